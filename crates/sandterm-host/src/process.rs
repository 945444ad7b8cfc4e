use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use sandterm_protocol::{
    ProcessId, ProcessOutputSubscription, SandboxError, SandboxResult, ServiceReadyEvent,
    SpawnRequest, SpawnedProcess, TerminalSize,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{self, JoinHandle};

use crate::readiness::ReadinessScanner;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(200);
/// Reported when the platform gives no exit code (for example, killed by a signal
/// on a platform without signal numbers).
const UNKNOWN_EXIT_CODE: i32 = -1;

pub(crate) type ProcessTable = Arc<Mutex<HashMap<ProcessId, RunningProcess>>>;

enum KillSwitch {
    Piped(oneshot::Sender<()>),
    Pty(Box<dyn ChildKiller + Send + Sync>),
}

pub(crate) struct RunningProcess {
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    kill: Option<KillSwitch>,
}

impl RunningProcess {
    pub(crate) fn write(&self, process: &ProcessId, input: &[u8]) -> SandboxResult<()> {
        self.stdin.send(input.to_vec()).map_err(|_| {
            SandboxError::Process(format!("stdin of {process} is no longer available"))
        })
    }

    /// `false` when the process was already signalled.
    pub(crate) fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(KillSwitch::Piped(signal)) => {
                let _ = signal.send(());
                true
            }
            Some(KillSwitch::Pty(mut killer)) => {
                let _ = killer.kill();
                true
            }
            None => false,
        }
    }
}

struct ChannelOutput {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl ProcessOutputSubscription for ChannelOutput {
    async fn next_chunk(&mut self) -> SandboxResult<Option<Vec<u8>>> {
        Ok(self.receiver.recv().await)
    }
}

pub(crate) struct ProcessContext<'a> {
    pub(crate) id: ProcessId,
    pub(crate) workdir: &'a Path,
    pub(crate) processes: ProcessTable,
    pub(crate) ready_tx: broadcast::Sender<ServiceReadyEvent>,
}

pub(crate) async fn spawn_process(
    context: ProcessContext<'_>,
    request: SpawnRequest,
) -> SandboxResult<SpawnedProcess> {
    if request.command.trim().is_empty() {
        return Err(SandboxError::Process("spawn command must not be empty".to_owned()));
    }
    match request.terminal {
        Some(size) => spawn_pty(context, request, size).await,
        None => spawn_piped(context, request),
    }
}

fn spawn_piped(context: ProcessContext<'_>, request: SpawnRequest) -> SandboxResult<SpawnedProcess> {
    let mut child = Command::new(&request.command)
        .args(&request.args)
        .current_dir(context.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            SandboxError::Process(format!("failed to start `{}`: {error}", request.command))
        })?;

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    let scanner = Arc::new(Mutex::new(ReadinessScanner::new(context.ready_tx.clone())));

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_pipe_pump(stdout, output_tx.clone(), Arc::clone(&scanner)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_pipe_pump(stderr, output_tx.clone(), scanner));
    }
    drop(output_tx);
    if let Some(stdin) = child.stdin.take() {
        spawn_stdin_writer(stdin, stdin_rx);
    }

    context.processes_insert(RunningProcess {
        stdin: stdin_tx,
        kill: Some(KillSwitch::Piped(kill_tx)),
    });

    let id = context.id.clone();
    let processes = Arc::clone(&context.processes);
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => exit_code(status),
            Err(error) => {
                tracing::warn!(process = %id, error = %error, "failed to reap sandbox process");
                UNKNOWN_EXIT_CODE
            }
        };

        // Descendants may keep the pipes open after the direct child exits.
        for pump in pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, pump).await.is_err() {
                tracing::debug!(process = %id, "abandoning output held open by descendants");
                abort.abort();
            }
        }
        remove_process(&processes, &id);
        let _ = exit_tx.send(code);
    });

    Ok(SpawnedProcess {
        id: context.id,
        output: Box::new(ChannelOutput {
            receiver: output_rx,
        }),
        exit: exit_rx,
    })
}

impl ProcessContext<'_> {
    fn processes_insert(&self, process: RunningProcess) {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.id.clone(), process);
    }
}

fn spawn_pipe_pump<R>(
    mut pipe: R,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    scanner: Arc<Mutex<ReadinessScanner>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0_u8; READ_CHUNK_SIZE];
        loop {
            match pipe.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => {
                    scanner
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .feed(&buffer[..read]);
                    if output_tx.send(buffer[..read].to_vec()).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn spawn_stdin_writer(mut stdin: ChildStdin, mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(input) = stdin_rx.recv().await {
            if input.is_empty() {
                continue;
            }
            if stdin.write_all(&input).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });
}

struct SpawnedPty {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

async fn spawn_pty(
    context: ProcessContext<'_>,
    request: SpawnRequest,
    size: TerminalSize,
) -> SandboxResult<SpawnedProcess> {
    if size.cols == 0 || size.rows == 0 {
        return Err(SandboxError::Process(
            "terminal size must have non-zero rows and columns".to_owned(),
        ));
    }

    let workdir = context.workdir.to_path_buf();
    let spawned = task::spawn_blocking(move || spawn_pty_process(request, &workdir, size))
        .await
        .map_err(|error| SandboxError::Internal(format!("pty spawn task failed: {error}")))??;

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let killer = spawned.child.clone_killer();

    context.processes_insert(RunningProcess {
        stdin: stdin_tx,
        kill: Some(KillSwitch::Pty(killer)),
    });

    spawn_read_loop(
        spawned.reader,
        output_tx,
        ReadinessScanner::new(context.ready_tx.clone()),
    );
    spawn_write_loop(spawned.writer, stdin_rx);
    spawn_child_wait_loop(
        Arc::clone(&context.processes),
        context.id.clone(),
        spawned.child,
        spawned.master,
        exit_tx,
    );

    Ok(SpawnedProcess {
        id: context.id,
        output: Box::new(ChannelOutput {
            receiver: output_rx,
        }),
        exit: exit_rx,
    })
}

fn to_pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        cols: size.cols,
        rows: size.rows,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn process_error(error: impl std::fmt::Display) -> SandboxError {
    SandboxError::Process(error.to_string())
}

fn spawn_pty_process(
    request: SpawnRequest,
    workdir: &Path,
    size: TerminalSize,
) -> SandboxResult<SpawnedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(to_pty_size(size))
        .map_err(process_error)?;

    let mut command = CommandBuilder::new(&request.command);
    command.cwd(workdir);
    for arg in &request.args {
        command.arg(arg);
    }

    let child = pair.slave.spawn_command(command).map_err(|error| {
        SandboxError::Process(format!("failed to start `{}`: {error}", request.command))
    })?;
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(error) => {
            terminate_child(child);
            return Err(process_error(error));
        }
    };

    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(error) => {
            terminate_child(child);
            return Err(process_error(error));
        }
    };

    Ok(SpawnedPty {
        master: pair.master,
        reader,
        writer,
        child,
    })
}

fn terminate_child(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_read_loop(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut scanner: ReadinessScanner,
) {
    std::thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    scanner.feed(&buffer[..read]);
                    if output_tx.send(buffer[..read].to_vec()).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn spawn_write_loop(
    mut writer: Box<dyn Write + Send>,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Some(input) = stdin_rx.blocking_recv() {
            if input.is_empty() {
                continue;
            }
            if writer.write_all(&input).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });
}

fn spawn_child_wait_loop(
    processes: ProcessTable,
    id: ProcessId,
    mut child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    exit_tx: oneshot::Sender<i32>,
) {
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).unwrap_or(UNKNOWN_EXIT_CODE),
            Err(error) => {
                tracing::warn!(process = %id, error = %error, "failed to reap pty process");
                UNKNOWN_EXIT_CODE
            }
        };
        // Closing the master ends the read loop once the slave side is gone.
        drop(master);
        remove_process(&processes, &id);
        let _ = exit_tx.send(code);
    });
}

fn remove_process(processes: &ProcessTable, id: &ProcessId) {
    processes
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(id);
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}
