use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sandterm_protocol::{
    ExitReceiver, ProcessId, ProcessOutputStream, SandboxError, SandboxInstance, SandboxResult,
    SpawnRequest,
};

use crate::state::{ChainStep, KillOutcome};
use crate::surface::OutputObserver;

/// One spawned sandbox process.
///
/// Output can be taken exactly once and the exit code resolves exactly once;
/// later `wait` calls return the cached code.
pub struct ProcessHandle {
    id: ProcessId,
    output: Option<ProcessOutputStream>,
    exit: Option<ExitReceiver>,
    exit_code: Option<i32>,
    killer: ProcessKiller,
}

impl ProcessHandle {
    pub async fn spawn(
        instance: Arc<dyn SandboxInstance>,
        request: SpawnRequest,
    ) -> SandboxResult<Self> {
        let command = request.display_command();
        let spawned = instance.spawn(request).await?;
        tracing::debug!(process = %spawned.id, command = %command, "spawned sandbox process");

        Ok(Self {
            id: spawned.id.clone(),
            output: Some(spawned.output),
            exit: Some(spawned.exit),
            exit_code: None,
            killer: ProcessKiller {
                instance,
                id: spawned.id,
                exited: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn take_output(&mut self) -> Option<ProcessOutputStream> {
        self.output.take()
    }

    pub fn has_exited(&self) -> bool {
        self.killer.has_exited()
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    pub async fn wait(&mut self) -> SandboxResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let exit = self.exit.take().ok_or_else(|| {
            SandboxError::Internal(format!("exit status of {} already consumed", self.id))
        })?;
        let code = exit.await.map_err(|_| {
            SandboxError::Process(format!("{} ended without reporting an exit status", self.id))
        })?;
        self.exit_code = Some(code);
        self.killer.mark_exited();
        Ok(code)
    }

    /// Forwards all remaining output to `observer`, then resolves the exit code.
    pub async fn run_to_exit(
        &mut self,
        observer: &dyn OutputObserver,
        step: ChainStep,
    ) -> SandboxResult<i32> {
        if let Some(mut output) = self.output.take() {
            pump_output(&mut output, observer, step).await?;
        }
        self.wait().await
    }

    pub async fn send_input(&self, input: &[u8]) -> SandboxResult<()> {
        self.killer.instance.send_input(&self.id, input).await
    }

    pub async fn kill(&self) -> SandboxResult<KillOutcome> {
        self.killer.kill().await
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Kill half of a [`ProcessHandle`], shareable after the handle moved into a task.
#[derive(Clone)]
pub struct ProcessKiller {
    instance: Arc<dyn SandboxInstance>,
    id: ProcessId,
    exited: Arc<AtomicBool>,
}

impl ProcessKiller {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub async fn kill(&self) -> SandboxResult<KillOutcome> {
        if self.has_exited() {
            return Ok(KillOutcome::AlreadyExited);
        }
        match self.instance.kill(&self.id).await {
            Ok(()) => {
                self.mark_exited();
                Ok(KillOutcome::Killed)
            }
            Err(SandboxError::NotReady) | Err(SandboxError::ProcessNotFound(_)) => {
                self.mark_exited();
                Ok(KillOutcome::AlreadyExited)
            }
            Err(error) => Err(error),
        }
    }
}

pub(crate) async fn pump_output(
    output: &mut ProcessOutputStream,
    observer: &dyn OutputObserver,
    step: ChainStep,
) -> SandboxResult<()> {
    while let Some(chunk) = output.next_chunk().await? {
        if !chunk.is_empty() {
            observer.on_output(step, &chunk);
        }
    }
    Ok(())
}
