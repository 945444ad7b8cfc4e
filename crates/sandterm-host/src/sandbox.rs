use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sandterm_protocol::{
    DirEntry, FileTree, ProcessId, RemoveOptions, SandboxBooter, SandboxError, SandboxEventSource,
    SandboxFilesystem, SandboxInstance, SandboxProcessControl, SandboxResult, SandboxTeardown,
    ServiceReadyEvent, ServiceReadyStream, ServiceReadySubscription, SpawnRequest, SpawnedProcess,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::process::{spawn_process, ProcessContext, ProcessTable};
use crate::workspace::SandboxRoot;

const DEFAULT_READY_BUFFER: usize = 16;
const ROOT_PREFIX: &str = "sandterm-";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSandboxConfig {
    /// Directory the per-boot sandbox roots are created in; the system temp dir when unset.
    pub root_parent: Option<PathBuf>,
}

/// Boots sandboxes backed by a fresh temporary directory and local processes.
#[derive(Debug, Clone, Default)]
pub struct HostSandbox {
    config: HostSandboxConfig,
}

impl HostSandbox {
    pub fn new(config: HostSandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SandboxBooter for HostSandbox {
    async fn boot(&self) -> SandboxResult<Arc<dyn SandboxInstance>> {
        let root_parent = self.config.root_parent.clone();
        let dir = tokio::task::spawn_blocking(move || {
            let mut builder = tempfile::Builder::new();
            builder.prefix(ROOT_PREFIX);
            match root_parent {
                Some(parent) => {
                    std::fs::create_dir_all(&parent)?;
                    builder.tempdir_in(parent)
                }
                None => builder.tempdir(),
            }
        })
        .await
        .map_err(|error| SandboxError::BootFailed(format!("boot task failed: {error}")))?
        .map_err(|error| SandboxError::BootFailed(format!("cannot create sandbox root: {error}")))?;

        tracing::info!(root = %dir.path().display(), "host sandbox booted");
        Ok(Arc::new(HostInstance::new(dir)))
    }
}

/// One booted host sandbox. Dropping or tearing it down removes its root.
pub struct HostInstance {
    root: SandboxRoot,
    dir: Mutex<Option<TempDir>>,
    processes: ProcessTable,
    ready_tx: Mutex<Option<broadcast::Sender<ServiceReadyEvent>>>,
    next_process: AtomicU64,
    torn_down: AtomicBool,
}

impl HostInstance {
    fn new(dir: TempDir) -> Self {
        let (ready_tx, _) = broadcast::channel(DEFAULT_READY_BUFFER);
        Self {
            root: SandboxRoot::new(dir.path().to_path_buf()),
            dir: Mutex::new(Some(dir)),
            processes: Arc::new(Mutex::new(HashMap::new())),
            ready_tx: Mutex::new(Some(ready_tx)),
            next_process: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        self.root.path()
    }

    fn ensure_live(&self) -> SandboxResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SandboxError::NotReady);
        }
        Ok(())
    }

    fn ready_sender(&self) -> SandboxResult<broadcast::Sender<ServiceReadyEvent>> {
        self.ready_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(SandboxError::NotReady)
    }
}

#[async_trait]
impl SandboxFilesystem for HostInstance {
    async fn mount(&self, tree: &FileTree) -> SandboxResult<()> {
        self.ensure_live()?;
        self.root.mount(tree).await
    }

    async fn list_dir(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        self.ensure_live()?;
        self.root.list_dir(path).await
    }

    async fn make_dir(&self, path: &str) -> SandboxResult<()> {
        self.ensure_live()?;
        self.root.make_dir(path).await
    }

    async fn remove_dir(&self, path: &str, options: RemoveOptions) -> SandboxResult<()> {
        self.ensure_live()?;
        self.root.remove_dir(path, options).await
    }
}

#[async_trait]
impl SandboxProcessControl for HostInstance {
    async fn spawn(&self, request: SpawnRequest) -> SandboxResult<SpawnedProcess> {
        self.ensure_live()?;
        let sequence = self.next_process.fetch_add(1, Ordering::Relaxed) + 1;
        let context = ProcessContext {
            id: ProcessId::new(format!("proc-{sequence}")),
            workdir: self.root.path(),
            processes: Arc::clone(&self.processes),
            ready_tx: self.ready_sender()?,
        };
        spawn_process(context, request).await
    }

    async fn kill(&self, process: &ProcessId) -> SandboxResult<()> {
        self.ensure_live()?;
        let mut processes = self
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match processes.get_mut(process).map(|running| running.kill()) {
            Some(true) => Ok(()),
            _ => Err(SandboxError::ProcessNotFound(process.to_string())),
        }
    }

    async fn send_input(&self, process: &ProcessId, input: &[u8]) -> SandboxResult<()> {
        self.ensure_live()?;
        let processes = self
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let running = processes
            .get(process)
            .ok_or_else(|| SandboxError::ProcessNotFound(process.to_string()))?;
        running.write(process, input)
    }
}

#[async_trait]
impl SandboxEventSource for HostInstance {
    async fn subscribe_service_ready(&self) -> SandboxResult<ServiceReadyStream> {
        self.ensure_live()?;
        Ok(Box::new(BroadcastReady {
            receiver: self.ready_sender()?.subscribe(),
        }))
    }
}

#[async_trait]
impl SandboxTeardown for HostInstance {
    async fn teardown(&self) -> SandboxResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut processes = self
                .processes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for running in processes.values_mut() {
                running.kill();
            }
        }
        self.ready_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let dir = self
            .dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = dir {
            let root = dir.path().display().to_string();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|error| SandboxError::Internal(format!("teardown task failed: {error}")))?
                .map_err(|error| SandboxError::Io(format!("cannot remove {root}: {error}")))?;
            tracing::info!(root = %root, "host sandbox removed");
        }
        Ok(())
    }
}

struct BroadcastReady {
    receiver: broadcast::Receiver<ServiceReadyEvent>,
}

#[async_trait]
impl ServiceReadySubscription for BroadcastReady {
    async fn next_ready(&mut self) -> SandboxResult<Option<ServiceReadyEvent>> {
        match self.receiver.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(SandboxError::Process(
                format!("readiness subscriber lagged; dropped {skipped} announcements"),
            )),
        }
    }
}
