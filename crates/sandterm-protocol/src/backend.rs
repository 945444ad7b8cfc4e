use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SandboxResult;
use crate::event::ServiceReadyStream;
use crate::ids::ProcessId;
use crate::process::{SpawnRequest, SpawnedProcess};
use crate::tree::{DirEntry, FileTree, RemoveOptions};

#[async_trait]
pub trait SandboxFilesystem: Send + Sync {
    async fn mount(&self, tree: &FileTree) -> SandboxResult<()>;
    async fn list_dir(&self, path: &str) -> SandboxResult<Vec<DirEntry>>;
    async fn make_dir(&self, path: &str) -> SandboxResult<()>;
    async fn remove_dir(&self, path: &str, options: RemoveOptions) -> SandboxResult<()>;
}

#[async_trait]
pub trait SandboxProcessControl: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> SandboxResult<SpawnedProcess>;
    /// Fails with `ProcessNotFound` once the process has exited or was already killed.
    async fn kill(&self, process: &ProcessId) -> SandboxResult<()>;
    async fn send_input(&self, process: &ProcessId, input: &[u8]) -> SandboxResult<()>;
}

#[async_trait]
pub trait SandboxEventSource: Send + Sync {
    async fn subscribe_service_ready(&self) -> SandboxResult<ServiceReadyStream>;
}

#[async_trait]
pub trait SandboxTeardown: Send + Sync {
    async fn teardown(&self) -> SandboxResult<()>;
}

pub trait SandboxInstance:
    SandboxFilesystem + SandboxProcessControl + SandboxEventSource + SandboxTeardown + Send + Sync
{
}

impl<T> SandboxInstance for T where
    T: SandboxFilesystem
        + SandboxProcessControl
        + SandboxEventSource
        + SandboxTeardown
        + Send
        + Sync
{
}

#[async_trait]
pub trait SandboxBooter: Send + Sync {
    async fn boot(&self) -> SandboxResult<Arc<dyn SandboxInstance>>;
}
