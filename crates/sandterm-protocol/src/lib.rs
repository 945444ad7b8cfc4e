//! Contract between the terminal core and the sandbox runtime it drives.

pub mod backend;
pub mod error;
pub mod event;
pub mod ids;
pub mod process;
pub mod tree;

pub use backend::{
    SandboxBooter, SandboxEventSource, SandboxFilesystem, SandboxInstance, SandboxProcessControl,
    SandboxTeardown,
};
pub use error::{SandboxError, SandboxResult};
pub use event::{ServiceReadyEvent, ServiceReadyStream, ServiceReadySubscription};
pub use ids::ProcessId;
pub use process::{
    ExitReceiver, ProcessOutputStream, ProcessOutputSubscription, SpawnRequest, SpawnedProcess,
    TerminalSize,
};
pub use tree::{DirEntry, FileNode, FileTree, RemoveOptions};
