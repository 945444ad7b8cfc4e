use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox is not ready")]
    NotReady,
    #[error("sandbox boot failed: {0}")]
    BootFailed(String),
    #[error("sandbox mount failed: {0}")]
    MountFailed(String),
    #[error("{0}")]
    Io(String),
    #[error("install step exited with code {code}")]
    InstallFailed { code: i32 },
    #[error("no running server")]
    NoActiveServer,
    #[error("server already running")]
    ServerAlreadyRunning,
    #[error("sandbox process not found: {0}")]
    ProcessNotFound(String),
    #[error("sandbox process error: {0}")]
    Process(String),
    #[error("sandbox internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Failures that leave the sandbox unusable until an explicit reboot.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BootFailed(_) | Self::MountFailed(_))
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
