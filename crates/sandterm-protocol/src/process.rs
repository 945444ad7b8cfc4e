use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::SandboxResult;
use crate::ids::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Allocate a pseudo-terminal of this size instead of plain pipes.
    pub terminal: Option<TerminalSize>,
}

impl SpawnRequest {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            terminal: None,
        }
    }

    pub fn with_terminal(mut self, size: TerminalSize) -> Self {
        self.terminal = Some(size);
        self
    }

    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        format!("{} {}", self.command, self.args.join(" "))
    }
}

#[async_trait]
pub trait ProcessOutputSubscription: Send {
    /// Next chunk of output in emission order; `None` once the process closed its output.
    async fn next_chunk(&mut self) -> SandboxResult<Option<Vec<u8>>>;
}

pub type ProcessOutputStream = Box<dyn ProcessOutputSubscription>;

/// Resolves once with the process exit code.
pub type ExitReceiver = oneshot::Receiver<i32>;

pub struct SpawnedProcess {
    pub id: ProcessId,
    pub output: ProcessOutputStream,
    pub exit: ExitReceiver,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
