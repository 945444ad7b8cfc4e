use std::sync::Arc;

use sandterm_lifecycle::{KillOutcome, ProcessHandle, SandboxLifecycle, ServerChain, ServerHandle};
use sandterm_protocol::{SandboxError, SandboxResult, SpawnRequest};
use tokio::sync::Mutex;

use crate::commands::{Command, CommandRegistry, ParsedLine};
use crate::display::OutputSink;
use crate::render;

/// What the session must do once a command has finished.
#[derive(Debug)]
pub enum CommandEffect {
    None,
    EnterPassthrough(ProcessHandle),
}

/// Runs committed lines against the sandbox lifecycle.
///
/// Every failure is rendered as a single error line on the sink; nothing
/// escapes `dispatch`. Clones share the running-server slot.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    lifecycle: SandboxLifecycle,
    chain: ServerChain,
    interactive: SpawnRequest,
    server: Arc<Mutex<Option<ServerHandle>>>,
}

impl CommandDispatcher {
    pub fn new(lifecycle: SandboxLifecycle, chain: ServerChain, interactive: SpawnRequest) -> Self {
        Self {
            registry: Arc::new(CommandRegistry::new()),
            lifecycle,
            chain,
            interactive,
            server: Arc::new(Mutex::new(None)),
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &SandboxLifecycle {
        &self.lifecycle
    }

    pub async fn dispatch(&self, line: &str, sink: &OutputSink) -> CommandEffect {
        let command = match self.registry.parse_line(line) {
            ParsedLine::Empty => return CommandEffect::None,
            ParsedLine::Unknown(line) => {
                sink.write_line(render::unknown_command(&line));
                return CommandEffect::None;
            }
            ParsedLine::Command(command) => command,
        };

        let name = command.name();
        tracing::debug!(command = name, "dispatching command");
        match self.execute(command, sink).await {
            Ok(effect) => effect,
            Err(error) => {
                tracing::warn!(command = name, error = %error, "command failed");
                sink.write_line(render::error_line(&error));
                if error.is_fatal() {
                    sink.write_line(render::reboot_hint());
                }
                CommandEffect::None
            }
        }
    }

    pub async fn server_running(&self) -> bool {
        self.server
            .lock()
            .await
            .as_ref()
            .is_some_and(ServerHandle::is_running)
    }

    /// Kills the stored server, if any.
    pub async fn stop_server(&self) -> SandboxResult<KillOutcome> {
        let server = self.server.lock().await.take();
        match server {
            Some(server) => server.kill().await,
            None => Err(SandboxError::NoActiveServer),
        }
    }

    async fn execute(&self, command: Command, sink: &OutputSink) -> SandboxResult<CommandEffect> {
        match command {
            Command::Clear => sink.clear(),
            Command::Help => {
                for metadata in self.registry.list() {
                    sink.write_line(render::help_line(metadata));
                }
            }
            Command::List { path } => {
                let entries = self.lifecycle.list_dir(&path).await?;
                if !entries.is_empty() {
                    sink.write_line(render::listing(&entries));
                }
            }
            Command::MakeDir { name } => self.lifecycle.make_dir(&name).await?,
            Command::RemoveDir { name } => self.lifecycle.remove_dir(&name).await?,
            Command::OpenServer => self.open_server(sink).await?,
            Command::CloseServer => match self.stop_server().await? {
                KillOutcome::Killed => sink.write_line(" server stopped"),
                KillOutcome::AlreadyExited => return Err(SandboxError::NoActiveServer),
            },
            Command::OpenInteractive => {
                let handle = self
                    .lifecycle
                    .open_interactive(self.interactive.clone())
                    .await?;
                return Ok(CommandEffect::EnterPassthrough(handle));
            }
            Command::Reboot => {
                self.server.lock().await.take();
                sink.write_line(" rebooting sandbox...");
                self.lifecycle.reboot().await?;
                sink.write_line(" sandbox ready");
            }
        }
        Ok(CommandEffect::None)
    }

    /// The slot stays locked for the whole chain so a concurrent
    /// `openServer` waits and then sees the running server.
    async fn open_server(&self, sink: &OutputSink) -> SandboxResult<()> {
        let mut server = self.server.lock().await;
        if server.as_ref().is_some_and(ServerHandle::is_running) {
            return Err(SandboxError::ServerAlreadyRunning);
        }

        sink.write_line(format!(" running {}", self.chain.install.display_command()));
        let handle = self
            .lifecycle
            .open_server(&self.chain, Arc::new(sink.clone()))
            .await?;
        sink.write_line(format!(" started {}", self.chain.run.display_command()));
        *server = Some(handle);
        Ok(())
    }
}
