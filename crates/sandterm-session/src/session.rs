use sandterm_eventbus::{SessionEvent, SessionEventSubscription};
use sandterm_lifecycle::{ProcessHandle, SandboxLifecycle, ServerChain};
use sandterm_protocol::{ProcessId, SandboxError, SpawnRequest, TerminalSize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::{CommandDispatcher, CommandEffect};
use crate::display::{DisplayOp, DisplaySurface, OutputSink};
use crate::key::KeyInput;
use crate::line_buffer::LineBuffer;
use crate::passthrough::PassthroughStream;
use crate::render;
use crate::router::{InputMode, InputRouter, RouterAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub prompt_label: String,
    pub prompt_width: usize,
    pub tab_width: usize,
    pub exit_token: String,
    pub show_welcome: bool,
    pub server_chain: ServerChain,
    pub interactive: SpawnRequest,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            prompt_label: " Hello from sandterm $ ".to_owned(),
            prompt_width: render::PROMPT_MARKER.len(),
            tab_width: 4,
            exit_token: "exit".to_owned(),
            show_welcome: true,
            server_chain: ServerChain::default(),
            interactive: SpawnRequest::new("sh", Vec::<String>::new())
                .with_terminal(TerminalSize::default()),
        }
    }
}

#[derive(Debug)]
pub(crate) enum SessionMessage {
    Display(DisplayOp),
    Notice(String),
    CommandFinished(CommandEffect),
    PassthroughOutput { process: ProcessId, bytes: Vec<u8> },
    PassthroughEnded { process: ProcessId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Quit,
}

enum LoopEvent {
    Key(Option<KeyInput>),
    Message(Option<SessionMessage>),
}

/// One interactive terminal bound to one sandbox lifecycle.
///
/// The session is the only writer of its display. Commands run as
/// background tasks so keys keep flowing while a chain is outstanding; their
/// output and completion come back through the message queue and are applied
/// by [`Session::step`] or [`Session::run`].
pub struct Session {
    settings: SessionSettings,
    router: InputRouter,
    display: Box<dyn DisplaySurface>,
    dispatcher: CommandDispatcher,
    sink: OutputSink,
    messages: mpsc::UnboundedReceiver<SessionMessage>,
    passthrough: Option<PassthroughStream>,
    preview_watch: JoinHandle<()>,
    /// Notices that arrived while a passthrough program owned the screen.
    deferred_notices: Vec<String>,
    commands_in_flight: usize,
    closed: bool,
}

impl Session {
    /// Draws the banner and prompt and starts booting the sandbox in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        lifecycle: SandboxLifecycle,
        display: Box<dyn DisplaySurface>,
        settings: SessionSettings,
    ) -> Self {
        let (sink, messages) = OutputSink::channel();
        let dispatcher = CommandDispatcher::new(
            lifecycle.clone(),
            settings.server_chain.clone(),
            settings.interactive.clone(),
        );
        let router = InputRouter::new(
            LineBuffer::new(settings.prompt_width, settings.tab_width),
            settings.exit_token.clone(),
        );
        let preview_watch = spawn_preview_watch(lifecycle.subscribe_events(), sink.clone());
        let mut session = Self {
            settings,
            router,
            display,
            dispatcher,
            sink,
            messages,
            passthrough: None,
            preview_watch,
            deferred_notices: Vec::new(),
            commands_in_flight: 0,
            closed: false,
        };

        if session.settings.show_welcome {
            for line in render::welcome_lines() {
                session.display.write_line(line);
            }
        }
        session.render_prompt();

        let boot_sink = session.sink.clone();
        tokio::spawn(async move {
            if let Err(error) = lifecycle.boot().await {
                boot_sink.notice(render::error_line(&error));
            }
        });
        tracing::info!("session opened");
        session
    }

    pub fn mode(&self) -> InputMode {
        self.router.mode()
    }

    pub fn buffer(&self) -> &str {
        self.router.buffer().as_str()
    }

    pub fn lifecycle(&self) -> &SandboxLifecycle {
        self.dispatcher.lifecycle()
    }

    pub fn commands_in_flight(&self) -> usize {
        self.commands_in_flight
    }

    pub fn passthrough_process(&self) -> Option<&ProcessId> {
        self.passthrough.as_ref().map(PassthroughStream::id)
    }

    /// Notices held back while a passthrough program owns the screen.
    pub fn deferred_notices(&self) -> &[String] {
        &self.deferred_notices
    }

    pub async fn server_running(&self) -> bool {
        self.dispatcher.server_running().await
    }

    pub async fn handle_key(&mut self, key: KeyInput) -> SessionControl {
        if self.closed {
            return SessionControl::Quit;
        }
        match self.router.handle_key(key, self.display.as_mut()) {
            RouterAction::None => {}
            RouterAction::Commit(line) => self.start_command(line),
            RouterAction::Forward(bytes) => self.forward(&bytes).await,
            RouterAction::ExitPassthrough => self.exit_passthrough().await,
            RouterAction::Quit => return SessionControl::Quit,
        }
        SessionControl::Continue
    }

    /// Waits for one queued message and applies it. `false` once the queue is closed.
    pub async fn step(&mut self) -> bool {
        match self.messages.recv().await {
            Some(message) => {
                self.apply(message).await;
                true
            }
            None => false,
        }
    }

    /// Applies messages until no command is outstanding and the queue is empty.
    pub async fn settle(&mut self) {
        while self.commands_in_flight > 0 {
            if !self.step().await {
                return;
            }
        }
        while let Ok(message) = self.messages.try_recv() {
            self.apply(message).await;
        }
    }

    /// Routes keys and queued output until the key source ends or a quit key
    /// arrives, then closes the session.
    pub async fn run(&mut self, keys: &mut mpsc::Receiver<KeyInput>) {
        loop {
            let event = tokio::select! {
                key = keys.recv() => LoopEvent::Key(key),
                message = self.messages.recv() => LoopEvent::Message(message),
            };
            match event {
                LoopEvent::Key(Some(key)) => {
                    if self.handle_key(key).await == SessionControl::Quit {
                        break;
                    }
                }
                LoopEvent::Message(Some(message)) => self.apply(message).await,
                LoopEvent::Key(None) | LoopEvent::Message(None) => break,
            }
        }
        self.close().await;
    }

    /// Closes passthrough, stops the server, and tears the sandbox down.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.preview_watch.abort();

        if let Some(stream) = self.passthrough.take() {
            if let Err(error) = stream.close().await {
                tracing::warn!(error = %error, "failed to stop interactive program");
            }
            self.router.leave_passthrough();
            self.publish(SessionEvent::PassthroughExited);
        }

        // Teardown ends any in-flight server chain, which frees the server slot.
        self.lifecycle().teardown().await;
        match self.dispatcher.stop_server().await {
            Ok(_) | Err(SandboxError::NoActiveServer) => {}
            Err(error) => tracing::warn!(error = %error, "failed to stop server"),
        }
        tracing::info!("session closed");
    }

    fn start_command(&mut self, line: String) {
        if line.trim().is_empty() {
            self.render_prompt();
            return;
        }

        self.commands_in_flight += 1;
        let dispatcher = self.dispatcher.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let effect = dispatcher.dispatch(&line, &sink).await;
            sink.send(SessionMessage::CommandFinished(effect));
        });
    }

    async fn apply(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Display(op) => op.apply(self.display.as_mut()),
            SessionMessage::Notice(text) => {
                if self.mode() == InputMode::Passthrough {
                    self.deferred_notices.push(text);
                    return;
                }
                self.display.write(b"\n");
                self.display.write_line(&text);
                self.render_prompt_with_buffer();
            }
            SessionMessage::CommandFinished(effect) => {
                self.commands_in_flight = self.commands_in_flight.saturating_sub(1);
                if let CommandEffect::EnterPassthrough(handle) = effect {
                    self.attach_passthrough(handle).await;
                }
                if self.mode() == InputMode::LineEdit {
                    self.render_prompt_with_buffer();
                }
            }
            SessionMessage::PassthroughOutput { process, bytes } => {
                if self.passthrough_process() == Some(&process) {
                    self.display.write(&bytes);
                }
            }
            SessionMessage::PassthroughEnded { process } => {
                if self.passthrough_process() == Some(&process) {
                    self.finish_passthrough().await;
                }
            }
        }
    }

    async fn attach_passthrough(&mut self, handle: ProcessHandle) {
        if self.closed || self.passthrough.is_some() {
            if let Err(error) = handle.kill().await {
                tracing::warn!(error = %error, "failed to stop surplus interactive program");
            }
            self.display
                .write_line(&render::error_text("an interactive program is already attached"));
            return;
        }

        let stream = PassthroughStream::attach(handle, &self.sink);
        tracing::info!(process = %stream.id(), "passthrough attached");
        self.passthrough = Some(stream);
        self.router.enter_passthrough();
        self.display.write_line(&format!(
            " interactive session started; type '{}' to leave",
            self.settings.exit_token.trim()
        ));
        self.publish(SessionEvent::PassthroughEntered);
    }

    async fn forward(&mut self, bytes: &[u8]) {
        let Some(stream) = self.passthrough.as_ref() else {
            tracing::debug!("no passthrough stream attached; dropping input");
            return;
        };
        if let Err(error) = stream.send(bytes).await {
            tracing::warn!(process = %stream.id(), error = %error, "failed to forward input");
        }
    }

    async fn exit_passthrough(&mut self) {
        if let Some(stream) = self.passthrough.take() {
            let process = stream.id().clone();
            match stream.close().await {
                Ok(outcome) => tracing::info!(process = %process, ?outcome, "passthrough closed"),
                Err(error) => {
                    tracing::warn!(process = %process, error = %error, "failed to stop interactive program")
                }
            }
        }
        self.publish(SessionEvent::PassthroughExited);
        self.flush_deferred_notices();
        self.render_prompt();
    }

    async fn finish_passthrough(&mut self) {
        let Some(stream) = self.passthrough.take() else {
            return;
        };
        let process = stream.id().clone();
        match stream.finish().await {
            Ok(code) => {
                tracing::info!(process = %process, code, "interactive program exited");
                self.display
                    .write_line(&format!("\n interactive program exited with code {code}"));
            }
            Err(error) => {
                tracing::warn!(process = %process, error = %error, "interactive program ended");
                self.display.write_line(&render::error_line(&error));
            }
        }
        self.router.leave_passthrough();
        self.publish(SessionEvent::PassthroughExited);
        self.flush_deferred_notices();
        self.render_prompt();
    }

    fn flush_deferred_notices(&mut self) {
        for text in std::mem::take(&mut self.deferred_notices) {
            self.display.write_line(&text);
        }
    }

    fn render_prompt(&mut self) {
        self.display.write_line(&self.settings.prompt_label);
        self.display.write(render::prompt_marker().as_bytes());
    }

    fn render_prompt_with_buffer(&mut self) {
        self.render_prompt();
        let pending = self.router.buffer().as_str().to_owned();
        if !pending.is_empty() {
            self.display.write(pending.as_bytes());
        }
    }

    fn publish(&self, event: SessionEvent) {
        self.dispatcher.lifecycle().eventbus().publish(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.preview_watch.abort();
    }
}

/// Turns preview changes into notices so they are drawn by the session loop.
fn spawn_preview_watch(mut events: SessionEventSubscription, sink: OutputSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.next_event().await {
                Ok(Some(envelope)) => match envelope.event {
                    SessionEvent::PreviewBound { url } => sink.notice(render::preview_bound(&url)),
                    SessionEvent::PreviewUnbound => sink.notice(render::preview_closed()),
                    _ => {}
                },
                Ok(None) => break,
                Err(error) => tracing::warn!(?error, "preview watch lagged"),
            }
        }
    })
}
