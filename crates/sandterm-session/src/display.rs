use sandterm_lifecycle::{ChainStep, OutputObserver};
use sandterm_protocol::ProcessId;
use tokio::sync::mpsc;

use crate::session::SessionMessage;

/// The terminal widget the session draws on.
pub trait DisplaySurface: Send {
    fn write(&mut self, bytes: &[u8]);

    /// Writes `text` followed by a newline.
    fn write_line(&mut self, text: &str);

    fn clear(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayOp {
    Write(Vec<u8>),
    Line(String),
    Clear,
}

impl DisplayOp {
    pub fn apply(self, display: &mut dyn DisplaySurface) {
        match self {
            Self::Write(bytes) => display.write(&bytes),
            Self::Line(text) => display.write_line(&text),
            Self::Clear => display.clear(),
        }
    }
}

/// Queues output for the session loop, which is the only writer of the display.
///
/// Background work (command handlers, server output, passthrough output) only
/// ever holds a sink, never the display itself.
#[derive(Debug, Clone)]
pub struct OutputSink {
    sender: mpsc::UnboundedSender<SessionMessage>,
}

impl OutputSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<SessionMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn write(&self, bytes: &[u8]) {
        self.send(SessionMessage::Display(DisplayOp::Write(bytes.to_vec())));
    }

    pub fn write_line(&self, text: impl Into<String>) {
        self.send(SessionMessage::Display(DisplayOp::Line(text.into())));
    }

    pub fn clear(&self) {
        self.send(SessionMessage::Display(DisplayOp::Clear));
    }

    /// A line that interrupts whatever is being typed; the prompt is redrawn after it.
    pub fn notice(&self, text: impl Into<String>) {
        self.send(SessionMessage::Notice(text.into()));
    }

    pub(crate) fn passthrough_output(&self, process: &ProcessId, bytes: Vec<u8>) {
        self.send(SessionMessage::PassthroughOutput {
            process: process.clone(),
            bytes,
        });
    }

    pub(crate) fn passthrough_ended(&self, process: &ProcessId) {
        self.send(SessionMessage::PassthroughEnded {
            process: process.clone(),
        });
    }

    pub(crate) fn send(&self, message: SessionMessage) {
        if self.sender.send(message).is_err() {
            tracing::debug!("session closed; dropping output");
        }
    }
}

impl OutputObserver for OutputSink {
    fn on_output(&self, _step: ChainStep, bytes: &[u8]) {
        self.write(bytes);
    }
}
