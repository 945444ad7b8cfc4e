use crate::display::DisplaySurface;
use crate::key::KeyInput;
use crate::line_buffer::LineBuffer;

const ERASE_ONE: &[u8] = b"\x08 \x08";
const PASSTHROUGH_ENTER: &[u8] = b"\r";
const PASSTHROUGH_BACKSPACE: &[u8] = &[0x7f];
const PASSTHROUGH_TAB: &[u8] = b"\t";
const PASSTHROUGH_INTERRUPT: &[u8] = &[0x03];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    LineEdit,
    Passthrough,
}

/// What the session has to do after a key was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterAction {
    None,
    /// A completed line for the dispatcher.
    Commit(String),
    /// Bytes for the attached passthrough stream.
    Forward(Vec<u8>),
    /// The exit token was committed; the router is already back in line-edit mode.
    ExitPassthrough,
    Quit,
}

/// Turns key events into line edits, echo, or passthrough bytes.
///
/// In passthrough mode nothing is echoed: the remote program owns its own
/// echo and line editing. The buffer keeps tracking the current line there
/// only to recognize the exit token.
#[derive(Debug, Clone)]
pub struct InputRouter {
    mode: InputMode,
    buffer: LineBuffer,
    exit_token: String,
}

impl InputRouter {
    pub fn new(buffer: LineBuffer, exit_token: impl Into<String>) -> Self {
        Self {
            mode: InputMode::LineEdit,
            buffer,
            exit_token: exit_token.into().trim().to_owned(),
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    pub fn enter_passthrough(&mut self) {
        self.mode = InputMode::Passthrough;
        self.buffer.clear();
    }

    pub fn leave_passthrough(&mut self) {
        self.mode = InputMode::LineEdit;
        self.buffer.clear();
    }

    pub fn handle_key(&mut self, key: KeyInput, display: &mut dyn DisplaySurface) -> RouterAction {
        match self.mode {
            InputMode::LineEdit => self.handle_line_edit(key, display),
            InputMode::Passthrough => self.handle_passthrough(key, display),
        }
    }

    fn handle_line_edit(&mut self, key: KeyInput, display: &mut dyn DisplaySurface) -> RouterAction {
        match key {
            KeyInput::Enter => {
                display.write(b"\n");
                RouterAction::Commit(self.buffer.take())
            }
            KeyInput::Backspace => {
                if self.buffer.pop().is_some() {
                    display.write(ERASE_ONE);
                }
                RouterAction::None
            }
            KeyInput::Tab => {
                let fill = self.buffer.insert_tab();
                display.write(fill.as_bytes());
                RouterAction::None
            }
            KeyInput::Interrupt => RouterAction::Quit,
            KeyInput::Text(text) => {
                self.buffer.push_str(&text);
                display.write(text.as_bytes());
                RouterAction::None
            }
        }
    }

    fn handle_passthrough(
        &mut self,
        key: KeyInput,
        display: &mut dyn DisplaySurface,
    ) -> RouterAction {
        match key {
            KeyInput::Enter => {
                if self.matches_exit_token() {
                    self.leave_passthrough();
                    display.write(b"\n");
                    return RouterAction::ExitPassthrough;
                }
                self.buffer.clear();
                RouterAction::Forward(PASSTHROUGH_ENTER.to_vec())
            }
            KeyInput::Backspace => {
                self.buffer.pop();
                RouterAction::Forward(PASSTHROUGH_BACKSPACE.to_vec())
            }
            KeyInput::Tab => {
                self.buffer.insert_tab();
                RouterAction::Forward(PASSTHROUGH_TAB.to_vec())
            }
            KeyInput::Interrupt => {
                self.buffer.clear();
                RouterAction::Forward(PASSTHROUGH_INTERRUPT.to_vec())
            }
            KeyInput::Text(text) => {
                self.buffer.push_str(&text);
                RouterAction::Forward(text.into_bytes())
            }
        }
    }

    fn matches_exit_token(&self) -> bool {
        !self.exit_token.is_empty() && self.buffer.as_str().trim() == self.exit_token
    }
}
