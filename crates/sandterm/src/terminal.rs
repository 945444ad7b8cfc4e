use std::io::{self, Stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use crossterm::ExecutableCommand;
use sandterm_session::{DisplaySurface, KeyInput};
use tokio::sync::mpsc;

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Keeps the terminal in raw mode until dropped.
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Writes session output to stdout. Raw mode does no output processing, so
/// a bare `\n` is written as `\r\n`.
pub struct CrosstermDisplay {
    out: Stdout,
    last_was_cr: bool,
}

impl Default for CrosstermDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl CrosstermDisplay {
    pub fn new() -> Self {
        Self {
            out: io::stdout(),
            last_was_cr: false,
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        let translated = expand_newlines(bytes, &mut self.last_was_cr);
        let mut out = self.out.lock();
        if let Err(error) = out.write_all(&translated).and_then(|()| out.flush()) {
            tracing::warn!(error = %error, "failed to write to terminal");
        }
    }
}

impl DisplaySurface for CrosstermDisplay {
    fn write(&mut self, bytes: &[u8]) {
        self.emit(bytes);
    }

    fn write_line(&mut self, text: &str) {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.emit(&line);
    }

    fn clear(&mut self) {
        let result = self
            .out
            .execute(Clear(ClearType::All))
            .and_then(|out| out.execute(MoveTo(0, 0)))
            .map(|_| ());
        if let Err(error) = result {
            tracing::warn!(error = %error, "failed to clear terminal");
        }
        self.last_was_cr = false;
    }
}

/// Inserts `\r` before every `\n` not already preceded by one, across calls.
pub fn expand_newlines(bytes: &[u8], last_was_cr: &mut bool) -> Vec<u8> {
    let mut expanded = Vec::with_capacity(bytes.len());
    for &byte in bytes {
        if byte == b'\n' && !*last_was_cr {
            expanded.push(b'\r');
        }
        expanded.push(byte);
        *last_was_cr = byte == b'\r';
    }
    expanded
}

/// Maps a terminal key press onto a session key. Releases and keys with no
/// byte representation map to `None`.
pub fn translate_key(key: KeyEvent) -> Option<KeyInput> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    if key.modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(ch) = key.code {
            let ch = ch.to_ascii_lowercase();
            if ch == 'c' {
                return Some(KeyInput::Interrupt);
            }
            if ch.is_ascii_lowercase() {
                let control = (ch as u8) & 0x1f;
                return Some(KeyInput::char(char::from(control)));
            }
        }
    }

    let text = match key.code {
        KeyCode::Enter => return Some(KeyInput::Enter),
        KeyCode::Backspace => return Some(KeyInput::Backspace),
        KeyCode::Tab => return Some(KeyInput::Tab),
        KeyCode::Char(ch) => ch.to_string(),
        KeyCode::Esc => "\x1b".to_owned(),
        KeyCode::Up => "\x1b[A".to_owned(),
        KeyCode::Down => "\x1b[B".to_owned(),
        KeyCode::Right => "\x1b[C".to_owned(),
        KeyCode::Left => "\x1b[D".to_owned(),
        KeyCode::Home => "\x1b[H".to_owned(),
        KeyCode::End => "\x1b[F".to_owned(),
        KeyCode::Delete => "\x1b[3~".to_owned(),
        KeyCode::BackTab => "\x1b[Z".to_owned(),
        _ => return None,
    };
    Some(KeyInput::Text(text))
}

/// Background thread feeding terminal keys into the session.
pub struct KeyReader {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl KeyReader {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("key reader thread panicked");
            }
        }
    }
}

pub fn spawn_key_reader(sender: mpsc::Sender<KeyInput>) -> io::Result<KeyReader> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
        .name("sandterm-keys".to_owned())
        .spawn(move || read_keys(sender, thread_stop))?;
    Ok(KeyReader {
        stop,
        thread: Some(thread),
    })
}

fn read_keys(sender: mpsc::Sender<KeyInput>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) && !sender.is_closed() {
        match event::poll(KEY_POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(error) => {
                tracing::warn!(error = %error, "terminal event poll failed");
                break;
            }
        }
        let key = match event::read() {
            Ok(Event::Key(key)) => translate_key(key),
            Ok(Event::Paste(text)) => Some(KeyInput::Text(text)),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(error = %error, "terminal event read failed");
                break;
            }
        };
        if let Some(key) = key {
            if sender.blocking_send(key).is_err() {
                break;
            }
        }
    }
    tracing::debug!("key reader stopped");
}
