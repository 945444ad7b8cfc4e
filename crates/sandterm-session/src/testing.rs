//! Display double for router and session tests.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::display::DisplaySurface;

#[derive(Debug, Default)]
struct RecordingState {
    bytes: Vec<u8>,
    clears: usize,
}

/// Records everything written since the last `clear`. Clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingDisplay {
    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raw output, escape sequences included.
    pub fn transcript(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }

    /// Output as a user would read it: styling stripped, backspaces applied.
    pub fn rendered(&self) -> String {
        let mut rendered = String::new();
        for ch in strip_ansi(&self.transcript()).chars() {
            match ch {
                '\x08' => {
                    rendered.pop();
                }
                '\r' => {}
                ch => rendered.push(ch),
            }
        }
        rendered
    }

    pub fn lines(&self) -> Vec<String> {
        self.rendered().lines().map(ToOwned::to_owned).collect()
    }

    pub fn occurrences(&self, needle: &str) -> usize {
        self.rendered().matches(needle).count()
    }

    pub fn clear_count(&self) -> usize {
        self.lock().clears
    }
}

impl DisplaySurface for RecordingDisplay {
    fn write(&mut self, bytes: &[u8]) {
        self.lock().bytes.extend_from_slice(bytes);
    }

    fn write_line(&mut self, text: &str) {
        let mut state = self.lock();
        state.bytes.extend_from_slice(text.as_bytes());
        state.bytes.push(b'\n');
    }

    fn clear(&mut self) {
        let mut state = self.lock();
        state.bytes.clear();
        state.clears += 1;
    }
}

/// Drops CSI escape sequences (`ESC [ ... final`).
pub fn strip_ansi(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
            continue;
        }
        stripped.push(ch);
    }
    stripped
}
