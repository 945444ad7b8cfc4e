use sandterm_protocol::ServiceReadyEvent;
use tokio::sync::broadcast;

const SCAN_ROWS: u16 = 64;
const SCAN_COLS: u16 = 512;
const LOCAL_URL_PREFIXES: [&str; 3] = [
    "http://localhost:",
    "http://127.0.0.1:",
    "http://0.0.0.0:",
];

/// Watches one process's output for the first local URL it prints.
///
/// Output is rendered through a terminal emulator so color and cursor
/// sequences wrapped around the URL do not hide it.
pub(crate) struct ReadinessScanner {
    parser: vt100::Parser,
    ready_tx: broadcast::Sender<ServiceReadyEvent>,
    announced: bool,
    last_was_cr: bool,
}

impl ReadinessScanner {
    pub(crate) fn new(ready_tx: broadcast::Sender<ServiceReadyEvent>) -> Self {
        Self {
            parser: vt100::Parser::new(SCAN_ROWS, SCAN_COLS, 0),
            ready_tx,
            announced: false,
            last_was_cr: false,
        }
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        if self.announced || bytes.is_empty() {
            return;
        }

        let mut normalized = Vec::with_capacity(bytes.len());
        for &byte in bytes {
            if byte == b'\n' && !self.last_was_cr {
                normalized.push(b'\r');
            }
            normalized.push(byte);
            self.last_was_cr = byte == b'\r';
        }
        self.parser.process(&normalized);

        if let Some(event) = find_local_url(&self.parser.screen().contents()) {
            self.announced = true;
            tracing::debug!(port = event.port, url = %event.url, "detected listening service");
            let _ = self.ready_tx.send(event);
        }
    }
}

pub(crate) fn find_local_url(text: &str) -> Option<ServiceReadyEvent> {
    LOCAL_URL_PREFIXES
        .iter()
        .filter_map(|prefix| text.find(prefix).map(|start| (start, *prefix)))
        .min_by_key(|(start, _)| *start)
        .and_then(|(start, prefix)| {
            let candidate = &text[start..];
            let end = candidate
                .find(|ch: char| ch.is_whitespace())
                .unwrap_or(candidate.len());
            let url = &candidate[..end];
            let digits = url[prefix.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>();
            let port = digits.parse::<u16>().ok()?;
            Some(ServiceReadyEvent {
                port,
                url: url.to_owned(),
            })
        })
}
