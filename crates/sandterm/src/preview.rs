use std::sync::Mutex;

use sandterm_lifecycle::PreviewSurface;

/// Remembers the dev server's preview address.
///
/// A terminal has no embedded browser frame. The session announces bind and
/// unbind changes itself, so this surface only keeps the current address.
#[derive(Debug, Default)]
pub struct TerminalPreview {
    url: Mutex<Option<String>>,
}

impl TerminalPreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_url(&self) -> Option<String> {
        self.url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl PreviewSurface for TerminalPreview {
    fn bind(&self, url: &str) {
        *self
            .url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(url.to_owned());
        tracing::info!(url, "preview bound");
    }

    fn unbind(&self) {
        let previous = self
            .url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(url) = previous {
            tracing::info!(url = %url, "preview unbound");
        }
    }
}

#[cfg(test)]
mod tests {
    use sandterm_lifecycle::PreviewSurface;

    use super::TerminalPreview;

    #[test]
    fn binding_tracks_the_latest_url_until_unbound() {
        let preview = TerminalPreview::new();
        assert_eq!(preview.current_url(), None);

        preview.bind("http://localhost:5173/");
        assert_eq!(
            preview.current_url().as_deref(),
            Some("http://localhost:5173/")
        );

        preview.unbind();
        assert_eq!(preview.current_url(), None);
        preview.unbind();
    }
}
