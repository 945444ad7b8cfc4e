use std::sync::Mutex;

use sandterm_protocol::ProcessId;

use crate::state::ChainStep;

/// Where a forwarded server URL gets shown (a preview frame, a status line).
pub trait PreviewSurface: Send + Sync {
    fn bind(&self, url: &str);
    fn unbind(&self);
}

/// Receives output of the install and run steps as it is produced.
pub trait OutputObserver: Send + Sync {
    fn on_output(&self, step: ChainStep, bytes: &[u8]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSurface;

impl PreviewSurface for DetachedSurface {
    fn bind(&self, _url: &str) {}

    fn unbind(&self) {}
}

#[derive(Debug, Default)]
struct Binding {
    owner: Option<ProcessId>,
    url: Option<String>,
}

/// Tracks which run process currently owns the preview surface.
///
/// Only the owner may unbind, so a stale kill capability can never clear a
/// binding made by a newer server.
#[derive(Debug, Default)]
pub(crate) struct PreviewSlot {
    binding: Mutex<Binding>,
}

impl PreviewSlot {
    pub(crate) fn bind(&self, surface: &dyn PreviewSurface, owner: &ProcessId, url: &str) -> bool {
        let mut binding = self
            .binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if binding
            .owner
            .as_ref()
            .is_some_and(|current| current != owner)
        {
            return false;
        }
        binding.owner = Some(owner.clone());
        binding.url = Some(url.to_owned());
        surface.bind(url);
        true
    }

    pub(crate) fn release(&self, surface: &dyn PreviewSurface, owner: &ProcessId) -> bool {
        let mut binding = self
            .binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if binding.owner.as_ref() != Some(owner) {
            return false;
        }
        *binding = Binding::default();
        surface.unbind();
        true
    }

    pub(crate) fn release_any(&self, surface: &dyn PreviewSurface) -> bool {
        let mut binding = self
            .binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if binding.owner.is_none() {
            return false;
        }
        *binding = Binding::default();
        surface.unbind();
        true
    }

    pub(crate) fn url(&self) -> Option<String> {
        self.binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .url
            .clone()
    }
}
