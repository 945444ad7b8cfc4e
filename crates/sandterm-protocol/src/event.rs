use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxResult;

/// A sandboxed program started listening on `port`; `url` forwards to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReadyEvent {
    pub port: u16,
    pub url: String,
}

#[async_trait]
pub trait ServiceReadySubscription: Send {
    async fn next_ready(&mut self) -> SandboxResult<Option<ServiceReadyEvent>>;
}

pub type ServiceReadyStream = Box<dyn ServiceReadySubscription>;
