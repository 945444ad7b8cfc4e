use serde::{Deserialize, Serialize};

/// State transitions the presentation layer re-renders on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    BootStarted,
    BootCompleted,
    BootFailed { reason: String },
    ServerStarting,
    ServerOpened,
    ServerClosed,
    ServerExited { code: i32 },
    PreviewBound { url: String },
    PreviewUnbound,
    PassthroughEntered,
    PassthroughExited,
    TornDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEventEnvelope {
    pub sequence: u64,
    pub received_at_monotonic_nanos: u64,
    pub event: SessionEvent,
}
