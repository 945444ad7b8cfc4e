//! Session change notifications fanned out to the presentation layer.

pub mod bus;
pub mod envelope;

pub use bus::{
    SessionEventBus, SessionEventBusConfig, SessionEventBusPerfSnapshot, SessionEventRecvError,
    SessionEventSubscription, DEFAULT_BUFFER_CAPACITY,
};
pub use envelope::{SessionEvent, SessionEventEnvelope};
