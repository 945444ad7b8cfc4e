//! Sandbox runtime backed by the local machine: a temporary directory per
//! boot, piped or pseudo-terminal child processes, and readiness detection
//! from process output.

mod process;
mod readiness;
mod sandbox;
mod workspace;

pub use sandbox::{HostInstance, HostSandbox, HostSandboxConfig};
