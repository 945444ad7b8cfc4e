//! Sandbox lifecycle: single-flight boot, filesystem commands, the
//! install-then-run server chain, preview binding, and teardown.

pub mod controller;
pub mod process;
pub mod state;
pub mod surface;
pub mod test_support;
pub mod tree;

pub use controller::{SandboxLifecycle, SandboxLifecyclePerfSnapshot, ServerChain, ServerHandle};
pub use process::{ProcessHandle, ProcessKiller};
pub use state::{BootState, ChainStep, KillOutcome};
pub use surface::{DetachedSurface, OutputObserver, PreviewSurface};
pub use tree::initial_file_tree;

#[cfg(test)]
mod tests {
    use super::{BootState, ChainStep};

    #[test]
    fn lifecycle_state_defaults_to_unbooted() {
        assert_eq!(BootState::default(), BootState::Unbooted);
        assert!(!BootState::Unbooted.is_boot_in_flight_or_done());
        assert!(BootState::Booting.is_boot_in_flight_or_done());
        assert!(BootState::Ready.is_ready());
    }

    #[test]
    fn chain_steps_have_stable_names() {
        assert_eq!(ChainStep::Install.as_str(), "install");
        assert_eq!(ChainStep::Run.as_str(), "run");
    }
}
