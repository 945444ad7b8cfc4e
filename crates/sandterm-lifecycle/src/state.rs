#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootState {
    #[default]
    Unbooted,
    Booting,
    Ready,
}

impl BootState {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// A boot request in this state must not start another boot.
    pub fn is_boot_in_flight_or_done(self) -> bool {
        matches!(self, Self::Booting | Self::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStep {
    Install,
    Run,
}

impl ChainStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// The process had already exited, or its sandbox was torn down.
    AlreadyExited,
}
