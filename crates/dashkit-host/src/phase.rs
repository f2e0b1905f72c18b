//! Reload phase tracking

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Phase of the reload state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReloadPhase {
    /// No reload in progress
    #[default]
    Idle,
    /// Disposing instances and unloading contexts of the previous generation
    TearingDown,
    /// Copying module files into a fresh shadow directory
    Staging,
    /// Loading staged modules into isolated contexts
    Loading,
    /// Constructing widgets on the UI dispatcher
    Instantiating,
    /// Swapping in the new generation and notifying listeners
    Publishing,
}

impl ReloadPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::TearingDown,
            2 => Self::Staging,
            3 => Self::Loading,
            4 => Self::Instantiating,
            5 => Self::Publishing,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::TearingDown => 1,
            Self::Staging => 2,
            Self::Loading => 3,
            Self::Instantiating => 4,
            Self::Publishing => 5,
        }
    }
}

impl std::fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadPhase::Idle => write!(f, "Idle"),
            ReloadPhase::TearingDown => write!(f, "Tearing down"),
            ReloadPhase::Staging => write!(f, "Staging"),
            ReloadPhase::Loading => write!(f, "Loading"),
            ReloadPhase::Instantiating => write!(f, "Instantiating"),
            ReloadPhase::Publishing => write!(f, "Publishing"),
        }
    }
}

/// Lock-free cell holding the current phase
#[derive(Debug, Default)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn get(&self) -> ReloadPhase {
        ReloadPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, phase: ReloadPhase) {
        let previous = ReloadPhase::from_u8(self.0.swap(phase.as_u8(), Ordering::AcqRel));
        if previous != phase {
            tracing::debug!(from = %previous, to = %phase, "reload phase changed");
        }
    }
}
