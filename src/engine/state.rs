// src/engine/state.rs

use crate::manifest::UpdateClass;
use std::fmt;

/// Update run phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Nothing done yet
    Init,
    /// Current and target slot known
    SlotsResolved,
    /// Bundle stream open, manifest not yet read
    ArchiveOpened,
    /// Manifest read, checked and classified
    ManifestValidated,
    /// Writing images for one update class
    Dispatching(UpdateClass),
    /// Images written, syncing and switching slots
    Finalizing,
    /// Completion recorded
    Done,
    /// Stopped with the given exit code
    Failed(i32),
}

impl UpdateState {
    /// Whether the target slot may already hold partial content
    pub fn touched_target(&self) -> bool {
        matches!(self, Self::Dispatching(_) | Self::Finalizing | Self::Done)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::SlotsResolved => f.write_str("slots-resolved"),
            Self::ArchiveOpened => f.write_str("archive-opened"),
            Self::ManifestValidated => f.write_str("manifest-validated"),
            Self::Dispatching(class) => write!(f, "dispatching({})", class),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Done => f.write_str("done"),
            Self::Failed(code) => write!(f, "failed({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!UpdateState::ManifestValidated.touched_target());
        assert!(UpdateState::Dispatching(UpdateClass::Delta).touched_target());
        assert_eq!(
            UpdateState::Dispatching(UpdateClass::FullImage).to_string(),
            "dispatching(full-image)"
        );
    }
}
