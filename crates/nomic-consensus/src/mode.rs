//! Consensus mode and its one-way schedule.
//!
//! The game opens in unanimous mode. Once the circuit count reaches the
//! configured threshold the mode flips to majority and stays there:
//!
//! ```text
//! circuit:   0 ──── 1 ──── 2 ──── 3 ──── ...
//! mode:      Unanimous     │ Majority ──────►
//!                          └ threshold = 2
//! ```

use serde::{Deserialize, Serialize};

/// Default number of completed circuits before majority voting is enabled.
pub const DEFAULT_MAJORITY_AFTER_CIRCUITS: u32 = 2;

/// The vote-satisfaction rule for newly opened proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    /// Every decisive vote must be "yes".
    #[default]
    Unanimous,
    /// Strictly more "yes" than "no".
    Majority,
}

impl std::fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unanimous => write!(f, "Unanimous"),
            Self::Majority => write!(f, "Majority"),
        }
    }
}

impl ConsensusMode {
    /// The mode in force after `circuits` completed rotations.
    ///
    /// Never returns `Unanimous` once `self` is `Majority`.
    #[must_use]
    pub const fn after_circuits(self, circuits: u32, majority_after: u32) -> Self {
        match self {
            Self::Majority => Self::Majority,
            Self::Unanimous if circuits >= majority_after => Self::Majority,
            Self::Unanimous => Self::Unanimous,
        }
    }

    /// True if this transition is the single Unanimous → Majority flip.
    #[must_use]
    pub const fn flips_to(self, next: Self) -> bool {
        matches!((self, next), (Self::Unanimous, Self::Majority))
    }
}
