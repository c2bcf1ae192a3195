//! Ratification verdicts.
//!
//! A verdict is decided as soon as no remaining ballot can change it, so the
//! outcome depends only on the final vote set, never on arrival order:
//!
//! ```text
//! MODE        PASSES WHEN                          REJECTS EARLY WHEN
//! ───────────────────────────────────────────────────────────────────────
//! Unanimous   nobody pending, no "no", quorum      any "no"
//! Majority    yes > no + pending, quorum           yes + pending <= no
//! ```
//!
//! Abstentions never count toward the denominator. Quorum means at least one
//! decisive vote from someone other than the proposer.

use crate::mode::ConsensusMode;
use crate::tally::Tally;
use serde::{Deserialize, Serialize};

/// Why a proposal failed ratification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Unanimity broken by an explicit "no"
    Dissent,
    /// Majority not reached (ties reject)
    NoMajority,
    /// Everyone except the proposer abstained
    NoQuorum,
}

/// Outcome of judging a tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    /// More ballots are needed
    Pending,
    /// Ratify
    Passed,
    /// Cannot pass any more
    Rejected(RejectReason),
}

impl Verdict {
    /// True for `Passed` and `Rejected`.
    pub const fn is_decided(&self) -> bool {
        !matches!(self, Verdict::Pending)
    }
}

/// Judge a tally under the given mode.
pub fn judge(mode: ConsensusMode, tally: &Tally) -> Verdict {
    match mode {
        ConsensusMode::Unanimous => judge_unanimous(tally),
        ConsensusMode::Majority => judge_majority(tally),
    }
}

fn judge_unanimous(tally: &Tally) -> Verdict {
    if tally.no > 0 {
        return Verdict::Rejected(RejectReason::Dissent);
    }
    if !tally.is_complete() {
        return Verdict::Pending;
    }
    if tally.has_quorum() {
        Verdict::Passed
    } else {
        Verdict::Rejected(RejectReason::NoQuorum)
    }
}

fn judge_majority(tally: &Tally) -> Verdict {
    // Even if every pending voter says yes, "no" still wins or ties
    if tally.yes + tally.pending <= tally.no {
        return Verdict::Rejected(RejectReason::NoMajority);
    }
    // Even if every pending voter says no, "yes" still wins
    if tally.yes > tally.no + tally.pending && tally.has_quorum() {
        return Verdict::Passed;
    }
    if !tally.is_complete() {
        return Verdict::Pending;
    }
    // Complete, yes > no, but only the proposer was decisive
    Verdict::Rejected(RejectReason::NoQuorum)
}
