//! Ratification Consensus for Nomic Reality
//!
//! A proposal is judged by the consensus mode that was in force when it
//! opened. Modes change over time (unanimity first, majority later) but a
//! vote in progress never changes its rules.
//!
//! # Core Insight
//!
//! The verdict is a pure function of the ballot set. Early decisions are only
//! taken when no pending ballot could change the result, so any arrival order
//! of the same votes reaches the same verdict.
//!
//! # Abstentions
//!
//! Players that time out, are unreachable, or answer garbage abstain.
//! Abstentions are excluded from the denominator:
//! - Unanimous → every decisive vote is "yes"
//! - Majority → strictly more "yes" than "no" (ties reject)
//!
//! A proposal also needs a quorum of one decisive vote from someone other
//! than the proposer.

mod mode;
mod tally;
mod verdict;

pub use mode::{ConsensusMode, DEFAULT_MAJORITY_AFTER_CIRCUITS};
pub use tally::{Ballot, Tally};
pub use verdict::{judge, RejectReason, Verdict};
