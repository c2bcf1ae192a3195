//! Vote tally over a proposal's electorate.

use serde::{Deserialize, Serialize};

/// Where one member of the electorate stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ballot {
    /// Voted in favor
    Yes,
    /// Voted against
    No,
    /// Timed out, unreachable, or answered malformed
    Abstain,
    /// Not heard from yet
    Pending,
}

impl From<bool> for Ballot {
    fn from(choice: bool) -> Self {
        if choice {
            Ballot::Yes
        } else {
            Ballot::No
        }
    }
}

/// Counts of ballots for one proposal.
///
/// `others_decisive` counts yes/no votes cast by anyone but the proposer;
/// a proposal needs at least one of those to be ratified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tally {
    pub yes: usize,
    pub no: usize,
    pub abstain: usize,
    pub pending: usize,
    pub others_decisive: usize,
}

impl Tally {
    /// Count ballots. `is_proposer` marks the proposer's own entry.
    pub fn count<I>(ballots: I) -> Self
    where
        I: IntoIterator<Item = (Ballot, bool)>,
    {
        let mut tally = Tally::default();
        for (ballot, is_proposer) in ballots {
            match ballot {
                Ballot::Yes => tally.yes += 1,
                Ballot::No => tally.no += 1,
                Ballot::Abstain => tally.abstain += 1,
                Ballot::Pending => tally.pending += 1,
            }
            if !is_proposer && matches!(ballot, Ballot::Yes | Ballot::No) {
                tally.others_decisive += 1;
            }
        }
        tally
    }

    /// Yes + no.
    pub fn decisive(&self) -> usize {
        self.yes + self.no
    }

    /// Size of the electorate this tally covers.
    pub fn electorate(&self) -> usize {
        self.yes + self.no + self.abstain + self.pending
    }

    /// True once every member has voted or abstained.
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// True if someone besides the proposer cast a decisive vote.
    pub fn has_quorum(&self) -> bool {
        self.others_decisive > 0
    }

    /// True if no decisive vote was "no".
    pub fn is_unanimous(&self) -> bool {
        self.no == 0
    }
}
