//! Proposal model - a rule change under vote.

use chrono::{DateTime, Utc};
use nomic_consensus::{Ballot, ConsensusMode, Tally};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Proposal number. Monotonically increasing, never reused.
pub type ProposalId = u64;

/// Lifecycle of a proposal. Only `Open` is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Open,
    Passed,
    Rejected,
    Withdrawn,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Passed => write!(f, "passed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Withdrawn => write!(f, "withdrawn"),
        }
    }
}

/// One recorded ballot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub proposal_id: ProposalId,
    pub voter: String,
    pub choice: bool,
    pub cast_at: DateTime<Utc>,
}

/// A proposed change to the rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub id: ProposalId,

    /// Player who made the proposal
    pub proposer: String,

    pub description: String,

    /// Unified diff against trunk
    pub diff: String,

    /// Ledger branch holding the change
    pub branch: String,

    pub status: ProposalStatus,

    pub created_at: DateTime<Utc>,

    /// Consensus mode in force when the proposal opened
    pub mode: ConsensusMode,

    /// Players eligible to vote, proposer included
    pub electorate: Vec<String>,

    /// At most one vote per voter; kept after resolution
    #[serde(default)]
    pub votes: BTreeMap<String, Vote>,

    /// Voters that timed out, were unreachable or answered malformed
    #[serde(default)]
    pub abstentions: BTreeSet<String>,

    /// Voters that acknowledged a vote request and will call back
    #[serde(default)]
    pub solicited: BTreeMap<String, DateTime<Utc>>,

    pub resolved_at: Option<DateTime<Utc>>,

    /// Branch commit the proposal was opened at
    #[serde(default)]
    pub head_commit: Option<String>,

    /// Trunk commit that ratified the proposal
    pub merge_commit: Option<String>,

    /// Why the proposal was rejected
    pub rejection: Option<String>,

    /// Score change applied to the proposer on resolution
    #[serde(default)]
    pub points_awarded: i64,
}

impl Proposal {
    /// Open a proposal. The proposer's own vote is recorded as "yes".
    pub fn open(
        id: ProposalId,
        proposer: String,
        description: String,
        diff: String,
        branch: String,
        mode: ConsensusMode,
        electorate: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let mut votes = BTreeMap::new();
        votes.insert(
            proposer.clone(),
            Vote {
                proposal_id: id,
                voter: proposer.clone(),
                choice: true,
                cast_at: now,
            },
        );
        Self {
            id,
            proposer,
            description,
            diff,
            branch,
            status: ProposalStatus::Open,
            created_at: now,
            mode,
            electorate,
            votes,
            abstentions: BTreeSet::new(),
            solicited: BTreeMap::new(),
            resolved_at: None,
            head_commit: None,
            merge_commit: None,
            rejection: None,
            points_awarded: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ProposalStatus::Open
    }

    /// Storage key for this proposal.
    pub fn storage_key(&self) -> String {
        Self::key_for(self.id)
    }

    /// Storage key for a proposal id. Zero-padded so keys sort numerically.
    pub fn key_for(id: ProposalId) -> String {
        format!("proposal:{:020}", id)
    }

    /// Where `voter` currently stands.
    pub fn ballot(&self, voter: &str) -> Ballot {
        if let Some(vote) = self.votes.get(voter) {
            Ballot::from(vote.choice)
        } else if self.abstentions.contains(voter) {
            Ballot::Abstain
        } else {
            Ballot::Pending
        }
    }

    /// Tally over the electorate.
    pub fn tally(&self) -> Tally {
        Tally::count(
            self.electorate
                .iter()
                .map(|voter| (self.ballot(voter), *voter == self.proposer)),
        )
    }

    /// Record or overwrite a vote. Replaces an earlier abstention.
    pub fn record_vote(&mut self, voter: &str, choice: bool) {
        self.abstentions.remove(voter);
        self.solicited.remove(voter);
        self.votes.insert(
            voter.to_string(),
            Vote {
                proposal_id: self.id,
                voter: voter.to_string(),
                choice,
                cast_at: Utc::now(),
            },
        );
    }

    /// Record an abstention unless the voter already voted.
    pub fn record_abstention(&mut self, voter: &str) {
        self.solicited.remove(voter);
        if !self.votes.contains_key(voter) {
            self.abstentions.insert(voter.to_string());
        }
    }

    /// Electorate members still to be heard from.
    pub fn outstanding(&self) -> impl Iterator<Item = &String> {
        self.electorate
            .iter()
            .filter(move |voter| self.ballot(voter) == Ballot::Pending)
    }

    /// Players that voted "no".
    pub fn dissenters(&self) -> impl Iterator<Item = &String> {
        self.votes
            .values()
            .filter(|vote| !vote.choice)
            .map(|vote| &vote.voter)
    }

    /// Move out of `Open`.
    pub fn close(&mut self, status: ProposalStatus) {
        self.status = status;
        self.solicited.clear();
        self.resolved_at = Some(Utc::now());
    }

    /// First line of the description, for commit messages and logs.
    pub fn title(&self) -> &str {
        self.description.lines().next().unwrap_or_default().trim()
    }
}
