//! Read-only views served over the API and sent to players.

use super::game_state::{Alarm, GamePhase, GameState, Halt, Outcome};
use super::player::Player;
use super::proposal::{Proposal, ProposalId, ProposalStatus};
use nomic_consensus::{ConsensusMode, Tally};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of a proposal and where its vote stands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalView {
    pub id: ProposalId,
    pub proposer: String,
    pub description: String,
    pub branch: String,
    pub status: ProposalStatus,
    pub mode: ConsensusMode,
    pub tally: Tally,
    pub votes: BTreeMap<String, bool>,
    pub abstentions: Vec<String>,
}

impl From<&Proposal> for ProposalView {
    fn from(p: &Proposal) -> Self {
        Self {
            id: p.id,
            proposer: p.proposer.clone(),
            description: p.description.clone(),
            branch: p.branch.clone(),
            status: p.status,
            mode: p.mode,
            tally: p.tally(),
            votes: p
                .votes
                .iter()
                .map(|(voter, vote)| (voter.clone(), vote.choice))
                .collect(),
            abstentions: p.abstentions.iter().cloned().collect(),
        }
    }
}

/// Game state as seen from outside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub phase: GamePhase,
    pub turn_index: usize,
    pub current_player: Option<String>,
    pub circuit: u32,
    pub consensus_mode: ConsensusMode,
    pub majority_voting: bool,
    pub majority_after_circuits: u32,
    pub win_score: u64,
    pub next_proposal_id: ProposalId,
    pub open_proposal: Option<ProposalView>,
    pub winner: Option<String>,
    pub halt: Option<Halt>,
    pub alarm: Option<Alarm>,
    pub last_outcome: Option<Outcome>,
    pub behavior: String,
    pub players: Vec<Player>,
}

impl StateSnapshot {
    pub fn capture(state: &GameState, players: &[Player], open: Option<&Proposal>) -> Self {
        let current_player = match state.phase {
            GamePhase::NotStarted => None,
            _ => players.get(state.turn_index).map(|p| p.name.clone()),
        };
        Self {
            phase: state.phase,
            turn_index: state.turn_index,
            current_player,
            circuit: state.circuit,
            consensus_mode: state.consensus_mode,
            majority_voting: state.consensus_mode == ConsensusMode::Majority,
            majority_after_circuits: state.majority_after_circuits,
            win_score: state.win_score,
            next_proposal_id: state.next_proposal_id,
            open_proposal: open.map(ProposalView::from),
            winner: state.winner.clone(),
            halt: state.halt.clone(),
            alarm: state.alarm.clone(),
            last_outcome: state.last_outcome.clone(),
            behavior: state.behavior.clone(),
            players: players.to_vec(),
        }
    }
}
