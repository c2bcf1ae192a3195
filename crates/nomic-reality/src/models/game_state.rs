//! Game state - the singleton turn and consensus state machine.

use super::proposal::{ProposalId, ProposalStatus};
use chrono::{DateTime, Utc};
use nomic_consensus::ConsensusMode;
use serde::{Deserialize, Serialize};

/// Game lifecycle.
///
/// ```text
/// NotStarted ──start──► InProgress ──score ≥ win──► Won
///                          │  ▲
///                   paradox│  │resume
///                          ▼  │
///                         Halted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    NotStarted,
    InProgress,
    Halted,
    Won,
}

impl std::fmt::Display for GamePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Halted => write!(f, "halted"),
            Self::Won => write!(f, "won"),
        }
    }
}

/// Why the game halted and where `resume` returns to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Halt {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub resume_to: GamePhase,
}

/// Operator-visible problem that did not stop the game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alarm {
    pub message: String,
    pub raised_at: DateTime<Utc>,
    /// Proposal whose ratification raised the alarm
    pub proposal_id: Option<ProposalId>,
}

/// How the most recent proposal or turn ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outcome {
    pub player: String,
    /// Absent for skipped turns
    pub proposal_id: Option<ProposalId>,
    pub status: Option<ProposalStatus>,
    pub detail: Option<String>,
    pub points: i64,
    pub at: DateTime<Utc>,
}

/// Effect of moving to the next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnAdvance {
    /// Turn index wrapped to 0
    pub wrapped: bool,
    /// Consensus mode flipped to Majority
    pub flipped: bool,
}

/// The singleton game state. Persisted after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameState {
    pub phase: GamePhase,

    /// Index into join order of the turn holder
    pub turn_index: usize,

    /// Completed full rotations
    pub circuit: u32,

    pub consensus_mode: ConsensusMode,

    pub majority_after_circuits: u32,

    pub win_score: u64,

    pub next_proposal_id: ProposalId,

    pub open_proposal: Option<ProposalId>,

    pub winner: Option<String>,

    pub halt: Option<Halt>,

    pub alarm: Option<Alarm>,

    pub last_outcome: Option<Outcome>,

    /// When the turn holder acknowledged a turn request
    pub turn_solicited_at: Option<DateTime<Utc>>,

    /// Identity of the active behavior
    pub behavior: String,
}

impl GameState {
    /// Fresh state for a game that has not started.
    pub fn new(first_proposal_id: ProposalId, win_score: u64, majority_after_circuits: u32) -> Self {
        Self {
            phase: GamePhase::NotStarted,
            turn_index: 0,
            circuit: 0,
            consensus_mode: ConsensusMode::Unanimous,
            majority_after_circuits,
            win_score,
            next_proposal_id: first_proposal_id,
            open_proposal: None,
            winner: None,
            halt: None,
            alarm: None,
            last_outcome: None,
            turn_solicited_at: None,
            behavior: String::new(),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.phase == GamePhase::Halted
    }

    /// Hand the turn to the next player in join order.
    ///
    /// The circuit count increments only when the index wraps to 0, and the
    /// consensus mode only ever moves from Unanimous to Majority.
    pub fn advance_turn(&mut self, player_count: usize) -> TurnAdvance {
        let player_count = player_count.max(1);
        self.turn_index = (self.turn_index + 1) % player_count;
        self.turn_solicited_at = None;
        let wrapped = self.turn_index == 0;
        if wrapped {
            self.circuit += 1;
        }
        let next = self
            .consensus_mode
            .after_circuits(self.circuit, self.majority_after_circuits);
        let flipped = self.consensus_mode.flips_to(next);
        self.consensus_mode = next;
        TurnAdvance { wrapped, flipped }
    }

    /// Stop the game. Keeps the first reason if already halted.
    pub fn halt(&mut self, reason: impl Into<String>) {
        if self.halt.is_none() {
            self.halt = Some(Halt {
                reason: reason.into(),
                at: Utc::now(),
                resume_to: self.phase,
            });
        }
        self.phase = GamePhase::Halted;
    }

    /// Leave the halted phase. Returns the phase resumed to.
    pub fn resume(&mut self) -> Option<GamePhase> {
        let halt = self.halt.take()?;
        self.phase = match halt.resume_to {
            GamePhase::Halted => GamePhase::InProgress,
            phase => phase,
        };
        Some(self.phase)
    }

    pub fn raise_alarm(&mut self, message: impl Into<String>, proposal_id: Option<ProposalId>) {
        self.alarm = Some(Alarm {
            message: message.into(),
            raised_at: Utc::now(),
            proposal_id,
        });
    }
}
