//! Error types for Reality.

use crate::behavior::LoadError;
use crate::models::{GamePhase, ProposalId};
use nomic_ledger::LedgerError;
use thiserror::Error;

/// Result type for Reality operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Reality operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A player with this name is already registered
    #[error("player already registered: {0}")]
    DuplicatePlayer(String),

    /// Registration is closed once the game starts
    #[error("game already started")]
    GameAlreadyStarted,

    /// Not enough players to start
    #[error("need at least {need} players, have {have}")]
    InsufficientPlayers { have: usize, need: usize },

    /// Operation not allowed in the current phase
    #[error("operation not allowed while game is {0}")]
    InvalidPhase(GamePhase),

    /// The game is halted and refuses mutation
    #[error("game halted: {0}")]
    GameHalted(String),

    /// Someone other than the turn holder tried to act
    #[error("not {player}'s turn; waiting on {holder}")]
    NotYourTurn { player: String, holder: String },

    /// Another proposal is still open
    #[error("proposal {0} is still open")]
    ProposalAlreadyOpen(ProposalId),

    /// The proposal exists but is resolved
    #[error("proposal {0} is not open")]
    ProposalNotOpen(ProposalId),

    /// No such proposal
    #[error("proposal {0} not found")]
    ProposalNotFound(ProposalId),

    /// No such player
    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    /// The diff does not apply to trunk
    #[error("patch does not apply: {0}")]
    PatchApplyFailed(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Behavior definition could not be loaded
    #[error("behavior load failed: {0}")]
    Behavior(#[from] LoadError),

    /// Ledger error
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DuplicatePlayer(_) => "DuplicatePlayer",
            Error::GameAlreadyStarted => "GameAlreadyStarted",
            Error::InsufficientPlayers { .. } => "InsufficientPlayers",
            Error::InvalidPhase(_) => "InvalidPhase",
            Error::GameHalted(_) => "GameHalted",
            Error::NotYourTurn { .. } => "NotYourTurn",
            Error::ProposalAlreadyOpen(_) => "ProposalAlreadyOpen",
            Error::ProposalNotOpen(_) => "ProposalNotOpen",
            Error::ProposalNotFound(_) => "ProposalNotFound",
            Error::UnknownPlayer(_) => "UnknownPlayer",
            Error::PatchApplyFailed(_) => "PatchApplyFailed",
            Error::InvalidInput(_) => "InvalidInput",
            Error::NotFound(_) => "NotFound",
            Error::Behavior(_) => "BehaviorLoadFailed",
            Error::Ledger(LedgerError::BranchExists(_)) => "BranchExists",
            Error::Ledger(LedgerError::InvalidRef(_)) => "InvalidInput",
            Error::Ledger(_) => "LedgerError",
            Error::Storage(_) => "StorageError",
            Error::Config(_) => "ConfigError",
            Error::Serialization(_) => "SerializationError",
            Error::Io(_) => "IoError",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
