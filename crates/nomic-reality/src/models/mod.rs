//! Game models for Reality.
//!
//! # Core Types
//!
//! - [`Player`] - A registered participant and its score
//! - [`Proposal`] - A rule change under vote, with its ballots
//! - [`GameState`] - The singleton turn/consensus state machine
//!
//! # Supporting Types
//!
//! - [`Vote`] - One recorded ballot
//! - [`ProposalStatus`] - Open, Passed, Rejected, Withdrawn
//! - [`GamePhase`] - NotStarted, InProgress, Halted, Won
//! - [`Alarm`] - Operator-visible problem that did not stop the game
//! - [`Outcome`] - How the most recent proposal or turn ended
//!
//! # Views
//!
//! - [`StateSnapshot`] - `GET /state` and the `game_state` sent to players
//! - [`ProposalView`] - A proposal with its current tally

mod game_state;
mod player;
mod proposal;
mod snapshot;

pub use game_state::{Alarm, GamePhase, GameState, Halt, Outcome, TurnAdvance};
pub use player::Player;
pub use proposal::{Proposal, ProposalId, ProposalStatus, Vote};
pub use snapshot::{ProposalView, StateSnapshot};
