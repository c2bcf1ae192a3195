//! Nomic Reality - Self-Modifying Game Orchestrator
//!
//! The authoritative engine for a game of Nomic played by remote players
//! whose rules, and whose own scoring behavior, live in a version-controlled
//! repository.
//!
//! # Architecture
//!
//! - **Orchestrator**: turn rotation, proposals, votes, ratification
//! - **Gateway**: outbound HTTP calls to player endpoints
//! - **Behavior**: hot-reloadable scoring and verdict policy
//! - **Rules**: whitelisted facts extracted from the rule text
//! - **Storage**: RocksDB-backed game state, players and proposals
//! - **API**: HTTP endpoints for players and operators
//! - **Admin Socket**: Unix socket for manual recovery (reality-admin CLI)
//!
//! # Example
//!
//! ```no_run
//! use nomic_reality::{RealityConfig, RealityNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RealityConfig::from_env()?;
//!     let node = RealityNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin_socket;
pub mod api;
pub mod behavior;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod models;
pub mod node;
pub mod orchestrator;
pub mod rules;
pub mod storage;

pub use behavior::{Behavior, BehaviorLoader, LoadError};
pub use error::{Error, Result};
pub use gateway::{HttpGateway, PlayerGateway};
pub use models::{
    Alarm, GamePhase, GameState, Halt, Outcome, Player, Proposal, ProposalId, ProposalStatus,
    StateSnapshot, Vote,
};
pub use node::{RealityConfig, RealityNode};
pub use orchestrator::{AdvanceOutcome, GameConfig, Orchestrator, ProposalSubmission, VoteReceipt};
pub use storage::Storage;
