//! Persistent storage using RocksDB.
//!
//! # Keys
//!
//! - `game` - the singleton [`GameState`]
//! - `player:{join_order}` - one [`Player`] per registration
//! - `proposal:{id}` - one [`Proposal`] with its votes
//!
//! Values are JSON. Every mutation is written as one atomic batch, so a
//! crash never leaves the game state and a proposal out of step.

use crate::error::Result;
use crate::models::{GameState, Player, Proposal, ProposalId};
use rocksdb::{Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use std::path::Path;

const GAME_KEY: &[u8] = b"game";

/// Storage backend for Reality data.
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Write the game state, the given players and proposals atomically.
    pub fn persist(
        &self,
        state: &GameState,
        players: &[Player],
        proposals: &[&Proposal],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(GAME_KEY, serde_json::to_vec(state)?);
        for player in players {
            batch.put(player.storage_key().as_bytes(), serde_json::to_vec(player)?);
        }
        for proposal in proposals {
            batch.put(
                proposal.storage_key().as_bytes(),
                serde_json::to_vec(proposal)?,
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    // --- Game ---

    /// Load the game state, if one was ever persisted.
    pub fn load_game(&self) -> Result<Option<GameState>> {
        match self.db.get(GAME_KEY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    // --- Players ---

    /// List players in join order.
    pub fn list_players(&self) -> Result<Vec<Player>> {
        self.scan(b"player:")
    }

    // --- Proposals ---

    /// Get a proposal by id.
    pub fn get_proposal(&self, id: ProposalId) -> Result<Option<Proposal>> {
        match self.db.get(Proposal::key_for(id).as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// List all proposals in id order.
    pub fn list_proposals(&self) -> Result<Vec<Proposal>> {
        self.scan(b"proposal:")
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let mut items = Vec::new();

        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                items.push(serde_json::from_slice(&value)?);
            } else {
                break;
            }
        }

        Ok(items)
    }
}
