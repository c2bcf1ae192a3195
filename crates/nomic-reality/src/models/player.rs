//! Player model - a registered participant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A player in the game.
///
/// Players are never removed once registered; join order fixes turn order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    /// Unique name
    pub name: String,

    /// Callback URL for turn and vote requests
    pub endpoint_url: String,

    /// Cumulative score, never negative
    #[serde(default)]
    pub score: u64,

    /// Position in turn order (0-based)
    pub join_order: u32,

    /// Registration time
    pub joined_at: DateTime<Utc>,
}

impl Player {
    /// Create a new player with a zero score.
    pub fn new(name: String, endpoint_url: String, join_order: u32) -> Self {
        Self {
            name,
            endpoint_url,
            score: 0,
            join_order,
            joined_at: Utc::now(),
        }
    }

    /// Add points.
    pub fn award(&mut self, points: u64) {
        self.score = self.score.saturating_add(points);
    }

    /// Remove points, stopping at zero. Returns the points actually removed.
    pub fn penalize(&mut self, points: u64) -> u64 {
        let removed = points.min(self.score);
        self.score -= removed;
        removed
    }

    /// Storage key for this player.
    pub fn storage_key(&self) -> String {
        format!("player:{:06}", self.join_order)
    }
}
