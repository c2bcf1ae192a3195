//! Game tunables.

use nomic_consensus::DEFAULT_MAJORITY_AFTER_CIRCUITS;
use std::time::Duration;

/// Tunables for one game. Rule facts on trunk override `win_score` and
/// `majority_after_circuits` once the game is running.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Number of the first proposal
    pub first_proposal_id: u64,

    /// Default score needed to win
    pub win_score: u64,

    /// Default circuits before majority voting
    pub majority_after_circuits: u32,

    /// Players needed to start
    pub min_players: usize,

    /// Rule text read for directives
    pub rules_file: String,

    /// Behavior definition loaded on self-modification
    pub behavior_file: String,

    /// Changes under these prefixes reload the behavior
    pub self_paths: Vec<String>,

    /// Changes under these prefixes notify players
    pub player_paths: Vec<String>,

    /// Time a player has to deliver a proposal after acknowledging its turn
    pub turn_timeout: Duration,

    /// Time a player has to vote after acknowledging a vote request
    pub vote_timeout: Duration,

    /// Keep proposal branches after resolution
    pub retain_branches: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            first_proposal_id: 301,
            win_score: 100,
            majority_after_circuits: DEFAULT_MAJORITY_AFTER_CIRCUITS,
            min_players: 2,
            rules_file: "rules.md".to_string(),
            behavior_file: "reality/behavior.json".to_string(),
            self_paths: vec!["reality/".to_string()],
            player_paths: vec!["ai/".to_string()],
            turn_timeout: Duration::from_secs(1200),
            vote_timeout: Duration::from_secs(1200),
            retain_branches: false,
        }
    }
}

impl GameConfig {
    /// Whether any of `paths` falls under the behavior prefixes.
    pub fn touches_self(&self, paths: &[String]) -> bool {
        touches(paths, &self.self_paths) || paths.iter().any(|p| *p == self.behavior_file)
    }

    /// Whether any of `paths` falls under the player prefixes.
    pub fn touches_players(&self, paths: &[String]) -> bool {
        touches(paths, &self.player_paths)
    }
}

fn touches(paths: &[String], prefixes: &[String]) -> bool {
    paths
        .iter()
        .any(|path| prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())))
}
