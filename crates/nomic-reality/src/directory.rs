//! Player directory - registered players in join order.

use crate::error::{Error, Result};
use crate::models::Player;

/// Registered players. Join order is fixed at registration and never changes.
#[derive(Debug, Clone, Default)]
pub struct PlayerDirectory {
    players: Vec<Player>,
}

impl PlayerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted players.
    pub fn from_players(mut players: Vec<Player>) -> Self {
        players.sort_by_key(|p| p.join_order);
        Self { players }
    }

    /// Register a player at the end of the turn order.
    pub fn add(&mut self, name: &str, endpoint_url: &str) -> Result<&Player> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("player name must not be empty".into()));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::InvalidInput(format!(
                "player name {:?} may only contain letters, digits, '-', '_' and '.'",
                name
            )));
        }
        validate_endpoint(endpoint_url)?;
        if self.contains(name) {
            return Err(Error::DuplicatePlayer(name.to_string()));
        }

        let join_order = self.players.len() as u32;
        self.players.push(Player::new(
            name.to_string(),
            endpoint_url.trim_end_matches('/').to_string(),
            join_order,
        ));
        Ok(&self.players[self.players.len() - 1])
    }

    pub fn get(&self, name: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Player at a turn index.
    pub fn at(&self, index: usize) -> Option<&Player> {
        self.players.get(index)
    }

    /// All players in join order.
    pub fn list(&self) -> &[Player] {
        &self.players
    }

    pub fn names(&self) -> Vec<String> {
        self.players.iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Highest scoring player at or above `win_score`, earliest joiner on ties.
    pub fn leader_at(&self, win_score: u64) -> Option<&Player> {
        self.players
            .iter()
            .filter(|p| p.score >= win_score)
            .fold(None, |best: Option<&Player>, p| match best {
                Some(b) if b.score >= p.score => Some(b),
                _ => Some(p),
            })
    }
}

fn validate_endpoint(endpoint_url: &str) -> Result<()> {
    let url = reqwest::Url::parse(endpoint_url)
        .map_err(|e| Error::InvalidInput(format!("invalid endpoint url {:?}: {}", endpoint_url, e)))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(()),
        _ => Err(Error::InvalidInput(format!(
            "endpoint url must be an absolute http(s) url: {}",
            endpoint_url
        ))),
    }
}
