//! Player gateway - outbound calls to remote players.
//!
//! Players are HTTP services. Reality asks the turn holder for a proposal,
//! asks the electorate for votes, tells everyone to pull after each
//! ratification, and pings everyone after player code changes:
//!
//! ```text
//! POST {endpoint}/turn    {player_name, proposal_number, game_state}
//!                         ─► {description, diff, branch} | {status: ..}
//! POST {endpoint}/vote    {player_name, proposal_id, proposer, description,
//!                          diff, branch, game_state}
//!                         ─► {vote: bool} | {status: ..}
//! POST {endpoint}/pull    fire and forget
//! POST {endpoint}/update  fire and forget
//! ```
//!
//! A `{status: ..}` acknowledgement means the player is working in the
//! background and will call back through the inbound API. Every failure is
//! an outcome, never an error: the orchestrator turns failed votes into
//! abstentions and failed turn requests into retries.

use crate::error::{Error, Result};
use crate::models::{Player, ProposalId, StateSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Turn request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRequest {
    pub player_name: String,
    pub proposal_number: ProposalId,
    pub game_state: StateSnapshot,
}

/// Vote request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoteRequest {
    pub player_name: String,
    pub proposal_id: ProposalId,
    pub proposer: String,
    pub description: String,
    pub diff: String,
    pub branch: String,
    pub game_state: StateSnapshot,
}

/// A proposal returned by the turn holder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProposalDraft {
    pub description: String,
    /// Empty when the player pushed the branch itself
    #[serde(default)]
    pub diff: String,
    pub branch: String,
}

/// Outcome of asking for a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnReply {
    Proposal(ProposalDraft),
    /// Acknowledged; the proposal will arrive through the inbound API
    Deferred,
    Unreachable(String),
    Timeout,
    Malformed(String),
}

/// Outcome of asking for a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteReply {
    Vote(bool),
    /// Acknowledged; the vote will arrive through the inbound API
    Deferred,
    Unreachable(String),
    Timeout,
    Malformed(String),
}

/// Outbound interface to players.
#[async_trait]
pub trait PlayerGateway: Send + Sync {
    /// Ask the turn holder for a proposal.
    async fn request_turn(&self, player: &Player, request: &TurnRequest) -> TurnReply;

    /// Ask a player for a vote.
    async fn request_vote(&self, player: &Player, request: &VoteRequest) -> VoteReply;

    /// Tell a player that trunk moved.
    async fn notify_pull(&self, player: &Player);

    /// Tell a player that player code on trunk changed.
    async fn notify_update(&self, player: &Player);
}

/// Why a call produced no usable body.
enum Failure {
    Unreachable(String),
    Timeout,
    Malformed(String),
}

impl From<reqwest::Error> for Failure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Failure::Timeout
        } else if e.is_decode() || e.is_body() {
            Failure::Malformed(e.to_string())
        } else {
            Failure::Unreachable(e.to_string())
        }
    }
}

/// [`PlayerGateway`] over HTTP with a bounded per-call timeout.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
}

impl HttpGateway {
    /// Create a gateway whose calls give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        player: &Player,
        route: &str,
        body: &B,
    ) -> std::result::Result<Value, Failure> {
        let url = format!("{}/{}", player.endpoint_url, route);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Failure::Malformed(format!("{} answered {}", url, status)));
        }
        let bytes = response.bytes().await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(_) if status == reqwest::StatusCode::ACCEPTED => {
                Ok(serde_json::json!({ "status": "accepted" }))
            }
            Err(e) => Err(Failure::Malformed(format!("invalid JSON from {}: {}", url, e))),
        }
    }

    /// Fire-and-forget POST; failures are only logged.
    async fn notify(&self, player: &Player, route: &str) {
        let url = format!("{}/{}", player.endpoint_url, route);
        match self.client.post(&url).json(&serde_json::json!({})).send().await {
            Ok(response) => {
                tracing::debug!(player = %player.name, %route, status = %response.status(), "Notification sent")
            }
            Err(e) => tracing::warn!(player = %player.name, %route, "Notification failed: {}", e),
        }
    }
}

fn is_ack(value: &Value) -> bool {
    value.get("status").is_some()
}

fn parse_turn(value: Value) -> TurnReply {
    if is_ack(&value) && value.get("description").is_none() {
        return TurnReply::Deferred;
    }
    match serde_json::from_value::<ProposalDraft>(value) {
        Ok(draft) => TurnReply::Proposal(draft),
        Err(e) => TurnReply::Malformed(e.to_string()),
    }
}

fn parse_vote(value: Value) -> VoteReply {
    match value.get("vote") {
        Some(Value::Bool(choice)) => VoteReply::Vote(*choice),
        Some(other) => VoteReply::Malformed(format!("vote must be a boolean, got {}", other)),
        None if is_ack(&value) => VoteReply::Deferred,
        None => VoteReply::Malformed("missing vote".into()),
    }
}

#[async_trait]
impl PlayerGateway for HttpGateway {
    async fn request_turn(&self, player: &Player, request: &TurnRequest) -> TurnReply {
        tracing::debug!(player = %player.name, proposal = request.proposal_number, "Requesting turn");
        match self.post(player, "turn", request).await {
            Ok(value) => parse_turn(value),
            Err(Failure::Unreachable(e)) => TurnReply::Unreachable(e),
            Err(Failure::Timeout) => TurnReply::Timeout,
            Err(Failure::Malformed(e)) => TurnReply::Malformed(e),
        }
    }

    async fn request_vote(&self, player: &Player, request: &VoteRequest) -> VoteReply {
        tracing::debug!(player = %player.name, proposal = request.proposal_id, "Requesting vote");
        match self.post(player, "vote", request).await {
            Ok(value) => parse_vote(value),
            Err(Failure::Unreachable(e)) => VoteReply::Unreachable(e),
            Err(Failure::Timeout) => VoteReply::Timeout,
            Err(Failure::Malformed(e)) => VoteReply::Malformed(e),
        }
    }

    async fn notify_pull(&self, player: &Player) {
        self.notify(player, "pull").await;
    }

    async fn notify_update(&self, player: &Player) {
        self.notify(player, "update").await;
    }
}
