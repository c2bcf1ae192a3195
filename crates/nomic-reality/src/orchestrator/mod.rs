//! Turn orchestrator - the authoritative game engine.
//!
//! Owns the game state, the player directory, the open proposal and the
//! active behavior. Every mutation happens under one async lock; remote
//! players are called with the lock released and their answers are
//! re-validated when it is taken again.
//!
//! # Turn cycle
//!
//! ```text
//!            advance()                      submit_vote()
//! turn holder ──────► request_turn ─┐      ┌──────────────┐
//!      ▲                            ▼      ▼              │
//!      │                     submit_proposal ──► Open ────┤
//!      │                                          │       │ pending
//!      │         ┌────────── Rejected ◄── verdict ┘◄──────┘
//!      │         │                          │
//!      └─ next ◄─┴── Passed ◄── merge ◄─────┘
//!                      │
//!                      ├─ award points
//!                      ├─ reload behavior / notify players
//!                      ├─ re-extract rule facts, win check
//!                      └─ tell every player to pull
//! ```
//!
//! # Concurrency
//!
//! Gateway calls are tracked in a separate in-flight set so concurrent
//! [`Orchestrator::advance`] calls never ask the same player twice.

mod config;

pub use config::GameConfig;

use crate::behavior::{Behavior, BehaviorLoader, LoadError};
use crate::directory::PlayerDirectory;
use crate::error::{Error, Result};
use crate::gateway::{PlayerGateway, TurnReply, TurnRequest, VoteReply, VoteRequest};
use crate::models::{
    GamePhase, GameState, Outcome, Player, Proposal, ProposalId, ProposalStatus, StateSnapshot,
};
use crate::rules;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use nomic_consensus::{Ballot, RejectReason, Tally, Verdict};
use nomic_ledger::{patch, CommitId, Ledger, LedgerError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// A proposal as submitted by its proposer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalSubmission {
    pub proposer: String,
    pub description: String,
    /// Unified diff against trunk; empty when the branch was pushed directly
    #[serde(default)]
    pub diff: String,
    pub branch: String,
}

/// Result of recording a vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoteReceipt {
    pub proposal_id: ProposalId,
    pub status: ProposalStatus,
    pub tally: Tally,
}

/// What one [`Orchestrator::advance`] call did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Nothing to do in this phase
    Idle { phase: GamePhase },
    /// The turn holder answered with a proposal that is now open
    ProposalOpened { proposal_id: ProposalId },
    /// The turn holder answered with a proposal that was refused
    ProposalRefused { player: String, error: String },
    /// The turn holder acknowledged and will call back
    AwaitingProposal { player: String },
    /// The turn holder did not deliver in time
    TurnSkipped { player: String },
    /// The turn holder could not be asked; retried next tick
    PlayerUnavailable { player: String, reason: String },
    /// Vote requests went out
    VotesRequested {
        proposal_id: ProposalId,
        requested: usize,
        status: ProposalStatus,
    },
    /// Every outstanding voter has been asked already
    AwaitingVotes { proposal_id: ProposalId },
    /// Overdue voters abstained and the proposal resolved
    ProposalResolved {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },
}

/// Side effects to run once the engine lock is released.
#[derive(Debug, Default)]
struct Effects {
    /// Players told that player code changed
    notify: Vec<Player>,
    /// Players told that trunk moved
    pull: Vec<Player>,
}

/// Where a proposal stands after its tally was judged.
struct Evaluation {
    status: ProposalStatus,
    tally: Tally,
    effects: Effects,
}

/// Everything guarded by the engine lock.
struct Engine {
    state: GameState,
    directory: PlayerDirectory,
    open: Option<Proposal>,
    behavior: Arc<dyn Behavior>,
}

impl Engine {
    fn ensure_not_halted(&self) -> Result<()> {
        match &self.state.halt {
            Some(halt) if self.state.is_halted() => Err(Error::GameHalted(halt.reason.clone())),
            _ if self.state.is_halted() => Err(Error::GameHalted("halted".into())),
            _ => Ok(()),
        }
    }

    fn ensure_in_progress(&self) -> Result<()> {
        self.ensure_not_halted()?;
        match self.state.phase {
            GamePhase::InProgress => Ok(()),
            phase => Err(Error::InvalidPhase(phase)),
        }
    }

    fn turn_holder(&self) -> Option<&Player> {
        self.directory.at(self.state.turn_index)
    }

    /// Check that `player` is registered and holds the turn.
    fn ensure_turn_holder(&self, player: &str) -> Result<()> {
        if !self.directory.contains(player) {
            return Err(Error::UnknownPlayer(player.to_string()));
        }
        let holder = self.turn_holder().map(|p| p.name.as_str()).unwrap_or_default();
        if holder != player {
            return Err(Error::NotYourTurn {
                player: player.to_string(),
                holder: holder.to_string(),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::capture(&self.state, self.directory.list(), self.open.as_ref())
    }

    /// Hand the turn on. Logs circuit completion and the consensus flip.
    fn next_turn(&mut self) {
        let step = self.state.advance_turn(self.directory.len());
        if step.wrapped {
            tracing::info!(circuit = self.state.circuit, "Circuit complete");
        }
        if step.flipped {
            tracing::info!(
                circuit = self.state.circuit,
                "Consensus mode is now {}",
                self.state.consensus_mode
            );
        }
        if let Some(holder) = self.turn_holder() {
            tracing::info!(player = %holder.name, turn = self.state.turn_index, "Turn passes");
        }
    }

    /// End the game when a player reached the win score.
    ///
    /// The highest score wins; join order breaks ties.
    fn check_winner(&mut self) -> bool {
        if self.state.phase != GamePhase::InProgress {
            return false;
        }
        let Some(leader) = self.directory.leader_at(self.state.win_score) else {
            return false;
        };
        let winner = leader.name.clone();
        tracing::info!(%winner, score = leader.score, win_score = self.state.win_score, "Game won");
        self.state.phase = GamePhase::Won;
        self.state.winner = Some(winner);
        true
    }

    fn record_outcome(&mut self, player: &str, proposal: Option<&Proposal>, detail: Option<String>) {
        self.state.last_outcome = Some(Outcome {
            player: player.to_string(),
            proposal_id: proposal.map(|p| p.id),
            status: proposal.map(|p| p.status),
            detail,
            points: proposal.map(|p| p.points_awarded).unwrap_or_default(),
            at: Utc::now(),
        });
    }
}

/// Outstanding remote call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Solicitation {
    Turn {
        player: String,
        proposal_number: ProposalId,
    },
    Vote {
        proposal_id: ProposalId,
        voter: String,
    },
}

/// Removes its solicitation from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a std::sync::Mutex<HashSet<Solicitation>>,
    key: Solicitation,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct Shared {
    config: GameConfig,
    engine: Mutex<Engine>,
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PlayerGateway>,
    storage: Arc<Storage>,
    loader: BehaviorLoader,
    in_flight: std::sync::Mutex<HashSet<Solicitation>>,
}

/// Handle to the game engine. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Restore the game from storage and reconcile it with the ledger.
    ///
    /// Loads the behavior and rule facts from trunk, finishes the
    /// ratification of an open proposal whose branch is already merged,
    /// and halts on inconsistencies between storage and ledger.
    pub async fn restore(
        config: GameConfig,
        storage: Arc<Storage>,
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PlayerGateway>,
        loader: BehaviorLoader,
    ) -> Result<Self> {
        let state = storage.load_game()?.unwrap_or_else(|| {
            GameState::new(
                config.first_proposal_id,
                config.win_score,
                config.majority_after_circuits,
            )
        });
        let directory = PlayerDirectory::from_players(storage.list_players()?);
        let proposals = storage.list_proposals()?;
        let behavior = loader.fallback();

        let orchestrator = Self {
            shared: Arc::new(Shared {
                config,
                engine: Mutex::new(Engine {
                    state,
                    directory,
                    open: None,
                    behavior,
                }),
                ledger,
                gateway,
                storage,
                loader,
                in_flight: std::sync::Mutex::new(HashSet::new()),
            }),
        };
        orchestrator.reconcile(proposals).await?;
        Ok(orchestrator)
    }

    async fn reconcile(&self, proposals: Vec<Proposal>) -> Result<()> {
        let effects = {
            let mut engine = self.lock().await;
            engine.state.behavior = engine.behavior.identity();
            let _ = self.reload_behavior_locked(&mut engine, None, true).await;
            self.apply_rule_facts(&mut engine).await;

            let trunk = self.shared.ledger.trunk().to_string();
            let mut open = Vec::new();
            for proposal in proposals {
                match proposal.status {
                    ProposalStatus::Open => open.push(proposal),
                    ProposalStatus::Passed => {
                        let Some(commit) = &proposal.merge_commit else {
                            continue;
                        };
                        if !self.shared.ledger.contains_commit(commit, &trunk).await? {
                            engine.state.halt(format!(
                                "proposal {} is recorded as merged at {} but {} does not contain it",
                                proposal.id, commit, trunk
                            ));
                            tracing::error!(proposal = proposal.id, %commit, "Ratified change missing from trunk");
                        }
                    }
                    _ => {}
                }
            }

            if open.len() > 1 {
                let ids: Vec<String> = open.iter().map(|p| p.id.to_string()).collect();
                engine
                    .state
                    .halt(format!("proposals {} are open at once", ids.join(", ")));
                tracing::error!(proposals = %ids.join(","), "More than one open proposal");
            }

            let mut effects = Effects::default();
            let first_open = open.into_iter().next();
            engine.state.open_proposal = first_open.as_ref().map(|p| p.id);
            if let Some(proposal) = first_open {
                let merged = self.already_merged(&proposal, &trunk).await?;
                let id = proposal.id;
                engine.open = Some(proposal);
                if merged && !engine.state.is_halted() {
                    let head = self.shared.ledger.head(&trunk).await?;
                    tracing::info!(proposal = id, %head, "Finishing interrupted ratification");
                    effects = self.ratify(&mut engine, Some(head)).await?;
                }
            }

            self.persist(&engine, &[])?;
            tracing::info!(
                phase = %engine.state.phase,
                players = engine.directory.len(),
                next_proposal = engine.state.next_proposal_id,
                behavior = %engine.state.behavior,
                "Game restored"
            );
            effects
        };
        self.dispatch(effects);
        Ok(())
    }

    /// Whether the proposal's change already reached trunk.
    ///
    /// The recorded head commit answers this even after the branch is gone.
    async fn already_merged(&self, proposal: &Proposal, trunk: &str) -> Result<bool> {
        let ledger = &self.shared.ledger;
        if let Some(head) = &proposal.head_commit {
            if ledger.contains_commit(head, trunk).await? {
                return Ok(true);
            }
        }
        Ok(ledger.branch_exists(&proposal.branch).await?
            && ledger.is_merged(&proposal.branch, trunk).await?)
    }

    // --- Registration and start ---

    /// Register a player. Only allowed before the game starts.
    pub async fn register_player(&self, name: &str, endpoint_url: &str) -> Result<Player> {
        let mut engine = self.lock().await;
        engine.ensure_not_halted()?;
        if engine.state.phase != GamePhase::NotStarted {
            return Err(Error::GameAlreadyStarted);
        }
        let player = engine.directory.add(name, endpoint_url)?.clone();
        self.persist(&engine, &[])?;
        tracing::info!(player = %player.name, endpoint = %player.endpoint_url, "Player registered");
        Ok(player)
    }

    /// Start the game with the registered players.
    pub async fn start_game(&self) -> Result<StateSnapshot> {
        let mut engine = self.lock().await;
        engine.ensure_not_halted()?;
        if engine.state.phase != GamePhase::NotStarted {
            return Err(Error::InvalidPhase(engine.state.phase));
        }
        let have = engine.directory.len();
        let need = self.shared.config.min_players;
        if have < need {
            return Err(Error::InsufficientPlayers { have, need });
        }
        engine.state.phase = GamePhase::InProgress;
        engine.state.turn_index = 0;
        self.persist(&engine, &[])?;
        tracing::info!(players = have, "Game started");
        Ok(engine.snapshot())
    }

    // --- Proposals and votes ---

    /// Open a proposal for the turn holder, then ask the others to vote.
    pub async fn submit_proposal(&self, submission: ProposalSubmission) -> Result<ProposalId> {
        let id = self.open_proposal(submission).await?;
        if let Err(e) = self.solicit_votes().await {
            tracing::error!(proposal = id, "Vote solicitation failed: {}", e);
        }
        Ok(id)
    }

    async fn open_proposal(&self, submission: ProposalSubmission) -> Result<ProposalId> {
        let mut engine = self.lock().await;
        engine.ensure_in_progress()?;
        if let Some(open) = engine.state.open_proposal {
            return Err(Error::ProposalAlreadyOpen(open));
        }
        engine.ensure_turn_holder(&submission.proposer)?;

        let description = submission.description.trim().to_string();
        if description.is_empty() {
            return Err(Error::InvalidInput("description must not be empty".into()));
        }
        let ledger = &self.shared.ledger;
        let trunk = ledger.trunk().to_string();
        let branch = submission.branch.trim().to_string();
        if nomic_ledger::validate_ref(&branch).is_err() || branch == trunk {
            return Err(Error::InvalidInput(format!("invalid branch name {:?}", branch)));
        }

        let id = engine.state.next_proposal_id;
        let (diff, head) = if submission.diff.trim().is_empty() {
            if !ledger.branch_exists(&branch).await? {
                return Err(Error::InvalidInput(format!(
                    "empty diff and branch {} does not exist",
                    branch
                )));
            }
            let diff = ledger.diff_from(&branch, &trunk).await?;
            if diff.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "branch {} has no changes against {}",
                    branch, trunk
                )));
            }
            (diff, ledger.head(&branch).await?)
        } else {
            ledger.create_branch(&branch, &trunk).await?;
            let message = format!("Proposal {}: {}", id, first_line(&description));
            match ledger.commit_diff(&branch, &submission.diff, &message).await {
                Ok(head) => (submission.diff, head),
                Err(e) => {
                    if let Err(cleanup) = ledger.delete_branch(&branch).await {
                        tracing::warn!(%branch, "Failed to remove branch after refused patch: {}", cleanup);
                    }
                    tracing::warn!(proposer = %submission.proposer, %branch, "Proposal refused: {}", e);
                    return Err(match e {
                        LedgerError::PatchApplyFailed(detail) => Error::PatchApplyFailed(detail),
                        other => other.into(),
                    });
                }
            }
        };

        let mode = engine.state.consensus_mode;
        let electorate = engine.directory.names();
        let mut proposal = Proposal::open(
            id,
            submission.proposer,
            description,
            diff,
            branch,
            mode,
            electorate,
        );
        proposal.head_commit = Some(head);
        tracing::info!(
            proposal = id,
            proposer = %proposal.proposer,
            branch = %proposal.branch,
            %mode,
            "Proposal opened"
        );
        engine.state.next_proposal_id += 1;
        engine.state.open_proposal = Some(id);
        engine.state.turn_solicited_at = None;
        engine.open = Some(proposal);
        self.persist(&engine, &[])?;
        Ok(id)
    }

    /// Record a vote and resolve the proposal once its verdict is decided.
    pub async fn submit_vote(
        &self,
        proposal_id: ProposalId,
        voter: &str,
        choice: bool,
    ) -> Result<VoteReceipt> {
        let evaluation = {
            let mut engine = self.lock().await;
            engine.ensure_not_halted()?;
            let is_open = matches!(&engine.open, Some(p) if p.id == proposal_id);
            if !is_open {
                return Err(self.closed_or_missing(proposal_id)?);
            }
            if !engine.directory.contains(voter) {
                return Err(Error::UnknownPlayer(voter.to_string()));
            }
            let Some(open) = engine.open.as_mut() else {
                return Err(Error::ProposalNotFound(proposal_id));
            };
            if !open.electorate.iter().any(|v| v == voter) {
                return Err(Error::InvalidInput(format!(
                    "{} is not eligible to vote on proposal {}",
                    voter, proposal_id
                )));
            }
            open.record_vote(voter, choice);
            tracing::info!(proposal = proposal_id, %voter, vote = choice, "Vote recorded");
            self.evaluate(&mut engine).await?
        };
        self.dispatch(evaluation.effects);
        Ok(VoteReceipt {
            proposal_id,
            status: evaluation.status,
            tally: evaluation.tally,
        })
    }

    /// Withdraw an open proposal. The turn passes without penalty.
    pub async fn withdraw(&self, proposal_id: ProposalId, proposer: &str) -> Result<Proposal> {
        let mut engine = self.lock().await;
        engine.ensure_not_halted()?;
        let owner = match &engine.open {
            Some(p) if p.id == proposal_id => p.proposer.clone(),
            _ => return Err(self.closed_or_missing(proposal_id)?),
        };
        if owner != proposer {
            return Err(Error::NotYourTurn {
                player: proposer.to_string(),
                holder: owner,
            });
        }
        let Some(mut proposal) = engine.open.take() else {
            return Err(Error::ProposalNotFound(proposal_id));
        };
        proposal.close(ProposalStatus::Withdrawn);
        tracing::info!(proposal = proposal_id, %proposer, "Proposal withdrawn");
        engine.state.open_proposal = None;
        engine.record_outcome(proposer, Some(&proposal), Some("withdrawn".into()));
        engine.next_turn();
        self.persist(&engine, &[&proposal])?;
        self.retire_branch(&proposal).await;
        Ok(proposal)
    }

    /// The turn holder could not produce a change; skip its turn.
    pub async fn report_turn_failed(&self, player: &str, reason: &str) -> Result<StateSnapshot> {
        let mut engine = self.lock().await;
        engine.ensure_in_progress()?;
        if let Some(open) = engine.state.open_proposal {
            return Err(Error::ProposalAlreadyOpen(open));
        }
        engine.ensure_turn_holder(player)?;
        tracing::warn!(%player, %reason, "Turn failed, skipping");
        engine.record_outcome(player, None, Some(format!("turn failed: {}", reason)));
        engine.next_turn();
        self.persist(&engine, &[])?;
        Ok(engine.snapshot())
    }

    // --- Advancing ---

    /// Drive the game forward by one step. Safe to call repeatedly and
    /// concurrently: a call that finds nothing new to do changes nothing.
    pub async fn advance(&self) -> Result<AdvanceOutcome> {
        enum Step {
            Turn,
            Votes,
        }

        let step = {
            let mut engine = self.lock().await;
            engine.ensure_not_halted()?;
            if engine.state.phase != GamePhase::InProgress {
                return Ok(AdvanceOutcome::Idle {
                    phase: engine.state.phase,
                });
            }

            if let Some(proposal_id) = engine.open.as_ref().map(|p| p.id) {
                if self.expire_voters(&mut engine) {
                    let evaluation = self.evaluate(&mut engine).await?;
                    if evaluation.status != ProposalStatus::Open {
                        drop(engine);
                        self.dispatch(evaluation.effects);
                        return Ok(AdvanceOutcome::ProposalResolved {
                            proposal_id,
                            status: evaluation.status,
                        });
                    }
                }
                Step::Votes
            } else if let Some(solicited_at) = engine.state.turn_solicited_at {
                let player = engine
                    .turn_holder()
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                if !elapsed(solicited_at, self.shared.config.turn_timeout) {
                    return Ok(AdvanceOutcome::AwaitingProposal { player });
                }
                tracing::warn!(%player, "No proposal before the turn timeout, skipping");
                engine.record_outcome(&player, None, Some("turn timed out".into()));
                engine.next_turn();
                self.persist(&engine, &[])?;
                return Ok(AdvanceOutcome::TurnSkipped { player });
            } else {
                Step::Turn
            }
        };

        match step {
            Step::Turn => self.solicit_turn().await,
            Step::Votes => self.solicit_votes().await,
        }
    }

    /// Abstain every deferred voter whose vote timeout elapsed.
    fn expire_voters(&self, engine: &mut Engine) -> bool {
        let timeout = self.shared.config.vote_timeout;
        let Some(open) = engine.open.as_mut() else {
            return false;
        };
        let overdue: Vec<String> = open
            .solicited
            .iter()
            .filter(|(_, at)| elapsed(**at, timeout))
            .map(|(voter, _)| voter.clone())
            .collect();
        for voter in &overdue {
            tracing::warn!(proposal = open.id, %voter, "No vote before the vote timeout, abstaining");
            open.record_abstention(voter);
        }
        !overdue.is_empty()
    }

    async fn solicit_turn(&self) -> Result<AdvanceOutcome> {
        let (player, request, guard) = {
            let engine = self.lock().await;
            if engine.state.phase != GamePhase::InProgress || engine.open.is_some() {
                return Ok(AdvanceOutcome::Idle {
                    phase: engine.state.phase,
                });
            }
            let Some(player) = engine.turn_holder().cloned() else {
                return Ok(AdvanceOutcome::Idle {
                    phase: engine.state.phase,
                });
            };
            if engine.state.turn_solicited_at.is_some() {
                return Ok(AdvanceOutcome::AwaitingProposal {
                    player: player.name,
                });
            }
            let proposal_number = engine.state.next_proposal_id;
            let Some(guard) = self.claim(Solicitation::Turn {
                player: player.name.clone(),
                proposal_number,
            }) else {
                return Ok(AdvanceOutcome::AwaitingProposal {
                    player: player.name,
                });
            };
            let request = TurnRequest {
                player_name: player.name.clone(),
                proposal_number,
                game_state: engine.snapshot(),
            };
            (player, request, guard)
        };

        let reply = self.shared.gateway.request_turn(&player, &request).await;
        match reply {
            TurnReply::Proposal(draft) => {
                self.mark_turn_solicited(&player.name, request.proposal_number)
                    .await?;
                drop(guard);
                let submission = ProposalSubmission {
                    proposer: player.name.clone(),
                    description: draft.description,
                    diff: draft.diff,
                    branch: draft.branch,
                };
                match self.submit_proposal(submission).await {
                    Ok(proposal_id) => Ok(AdvanceOutcome::ProposalOpened { proposal_id }),
                    Err(e) => {
                        tracing::warn!(player = %player.name, "Proposal from turn request refused: {}", e);
                        Ok(AdvanceOutcome::ProposalRefused {
                            player: player.name,
                            error: e.to_string(),
                        })
                    }
                }
            }
            TurnReply::Deferred => {
                tracing::debug!(player = %player.name, "Turn acknowledged");
                self.mark_turn_solicited(&player.name, request.proposal_number)
                    .await?;
                Ok(AdvanceOutcome::AwaitingProposal {
                    player: player.name,
                })
            }
            failure => {
                let reason = describe_turn_failure(&failure);
                tracing::warn!(player = %player.name, %reason, "Turn request failed");
                Ok(AdvanceOutcome::PlayerUnavailable {
                    player: player.name,
                    reason,
                })
            }
        }
    }

    /// Start the turn timeout, unless the turn moved on meanwhile.
    async fn mark_turn_solicited(&self, player: &str, proposal_number: ProposalId) -> Result<()> {
        let mut engine = self.lock().await;
        let current = engine.state.phase == GamePhase::InProgress
            && engine.open.is_none()
            && engine.state.next_proposal_id == proposal_number
            && engine.state.turn_solicited_at.is_none()
            && engine.turn_holder().is_some_and(|p| p.name == player);
        if current {
            engine.state.turn_solicited_at = Some(Utc::now());
            self.persist(&engine, &[])?;
        }
        Ok(())
    }

    async fn solicit_votes(&self) -> Result<AdvanceOutcome> {
        let (proposal_id, targets) = {
            let engine = self.lock().await;
            let Some(open) = engine.open.as_ref() else {
                return Ok(AdvanceOutcome::Idle {
                    phase: engine.state.phase,
                });
            };
            if engine.state.phase != GamePhase::InProgress {
                return Ok(AdvanceOutcome::Idle {
                    phase: engine.state.phase,
                });
            }
            let game_state = engine.snapshot();
            let mut targets = Vec::new();
            for voter in open.outstanding() {
                if *voter == open.proposer || open.solicited.contains_key(voter) {
                    continue;
                }
                let Some(player) = engine.directory.get(voter) else {
                    continue;
                };
                let Some(guard) = self.claim(Solicitation::Vote {
                    proposal_id: open.id,
                    voter: voter.clone(),
                }) else {
                    continue;
                };
                let request = VoteRequest {
                    player_name: voter.clone(),
                    proposal_id: open.id,
                    proposer: open.proposer.clone(),
                    description: open.description.clone(),
                    diff: open.diff.clone(),
                    branch: open.branch.clone(),
                    game_state: game_state.clone(),
                };
                targets.push((player.clone(), request, guard));
            }
            (open.id, targets)
        };

        if targets.is_empty() {
            return Ok(AdvanceOutcome::AwaitingVotes { proposal_id });
        }
        let requested = targets.len();
        tracing::debug!(proposal = proposal_id, voters = requested, "Requesting votes");

        let gateway = &self.shared.gateway;
        let replies = join_all(targets.into_iter().map(|(player, request, guard)| async move {
            let reply = gateway.request_vote(&player, &request).await;
            (player.name, reply, guard)
        }))
        .await;

        let evaluation = {
            let mut engine = self.lock().await;
            let Some(open) = engine.open.as_mut().filter(|p| p.id == proposal_id) else {
                let status = self
                    .shared
                    .storage
                    .get_proposal(proposal_id)?
                    .map(|p| p.status)
                    .unwrap_or(ProposalStatus::Open);
                return Ok(AdvanceOutcome::VotesRequested {
                    proposal_id,
                    requested,
                    status,
                });
            };
            for (voter, reply, _guard) in replies {
                if open.ballot(&voter) != Ballot::Pending {
                    continue;
                }
                match reply {
                    VoteReply::Vote(choice) => {
                        tracing::info!(proposal = proposal_id, %voter, vote = choice, "Vote received");
                        open.record_vote(&voter, choice);
                    }
                    VoteReply::Deferred => {
                        tracing::debug!(proposal = proposal_id, %voter, "Vote acknowledged");
                        open.solicited.insert(voter, Utc::now());
                    }
                    VoteReply::Unreachable(reason) | VoteReply::Malformed(reason) => {
                        tracing::warn!(proposal = proposal_id, %voter, %reason, "Vote request failed, abstaining");
                        open.record_abstention(&voter);
                    }
                    VoteReply::Timeout => {
                        tracing::warn!(proposal = proposal_id, %voter, "Vote request timed out, abstaining");
                        open.record_abstention(&voter);
                    }
                }
            }
            self.evaluate(&mut engine).await?
        };
        self.dispatch(evaluation.effects);
        Ok(AdvanceOutcome::VotesRequested {
            proposal_id,
            requested,
            status: evaluation.status,
        })
    }

    // --- Resolution ---

    /// Judge the open proposal and resolve it when decided. Persists.
    async fn evaluate(&self, engine: &mut Engine) -> Result<Evaluation> {
        let Some(open) = engine.open.as_ref() else {
            return Ok(Evaluation {
                status: ProposalStatus::Open,
                tally: Tally::default(),
                effects: Effects::default(),
            });
        };
        let tally = open.tally();
        let verdict = engine.behavior.verdict(open.mode, &tally);
        match verdict {
            Verdict::Pending => {
                self.persist(engine, &[])?;
                Ok(Evaluation {
                    status: ProposalStatus::Open,
                    tally,
                    effects: Effects::default(),
                })
            }
            Verdict::Passed => {
                let effects = self.ratify(engine, None).await?;
                let status = engine
                    .state
                    .last_outcome
                    .as_ref()
                    .and_then(|o| o.status)
                    .unwrap_or(ProposalStatus::Passed);
                Ok(Evaluation {
                    status,
                    tally,
                    effects,
                })
            }
            Verdict::Rejected(reason) => {
                if let Some(proposal) = engine.open.take() {
                    self.reject(engine, proposal, describe_rejection(reason), true)
                        .await?;
                }
                Ok(Evaluation {
                    status: ProposalStatus::Rejected,
                    tally,
                    effects: Effects::default(),
                })
            }
        }
    }

    /// Merge and score the open proposal.
    ///
    /// `merged` carries the trunk commit when the merge already happened
    /// before a restart.
    async fn ratify(&self, engine: &mut Engine, merged: Option<CommitId>) -> Result<Effects> {
        let Some(mut proposal) = engine.open.take() else {
            return Ok(Effects::default());
        };
        let ledger = &self.shared.ledger;
        let config = &self.shared.config;
        let trunk = ledger.trunk().to_string();

        let commit = match merged {
            Some(commit) => commit,
            None => {
                let message = format!("Ratify proposal {}: {}", proposal.id, proposal.title());
                match ledger.merge(&proposal.branch, &trunk, &message).await {
                    Ok(commit) => commit,
                    Err(e) => {
                        tracing::warn!(proposal = proposal.id, "Merge failed: {}", e);
                        self.reject(engine, proposal, format!("merge failed: {}", e), false)
                            .await?;
                        return Ok(Effects::default());
                    }
                }
            }
        };
        proposal.merge_commit = Some(commit.clone());
        proposal.close(ProposalStatus::Passed);

        let awards = engine.behavior.awards(&proposal);
        if let Some(proposer) = engine.directory.get_mut(&proposal.proposer) {
            proposer.award(awards.proposer);
        }
        if awards.per_dissenter > 0 {
            let dissenters: Vec<String> = proposal.dissenters().cloned().collect();
            for name in dissenters {
                if let Some(player) = engine.directory.get_mut(&name) {
                    player.award(awards.per_dissenter);
                }
            }
        }
        proposal.points_awarded = i64::try_from(awards.proposer).unwrap_or(i64::MAX);
        tracing::info!(
            proposal = proposal.id,
            %commit,
            points = awards.proposer,
            dissent_bonus = awards.per_dissenter,
            "Proposal ratified"
        );

        let mut effects = Effects {
            pull: engine.directory.list().to_vec(),
            ..Effects::default()
        };
        let touched = patch::touched_paths(&proposal.diff);
        if config.touches_self(&touched) {
            tracing::info!(proposal = proposal.id, "Ratified change touches behavior, reloading");
            let _ = self
                .reload_behavior_locked(engine, Some(proposal.id), false)
                .await;
        }
        if config.touches_players(&touched) {
            effects.notify = engine.directory.list().to_vec();
        }
        self.apply_rule_facts(engine).await;
        // Scores and the win score are both final only now
        engine.check_winner();

        engine.state.open_proposal = None;
        let proposer = proposal.proposer.clone();
        engine.record_outcome(&proposer, Some(&proposal), None);
        if engine.state.phase == GamePhase::InProgress {
            engine.next_turn();
        }
        self.persist(engine, &[&proposal])?;
        self.retire_branch(&proposal).await;
        Ok(effects)
    }

    /// Close a proposal as rejected and pass the turn.
    async fn reject(
        &self,
        engine: &mut Engine,
        mut proposal: Proposal,
        reason: String,
        penalize: bool,
    ) -> Result<()> {
        proposal.close(ProposalStatus::Rejected);
        proposal.rejection = Some(reason.clone());
        if penalize {
            let penalty = engine.behavior.defeat_penalty(&proposal);
            if let Some(proposer) = engine.directory.get_mut(&proposal.proposer) {
                let removed = proposer.penalize(penalty);
                proposal.points_awarded = -i64::try_from(removed).unwrap_or(i64::MAX);
            }
        }
        tracing::warn!(
            proposal = proposal.id,
            proposer = %proposal.proposer,
            points = proposal.points_awarded,
            %reason,
            "Proposal rejected"
        );

        engine.state.open_proposal = None;
        let proposer = proposal.proposer.clone();
        engine.record_outcome(&proposer, Some(&proposal), Some(reason));
        if engine.state.phase == GamePhase::InProgress {
            engine.next_turn();
        }
        self.persist(engine, &[&proposal])?;
        self.retire_branch(&proposal).await;
        Ok(())
    }

    async fn retire_branch(&self, proposal: &Proposal) {
        if self.shared.config.retain_branches {
            return;
        }
        match self.shared.ledger.delete_branch(&proposal.branch).await {
            Ok(()) | Err(LedgerError::BranchNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(proposal = proposal.id, branch = %proposal.branch, "Failed to delete branch: {}", e)
            }
        }
    }

    // --- Self-modification and rule facts ---

    /// Load the behavior definition from trunk and swap it in.
    ///
    /// On failure the current behavior stays and an alarm is raised.
    /// `missing_ok` keeps the current behavior silently when trunk has no
    /// definition at all.
    async fn reload_behavior_locked(
        &self,
        engine: &mut Engine,
        proposal_id: Option<ProposalId>,
        missing_ok: bool,
    ) -> std::result::Result<(), LoadError> {
        let ledger = &self.shared.ledger;
        let path = &self.shared.config.behavior_file;
        let loaded = match ledger.read_file(path, ledger.trunk()).await {
            Ok(bytes) => self.shared.loader.load(&bytes),
            Err(LedgerError::FileNotFound { .. }) if missing_ok => return Ok(()),
            Err(e) => Err(LoadError::Unreadable(e.to_string())),
        };
        match loaded {
            Ok(behavior) => {
                let identity = behavior.identity();
                tracing::info!(
                    from = %engine.state.behavior,
                    to = %identity,
                    "Behavior swapped"
                );
                engine.behavior = behavior;
                engine.state.behavior = identity;
                engine.state.alarm = None;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    path = %path,
                    active = %engine.state.behavior,
                    "Behavior reload failed: {}",
                    e
                );
                engine
                    .state
                    .raise_alarm(format!("behavior reload failed: {}", e), proposal_id);
                Err(e)
            }
        }
    }

    /// Re-read the whitelisted rule facts from trunk. A paradox halts.
    async fn apply_rule_facts(&self, engine: &mut Engine) {
        let ledger = &self.shared.ledger;
        let path = &self.shared.config.rules_file;
        let text = match ledger.read_file(path, ledger.trunk()).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(LedgerError::FileNotFound { .. }) => return,
            Err(e) => {
                tracing::warn!(path = %path, "Cannot read rules: {}", e);
                return;
            }
        };
        match rules::extract(&text) {
            Ok(facts) => {
                let state = &mut engine.state;
                if let Some(win_score) = facts.win_score {
                    if win_score != state.win_score {
                        tracing::info!(from = state.win_score, to = win_score, "Win score changed");
                        state.win_score = win_score;
                    }
                }
                if let Some(circuits) = facts.majority_after_circuits {
                    if circuits != state.majority_after_circuits {
                        tracing::info!(
                            from = state.majority_after_circuits,
                            to = circuits,
                            "Majority threshold changed"
                        );
                        state.majority_after_circuits = circuits;
                    }
                    let next = state.consensus_mode.after_circuits(state.circuit, circuits);
                    if state.consensus_mode.flips_to(next) {
                        tracing::info!(circuit = state.circuit, "Consensus mode is now {}", next);
                        state.consensus_mode = next;
                    }
                }
            }
            Err(e) => {
                tracing::error!(path = %path, "Rules cannot be evaluated: {}", e);
                engine
                    .state
                    .halt(format!("rules cannot be evaluated: {}", e));
            }
        }
    }

    // --- Reads ---

    /// Current state summary.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.lock().await.snapshot()
    }

    /// Players in join order.
    pub async fn players(&self) -> Vec<Player> {
        self.lock().await.directory.list().to_vec()
    }

    /// A proposal, open or resolved.
    pub async fn proposal(&self, id: ProposalId) -> Result<Proposal> {
        {
            let engine = self.lock().await;
            if let Some(open) = engine.open.as_ref().filter(|p| p.id == id) {
                return Ok(open.clone());
            }
        }
        self.shared
            .storage
            .get_proposal(id)?
            .ok_or(Error::ProposalNotFound(id))
    }

    /// Resolved proposals in id order.
    pub async fn history(&self) -> Result<Vec<Proposal>> {
        Ok(self
            .shared
            .storage
            .list_proposals()?
            .into_iter()
            .filter(|p| !p.is_open())
            .collect())
    }

    /// Rule text at trunk head.
    pub async fn rules(&self) -> Result<String> {
        let ledger = &self.shared.ledger;
        let path = &self.shared.config.rules_file;
        match ledger.read_file(path, ledger.trunk()).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(LedgerError::FileNotFound { .. }) => {
                Err(Error::NotFound(format!("{} on {}", path, ledger.trunk())))
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- Admin ---

    /// Leave the halted phase after manual repair.
    pub async fn resume(&self) -> Result<GamePhase> {
        let mut engine = self.lock().await;
        if !engine.state.is_halted() {
            return Err(Error::InvalidPhase(engine.state.phase));
        }
        let mut phase = engine.state.resume().unwrap_or(GamePhase::InProgress);
        engine.state.phase = phase;
        if engine.check_winner() {
            phase = GamePhase::Won;
        }
        self.persist(&engine, &[])?;
        tracing::info!(%phase, "Game resumed");
        Ok(phase)
    }

    /// Clear the active alarm. Returns whether there was one.
    pub async fn clear_alarm(&self) -> Result<bool> {
        let mut engine = self.lock().await;
        let cleared = engine.state.alarm.take().is_some();
        if cleared {
            self.persist(&engine, &[])?;
            tracing::info!("Alarm cleared");
        }
        Ok(cleared)
    }

    /// Retry loading the behavior definition from trunk.
    pub async fn reload_behavior(&self) -> Result<String> {
        let mut engine = self.lock().await;
        let result = self.reload_behavior_locked(&mut engine, None, false).await;
        self.persist(&engine, &[])?;
        result?;
        Ok(engine.state.behavior.clone())
    }

    // --- Helpers ---

    async fn lock(&self) -> MutexGuard<'_, Engine> {
        self.shared.engine.lock().await
    }

    /// Persist the game state, all players, the open proposal and `closed`.
    fn persist(&self, engine: &Engine, closed: &[&Proposal]) -> Result<()> {
        let mut proposals: Vec<&Proposal> = closed.to_vec();
        proposals.extend(engine.open.as_ref());
        self.shared
            .storage
            .persist(&engine.state, engine.directory.list(), &proposals)
    }

    fn closed_or_missing(&self, id: ProposalId) -> Result<Error> {
        Ok(match self.shared.storage.get_proposal(id)? {
            Some(_) => Error::ProposalNotOpen(id),
            None => Error::ProposalNotFound(id),
        })
    }

    fn claim(&self, key: Solicitation) -> Option<InFlight<'_>> {
        let set = &self.shared.in_flight;
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then_some(InFlight { set, key })
    }

    fn dispatch(&self, effects: Effects) {
        if !effects.pull.is_empty() {
            tracing::debug!(players = effects.pull.len(), "Telling players to pull trunk");
        }
        for player in effects.pull {
            let gateway = Arc::clone(&self.shared.gateway);
            tokio::spawn(async move {
                gateway.notify_pull(&player).await;
            });
        }
        if !effects.notify.is_empty() {
            tracing::info!(players = effects.notify.len(), "Notifying players of updated player code");
        }
        for player in effects.notify {
            let gateway = Arc::clone(&self.shared.gateway);
            tokio::spawn(async move {
                gateway.notify_update(&player).await;
            });
        }
    }
}

fn elapsed(since: DateTime<Utc>, timeout: Duration) -> bool {
    Utc::now()
        .signed_duration_since(since)
        .to_std()
        .unwrap_or_default()
        >= timeout
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

fn describe_rejection(reason: RejectReason) -> String {
    match reason {
        RejectReason::Dissent => "voted down".to_string(),
        RejectReason::NoMajority => "no majority".to_string(),
        RejectReason::NoQuorum => "no quorum: every other player abstained".to_string(),
    }
}

fn describe_turn_failure(reply: &TurnReply) -> String {
    match reply {
        TurnReply::Unreachable(reason) => format!("unreachable: {}", reason),
        TurnReply::Timeout => "timed out".to_string(),
        TurnReply::Malformed(reason) => format!("malformed reply: {}", reason),
        TurnReply::Proposal(_) | TurnReply::Deferred => String::new(),
    }
}

#[cfg(test)]
mod tests;
