use super::*;
use crate::gateway::ProposalDraft;
use async_trait::async_trait;
use nomic_consensus::ConsensusMode;
use nomic_ledger::MemoryLedger;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use tempfile::TempDir;

const RULES: &str = "# Rules\n\n101. All players must obey the rules.\n";

/// Gateway answering from a script. Unscripted calls are acknowledged.
#[derive(Default)]
struct ScriptedGateway {
    turns: StdMutex<HashMap<String, VecDeque<TurnReply>>>,
    votes: StdMutex<HashMap<String, VoteReply>>,
    turn_delay: StdMutex<Option<Duration>>,
    turn_calls: StdMutex<Vec<String>>,
    vote_calls: StdMutex<Vec<(ProposalId, String)>>,
    updates: StdMutex<Vec<String>>,
    pulls: StdMutex<Vec<String>>,
}

impl ScriptedGateway {
    fn on_turn(&self, player: &str, reply: TurnReply) {
        self.turns
            .lock()
            .unwrap()
            .entry(player.to_string())
            .or_default()
            .push_back(reply);
    }

    fn on_vote(&self, player: &str, reply: VoteReply) {
        self.votes.lock().unwrap().insert(player.to_string(), reply);
    }

    fn turn_calls(&self) -> Vec<String> {
        self.turn_calls.lock().unwrap().clone()
    }

    fn vote_calls(&self) -> Vec<(ProposalId, String)> {
        self.vote_calls.lock().unwrap().clone()
    }

    async fn updates(&self, expected: usize) -> Vec<String> {
        settled(&self.updates, expected).await
    }

    async fn pulls(&self, expected: usize) -> Vec<String> {
        settled(&self.pulls, expected).await
    }
}

/// Wait for spawned notifications to land, then return them sorted.
async fn settled(log: &StdMutex<Vec<String>>, expected: usize) -> Vec<String> {
    for _ in 0..100 {
        if log.lock().unwrap().len() >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut names = log.lock().unwrap().clone();
    names.sort();
    names
}

#[async_trait]
impl PlayerGateway for ScriptedGateway {
    async fn request_turn(&self, player: &Player, _request: &TurnRequest) -> TurnReply {
        self.turn_calls.lock().unwrap().push(player.name.clone());
        let delay = *self.turn_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.turns
            .lock()
            .unwrap()
            .get_mut(&player.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(TurnReply::Deferred)
    }

    async fn request_vote(&self, player: &Player, request: &VoteRequest) -> VoteReply {
        self.vote_calls
            .lock()
            .unwrap()
            .push((request.proposal_id, player.name.clone()));
        self.votes
            .lock()
            .unwrap()
            .get(&player.name)
            .cloned()
            .unwrap_or(VoteReply::Deferred)
    }

    async fn notify_pull(&self, player: &Player) {
        self.pulls.lock().unwrap().push(player.name.clone());
    }

    async fn notify_update(&self, player: &Player) {
        self.updates.lock().unwrap().push(player.name.clone());
    }
}

struct Harness {
    orchestrator: Orchestrator,
    gateway: Arc<ScriptedGateway>,
    ledger: Arc<MemoryLedger>,
    storage: Arc<Storage>,
    config: GameConfig,
    _dir: TempDir,
}

impl Harness {
    async fn new(config: GameConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let ledger = Arc::new(MemoryLedger::new("main", [("rules.md", RULES)]));
        let gateway = Arc::new(ScriptedGateway::default());
        let orchestrator = Orchestrator::restore(
            config.clone(),
            Arc::clone(&storage),
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Arc::clone(&gateway) as Arc<dyn PlayerGateway>,
            BehaviorLoader::with_builtin(),
        )
        .await
        .unwrap();
        Self {
            orchestrator,
            gateway,
            ledger,
            storage,
            config,
            _dir: dir,
        }
    }

    /// Register `players` and start the game.
    async fn started(config: GameConfig, players: &[&str]) -> Self {
        let h = Self::new(config).await;
        for name in players {
            h.orchestrator
                .register_player(name, &format!("http://{}.test:8000", name))
                .await
                .unwrap();
        }
        h.orchestrator.start_game().await.unwrap();
        h
    }

    /// A fresh orchestrator over the same storage and ledger.
    async fn restart(&self) -> Orchestrator {
        Orchestrator::restore(
            self.config.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.ledger) as Arc<dyn Ledger>,
            Arc::clone(&self.gateway) as Arc<dyn PlayerGateway>,
            BehaviorLoader::with_builtin(),
        )
        .await
        .unwrap()
    }

    async fn trunk_file(&self, path: &str) -> Option<String> {
        self.ledger
            .read_file(path, "main")
            .await
            .ok()
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }

    /// Diff appending `line` to the rules at trunk head.
    async fn append_rule(&self, line: &str) -> String {
        let old = self.trunk_file("rules.md").await.unwrap();
        let new = format!("{}{}\n", old, line);
        patch::render_file_change("rules.md", Some(&old), Some(&new))
    }

    async fn propose(&self, proposer: &str, diff: String, branch: &str) -> Result<ProposalId> {
        self.orchestrator
            .submit_proposal(ProposalSubmission {
                proposer: proposer.to_string(),
                description: format!("Change by {}", proposer),
                diff,
                branch: branch.to_string(),
            })
            .await
    }

    async fn score(&self, name: &str) -> u64 {
        self.orchestrator
            .players()
            .await
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.score)
            .unwrap()
    }

    async fn current_player(&self) -> Option<String> {
        self.orchestrator.snapshot().await.current_player
    }
}

fn new_file(path: &str, content: &str) -> String {
    patch::render_file_change(path, None, Some(content))
}

// --- Registration and start ---

#[tokio::test]
async fn registration_rules() {
    let h = Harness::new(GameConfig::default()).await;
    let o = &h.orchestrator;

    o.register_player("alice", "http://alice.test").await.unwrap();
    assert!(matches!(
        o.start_game().await,
        Err(Error::InsufficientPlayers { have: 1, need: 2 })
    ));
    assert!(matches!(
        o.register_player("alice", "http://elsewhere.test").await,
        Err(Error::DuplicatePlayer(_))
    ));
    assert!(matches!(
        o.register_player("", "http://x.test").await,
        Err(Error::InvalidInput(_))
    ));
    o.register_player("bob", "http://bob.test").await.unwrap();

    let snapshot = o.start_game().await.unwrap();
    assert_eq!(snapshot.phase, GamePhase::InProgress);
    assert_eq!(snapshot.current_player.as_deref(), Some("alice"));

    assert!(matches!(
        o.register_player("carol", "http://carol.test").await,
        Err(Error::GameAlreadyStarted)
    ));
    assert!(matches!(
        o.start_game().await,
        Err(Error::InvalidPhase(GamePhase::InProgress))
    ));
}

#[tokio::test]
async fn proposals_need_a_running_game() {
    let h = Harness::new(GameConfig::default()).await;
    let diff = h.append_rule("102. Too early.").await;
    assert!(matches!(
        h.propose("alice", diff, "early").await,
        Err(Error::InvalidPhase(GamePhase::NotStarted))
    ));
    assert_eq!(
        h.orchestrator.advance().await.unwrap(),
        AdvanceOutcome::Idle {
            phase: GamePhase::NotStarted
        }
    );
}

// --- Scenarios ---

#[tokio::test]
async fn unanimous_pass_scores_and_passes_turn() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Players may vote.").await;

    let id = h.propose("alice", diff, "proposal-301").await.unwrap();
    assert_eq!(id, 301);
    assert_eq!(h.gateway.vote_calls(), vec![(301, "bob".to_string())]);

    let receipt = h.orchestrator.submit_vote(id, "bob", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Passed);
    assert_eq!((receipt.tally.yes, receipt.tally.no), (2, 0));

    assert_eq!(h.score("alice").await, 10);
    assert_eq!(h.current_player().await.as_deref(), Some("bob"));
    assert!(h.trunk_file("rules.md").await.unwrap().contains("102. Players may vote."));
    assert!(!h.ledger.branch_exists("proposal-301").await.unwrap());

    let proposal = h.orchestrator.proposal(id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Passed);
    assert_eq!(
        proposal.merge_commit,
        Some(h.ledger.head("main").await.unwrap())
    );
    assert_eq!(proposal.points_awarded, 10);
    assert_eq!(h.orchestrator.history().await.unwrap().len(), 1);

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.next_proposal_id, 302);
    assert!(snapshot.open_proposal.is_none());
}

#[tokio::test]
async fn single_no_rejects_immediately() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob", "carol"]).await;
    let diff = h.append_rule("102. Nobody likes this.").await;
    let id = h.propose("alice", diff, "proposal-301").await.unwrap();

    let receipt = h.orchestrator.submit_vote(id, "bob", false).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Rejected);
    assert_eq!(receipt.tally.pending, 1);

    let proposal = h.orchestrator.proposal(id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Rejected);
    assert_eq!(proposal.rejection.as_deref(), Some("voted down"));
    assert_eq!(h.score("alice").await, 0);
    assert_eq!(h.current_player().await.as_deref(), Some("bob"));
    assert_eq!(h.trunk_file("rules.md").await.unwrap(), RULES);
    assert!(!h.ledger.branch_exists("proposal-301").await.unwrap());

    assert!(matches!(
        h.orchestrator.submit_vote(id, "carol", true).await,
        Err(Error::ProposalNotOpen(301))
    ));
}

#[tokio::test]
async fn defeat_penalty_applies_after_earning_points() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;

    let diff = h.append_rule("102. First.").await;
    h.propose("alice", diff, "p1").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    let diff = h.append_rule("103. Second.").await;
    h.propose("bob", diff, "p2").await.unwrap();
    h.orchestrator.submit_vote(302, "alice", true).await.unwrap();
    assert_eq!(h.score("bob").await, 11);

    let diff = h.append_rule("104. Third.").await;
    h.propose("alice", diff, "p3").await.unwrap();
    h.orchestrator.submit_vote(303, "bob", false).await.unwrap();
    assert_eq!(h.score("alice").await, 0);

    let diff = h.append_rule("105. Fourth.").await;
    h.propose("bob", diff, "p4").await.unwrap();
    h.orchestrator.submit_vote(304, "alice", false).await.unwrap();
    assert_eq!(h.score("bob").await, 1);
    assert_eq!(
        h.orchestrator.proposal(304).await.unwrap().points_awarded,
        -10
    );
}

#[tokio::test]
async fn unappliable_patch_leaves_no_record() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = patch::render_file_change(
        "rules.md",
        Some("# Some other rules\n"),
        Some("# Some other rules\n102. Nope.\n"),
    );

    assert!(matches!(
        h.propose("alice", diff, "proposal-301").await,
        Err(Error::PatchApplyFailed(_))
    ));
    assert!(matches!(
        h.orchestrator.proposal(301).await,
        Err(Error::ProposalNotFound(301))
    ));
    assert!(h.orchestrator.history().await.unwrap().is_empty());
    assert_eq!(h.ledger.branches(), vec!["main"]);

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.current_player.as_deref(), Some("alice"));
    assert_eq!(snapshot.next_proposal_id, 301);
    assert!(h.gateway.vote_calls().is_empty());
}

#[tokio::test]
async fn unloadable_behavior_raises_alarm_and_game_goes_on() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = new_file("reality/behavior.json", "{ this is not json\n");

    let id = h.propose("alice", diff, "proposal-301").await.unwrap();
    let receipt = h.orchestrator.submit_vote(id, "bob", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Passed);

    assert_eq!(
        h.trunk_file("reality/behavior.json").await.as_deref(),
        Some("{ this is not json\n")
    );
    let snapshot = h.orchestrator.snapshot().await;
    let alarm = snapshot.alarm.expect("alarm raised");
    assert_eq!(alarm.proposal_id, Some(301));
    assert!(alarm.message.contains("behavior"));
    assert_eq!(snapshot.behavior, "classic@0");
    assert_eq!(snapshot.phase, GamePhase::InProgress);

    assert_eq!(
        h.orchestrator.advance().await.unwrap(),
        AdvanceOutcome::AwaitingProposal {
            player: "bob".into()
        }
    );
    assert!(matches!(
        h.orchestrator.reload_behavior().await,
        Err(Error::Behavior(LoadError::Syntax(_)))
    ));
    assert!(h.orchestrator.clear_alarm().await.unwrap());
    assert!(!h.orchestrator.clear_alarm().await.unwrap());
}

#[tokio::test]
async fn ratified_behavior_is_swapped_in() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = new_file(
        "reality/behavior.json",
        "{\"kind\": \"flat\", \"revision\": 1, \"points\": 40}\n",
    );
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    // The proposal that installs a behavior is still scored by the old one.
    assert_eq!(h.score("alice").await, 10);
    assert_eq!(h.orchestrator.snapshot().await.behavior, "flat@1");

    let diff = h.append_rule("102. Flat scoring.").await;
    h.propose("bob", diff, "proposal-302").await.unwrap();
    h.orchestrator.submit_vote(302, "alice", true).await.unwrap();
    assert_eq!(h.score("bob").await, 40);

    let restarted = h.restart().await;
    assert_eq!(restarted.snapshot().await.behavior, "flat@1");
}

#[tokio::test]
async fn player_code_changes_notify_everyone() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = new_file("ai/strategy.md", "Always vote yes.\n");
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    assert_eq!(h.gateway.updates(2).await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn every_ratification_tells_players_to_pull() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Voted down.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", false).await.unwrap();

    let diff = h.append_rule("102. Voted in.").await;
    h.propose("bob", diff, "proposal-302").await.unwrap();
    h.orchestrator.submit_vote(302, "alice", true).await.unwrap();

    assert_eq!(h.gateway.pulls(2).await, vec!["alice", "bob"]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.gateway.pulls(2).await.len(), 2);
    // Rules alone do not touch player code
    assert!(h.gateway.updates(0).await.is_empty());
}

#[tokio::test]
async fn majority_after_threshold_pays_dissenters() {
    let config = GameConfig {
        majority_after_circuits: 1,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob", "carol"]).await;
    for player in ["alice", "bob", "carol"] {
        h.orchestrator
            .report_turn_failed(player, "nothing to propose")
            .await
            .unwrap();
    }
    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.circuit, 1);
    assert_eq!(snapshot.consensus_mode, ConsensusMode::Majority);
    assert!(snapshot.majority_voting);

    let diff = h.append_rule("102. Majority rules.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    let receipt = h.orchestrator.submit_vote(301, "carol", false).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Open);
    let receipt = h.orchestrator.submit_vote(301, "bob", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Passed);

    // round(10 * 2 / 3)
    assert_eq!(h.score("alice").await, 7);
    assert_eq!(h.score("carol").await, 10);
    assert_eq!(h.score("bob").await, 0);
}

#[tokio::test]
async fn open_mode_applies_even_after_flip() {
    let config = GameConfig {
        majority_after_circuits: 1,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob", "carol"]).await;
    h.orchestrator.report_turn_failed("alice", "skip").await.unwrap();
    h.orchestrator.report_turn_failed("bob", "skip").await.unwrap();

    let diff = h.append_rule("102. Opened under unanimity.").await;
    h.propose("carol", diff, "proposal-301").await.unwrap();
    let proposal = h.orchestrator.proposal(301).await.unwrap();
    assert_eq!(proposal.mode, ConsensusMode::Unanimous);

    h.orchestrator.submit_vote(301, "alice", true).await.unwrap();
    let receipt = h.orchestrator.submit_vote(301, "bob", false).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Rejected);
    // The rejection completed the circuit; the next proposal is majority.
    assert_eq!(
        h.orchestrator.snapshot().await.consensus_mode,
        ConsensusMode::Majority
    );
}

// --- Gateway-driven play ---

#[tokio::test]
async fn advance_solicits_turn_and_votes() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Asked for.").await;
    h.gateway.on_turn(
        "alice",
        TurnReply::Proposal(ProposalDraft {
            description: "Add rule 102".into(),
            diff,
            branch: "proposal-301".into(),
        }),
    );
    h.gateway.on_vote("bob", VoteReply::Vote(true));

    let outcome = h.orchestrator.advance().await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::ProposalOpened { proposal_id: 301 });
    assert_eq!(h.gateway.turn_calls(), vec!["alice"]);
    assert_eq!(
        h.orchestrator.proposal(301).await.unwrap().status,
        ProposalStatus::Passed
    );
    assert_eq!(h.current_player().await.as_deref(), Some("bob"));
}

#[tokio::test]
async fn unreachable_voters_abstain_and_fail_quorum() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    h.gateway
        .on_vote("bob", VoteReply::Unreachable("connection refused".into()));
    let diff = h.append_rule("102. Lonely.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    let proposal = h.orchestrator.proposal(301).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Rejected);
    assert!(proposal.abstentions.contains("bob"));
    assert!(proposal.rejection.unwrap().contains("quorum"));
}

#[tokio::test]
async fn abstention_does_not_block_the_rest() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob", "carol"]).await;
    h.gateway.on_vote("bob", VoteReply::Timeout);
    h.gateway.on_vote("carol", VoteReply::Vote(true));
    let diff = h.append_rule("102. Enough voters.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    let proposal = h.orchestrator.proposal(301).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Passed);
    // Abstentions leave the denominator: 2 yes of 2 decisive.
    assert_eq!(h.score("alice").await, 10);
}

#[tokio::test]
async fn repeated_advance_changes_nothing() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;

    let first = h.orchestrator.advance().await.unwrap();
    assert_eq!(
        first,
        AdvanceOutcome::AwaitingProposal {
            player: "alice".into()
        }
    );
    let state = h.storage.load_game().unwrap();
    let snapshot = h.orchestrator.snapshot().await;

    for _ in 0..3 {
        assert_eq!(h.orchestrator.advance().await.unwrap(), first);
    }
    assert_eq!(h.storage.load_game().unwrap(), state);
    assert_eq!(h.orchestrator.snapshot().await, snapshot);
    assert_eq!(h.gateway.turn_calls(), vec!["alice"]);

    // Same with an open proposal whose voters all acknowledged.
    let diff = h.append_rule("102. Pending.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    let state = h.storage.load_game().unwrap();
    let proposal = h.storage.get_proposal(301).unwrap();
    for _ in 0..3 {
        assert_eq!(
            h.orchestrator.advance().await.unwrap(),
            AdvanceOutcome::AwaitingVotes { proposal_id: 301 }
        );
    }
    assert_eq!(h.storage.load_game().unwrap(), state);
    assert_eq!(h.storage.get_proposal(301).unwrap(), proposal);
    assert_eq!(h.gateway.vote_calls().len(), 1);
}

#[tokio::test]
async fn concurrent_advance_asks_once() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    *h.gateway.turn_delay.lock().unwrap() = Some(Duration::from_millis(100));

    let (a, b) = tokio::join!(h.orchestrator.advance(), h.orchestrator.advance());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.gateway.turn_calls(), vec!["alice"]);
}

#[tokio::test]
async fn unreachable_turn_holder_is_retried() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    h.gateway.on_turn("alice", TurnReply::Timeout);

    let outcome = h.orchestrator.advance().await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::PlayerUnavailable { ref player, .. } if player == "alice"));
    assert!(h.orchestrator.snapshot().await.last_outcome.is_none());

    assert_eq!(
        h.orchestrator.advance().await.unwrap(),
        AdvanceOutcome::AwaitingProposal {
            player: "alice".into()
        }
    );
    assert_eq!(h.gateway.turn_calls(), vec!["alice", "alice"]);
}

#[tokio::test]
async fn silent_turn_holder_is_skipped_after_timeout() {
    let config = GameConfig {
        turn_timeout: Duration::ZERO,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob"]).await;

    h.orchestrator.advance().await.unwrap();
    assert_eq!(
        h.orchestrator.advance().await.unwrap(),
        AdvanceOutcome::TurnSkipped {
            player: "alice".into()
        }
    );
    assert_eq!(h.current_player().await.as_deref(), Some("bob"));
    assert_eq!(h.score("alice").await, 0);
}

#[tokio::test]
async fn silent_voter_abstains_after_timeout() {
    let config = GameConfig {
        vote_timeout: Duration::ZERO,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob"]).await;
    let diff = h.append_rule("102. Nobody answers.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    assert_eq!(
        h.orchestrator.advance().await.unwrap(),
        AdvanceOutcome::ProposalResolved {
            proposal_id: 301,
            status: ProposalStatus::Rejected
        }
    );
    let proposal = h.orchestrator.proposal(301).await.unwrap();
    assert!(proposal.abstentions.contains("bob"));
}

#[tokio::test]
async fn late_vote_replaces_abstention() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob", "carol"]).await;
    h.gateway.on_vote("bob", VoteReply::Malformed("garbage".into()));
    let diff = h.append_rule("102. Second chances.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    let receipt = h.orchestrator.submit_vote(301, "bob", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Open);
    assert_eq!(receipt.tally.abstain, 0);
    let receipt = h.orchestrator.submit_vote(301, "carol", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Passed);
}

// --- Validation ---

#[tokio::test]
async fn turn_and_proposal_validation() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Out of turn.").await;

    assert!(matches!(
        h.propose("bob", diff.clone(), "proposal-301").await,
        Err(Error::NotYourTurn { ref holder, .. }) if holder == "alice"
    ));
    assert!(matches!(
        h.propose("mallory", diff.clone(), "proposal-301").await,
        Err(Error::UnknownPlayer(_))
    ));
    assert!(matches!(
        h.propose("alice", diff.clone(), "--force").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        h.propose("alice", diff.clone(), "main").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        h.propose("alice", String::new(), "missing-branch").await,
        Err(Error::InvalidInput(_))
    ));

    h.propose("alice", diff.clone(), "proposal-301").await.unwrap();
    assert!(matches!(
        h.propose("alice", diff, "proposal-302").await,
        Err(Error::ProposalAlreadyOpen(301))
    ));
    assert!(matches!(
        h.orchestrator.submit_vote(301, "mallory", true).await,
        Err(Error::UnknownPlayer(_))
    ));
    assert!(matches!(
        h.orchestrator.submit_vote(999, "bob", true).await,
        Err(Error::ProposalNotFound(999))
    ));
    assert!(matches!(
        h.orchestrator.report_turn_failed("alice", "oops").await,
        Err(Error::ProposalAlreadyOpen(301))
    ));
}

#[tokio::test]
async fn leftover_branch_conflicts() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    h.ledger.create_branch("taken", "main").await.unwrap();
    let diff = h.append_rule("102. Collides.").await;
    let err = h.propose("alice", diff, "taken").await.unwrap_err();
    assert!(matches!(err, Error::Ledger(LedgerError::BranchExists(_))));
    assert_eq!(err.code(), "BranchExists");
}

#[tokio::test]
async fn pushed_branch_supplies_the_diff() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Pushed by the player.").await;
    h.ledger.create_branch("alice-pushed", "main").await.unwrap();
    h.ledger
        .commit_diff("alice-pushed", &diff, "player commit")
        .await
        .unwrap();

    h.propose("alice", String::new(), "alice-pushed").await.unwrap();
    let proposal = h.orchestrator.proposal(301).await.unwrap();
    assert!(proposal.diff.contains("+102. Pushed by the player."));

    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();
    assert!(h
        .trunk_file("rules.md")
        .await
        .unwrap()
        .contains("102. Pushed by the player."));
}

#[tokio::test]
async fn merge_conflict_rejects_without_penalty() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Mine.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    // Trunk moves underneath the open proposal.
    let competing = h.append_rule("102. Theirs.").await;
    h.ledger.create_branch("hotfix", "main").await.unwrap();
    h.ledger.commit_diff("hotfix", &competing, "hotfix").await.unwrap();
    h.ledger.merge("hotfix", "main", "hotfix").await.unwrap();

    let receipt = h.orchestrator.submit_vote(301, "bob", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Rejected);
    let proposal = h.orchestrator.proposal(301).await.unwrap();
    assert!(proposal.rejection.unwrap().starts_with("merge failed"));
    assert_eq!(proposal.points_awarded, 0);

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.current_player.as_deref(), Some("bob"));
    let outcome = snapshot.last_outcome.unwrap();
    assert_eq!(outcome.status, Some(ProposalStatus::Rejected));
}

#[tokio::test]
async fn withdraw_passes_turn_without_penalty() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Second thoughts.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    assert!(matches!(
        h.orchestrator.withdraw(301, "bob").await,
        Err(Error::NotYourTurn { .. })
    ));
    let proposal = h.orchestrator.withdraw(301, "alice").await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Withdrawn);
    assert_eq!(h.current_player().await.as_deref(), Some("bob"));
    assert!(!h.ledger.branch_exists("proposal-301").await.unwrap());
    assert!(matches!(
        h.orchestrator.withdraw(301, "alice").await,
        Err(Error::ProposalNotOpen(301))
    ));
}

#[tokio::test]
async fn retained_branches_survive_resolution() {
    let config = GameConfig {
        retain_branches: true,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob"]).await;
    let diff = h.append_rule("102. Keep me.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", false).await.unwrap();
    assert!(h.ledger.branch_exists("proposal-301").await.unwrap());
}

#[tokio::test]
async fn turn_failed_skips_only_for_holder() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    assert!(matches!(
        h.orchestrator.report_turn_failed("bob", "not me").await,
        Err(Error::NotYourTurn { .. })
    ));
    let snapshot = h
        .orchestrator
        .report_turn_failed("alice", "claude crashed")
        .await
        .unwrap();
    assert_eq!(snapshot.current_player.as_deref(), Some("bob"));
    let outcome = snapshot.last_outcome.unwrap();
    assert_eq!(outcome.player, "alice");
    assert!(outcome.proposal_id.is_none());
}

// --- Winning, rule facts and halting ---

#[tokio::test]
async fn reaching_win_score_ends_the_game() {
    let config = GameConfig {
        win_score: 10,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob"]).await;
    let diff = h.append_rule("102. Winning move.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.phase, GamePhase::Won);
    assert_eq!(snapshot.winner.as_deref(), Some("alice"));
    assert_eq!(snapshot.turn_index, 0);
    assert_eq!(
        h.orchestrator.advance().await.unwrap(),
        AdvanceOutcome::Idle {
            phase: GamePhase::Won
        }
    );
}

#[tokio::test]
async fn ratified_rule_facts_take_effect() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h
        .append_rule("208. The winner needs 150 points. <!-- nomic: win_score = 150 -->")
        .await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    assert_eq!(h.orchestrator.snapshot().await.win_score, 150);
    assert!(h.orchestrator.rules().await.unwrap().contains("150 points"));
}

#[tokio::test]
async fn lowered_win_score_takes_effect_immediately() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h
        .append_rule("208. Five points win. <!-- nomic: win_score = 5 -->")
        .await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.win_score, 5);
    assert_eq!(snapshot.phase, GamePhase::Won);
    assert_eq!(snapshot.winner.as_deref(), Some("alice"));
    assert_eq!(snapshot.turn_index, 0);
}

#[tokio::test]
async fn win_reached_while_halted_is_declared_on_resume() {
    let config = GameConfig {
        win_score: 10,
        ..GameConfig::default()
    };
    let h = Harness::started(config, &["alice", "bob"]).await;
    let diff = h
        .append_rule("<!-- nomic: win_score = 100 -->\n<!-- nomic: win_score = 5 -->")
        .await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();
    assert_eq!(h.score("alice").await, 10);
    assert_eq!(h.orchestrator.snapshot().await.phase, GamePhase::Halted);

    assert_eq!(h.orchestrator.resume().await.unwrap(), GamePhase::Won);
    assert_eq!(h.orchestrator.snapshot().await.winner.as_deref(), Some("alice"));
}

#[tokio::test]
async fn paradox_halts_until_resumed() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h
        .append_rule("<!-- nomic: win_score = 100 -->\n<!-- nomic: win_score = 5 -->")
        .await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.phase, GamePhase::Halted);
    assert!(snapshot.halt.unwrap().reason.contains("paradox"));

    assert!(matches!(h.orchestrator.advance().await, Err(Error::GameHalted(_))));
    let diff = h.append_rule("103. Fix it.").await;
    assert!(matches!(
        h.propose("bob", diff, "proposal-302").await,
        Err(Error::GameHalted(_))
    ));

    assert_eq!(h.orchestrator.resume().await.unwrap(), GamePhase::InProgress);
    assert!(h.orchestrator.snapshot().await.halt.is_none());
    assert!(matches!(
        h.orchestrator.resume().await,
        Err(Error::InvalidPhase(GamePhase::InProgress))
    ));
}

// --- Restart and reconciliation ---

#[tokio::test]
async fn restart_keeps_open_proposal() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Survives restarts.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();

    let restarted = h.restart().await;
    let snapshot = restarted.snapshot().await;
    assert_eq!(snapshot.open_proposal.map(|p| p.id), Some(301));
    assert_eq!(snapshot.players.len(), 2);

    let receipt = restarted.submit_vote(301, "bob", true).await.unwrap();
    assert_eq!(receipt.status, ProposalStatus::Passed);
}

#[tokio::test]
async fn interrupted_ratification_is_finished_without_remerge() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Merged before the crash.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    let head = h
        .ledger
        .merge("proposal-301", "main", "merged before crash")
        .await
        .unwrap();

    let restarted = h.restart().await;
    let proposal = restarted.proposal(301).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Passed);
    assert_eq!(proposal.merge_commit, Some(head.clone()));
    assert_eq!(h.ledger.head("main").await.unwrap(), head);
    assert_eq!(restarted.snapshot().await.current_player.as_deref(), Some("bob"));
}

#[tokio::test]
async fn merged_proposal_without_branch_is_finished_on_restart() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Merged, then the branch went away.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    let head = h
        .ledger
        .merge("proposal-301", "main", "merged before crash")
        .await
        .unwrap();
    h.ledger.delete_branch("proposal-301").await.unwrap();

    let restarted = h.restart().await;
    let proposal = restarted.proposal(301).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Passed);
    assert_eq!(proposal.merge_commit, Some(head.clone()));
    assert!(proposal.rejection.is_none());
    assert_eq!(
        restarted
            .players()
            .await
            .into_iter()
            .find(|p| p.name == "alice")
            .map(|p| p.score),
        Some(10)
    );
    assert_eq!(h.ledger.head("main").await.unwrap(), head);
    assert_eq!(restarted.snapshot().await.current_player.as_deref(), Some("bob"));
    assert_eq!(h.gateway.pulls(2).await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn ratification_stores_the_branch_head() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let diff = h.append_rule("102. Stored first.").await;
    h.propose("alice", diff, "proposal-301").await.unwrap();
    let head = h.orchestrator.proposal(301).await.unwrap().head_commit;
    assert_eq!(head, Some(h.ledger.head("proposal-301").await.unwrap()));

    h.orchestrator.submit_vote(301, "bob", true).await.unwrap();
    let stored = h.storage.get_proposal(301).unwrap().unwrap();
    assert_eq!(stored.status, ProposalStatus::Passed);
    assert_eq!(stored.head_commit, head);
    assert!(!h.ledger.branch_exists("proposal-301").await.unwrap());
}

#[tokio::test]
async fn missing_merge_commit_halts_on_restart() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let state = h.storage.load_game().unwrap().unwrap();
    let players = h.orchestrator.players().await;
    let mut forged = Proposal::open(
        300,
        "alice".into(),
        "never merged".into(),
        String::new(),
        "ghost".into(),
        ConsensusMode::Unanimous,
        vec!["alice".into(), "bob".into()],
    );
    forged.close(ProposalStatus::Passed);
    forged.merge_commit = Some("feedface".into());
    h.storage.persist(&state, &players, &[&forged]).unwrap();

    let restarted = h.restart().await;
    let snapshot = restarted.snapshot().await;
    assert_eq!(snapshot.phase, GamePhase::Halted);
    assert!(snapshot.halt.unwrap().reason.contains("feedface"));
}

#[tokio::test]
async fn two_open_proposals_halt_on_restart() {
    let h = Harness::started(GameConfig::default(), &["alice", "bob"]).await;
    let state = h.storage.load_game().unwrap().unwrap();
    let open = |id| {
        Proposal::open(
            id,
            "alice".into(),
            "duplicate".into(),
            String::new(),
            format!("dup-{}", id),
            ConsensusMode::Unanimous,
            vec!["alice".into(), "bob".into()],
        )
    };
    h.storage
        .persist(&state, &[], &[&open(301), &open(302)])
        .unwrap();

    let restarted = h.restart().await;
    assert_eq!(restarted.snapshot().await.phase, GamePhase::Halted);
    assert!(matches!(
        restarted.submit_vote(301, "bob", true).await,
        Err(Error::GameHalted(_))
    ));
}
