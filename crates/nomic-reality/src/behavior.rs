//! Self-modification - behavior loaded from the rules themselves.
//!
//! The orchestrator's decision logic (verdicts, awards, penalties) lives
//! behind the [`Behavior`] trait. Which behavior is active is decided by a
//! JSON document on trunk:
//!
//! ```text
//! reality/behavior.json
//! {
//!   "kind": "classic",      ─► registry lookup
//!   "revision": 2,
//!   "defeat_penalty": 15    ─► constructor parameters
//! }
//! ```
//!
//! When a ratified diff touches the behavior paths the [`BehaviorLoader`]
//! builds a replacement and the orchestrator swaps it in under its lock.
//! Game state is never rebuilt; if loading fails the old behavior keeps
//! serving and an alarm is raised.

use crate::models::Proposal;
use nomic_consensus::{judge, ConsensusMode, Tally, Verdict};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors loading a behavior definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The definition could not be read from the ledger
    #[error("cannot read behavior definition: {0}")]
    Unreadable(String),

    /// Not valid JSON, or missing `kind`
    #[error("behavior definition is malformed: {0}")]
    Syntax(String),

    /// No constructor registered for the kind
    #[error("unknown behavior kind: {0}")]
    UnknownKind(String),

    /// The constructor rejected its parameters
    #[error("invalid parameters for {kind}: {detail}")]
    InvalidParams { kind: String, detail: String },
}

/// Points to hand out when a proposal passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Awards {
    /// Added to the proposer's score
    pub proposer: u64,
    /// Added to each player that voted "no"
    pub per_dissenter: u64,
}

/// Decision logic that may be replaced by self-modification.
pub trait Behavior: Send + Sync + std::fmt::Debug {
    /// Identity shown in game state, e.g. `classic@1`.
    fn identity(&self) -> String;

    /// Judge a tally under a consensus mode.
    fn verdict(&self, mode: ConsensusMode, tally: &Tally) -> Verdict {
        judge(mode, tally)
    }

    /// Points for a passed proposal.
    fn awards(&self, proposal: &Proposal) -> Awards;

    /// Points the proposer loses when its proposal is defeated.
    fn defeat_penalty(&self, proposal: &Proposal) -> u64;
}

// --- Built-in behaviors ---

/// Scoring after the traditional rules: the proposer earns
/// `round((id - base_offset) * yes / (yes + no))`, dissenters on a
/// non-unanimous pass earn a bonus, and a defeated proposer pays a penalty.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassicBehavior {
    #[serde(skip)]
    pub revision: u32,
    #[serde(default = "default_base_offset")]
    pub base_offset: u64,
    #[serde(default = "default_bonus")]
    pub dissent_bonus: u64,
    #[serde(default = "default_bonus")]
    pub defeat_penalty: u64,
}

fn default_base_offset() -> u64 {
    291
}

fn default_bonus() -> u64 {
    10
}

impl Default for ClassicBehavior {
    fn default() -> Self {
        Self {
            revision: 0,
            base_offset: default_base_offset(),
            dissent_bonus: default_bonus(),
            defeat_penalty: default_bonus(),
        }
    }
}

impl Behavior for ClassicBehavior {
    fn identity(&self) -> String {
        format!("classic@{}", self.revision)
    }

    fn awards(&self, proposal: &Proposal) -> Awards {
        let tally = proposal.tally();
        let decisive = tally.decisive() as u64;
        let base = proposal.id.saturating_sub(self.base_offset);
        // Rounds half up.
        let proposer = if decisive == 0 {
            0
        } else {
            (2 * base * tally.yes as u64 + decisive) / (2 * decisive)
        };
        Awards {
            proposer,
            per_dissenter: if tally.no > 0 { self.dissent_bonus } else { 0 },
        }
    }

    fn defeat_penalty(&self, _proposal: &Proposal) -> u64 {
        self.defeat_penalty
    }
}

/// Fixed points per passed proposal, regardless of its number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlatBehavior {
    #[serde(skip)]
    pub revision: u32,
    pub points: u64,
    #[serde(default)]
    pub dissent_bonus: u64,
    #[serde(default)]
    pub defeat_penalty: u64,
}

impl Behavior for FlatBehavior {
    fn identity(&self) -> String {
        format!("flat@{}", self.revision)
    }

    fn awards(&self, proposal: &Proposal) -> Awards {
        Awards {
            proposer: self.points,
            per_dissenter: if proposal.dissenters().next().is_some() {
                self.dissent_bonus
            } else {
                0
            },
        }
    }

    fn defeat_penalty(&self, _proposal: &Proposal) -> u64 {
        self.defeat_penalty
    }
}

// --- Loader ---

/// Parsed behavior definition.
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorDocument {
    pub kind: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl BehaviorDocument {
    /// Decode the constructor parameters.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, LoadError> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|e| {
            LoadError::InvalidParams {
                kind: self.kind.clone(),
                detail: e.to_string(),
            }
        })
    }
}

/// Builds a behavior from its definition.
pub type Constructor = fn(&BehaviorDocument) -> Result<Arc<dyn Behavior>, LoadError>;

/// Registry of behavior kinds.
#[derive(Clone)]
pub struct BehaviorLoader {
    constructors: BTreeMap<String, Constructor>,
}

impl Default for BehaviorLoader {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for BehaviorLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorLoader")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl BehaviorLoader {
    /// Loader with no kinds registered.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Loader knowing `classic` and `flat`.
    pub fn with_builtin() -> Self {
        let mut loader = Self::empty();
        loader.register("classic", build_classic);
        loader.register("flat", build_flat);
        loader
    }

    /// Register (or replace) a constructor.
    pub fn register(&mut self, kind: &str, constructor: Constructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// The behavior used when trunk carries no definition.
    pub fn fallback(&self) -> Arc<dyn Behavior> {
        Arc::new(ClassicBehavior::default())
    }

    /// Validate and construct a behavior from definition bytes.
    pub fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Behavior>, LoadError> {
        let document: BehaviorDocument =
            serde_json::from_slice(bytes).map_err(|e| LoadError::Syntax(e.to_string()))?;
        let constructor = self
            .constructors
            .get(&document.kind)
            .ok_or_else(|| LoadError::UnknownKind(document.kind.clone()))?;
        constructor(&document)
    }
}

fn build_classic(document: &BehaviorDocument) -> Result<Arc<dyn Behavior>, LoadError> {
    let mut behavior: ClassicBehavior = document.params()?;
    behavior.revision = document.revision;
    Ok(Arc::new(behavior))
}

fn build_flat(document: &BehaviorDocument) -> Result<Arc<dyn Behavior>, LoadError> {
    let mut behavior: FlatBehavior = document.params()?;
    if behavior.points == 0 {
        return Err(LoadError::InvalidParams {
            kind: document.kind.clone(),
            detail: "points must be positive".into(),
        });
    }
    behavior.revision = document.revision;
    Ok(Arc::new(behavior))
}
