//! Reality Node - the main application entry point.
//!
//! Architecture:
//! - Single daemon process owning the orchestrator and its RocksDB storage
//! - Git-backed ledger on a local repository
//! - HTTP API for players and operators
//! - Background ticker driving `advance()`
//! - Unix admin socket for manual recovery (reality-admin CLI)

use crate::admin_socket::AdminSocket;
use crate::api;
use crate::behavior::BehaviorLoader;
use crate::error::{Error, Result};
use crate::gateway::HttpGateway;
use crate::models::GamePhase;
use crate::orchestrator::{GameConfig, Orchestrator};
use crate::storage::Storage;
use nomic_ledger::{GitLedger, Ledger};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a reality node.
#[derive(Debug, Clone)]
pub struct RealityConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Git repository holding the rules and code
    pub repo_path: PathBuf,

    /// Trunk branch of the repository
    pub trunk: String,

    /// Admin socket path (for reality-admin CLI)
    pub admin_socket: PathBuf,

    /// Players registered at startup, in join order
    pub players: Vec<(String, String)>,

    /// Interval of the background ticker; `None` disables it
    pub tick_interval: Option<Duration>,

    /// Bound on every outbound player request
    pub player_timeout: Duration,

    pub game: GameConfig,
}

impl RealityConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(
            lookup("REALITY_DATA_DIR").unwrap_or_else(|| "./reality-data".to_string()),
        );

        let api_addr = parse_var(&lookup, "REALITY_API_ADDR", "0.0.0.0:5000".parse().ok())?;

        let repo_path =
            PathBuf::from(lookup("REALITY_REPO_PATH").unwrap_or_else(|| "./repo".to_string()));

        let trunk = lookup("REALITY_TRUNK").unwrap_or_else(|| "main".to_string());

        let admin_socket = lookup("REALITY_ADMIN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("admin.sock"));

        let players = match lookup("REALITY_PLAYERS") {
            Some(raw) => parse_players(&raw)?,
            None => Vec::new(),
        };

        let tick_secs: u64 = parse_var(&lookup, "REALITY_TICK_SECS", Some(5))?;
        let player_timeout: u64 = parse_var(&lookup, "REALITY_PLAYER_TIMEOUT_SECS", Some(10))?;

        let defaults = GameConfig::default();
        let turn_timeout: u64 = parse_var(
            &lookup,
            "REALITY_TURN_TIMEOUT_SECS",
            Some(defaults.turn_timeout.as_secs()),
        )?;
        let vote_timeout: u64 = parse_var(
            &lookup,
            "REALITY_VOTE_TIMEOUT_SECS",
            Some(defaults.vote_timeout.as_secs()),
        )?;
        let first_proposal_id = parse_var(
            &lookup,
            "REALITY_FIRST_PROPOSAL_ID",
            Some(defaults.first_proposal_id),
        )?;
        let retain_branches = parse_var(
            &lookup,
            "REALITY_RETAIN_BRANCHES",
            Some(defaults.retain_branches),
        )?;

        Ok(Self {
            data_dir,
            api_addr,
            repo_path,
            trunk,
            admin_socket,
            players,
            tick_interval: (tick_secs > 0).then(|| Duration::from_secs(tick_secs)),
            player_timeout: Duration::from_secs(player_timeout),
            game: GameConfig {
                first_proposal_id,
                turn_timeout: Duration::from_secs(turn_timeout),
                vote_timeout: Duration::from_secs(vote_timeout),
                retain_branches,
                ..defaults
            },
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {} {:?}: {}", key, raw, e))),
        None => default.ok_or_else(|| Error::Config(format!("{} is required", key))),
    }
}

/// Parse `name=url,name=url`.
fn parse_players(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                Ok((name.trim().to_string(), url.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "invalid REALITY_PLAYERS entry {:?}, expected name=url",
                entry
            ))),
        })
        .collect()
}

/// A reality node instance.
pub struct RealityNode {
    orchestrator: Orchestrator,
    config: RealityConfig,
}

impl RealityNode {
    /// Open storage and ledger and restore the game.
    ///
    /// Players from the config are registered and the game started when it
    /// has not started yet.
    pub async fn new(config: RealityConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Arc::new(Storage::open(config.data_dir.join("db"))?);
        let ledger: Arc<dyn Ledger> =
            Arc::new(GitLedger::open(&config.repo_path, &config.trunk).await?);
        let gateway = Arc::new(HttpGateway::new(config.player_timeout)?);

        let orchestrator = Orchestrator::restore(
            config.game.clone(),
            storage,
            ledger,
            gateway,
            BehaviorLoader::with_builtin(),
        )
        .await?;

        let node = Self {
            orchestrator,
            config,
        };
        node.bootstrap_players().await?;
        Ok(node)
    }

    async fn bootstrap_players(&self) -> Result<()> {
        if self.config.players.is_empty()
            || self.orchestrator.snapshot().await.phase != GamePhase::NotStarted
        {
            return Ok(());
        }
        let known: Vec<String> = self
            .orchestrator
            .players()
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        for (name, url) in &self.config.players {
            if !known.contains(name) {
                self.orchestrator.register_player(name, url).await?;
            }
        }
        self.orchestrator.start_game().await?;
        Ok(())
    }

    /// Get a handle to the orchestrator.
    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator.clone()
    }

    /// Run the node (starts HTTP server, ticker and admin socket).
    pub async fn run(self) -> Result<()> {
        tracing::info!("Reality node starting");
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Repo: {:?} ({})", self.config.repo_path, self.config.trunk);
        tracing::info!("  Admin: {:?}", self.config.admin_socket);
        tracing::info!("  Data: {:?}", self.config.data_dir);

        let admin_socket = AdminSocket::new(self.orchestrator(), &self.config.admin_socket);
        tokio::spawn(async move {
            if let Err(e) = admin_socket.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });

        if let Some(period) = self.config.tick_interval {
            let orchestrator = self.orchestrator();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    match orchestrator.advance().await {
                        Ok(outcome) => tracing::debug!(?outcome, "Tick"),
                        Err(Error::GameHalted(reason)) => {
                            tracing::debug!(%reason, "Tick skipped, game halted")
                        }
                        Err(e) => tracing::error!("Advance failed: {}", e),
                    }
                }
            });
        }

        let app = api::build_router(self.orchestrator());

        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}
