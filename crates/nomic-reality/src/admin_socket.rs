//! Unix socket server for admin commands.
//!
//! Local IPC for manual recovery: inspect the game, resume after a halt,
//! clear alarms and retry a failed behavior reload.

use crate::error::Result;
use crate::models::StateSnapshot;
use crate::orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Admin command sent over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Health check
    Ping,
    /// Current state snapshot
    Status,
    /// Leave the halted phase
    Resume,
    /// Drop the active alarm
    ClearAlarm,
    /// Load the behavior definition from trunk again
    ReloadBehavior,
}

/// Response from admin command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    State { state: Box<StateSnapshot> },
    Pong,
}

/// Admin socket server.
pub struct AdminSocket {
    orchestrator: Orchestrator,
    socket_path: PathBuf,
}

impl AdminSocket {
    /// Create a new admin socket server.
    pub fn new(orchestrator: Orchestrator, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            socket_path: socket_path.into(),
        }
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        // Stale socket from a previous run
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {}", self.socket_path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let orchestrator = self.orchestrator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, orchestrator).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, orchestrator: Orchestrator) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => execute_command(cmd, &orchestrator).await,
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

async fn execute_command(cmd: AdminCommand, orchestrator: &Orchestrator) -> AdminResponse {
    match cmd {
        AdminCommand::Ping => AdminResponse::Pong,

        AdminCommand::Status => AdminResponse::State {
            state: Box::new(orchestrator.snapshot().await),
        },

        AdminCommand::Resume => match orchestrator.resume().await {
            Ok(phase) => {
                tracing::info!(%phase, "Resumed by admin");
                AdminResponse::Ok {
                    message: format!("Game resumed, phase is {}", phase),
                }
            }
            Err(e) => AdminResponse::Error {
                error: e.to_string(),
            },
        },

        AdminCommand::ClearAlarm => match orchestrator.clear_alarm().await {
            Ok(true) => AdminResponse::Ok {
                message: "Alarm cleared".to_string(),
            },
            Ok(false) => AdminResponse::Ok {
                message: "No alarm was raised".to_string(),
            },
            Err(e) => AdminResponse::Error {
                error: e.to_string(),
            },
        },

        AdminCommand::ReloadBehavior => match orchestrator.reload_behavior().await {
            Ok(identity) => AdminResponse::Ok {
                message: format!("Behavior {} active", identity),
            },
            Err(e) => AdminResponse::Error {
                error: e.to_string(),
            },
        },
    }
}

/// Default socket path.
pub fn default_socket_path() -> String {
    let data_dir =
        std::env::var("REALITY_DATA_DIR").unwrap_or_else(|_| "./reality-data".to_string());
    format!("{}/admin.sock", data_dir)
}
