//! Control requests to the engine, strictly one at a time.
//!
//! The dispatcher never touches local engine state. Whatever a command does
//! becomes visible only through the engine's next `status-update` event.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    Pause,
    Resume,
    Stop,
    Restart,
}

impl EngineCommand {
    pub fn as_path(self) -> &'static str {
        match self {
            EngineCommand::Pause => "pause",
            EngineCommand::Resume => "resume",
            EngineCommand::Stop => "stop",
            EngineCommand::Restart => "restart",
        }
    }
}

impl std::fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_path())
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("another engine command is still in flight")]
    Busy,
    #[error("command request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine rejected {command}: {message}")]
    Rejected {
        command: EngineCommand,
        message: String,
    },
    #[error("engine answered {command} with HTTP {status}")]
    Status { command: EngineCommand, status: u16 },
    #[error("unreadable response to {command}: {body}")]
    Malformed { command: EngineCommand, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub command: EngineCommand,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Clears the in-flight flag on every exit path, including cancellation of the caller's future.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    http: reqwest::Client,
    base_url: String,
    in_flight: Arc<AtomicBool>,
}

impl CommandDispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CommandError> {
        let http = reqwest::Client::builder()
            .user_agent(format!(
                "policy-migration-console/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether a command is outstanding. While true, every command action should be disabled.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn execute(&self, command: EngineCommand) -> Result<CommandAck, CommandError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(%command, "command rejected, another is in flight");
            return Err(CommandError::Busy);
        }
        let _guard = InFlight(self.in_flight.clone());

        let url = format!("{}/command/{}", self.base_url, command.as_path());
        tracing::info!(%command, %url, "sending engine command");
        let resp = self.http.post(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        let parsed = match serde_json::from_str::<CommandResponse>(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(CommandError::Status {
                    command,
                    status: status.as_u16(),
                })
            }
            Err(_) => return Err(CommandError::Malformed { command, body }),
        };

        if let Some(message) = parsed.error {
            tracing::warn!(%command, %message, "engine rejected command");
            return Err(CommandError::Rejected { command, message });
        }
        if !status.is_success() {
            return Err(CommandError::Status {
                command,
                status: status.as_u16(),
            });
        }
        if !parsed.ok {
            return Err(CommandError::Rejected {
                command,
                message: "engine did not acknowledge the command".into(),
            });
        }
        tracing::info!(%command, "engine acknowledged command");
        Ok(CommandAck { command })
    }
}
