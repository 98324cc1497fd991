//! Live coordination with the external migration engine.
//!
//! A [`LiveCoordinator`] owns the three event subscriptions and the command
//! dispatcher for one engine endpoint. It is created explicitly, handed to
//! whoever needs it, and disposed explicitly (or on drop).

mod command;
pub mod stream;

pub use command::{CommandDispatcher, EngineCommand};
pub use stream::{ConnectionPhase, StreamClient, StreamViews};

use crate::model::{EngineStatus, EngineStats, LogEntry};
use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub command_timeout: Duration,
    pub log_cap: usize,
}

/// Point-in-time copy of everything the console mirrors from the engine.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub status: Option<EngineStatus>,
    pub stats: Option<EngineStats>,
    pub logs: Vec<LogEntry>,
    pub status_phase: ConnectionPhase,
    pub stats_phase: ConnectionPhase,
    pub logs_phase: ConnectionPhase,
    pub live_connected: bool,
    pub last_error: Option<String>,
    pub command_in_flight: bool,
}

impl LiveSnapshot {
    pub fn from_views(views: &StreamViews, command_in_flight: bool) -> Self {
        let status = views.status.borrow().clone();
        let stats = views.stats.borrow().clone();
        let logs = views.logs.borrow().clone();
        let last_error = status
            .last_error
            .clone()
            .or_else(|| stats.last_error.clone())
            .or_else(|| logs.last_error.clone());
        Self {
            live_connected: status.connected() && stats.connected(),
            status_phase: status.phase,
            stats_phase: stats.phase,
            logs_phase: logs.phase,
            status: status.view,
            stats: stats.view,
            logs: logs.view.iter().cloned().collect(),
            last_error,
            command_in_flight,
        }
    }
}

pub struct LiveCoordinator {
    streams: StreamClient,
    commands: CommandDispatcher,
    disposed: bool,
}

impl LiveCoordinator {
    /// Open all subscriptions against the engine. Must be called inside a Tokio runtime.
    /// The coordinator itself may then move to any thread.
    pub fn create(cfg: &EngineConfig) -> Result<Self> {
        let commands = CommandDispatcher::new(&cfg.base_url, cfg.command_timeout)
            .context("build engine command client")?;
        let streams = StreamClient::connect(&cfg.base_url, cfg.log_cap);
        tracing::info!(engine = %cfg.base_url, "live coordinator created");
        Ok(Self {
            streams,
            commands,
            disposed: false,
        })
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        self.commands.clone()
    }

    pub fn command_in_flight(&self) -> bool {
        self.commands.is_busy()
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot::from_views(&self.streams.views(), self.command_in_flight())
    }

    /// Close every subscription. Safe to call any number of times.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.streams.close();
        self.disposed = true;
        tracing::info!("live coordinator disposed");
    }
}

impl Drop for LiveCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispose_is_idempotent_and_disconnects() {
        let mut live = LiveCoordinator::create(&EngineConfig {
            base_url: "http://127.0.0.1:9".into(),
            command_timeout: Duration::from_secs(1),
            log_cap: 10,
        })
        .unwrap();
        let snap = live.snapshot();
        assert!(!snap.live_connected);
        assert!(snap.status.is_none());
        assert!(!snap.command_in_flight);

        live.dispose();
        live.dispose();
        let snap = live.snapshot();
        assert_eq!(snap.status_phase, ConnectionPhase::Disconnected);
        assert_eq!(snap.stats_phase, ConnectionPhase::Disconnected);
        assert_eq!(snap.logs_phase, ConnectionPhase::Disconnected);
    }
}
