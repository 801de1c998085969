/// Engine configuration.
///
/// Tunables for delivery, buffering and secret handling. The hard
/// guardrails (payload size, op caps, chunk sizes) are constants in
/// `crdt::limits` and are not configurable.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::crdt::limits::MAX_OPS_PER_SYNC_ROUND;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum gap between two outbound peer contacts.
    pub peer_contact_spacing_ms: u64,
    /// Attempts per outbound frame, the first one included.
    pub max_send_attempts: u32,
    /// Base delay before a retry, doubled per attempt.
    pub retry_backoff_ms: u64,
    /// How long an op may wait for missing dependencies.
    pub dependency_timeout_secs: u64,
    /// Bound on buffered ops per group.
    pub max_pending_ops: usize,
    /// Ops sent in answer to one sync request.
    pub max_ops_per_sync_round: usize,
    /// Accept invitations without asking the user.
    pub auto_accept_invites: bool,
    /// Generate a fresh group secret when a member holding it is removed.
    pub rotate_secret_on_removal: bool,
    /// Minimum gap between two requests for the same missing secret.
    pub secret_request_interval_secs: u64,
    pub command_queue_depth: usize,
    pub event_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_contact_spacing_ms: 250,
            max_send_attempts: 5,
            retry_backoff_ms: 2_000,
            dependency_timeout_secs: 600, // 10 minutes
            max_pending_ops: 1_024,
            max_ops_per_sync_round: MAX_OPS_PER_SYNC_ROUND,
            auto_accept_invites: false,
            rotate_secret_on_removal: true,
            secret_request_interval_secs: 30,
            command_queue_depth: 64,
            event_queue_depth: 256,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON object. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_attempts == 0 {
            return Err(ConfigError::Invalid("max_send_attempts must be at least 1".into()));
        }
        if self.max_ops_per_sync_round == 0 {
            return Err(ConfigError::Invalid("max_ops_per_sync_round must be at least 1".into()));
        }
        if self.command_queue_depth == 0 || self.event_queue_depth == 0 {
            return Err(ConfigError::Invalid("queue depths must be at least 1".into()));
        }
        Ok(())
    }

    pub fn peer_contact_spacing(&self) -> Duration {
        Duration::from_millis(self.peer_contact_spacing_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_secs)
    }

    pub fn secret_request_interval(&self) -> Duration {
        Duration::from_secs(self.secret_request_interval_secs)
    }
}
