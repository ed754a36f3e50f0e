use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calls::ParticipantRole;

/// Tunables for the signaling core. Every field has a default, so a partial
/// JSON document is enough.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Seconds the caller waits for an answer before sending `timeout`.
    pub ring_timeout_secs: u64,
    /// Seconds after the ring timeout during which a late accept still connects.
    pub grace_period_secs: u64,
    /// Identical notifications closer together than this are dropped.
    pub notification_dedup_ms: u64,
    /// Interval of the blocklist expiry sweep.
    pub blocklist_sweep_secs: u64,
    /// Directory holding the persisted blocklist.
    pub storage_dir: PathBuf,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            grace_period_secs: 5,
            notification_dedup_ms: 50,
            blocklist_sweep_secs: 300,
            storage_dir: PathBuf::from("./callsignal-data"),
        }
    }
}

impl SignalingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// The callee keeps ringing through the caller's grace window.
    pub fn callee_ring_timeout(&self) -> Duration {
        self.ring_timeout() + self.grace_period()
    }

    pub fn notification_dedup_window(&self) -> Duration {
        Duration::from_millis(self.notification_dedup_ms)
    }

    pub fn blocklist_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.blocklist_sweep_secs)
    }
}

/// The user this process signs in as.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LocalIdentity {
    pub user_id: String,
    pub role: ParticipantRole,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}
