//! Permanent and time-limited user blocks.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::error::{Result, StoreError};
use super::traits::KeyValueBackend;

/// JSON array of permanently blocked user ids.
pub const PERMANENT_KEY: &str = "blockedUsers";
/// JSON object mapping user id to expiry (epoch milliseconds).
pub const TEMPORARY_KEY: &str = "tempBlockedUsers";

#[derive(Debug, Default)]
struct BlocklistState {
    permanent: BTreeSet<String>,
    temporary: BTreeMap<String, DateTime<Utc>>,
}

/// Answers "is this user blocked right now?" and persists every change.
///
/// Changes are written to the backend before they are applied in memory, so
/// a failed write leaves both views unchanged.
pub struct BlocklistStore {
    backend: Arc<dyn KeyValueBackend>,
    state: Mutex<BlocklistState>,
    shutdown_notifier: Notify,
}

impl BlocklistStore {
    /// Loads both entries from `backend`. Malformed entries are logged and
    /// treated as empty.
    pub async fn load(backend: Arc<dyn KeyValueBackend>) -> Result<Self> {
        let mut state = BlocklistState::default();

        if let Some(raw) = backend.get(PERMANENT_KEY).await? {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(users) => state.permanent = users.into_iter().collect(),
                Err(e) => warn!(
                    target: "Store/Blocklist",
                    "Ignoring malformed {PERMANENT_KEY}: {e}"
                ),
            }
        }

        if let Some(raw) = backend.get(TEMPORARY_KEY).await? {
            match serde_json::from_str::<BTreeMap<String, i64>>(&raw) {
                Ok(entries) => {
                    for (user, millis) in entries {
                        match Utc.timestamp_millis_opt(millis).single() {
                            Some(expiry) => {
                                state.temporary.insert(user, expiry);
                            }
                            None => warn!(
                                target: "Store/Blocklist",
                                "Dropping temporary block for {user} with invalid expiry {millis}"
                            ),
                        }
                    }
                }
                Err(e) => warn!(
                    target: "Store/Blocklist",
                    "Ignoring malformed {TEMPORARY_KEY}: {e}"
                ),
            }
        }

        debug!(
            target: "Store/Blocklist",
            "Loaded {} permanent and {} temporary blocks",
            state.permanent.len(),
            state.temporary.len()
        );

        Ok(Self {
            backend,
            state: Mutex::new(state),
            shutdown_notifier: Notify::new(),
        })
    }

    pub async fn is_blocked(&self, user_id: &str) -> bool {
        self.is_blocked_at(user_id, Utc::now()).await
    }

    /// Blocked permanently, or temporarily with `now < expiry`. An expired
    /// temporary entry is evicted on the way.
    pub async fn is_blocked_at(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        if state.permanent.contains(user_id) {
            return true;
        }

        let expiry = state.temporary.get(user_id).copied();
        match expiry {
            Some(expiry) if now < expiry => true,
            Some(_) => {
                state.temporary.remove(user_id);
                debug!(target: "Store/Blocklist", "Temporary block on {user_id} expired");
                if let Err(e) = self.persist_temporary(&state.temporary).await {
                    warn!(target: "Store/Blocklist", "Failed to persist expiry of {user_id}: {e}");
                }
                false
            }
            None => false,
        }
    }

    pub async fn block_permanent(&self, user_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut permanent = state.permanent.clone();
        permanent.insert(user_id.to_string());
        self.persist_permanent(&permanent).await?;
        state.permanent = permanent;

        if state.temporary.contains_key(user_id) {
            let mut temporary = state.temporary.clone();
            temporary.remove(user_id);
            self.persist_temporary(&temporary).await?;
            state.temporary = temporary;
        }
        info!(target: "Store/Blocklist", "Blocked {user_id} permanently");
        Ok(())
    }

    /// Blocks for `duration_hours` from now, replacing any earlier temporary
    /// block. Returns the expiry.
    pub async fn block_temporary(
        &self,
        user_id: &str,
        duration_hours: u32,
    ) -> Result<DateTime<Utc>> {
        let expiry = Utc::now() + ChronoDuration::hours(i64::from(duration_hours));
        self.block_until(user_id, expiry).await?;
        Ok(expiry)
    }

    pub async fn block_until(&self, user_id: &str, expiry: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut temporary = state.temporary.clone();
        temporary.insert(user_id.to_string(), expiry);
        self.persist_temporary(&temporary).await?;
        state.temporary = temporary;
        info!(target: "Store/Blocklist", "Blocked {user_id} until {expiry}");
        Ok(())
    }

    /// Lifts both kinds of block. Returns true if anything was removed.
    pub async fn unblock(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let was_permanent = state.permanent.contains(user_id);
        let was_temporary = state.temporary.contains_key(user_id);

        if was_permanent {
            let mut permanent = state.permanent.clone();
            permanent.remove(user_id);
            self.persist_permanent(&permanent).await?;
            state.permanent = permanent;
        }
        if was_temporary {
            let mut temporary = state.temporary.clone();
            temporary.remove(user_id);
            self.persist_temporary(&temporary).await?;
            state.temporary = temporary;
        }
        if was_permanent || was_temporary {
            info!(target: "Store/Blocklist", "Unblocked {user_id}");
        }
        Ok(was_permanent || was_temporary)
    }

    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now()).await
    }

    /// Evicts every temporary block that has expired at `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut temporary = state.temporary.clone();
        temporary.retain(|_, expiry| now < *expiry);
        let evicted = state.temporary.len() - temporary.len();
        if evicted > 0 {
            self.persist_temporary(&temporary).await?;
            state.temporary = temporary;
            debug!(target: "Store/Blocklist", "Swept {evicted} expired temporary blocks");
        }
        Ok(evicted)
    }

    pub async fn permanent_blocks(&self) -> Vec<String> {
        self.state.lock().await.permanent.iter().cloned().collect()
    }

    pub async fn temporary_blocks(&self) -> Vec<(String, DateTime<Utc>)> {
        self.state
            .lock()
            .await
            .temporary
            .iter()
            .map(|(user, expiry)| (user.clone(), *expiry))
            .collect()
    }

    /// Periodically evicts expired temporary blocks until [`Self::shutdown`].
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.sweep().await {
                            warn!(target: "Store/Blocklist", "Sweep failed: {e}");
                        }
                    }
                    _ = store.shutdown_notifier.notified() => {
                        debug!(target: "Store/Blocklist", "Shutdown signaled, exiting sweeper.");
                        return;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_notifier.notify_one();
    }

    async fn persist_permanent(&self, permanent: &BTreeSet<String>) -> Result<()> {
        let data = serde_json::to_string(permanent)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(PERMANENT_KEY, &data).await
    }

    async fn persist_temporary(&self, temporary: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let entries: BTreeMap<&str, i64> = temporary
            .iter()
            .map(|(user, expiry)| (user.as_str(), expiry.timestamp_millis()))
            .collect();
        let data = serde_json::to_string(&entries)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(TEMPORARY_KEY, &data).await
    }
}
