use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, PilotError, Result};

/// How long terminal records linger before eviction.
const TERMINAL_GRACE: Duration = Duration::from_secs(3);

/// Stages an operation moves through. Terminal stages persist for a short
/// grace window and are then garbage-collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    BackingUp,
    Building,
    Exporting,
    Stopping,
    Creating,
    Importing,
    MigratingData,
    Validating,
    Switching,
    CleaningUp,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::Failed | Stage::Error | Stage::Cancelled
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Starting => "starting",
            Stage::BackingUp => "backing_up",
            Stage::Building => "building",
            Stage::Exporting => "exporting",
            Stage::Stopping => "stopping",
            Stage::Creating => "creating",
            Stage::Importing => "importing",
            Stage::MigratingData => "migrating_data",
            Stage::Validating => "validating",
            Stage::Switching => "switching",
            Stage::CleaningUp => "cleaning_up",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One operation's progress as observed by readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub operation_key: String,
    pub stage: Stage,
    /// 0..=100, non-decreasing until a terminal stage
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Debug)]
struct Entry {
    record: ProgressRecord,
    tx: broadcast::Sender<ProgressRecord>,
    cancel: CancellationToken,
    /// Lease currently held by an operation
    active: bool,
    /// Hosts the operation is touching; guards host deletion
    hosts: Vec<String>,
    /// Bumped on each acquire so a delayed sweep never evicts a new lease
    generation: u64,
}

/// Process-wide mapping from operation key to progress record.
///
/// One writer per key: `acquire` hands out an exclusive lease and a second
/// attempt while the first is active fails with `already_running`. Readers
/// poll with `get`/`all`, or subscribe to the per-key push channel.
#[derive(Debug)]
pub struct ProgressRegistry {
    entries: Arc<DashMap<String, Entry>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the exclusive lease for `key`.
    pub fn acquire(self: &Arc<Self>, key: &str) -> Result<ProgressLease> {
        let generation;
        {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(64);
                Entry {
                    record: ProgressRecord {
                        operation_key: key.to_string(),
                        stage: Stage::Starting,
                        progress: 0,
                        message: String::new(),
                        timestamp: Utc::now(),
                        cancel_requested: false,
                    },
                    tx,
                    cancel: CancellationToken::new(),
                    active: false,
                    hosts: Vec::new(),
                    generation: 0,
                }
            });

            if entry.active {
                return Err(PilotError::new(
                    ErrorKind::AlreadyRunning,
                    format!("operation already running for {}", key),
                ));
            }

            entry.active = true;
            entry.generation += 1;
            entry.hosts.clear();
            entry.cancel = CancellationToken::new();
            entry.record = ProgressRecord {
                operation_key: key.to_string(),
                stage: Stage::Starting,
                progress: 0,
                message: String::new(),
                timestamp: Utc::now(),
                cancel_requested: false,
            };
            generation = entry.generation;
        }

        debug!(key, "progress lease acquired");
        Ok(ProgressLease {
            registry: Arc::clone(self),
            key: key.to_string(),
            generation,
            released: false,
        })
    }

    /// Request cancellation of the operation holding `key`.
    pub fn cancel(&self, key: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| PilotError::not_found(format!("operation {}", key)))?;

        if !entry.active {
            return Err(PilotError::not_found(format!("operation {}", key)));
        }

        entry.record.cancel_requested = true;
        entry.record.timestamp = Utc::now();
        entry.cancel.cancel();
        let snapshot = entry.record.clone();
        let _ = entry.tx.send(snapshot);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<ProgressRecord> {
        self.entries.get(key).map(|e| e.record.clone())
    }

    /// All records currently present, including terminal ones in their grace
    /// window.
    pub fn all(&self) -> Vec<ProgressRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    /// Subscribe to the push channel for one key.
    pub fn subscribe(&self, key: &str) -> Option<broadcast::Receiver<ProgressRecord>> {
        self.entries.get(key).map(|e| e.tx.subscribe())
    }

    /// Whether any active operation references the given host id.
    pub fn host_in_use(&self, host_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.active && e.hosts.iter().any(|h| h == host_id))
    }

    fn update(&self, key: &str, generation: u64, f: impl FnOnce(&mut ProgressRecord)) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.generation != generation {
                return;
            }
            f(&mut entry.record);
            entry.record.timestamp = Utc::now();
            let snapshot = entry.record.clone();
            let _ = entry.tx.send(snapshot);
        }
    }

    fn release(&self, key: &str, generation: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.generation != generation {
                return;
            }
            entry.active = false;
        }

        // Sweep the terminal record after the grace window unless the key
        // was re-acquired in the meantime.
        let entries = Arc::clone(&self.entries);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_GRACE).await;
            entries.remove_if(&key, |_, e| !e.active && e.generation == generation);
        });
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive writer lease for one operation key. Dropping the lease without
/// reaching a terminal stage records an internal fault.
#[derive(Debug)]
pub struct ProgressLease {
    registry: Arc<ProgressRegistry>,
    key: String,
    generation: u64,
    released: bool,
}

impl ProgressLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record the hosts this operation touches, blocking their deletion.
    pub fn set_hosts(&self, hosts: Vec<String>) {
        if let Some(mut entry) = self.registry.entries.get_mut(&self.key) {
            if entry.generation == self.generation {
                entry.hosts = hosts;
            }
        }
    }

    /// Emit a stage transition. Progress is clamped non-decreasing.
    pub fn update(&self, stage: Stage, progress: u8, message: impl Into<String>) {
        let message = message.into();
        debug!(key = %self.key, %stage, progress, "progress update");
        self.registry.update(&self.key, self.generation, |r| {
            r.stage = stage;
            r.progress = r.progress.max(progress.min(100));
            r.message = message;
        });
    }

    /// One-shot cancellation latch, observed at engine checkpoints.
    pub fn cancel_requested(&self) -> bool {
        self.registry
            .entries
            .get(&self.key)
            .map(|e| e.generation == self.generation && e.record.cancel_requested)
            .unwrap_or(false)
    }

    /// Future resolving when cancellation is requested. Used to interrupt
    /// long-running suspension points.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        let token = self
            .registry
            .entries
            .get(&self.key)
            .map(|e| e.cancel.clone())
            .unwrap_or_default();
        token.cancelled_owned()
    }

    /// Reach a terminal stage and release the lease.
    pub fn finish(mut self, stage: Stage, progress: u8, message: impl Into<String>) {
        let message = message.into();
        self.registry.update(&self.key, self.generation, |r| {
            r.stage = stage;
            if stage == Stage::Completed {
                r.progress = 100;
            } else {
                r.progress = r.progress.max(progress.min(100));
            }
            r.message = message;
        });
        self.registry.release(&self.key, self.generation);
        self.released = true;
    }
}

impl Drop for ProgressLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(key = %self.key, "operation dropped its lease without finishing");
            self.registry.update(&self.key, self.generation, |r| {
                r.stage = Stage::Error;
                r.message = "operation aborted".into();
            });
            self.registry.release(&self.key, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_active() {
        let registry = Arc::new(ProgressRegistry::new());

        let lease = registry.acquire("web").unwrap();
        let err = registry.acquire("web").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        lease.finish(Stage::Completed, 100, "done");
        // Released: the key can be re-acquired inside the grace window.
        let lease2 = registry.acquire("web").unwrap();
        lease2.finish(Stage::Completed, 100, "done again");
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let registry = Arc::new(ProgressRegistry::new());
        let lease = registry.acquire("app").unwrap();

        lease.update(Stage::Building, 20, "building");
        lease.update(Stage::Creating, 70, "creating");
        lease.update(Stage::Validating, 10, "late update");

        let record = registry.get("app").unwrap();
        assert_eq!(record.progress, 70);
        lease.finish(Stage::Completed, 100, "done");
        assert_eq!(registry.get("app").unwrap().progress, 100);
    }

    #[tokio::test]
    async fn cancel_sets_latch_and_token() {
        let registry = Arc::new(ProgressRegistry::new());
        let lease = registry.acquire("db").unwrap();

        assert!(!lease.cancel_requested());
        registry.cancel("db").unwrap();
        assert!(lease.cancel_requested());

        // The token resolves promptly once set.
        tokio::time::timeout(Duration::from_millis(100), lease.cancelled())
            .await
            .expect("cancellation future should resolve");

        lease.finish(Stage::Cancelled, 40, "cancelled");
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_not_found() {
        let registry = Arc::new(ProgressRegistry::new());
        let err = registry.cancel("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn terminal_records_are_swept_after_grace() {
        let registry = Arc::new(ProgressRegistry::new());
        let lease = registry.acquire("tmp").unwrap();
        lease.finish(Stage::Failed, 50, "boom");

        assert!(registry.get("tmp").is_some());
        tokio::time::sleep(TERMINAL_GRACE + Duration::from_millis(300)).await;
        assert!(registry.get("tmp").is_none());
    }

    #[tokio::test]
    async fn push_channel_mirrors_updates() {
        let registry = Arc::new(ProgressRegistry::new());
        let lease = registry.acquire("svc").unwrap();
        let mut rx = registry.subscribe("svc").unwrap();

        lease.update(Stage::Building, 20, "build");
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.stage, Stage::Building);
        assert_eq!(seen.progress, 20);

        lease.finish(Stage::Completed, 100, "done");
    }

    #[tokio::test]
    async fn hosts_guard_deletion() {
        let registry = Arc::new(ProgressRegistry::new());
        let lease = registry.acquire("job").unwrap();
        lease.set_hosts(vec!["local".into(), "edge-1".into()]);

        assert!(registry.host_in_use("edge-1"));
        assert!(!registry.host_in_use("edge-2"));

        lease.finish(Stage::Completed, 100, "done");
        assert!(!registry.host_in_use("edge-1"));
    }
}
