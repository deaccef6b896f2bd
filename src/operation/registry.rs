//! Operation Registry
//!
//! Thread-safe table of in-flight and terminal operations. All mutation goes
//! through registry methods; callers only ever see cloned snapshots.

use crate::clock::{Clock, SystemClock};
use crate::error::{ExportError, Result};
use crate::operation::types::{keys, Operation, OperationId, OperationStatus, Progress};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Entry {
    op: Operation,
    token: CancellationToken,
}

pub struct OperationRegistry {
    ops: Mutex<HashMap<OperationId, Entry>>,
    clock: Arc<dyn Clock>,
}

impl OperationRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            ops: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn ops(&self) -> MutexGuard<'_, HashMap<OperationId, Entry>> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a Running operation with zeroed progress
    pub fn register(&self) -> OperationId {
        let id = OperationId::new();
        let entry = Entry {
            op: Operation::running(id, self.clock.now()),
            token: CancellationToken::new(),
        };
        self.ops().insert(id, entry);
        info!("Registered operation {}", id);
        id
    }

    /// Replace the progress triple; dropped for unknown/terminal operations and
    /// for updates that would move `current` backwards
    pub fn update_progress(&self, id: OperationId, current: u64, total: u64) {
        let mut ops = self.ops();
        if let Some(entry) = ops.get_mut(&id) {
            if entry.op.status.is_terminal() || current < entry.op.progress.current {
                return;
            }
            entry.op.progress = Progress::new(current, total);
        }
    }

    /// Running -> Cancelled. Returns false for unknown or otherwise-terminal
    /// operations, true (idempotently) for ones already cancelled.
    pub fn cancel(&self, id: OperationId) -> bool {
        let mut ops = self.ops();
        let Some(entry) = ops.get_mut(&id) else {
            return false;
        };
        match entry.op.status {
            OperationStatus::Cancelled => true,
            OperationStatus::Running | OperationStatus::LimitExceeded => {
                entry.op.status = OperationStatus::Cancelled;
                entry.op.ended_at = Some(self.clock.now());
                entry.token.cancel();
                info!("Cancelled operation {}", id);
                true
            }
            OperationStatus::Completed | OperationStatus::Failed => false,
        }
    }

    /// Running -> Completed; idempotent. Returns whether the operation is Completed.
    pub fn mark_completed(&self, id: OperationId) -> bool {
        let mut ops = self.ops();
        let Some(entry) = ops.get_mut(&id) else {
            return false;
        };
        match entry.op.status {
            OperationStatus::Completed => true,
            OperationStatus::Running | OperationStatus::LimitExceeded => {
                entry.op.status = OperationStatus::Completed;
                entry.op.ended_at = Some(self.clock.now());
                entry.op.metadata.remove(keys::AWAITING_CONFIRMATION);
                info!("Completed operation {}", id);
                true
            }
            OperationStatus::Cancelled | OperationStatus::Failed => false,
        }
    }

    /// Running -> Failed. The error itself is still returned to the caller;
    /// this only lets pollers and the reaper see a terminal state.
    pub fn mark_failed(&self, id: OperationId, reason: &str) {
        let mut ops = self.ops();
        if let Some(entry) = ops.get_mut(&id) {
            if entry.op.status.is_terminal() {
                return;
            }
            entry.op.status = OperationStatus::Failed;
            entry.op.ended_at = Some(self.clock.now());
            entry
                .op
                .metadata
                .insert(keys::ERROR.to_string(), serde_json::Value::from(reason));
            warn!("Operation {} failed: {}", id, reason);
        }
    }

    pub fn is_cancelled(&self, id: OperationId) -> bool {
        self.ops()
            .get(&id)
            .map(|e| e.op.status == OperationStatus::Cancelled)
            .unwrap_or(false)
    }

    pub fn status(&self, id: OperationId) -> Result<Operation> {
        self.ops()
            .get(&id)
            .map(|e| e.op.clone())
            .ok_or_else(|| ExportError::NotFound(id.to_string()))
    }

    /// Cancellation token that fires when `cancel(id)` succeeds
    pub fn token(&self, id: OperationId) -> Option<CancellationToken> {
        self.ops().get(&id).map(|e| e.token.clone())
    }

    pub fn set_metadata(&self, id: OperationId, key: &str, value: serde_json::Value) {
        let mut ops = self.ops();
        if let Some(entry) = ops.get_mut(&id) {
            if !entry.op.status.is_terminal() {
                entry.op.metadata.insert(key.to_string(), value);
            }
        }
    }

    /// Pick a paused operation back up. False when the id is unknown or terminal.
    pub fn resume(&self, id: OperationId) -> bool {
        let mut ops = self.ops();
        match ops.get_mut(&id) {
            Some(entry) if !entry.op.status.is_terminal() => {
                entry.op.metadata.remove(keys::AWAITING_CONFIRMATION);
                debug!("Resumed operation {}", id);
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<Operation> {
        self.ops().values().map(|e| e.op.clone()).collect()
    }

    /// Remove terminal operations that ended more than `max_age` ago
    pub fn reap(&self, max_age: chrono::Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let mut ops = self.ops();
        let before = ops.len();
        ops.retain(|_, entry| match entry.op.ended_at {
            Some(ended) if entry.op.status.is_terminal() => ended > cutoff,
            _ => true,
        });
        before - ops.len()
    }

    /// Run `reap` every `interval` until the returned handle is shut down or the
    /// registry is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, max_age: chrono::Duration) -> ReaperHandle {
        let registry: Weak<Self> = Arc::downgrade(self);
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        let reaped = registry.reap(max_age);
                        if reaped > 0 {
                            debug!("Reaped {} terminal operations", reaped);
                        }
                    }
                }
            }
            debug!("Operation reaper stopped");
        });

        ReaperHandle { token, handle }
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Owns the background reaper task
pub struct ReaperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Reaper task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn registry_with_clock() -> (Arc<OperationRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (Arc::new(OperationRegistry::new(clock.clone())), clock)
    }

    #[test]
    fn test_register_is_running_with_zero_progress() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        let op = registry.status(id).unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.progress, Progress::default());
        assert!(op.ended_at.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = OperationRegistry::default();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cancel_completed_is_rejected() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        assert!(registry.mark_completed(id));
        assert!(!registry.cancel(id));
        assert_eq!(registry.status(id).unwrap().status, OperationStatus::Completed);
    }

    #[test]
    fn test_cancel_twice_is_idempotent() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        assert!(registry.cancel(id));
        assert!(registry.cancel(id));
        assert_eq!(registry.status(id).unwrap().status, OperationStatus::Cancelled);
        assert!(registry.is_cancelled(id));
    }

    #[test]
    fn test_cancel_fires_token() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        let token = registry.token(id).unwrap();
        assert!(!token.is_cancelled());
        registry.cancel(id);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown() {
        let registry = OperationRegistry::default();
        assert!(!registry.cancel(OperationId::new()));
        assert!(!registry.is_cancelled(OperationId::new()));
    }

    #[test]
    fn test_mark_completed_after_cancel_is_noop() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        registry.cancel(id);
        assert!(!registry.mark_completed(id));
        assert_eq!(registry.status(id).unwrap().status, OperationStatus::Cancelled);
    }

    #[test]
    fn test_progress_dropped_after_terminal() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        registry.update_progress(id, 10, 100);
        registry.mark_completed(id);
        registry.update_progress(id, 50, 100);
        let op = registry.status(id).unwrap();
        assert_eq!(op.progress.current, 10);
        assert_eq!(op.progress.percentage, 10);
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        registry.update_progress(id, 40, 100);
        registry.update_progress(id, 30, 100);
        assert_eq!(registry.status(id).unwrap().progress.current, 40);
        registry.update_progress(id, 40, 80);
        assert_eq!(registry.status(id).unwrap().progress.percentage, 50);
    }

    #[test]
    fn test_progress_zero_total() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        registry.update_progress(id, 0, 0);
        assert_eq!(registry.status(id).unwrap().progress.percentage, 0);
    }

    #[test]
    fn test_mark_failed_is_terminal() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        registry.mark_failed(id, "procedure blew up");
        let op = registry.status(id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.metadata[keys::ERROR], serde_json::json!("procedure blew up"));
        assert!(!registry.cancel(id));
        assert!(!registry.mark_completed(id));
    }

    #[test]
    fn test_resume_only_running() {
        let registry = OperationRegistry::default();
        let id = registry.register();
        registry.set_metadata(id, keys::AWAITING_CONFIRMATION, serde_json::json!(true));
        assert_eq!(
            registry.status(id).unwrap().reported_status(),
            OperationStatus::LimitExceeded
        );
        assert!(registry.resume(id));
        assert_eq!(registry.status(id).unwrap().reported_status(), OperationStatus::Running);

        registry.mark_completed(id);
        assert!(!registry.resume(id));
    }

    #[test]
    fn test_reap_removes_only_old_terminal() {
        let (registry, clock) = registry_with_clock();
        let done = registry.register();
        let running = registry.register();
        registry.mark_completed(done);

        assert_eq!(registry.reap(chrono::Duration::minutes(10)), 0);

        clock.advance(chrono::Duration::minutes(11));
        assert_eq!(registry.reap(chrono::Duration::minutes(10)), 1);
        assert!(registry.status(done).is_err());
        assert!(registry.status(running).is_ok());
    }

    #[tokio::test]
    async fn test_background_reaper_runs_and_stops() {
        let (registry, clock) = registry_with_clock();
        let id = registry.register();
        registry.cancel(id);
        clock.advance(chrono::Duration::hours(2));

        let reaper = registry.spawn_reaper(Duration::from_millis(10), chrono::Duration::hours(1));
        for _ in 0..50 {
            if registry.status(id).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.status(id).is_err());
        reaper.shutdown().await;
    }
}
