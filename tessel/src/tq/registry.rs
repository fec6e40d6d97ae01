//! Subscription execs keyed by subscription key.
//!
//! Pollers on different worker threads share one [`Exec`] per subscription.
//! The consumer id and epoch are atomics: pollers only ever raise the epoch
//! (compare-and-swap), while [`ExecRegistry::apply_rebalance`] hands the
//! subscription to a new consumer under the registry's write lock, so the
//! create-or-update decision and the insert happen in one step.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConsistencyError, Result};
use crate::tq::exec::{QueryCompiler, QueryPlan, StreamExecutor};
use crate::tq::wal::{WalEntry, WalReadHandle, WalReader};

/// Consumer id meaning "no consumer".
pub const NO_CONSUMER: i64 = -1;

/// Epoch of an exec no poll has reached yet.
pub const EPOCH_UNSET: i32 = -1;

/// A consumer-group reassignment for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceRequest {
    /// Subscription key.
    pub sub_key: String,
    /// Consumer the coordinator believes holds the subscription, or
    /// [`NO_CONSUMER`] for a new subscription.
    pub old_consumer_id: i64,
    /// Consumer taking over.
    pub new_consumer_id: i64,
    /// What the subscription reads.
    pub plan: QueryPlan,
}

/// Per-subscription execution context.
pub struct Exec {
    sub_key: String,
    plan: QueryPlan,
    epoch: AtomicI32,
    consumer_id: AtomicI64,
    read_handle: Mutex<Box<dyn WalReadHandle>>,
    executors: Vec<Mutex<Box<dyn StreamExecutor>>>,
}

impl std::fmt::Debug for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exec")
            .field("sub_key", &self.sub_key)
            .field("plan", &self.plan)
            .field("epoch", &self.epoch())
            .field("consumer_id", &self.consumer_id())
            .field("executors", &self.executors.len())
            .finish_non_exhaustive()
    }
}

impl Exec {
    /// Opens a read handle on `wal` and compiles one executor per worker
    /// slot.
    ///
    /// # Errors
    ///
    /// Returns any error from `compiler`.
    pub(crate) fn new(
        sub_key: &str,
        plan: QueryPlan,
        consumer_id: i64,
        epoch: i32,
        wal: &dyn WalReader,
        compiler: &dyn QueryCompiler,
        slots: usize,
    ) -> Result<Self> {
        let executors = (0..slots)
            .map(|_| compiler.compile(&plan).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sub_key: sub_key.to_string(),
            plan,
            epoch: AtomicI32::new(epoch),
            consumer_id: AtomicI64::new(consumer_id),
            read_handle: Mutex::new(wal.open_read_handle()),
            executors,
        })
    }

    /// Subscription key.
    #[must_use]
    pub fn sub_key(&self) -> &str {
        &self.sub_key
    }

    /// Compiled plan.
    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Live epoch.
    #[must_use]
    pub fn epoch(&self) -> i32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Consumer currently holding the subscription.
    #[must_use]
    pub fn consumer_id(&self) -> i64 {
        self.consumer_id.load(Ordering::Acquire)
    }

    /// Raises the live epoch to `epoch` if it is behind and returns the
    /// resulting live epoch. Never lowers it.
    pub fn advance_epoch(&self, epoch: i32) -> i32 {
        let mut live = self.epoch();
        while live < epoch {
            match self
                .epoch
                .compare_exchange_weak(live, epoch, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return epoch,
                Err(actual) => live = actual,
            }
        }
        live
    }

    /// Reads the log entry at `version` through this exec's read handle.
    ///
    /// # Errors
    ///
    /// Propagates errors from the log.
    pub fn read_at(&self, version: i64) -> Result<Option<WalEntry>> {
        self.read_handle.lock().read_at(version)
    }

    /// Locks the executor of worker slot `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::WorkerOutOfRange`] if the slot does not
    /// exist.
    pub fn executor(&self, worker: usize) -> Result<MutexGuard<'_, Box<dyn StreamExecutor>>> {
        self.executors
            .get(worker)
            .map(|m| m.lock())
            .ok_or_else(|| {
                ConsistencyError::WorkerOutOfRange {
                    worker_id: worker,
                    slots: self.executors.len(),
                }
                .into()
            })
    }

    fn reassign(&self, consumer_id: i64) -> i32 {
        self.epoch.store(EPOCH_UNSET, Ordering::Release);
        self.consumer_id.store(consumer_id, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Concurrent map of subscription key to [`Exec`].
#[derive(Debug, Default)]
pub struct ExecRegistry {
    execs: RwLock<HashMap<String, Arc<Exec>>>,
}

impl ExecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a subscription.
    #[must_use]
    pub fn get(&self, sub_key: &str) -> Option<Arc<Exec>> {
        self.execs.read().get(sub_key).cloned()
    }

    /// Applies a rebalance and returns the affected exec.
    ///
    /// An unknown key with `old_consumer_id == NO_CONSUMER` creates a new
    /// exec with an unset epoch. A known key moves to the new consumer
    /// when the stored consumer equals `old_consumer_id`; its epoch
    /// restarts at 0.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::ConsumerMismatch`] if `old_consumer_id`
    /// does not match the stored consumer (or is not [`NO_CONSUMER`] for an
    /// unknown key), or [`ConsistencyError::InvalidBatch`] if the new
    /// consumer is [`NO_CONSUMER`]. Nothing is changed on error.
    pub fn apply_rebalance(
        &self,
        req: &RebalanceRequest,
        wal: &dyn WalReader,
        compiler: &dyn QueryCompiler,
        slots: usize,
    ) -> Result<Arc<Exec>> {
        if req.new_consumer_id == NO_CONSUMER {
            return Err(ConsistencyError::InvalidBatch {
                reason: format!("rebalance of '{}' names no new consumer", req.sub_key),
            }
            .into());
        }

        let mut execs = self.execs.write();
        match execs.entry(req.sub_key.clone()) {
            Entry::Vacant(slot) => {
                if req.old_consumer_id != NO_CONSUMER {
                    return Err(ConsistencyError::ConsumerMismatch {
                        sub_key: req.sub_key.clone(),
                        expected: req.old_consumer_id,
                        actual: NO_CONSUMER,
                    }
                    .into());
                }
                let exec = Arc::new(Exec::new(
                    &req.sub_key,
                    req.plan.clone(),
                    req.new_consumer_id,
                    EPOCH_UNSET,
                    wal,
                    compiler,
                    slots,
                )?);
                slot.insert(Arc::clone(&exec));
                info!(
                    target: "tessel::tq",
                    sub_key = %req.sub_key,
                    consumer_id = req.new_consumer_id,
                    slots,
                    "subscription exec created"
                );
                Ok(exec)
            }
            Entry::Occupied(slot) => {
                let exec = slot.get();
                let stored = exec.consumer_id();
                if stored != req.old_consumer_id {
                    return Err(ConsistencyError::ConsumerMismatch {
                        sub_key: req.sub_key.clone(),
                        expected: req.old_consumer_id,
                        actual: stored,
                    }
                    .into());
                }
                let epoch = exec.reassign(req.new_consumer_id);
                info!(
                    target: "tessel::tq",
                    sub_key = %req.sub_key,
                    old_consumer_id = stored,
                    consumer_id = req.new_consumer_id,
                    epoch,
                    "subscription reassigned"
                );
                Ok(Arc::clone(exec))
            }
        }
    }

    /// Inserts a restored exec, replacing any previous one.
    pub(crate) fn insert(&self, exec: Exec) {
        self.execs
            .write()
            .insert(exec.sub_key.clone(), Arc::new(exec));
    }

    /// Removes a subscription. In-flight polls holding the exec finish
    /// against it.
    pub fn remove(&self, sub_key: &str) -> Option<Arc<Exec>> {
        self.execs.write().remove(sub_key)
    }

    /// Every registered exec, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Exec>> {
        let mut all: Vec<_> = self.execs.read().values().cloned().collect();
        all.sort_by(|a, b| a.sub_key.cmp(&b.sub_key));
        all
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.execs.read().len()
    }

    /// True if there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::TesselError;
    use crate::tq::exec::ScanCompiler;
    use crate::tq::wal::MemWal;

    fn req(old: i64, new: i64) -> RebalanceRequest {
        RebalanceRequest {
            sub_key: "cg1:topic".to_string(),
            old_consumer_id: old,
            new_consumer_id: new,
            plan: QueryPlan::default(),
        }
    }

    #[test]
    fn test_create_then_reassign() {
        let wal = MemWal::new();
        let registry = ExecRegistry::new();

        let exec = registry.apply_rebalance(&req(NO_CONSUMER, 10), &wal, &ScanCompiler, 4).unwrap();
        assert_eq!(exec.epoch(), EPOCH_UNSET);
        assert_eq!(exec.consumer_id(), 10);
        assert!(exec.executor(3).is_ok());
        assert!(exec.executor(4).is_err());

        exec.advance_epoch(5);
        let exec = registry.apply_rebalance(&req(10, 11), &wal, &ScanCompiler, 4).unwrap();
        assert_eq!(exec.consumer_id(), 11);
        assert_eq!(exec.epoch(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mismatch_changes_nothing() {
        let wal = MemWal::new();
        let registry = ExecRegistry::new();

        let err = registry.apply_rebalance(&req(3, 10), &wal, &ScanCompiler, 1).unwrap_err();
        assert!(matches!(
            err,
            TesselError::Consistency(ConsistencyError::ConsumerMismatch { .. })
        ));
        assert!(registry.is_empty());

        registry.apply_rebalance(&req(NO_CONSUMER, 10), &wal, &ScanCompiler, 1).unwrap();
        let exec = registry.get("cg1:topic").unwrap();
        exec.advance_epoch(2);
        assert!(registry.apply_rebalance(&req(99, 12), &wal, &ScanCompiler, 1).is_err());
        assert_eq!(exec.consumer_id(), 10);
        assert_eq!(exec.epoch(), 2);
    }

    #[test]
    fn test_advance_epoch_is_monotonic() {
        let wal = MemWal::new();
        let exec = Exec::new("k", QueryPlan::default(), 1, EPOCH_UNSET, &wal, &ScanCompiler, 1).unwrap();
        assert_eq!(exec.advance_epoch(3), 3);
        assert_eq!(exec.advance_epoch(1), 3);
        assert_eq!(exec.epoch(), 3);
    }

    #[test]
    fn test_concurrent_create_inserts_once() {
        let wal = MemWal::new();
        let registry = ExecRegistry::new();
        let results: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (registry, wal) = (&registry, &wal);
                    s.spawn(move || {
                        registry
                            .apply_rebalance(&req(NO_CONSUMER, 100 + i), wal, &ScanCompiler, 1)
                            .is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_epoch_advance() {
        let wal = MemWal::new();
        let exec = Exec::new("k", QueryPlan::default(), 1, EPOCH_UNSET, &wal, &ScanCompiler, 1).unwrap();
        thread::scope(|s| {
            for e in 0..16 {
                let exec = &exec;
                s.spawn(move || exec.advance_epoch(e));
            }
        });
        assert_eq!(exec.epoch(), 15);
    }
}
