//! Log consumption: subscriptions polled by consumers and stream tasks run
//! on new submissions.
//!
//! [`Tq`] ties together the log ([`WalReader`]), the plan compiler
//! ([`QueryCompiler`]), the subscription registry and the task registry. All
//! of its methods take `&self` and may be called from several worker threads
//! at once; each worker passes its slot index so that it uses its own
//! compiled executor.

pub mod exec;
pub mod meta;
pub mod poll;
pub mod registry;
pub mod stream;
pub mod submit;
pub mod wal;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::TqConfig;
use crate::error::{ConsistencyError, Result, TesselError};

pub use exec::{QueryCompiler, QueryPlan, ResultBlock, ScanCompiler, StreamExecutor, StreamInput};
pub use meta::{ConsumerRecord, MetaStore, TaskRecord, TqMeta};
pub use poll::{FetchOffset, PollOutcome, PollRequest, PollResponse, RetrieveRsp};
pub use registry::{EPOCH_UNSET, Exec, ExecRegistry, NO_CONSUMER, RebalanceRequest};
pub use stream::{
    AggregationSink, ExecSummary, SinkKind, StreamTask, TaskDescriptor, TaskRegistry, TriggerReport,
};
pub use submit::{SubmitBlock, SubmitMsg};
pub use wal::{MemWal, MsgType, WalEntry, WalReadHandle, WalReader};

/// A submission copied out of the write path, queued for
/// [`Tq::process_stream_trigger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    /// Always [`MsgType::StreamTrigger`].
    pub msg_type: MsgType,
    /// Copy of the submit message body.
    pub body: Vec<u8>,
    /// Log version of the submission.
    pub version: i64,
}

/// The log-consumption layer of one vnode.
pub struct Tq {
    config: TqConfig,
    wal: Arc<dyn WalReader>,
    compiler: Arc<dyn QueryCompiler>,
    execs: ExecRegistry,
    tasks: TaskRegistry,
    meta: Option<MetaStore>,
}

impl std::fmt::Debug for Tq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tq")
            .field("config", &self.config)
            .field("subscriptions", &self.execs.len())
            .field("tasks", &self.tasks.len())
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Tq {
    /// Opens the layer over `wal`. If `meta_path` is given, previously
    /// committed subscriptions and tasks are restored from it: each gets a
    /// fresh read handle and freshly compiled executors.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] for an invalid `config`,
    /// [`crate::error::MetaStoreError`] if the records cannot be loaded, or
    /// any compiler error while restoring.
    pub fn open(
        config: TqConfig,
        wal: Arc<dyn WalReader>,
        compiler: Arc<dyn QueryCompiler>,
        meta_path: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let tq = Self {
            config,
            wal,
            compiler,
            execs: ExecRegistry::new(),
            tasks: TaskRegistry::new(),
            meta: meta_path.map(MetaStore::new),
        };

        if let Some(store) = &tq.meta {
            let saved = store.load()?;
            for rec in saved.consumers {
                tq.execs.insert(Exec::new(
                    &rec.sub_key,
                    rec.plan,
                    rec.consumer_id,
                    rec.epoch,
                    tq.wal.as_ref(),
                    tq.compiler.as_ref(),
                    tq.config.worker_slots,
                )?);
            }
            for rec in saved.tasks {
                let task = StreamTask::new(rec.descriptor, rec.parallelism, tq.compiler.as_ref())?;
                tq.tasks.deploy(task)?;
            }
        }
        info!(
            target: "tessel::tq",
            subscriptions = tq.execs.len(),
            tasks = tq.tasks.len(),
            worker_slots = tq.config.worker_slots,
            "tq opened"
        );
        Ok(tq)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &TqConfig {
        &self.config
    }

    /// Looks up a subscription.
    #[must_use]
    pub fn subscription(&self, sub_key: &str) -> Option<Arc<Exec>> {
        self.execs.get(sub_key)
    }

    /// Looks up a stream task.
    #[must_use]
    pub fn task(&self, task_id: i32) -> Option<Arc<StreamTask>> {
        self.tasks.get(task_id)
    }

    /// Persists every subscription and task. A layer opened without a meta
    /// path has nothing to persist.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::MetaStoreError`] if the records cannot be
    /// written.
    pub fn commit(&self) -> Result<()> {
        let Some(store) = &self.meta else {
            debug!(target: "tessel::tq", "commit without meta store");
            return Ok(());
        };
        let meta = TqMeta {
            consumers: self
                .execs
                .snapshot()
                .iter()
                .map(|e| ConsumerRecord {
                    sub_key: e.sub_key().to_string(),
                    consumer_id: e.consumer_id(),
                    epoch: e.epoch(),
                    plan: e.plan().clone(),
                })
                .collect(),
            tasks: self
                .tasks
                .snapshot()
                .iter()
                .map(|t| TaskRecord {
                    descriptor: t.descriptor().clone(),
                    parallelism: t.parallelism(),
                })
                .collect(),
        };
        store.save(&meta)?;
        info!(
            target: "tessel::tq",
            subscriptions = meta.consumers.len(),
            tasks = meta.tasks.len(),
            "tq committed"
        );
        Ok(())
    }

    /// Creates or reassigns a subscription.
    ///
    /// # Errors
    ///
    /// See [`ExecRegistry::apply_rebalance`].
    pub fn apply_rebalance(&self, req: &RebalanceRequest) -> Result<Arc<Exec>> {
        self.execs.apply_rebalance(
            req,
            self.wal.as_ref(),
            self.compiler.as_ref(),
            self.config.worker_slots,
        )
    }

    /// Answers a poll on worker slot `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::UnknownSubscription`] for an unknown key,
    /// [`ConsistencyError::WorkerOutOfRange`] for a bad slot, or any log,
    /// decode or executor error.
    pub fn process_poll_req(&self, req: &PollRequest, worker: usize) -> Result<PollOutcome> {
        self.check_worker(worker)?;
        let exec = self
            .execs
            .get(&req.sub_key)
            .ok_or_else(|| ConsistencyError::UnknownSubscription {
                sub_key: req.sub_key.clone(),
            })?;
        poll::poll(&exec, self.wal.as_ref(), &self.config, req, worker)
    }

    /// Deploys a stream task from a JSON descriptor with `parallelism`
    /// runners (the configured default if `None`).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CodecError::TaskDescriptor`] for a bad
    /// descriptor, [`ConsistencyError::DuplicateTask`] if the id is taken, or
    /// any compiler error.
    pub fn deploy_task(&self, descriptor: &[u8], parallelism: Option<usize>) -> Result<Arc<StreamTask>> {
        let descriptor = TaskDescriptor::decode(descriptor)?;
        let parallelism = parallelism.unwrap_or(self.config.default_parallelism);
        let task = StreamTask::new(descriptor, parallelism, self.compiler.as_ref())?;
        self.tasks.deploy(task)
    }

    /// Copies a submission from the write path into a trigger request.
    /// Other message types are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TesselError::OutOfMemory`] if the body cannot be copied.
    pub fn push_msg(&self, msg_type: MsgType, body: &[u8], version: i64) -> Result<Option<TriggerRequest>> {
        if msg_type != MsgType::Submit {
            return Ok(None);
        }
        let mut copy = Vec::new();
        copy.try_reserve_exact(body.len())
            .map_err(|_| TesselError::oom("trigger payload", body.len()))?;
        copy.extend_from_slice(body);
        debug!(target: "tessel::tq", offset = version, len = body.len(), "submission queued for stream trigger");
        Ok(Some(TriggerRequest {
            msg_type: MsgType::StreamTrigger,
            body: copy,
            version,
        }))
    }

    /// Runs every deployed task on a queued submission. Individual task
    /// failures are reported, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::WorkerOutOfRange`] or a decode error for
    /// the submission itself.
    pub fn process_stream_trigger(&self, req: &TriggerRequest, worker: usize) -> Result<TriggerReport> {
        self.check_worker(worker)?;
        let msg = SubmitMsg::decode(&req.body)?;
        let report = self.tasks.trigger_all(&StreamInput::Submit(msg), worker);
        debug!(
            target: "tessel::tq",
            offset = req.version,
            executed = report.executed,
            failed = report.failed.len(),
            "stream trigger processed"
        );
        Ok(report)
    }

    /// Runs one task on an explicit input.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::UnknownTask`] if the task is not
    /// deployed, [`ConsistencyError::WorkerOutOfRange`], or the task's own
    /// error.
    pub fn process_task_exec(&self, task_id: i32, input: StreamInput, worker: usize) -> Result<ExecSummary> {
        self.check_worker(worker)?;
        let task = self
            .tasks
            .get(task_id)
            .ok_or(ConsistencyError::UnknownTask { task_id })?;
        task.exec(input, worker)
    }

    /// Removes a subscription.
    pub fn remove_subscription(&self, sub_key: &str) -> Option<Arc<Exec>> {
        let removed = self.execs.remove(sub_key);
        if removed.is_some() {
            info!(target: "tessel::tq", sub_key, "subscription removed");
        }
        removed
    }

    /// Removes a stream task.
    pub fn drop_task(&self, task_id: i32) -> Option<Arc<StreamTask>> {
        let removed = self.tasks.remove(task_id);
        if removed.is_some() {
            info!(target: "tessel::tq", task_id, "stream task dropped");
        }
        removed
    }

    fn check_worker(&self, worker: usize) -> Result<()> {
        if worker >= self.config.worker_slots {
            return Err(ConsistencyError::WorkerOutOfRange {
                worker_id: worker,
                slots: self.config.worker_slots,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cols::tests::{batch, test_schema};
    use crate::config::Compression;

    fn open(wal: &MemWal) -> Tq {
        Tq::open(
            TqConfig::default(),
            Arc::new(wal.clone()),
            Arc::new(ScanCompiler),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_push_msg_filters_types() {
        let tq = open(&MemWal::new());
        assert!(tq.push_msg(MsgType::Other(5), b"x", 0).unwrap().is_none());
        let req = tq.push_msg(MsgType::Submit, b"abc", 7).unwrap().unwrap();
        assert_eq!(req.msg_type, MsgType::StreamTrigger);
        assert_eq!(req.body, b"abc");
        assert_eq!(req.version, 7);
    }

    #[test]
    fn test_poll_unknown_subscription_and_worker() {
        let tq = open(&MemWal::new());
        let req = PollRequest {
            consumer_id: 1,
            epoch: 0,
            sub_key: "missing".to_string(),
            offset: FetchOffset::Earliest,
        };
        assert!(matches!(
            tq.process_poll_req(&req, 0).unwrap_err(),
            TesselError::Consistency(ConsistencyError::UnknownSubscription { .. })
        ));
        assert!(matches!(
            tq.process_poll_req(&req, 99).unwrap_err(),
            TesselError::Consistency(ConsistencyError::WorkerOutOfRange { .. })
        ));
    }

    #[test]
    fn test_stream_trigger_runs_tasks() {
        let tq = open(&MemWal::new());
        tq.deploy_task(br#"{"task_id": 1, "plan": {}, "sink": "aggregation"}"#, None)
            .unwrap();
        let body = SubmitMsg::single(3, batch(&test_schema(), 1..=6))
            .encode(Compression::Snappy)
            .unwrap();
        let req = tq.push_msg(MsgType::Submit, &body, 0).unwrap().unwrap();
        let report = tq.process_stream_trigger(&req, 1).unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(tq.task(1).unwrap().aggregation().unwrap().rows, 6);

        assert!(matches!(
            tq.process_task_exec(8, StreamInput::Blocks(vec![]), 0).unwrap_err(),
            TesselError::Consistency(ConsistencyError::UnknownTask { task_id: 8 })
        ));
        assert!(tq.drop_task(1).is_some());
        assert!(tq.task(1).is_none());
    }
}
