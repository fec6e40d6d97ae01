//! Stream tasks: deployed plans that run on every submission.
//!
//! A task is deployed from a JSON [`TaskDescriptor`]. It owns `parallelism`
//! runners (one compiled executor each) and a sink. Triggering runs every
//! task against the same input; a failing task is logged and skipped so the
//! others still run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cols::DataCols;
use crate::error::{CodecError, ConsistencyError, Result};
use crate::tq::exec::{QueryCompiler, QueryPlan, ResultBlock, StreamExecutor, StreamInput};

/// Where a task's output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Output is counted and dropped.
    #[default]
    None,
    /// Output is folded into per-column summaries.
    Aggregation,
}

/// Serialized form of a stream task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task id, unique per registry.
    pub task_id: i32,
    /// Plan to run; `None` forwards input blocks to the sink unchanged.
    #[serde(default)]
    pub plan: Option<QueryPlan>,
    /// Output target.
    #[serde(default)]
    pub sink: SinkKind,
}

impl TaskDescriptor {
    /// Parses a JSON descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TaskDescriptor`] if the bytes are not a valid
    /// descriptor.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| CodecError::TaskDescriptor { source }.into())
    }

    /// Serializes the descriptor as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TaskDescriptor`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| CodecError::TaskDescriptor { source }.into())
    }
}

/// Running summary of one column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColumnSummary {
    /// Non-null values seen.
    pub count: u64,
    /// Sum of non-null values.
    pub sum: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
}

impl Default for ColumnSummary {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

/// Folds produced rows into per-column summaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationSink {
    /// Blocks absorbed.
    pub blocks: u64,
    /// Rows absorbed.
    pub rows: u64,
    /// Smallest and largest key seen.
    pub key_range: Option<(i64, i64)>,
    /// Summaries of the non-key columns, by column id.
    pub columns: BTreeMap<i16, ColumnSummary>,
}

impl AggregationSink {
    fn absorb(&mut self, cols: &DataCols) {
        let (Some(first), Some(last)) = (cols.key_first(), cols.key_last()) else {
            return;
        };
        self.blocks += 1;
        self.rows += cols.num_rows() as u64;
        self.key_range = Some(match self.key_range {
            None => (first, last),
            Some((lo, hi)) => (lo.min(first), hi.max(last)),
        });
        for (pos, col) in cols.columns().iter().enumerate().skip(1) {
            let summary = self.columns.entry(col.spec().id).or_default();
            for row in 0..cols.num_rows() {
                if let Some(v) = cols.value_at(pos, row).as_f64() {
                    summary.count += 1;
                    summary.sum += v;
                    summary.min = summary.min.min(v);
                    summary.max = summary.max.max(v);
                }
            }
        }
    }
}

/// A task's output target.
#[derive(Debug)]
pub enum TaskSink {
    /// Discards output.
    None,
    /// Aggregates output.
    Aggregation(AggregationSink),
}

impl TaskSink {
    fn new(kind: SinkKind) -> Self {
        match kind {
            SinkKind::None => Self::None,
            SinkKind::Aggregation => Self::Aggregation(AggregationSink::default()),
        }
    }

    fn absorb(&mut self, cols: &DataCols) {
        match self {
            Self::None => {}
            Self::Aggregation(agg) => agg.absorb(cols),
        }
    }
}

/// Rows and blocks one execution produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    /// Blocks produced.
    pub blocks: usize,
    /// Rows produced.
    pub rows: usize,
}

/// A deployed stream task.
pub struct StreamTask {
    descriptor: TaskDescriptor,
    parallelism: usize,
    runners: Vec<Mutex<Box<dyn StreamExecutor>>>,
    sink: Mutex<TaskSink>,
}

impl std::fmt::Debug for StreamTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTask")
            .field("descriptor", &self.descriptor)
            .field("parallelism", &self.parallelism)
            .field("runners", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl StreamTask {
    /// Compiles `parallelism` runners for `descriptor`. A descriptor
    /// without a plan gets no runners but keeps the requested parallelism.
    ///
    /// # Errors
    ///
    /// Returns any error from `compiler`.
    pub fn new(
        descriptor: TaskDescriptor,
        parallelism: usize,
        compiler: &dyn QueryCompiler,
    ) -> Result<Self> {
        let parallelism = parallelism.max(1);
        let runners = match &descriptor.plan {
            None => Vec::new(),
            Some(plan) => (0..parallelism)
                .map(|_| compiler.compile(plan).map(Mutex::new))
                .collect::<Result<Vec<_>>>()?,
        };
        let sink = Mutex::new(TaskSink::new(descriptor.sink));
        Ok(Self {
            descriptor,
            parallelism,
            runners,
            sink,
        })
    }

    /// Task id.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.descriptor.task_id
    }

    /// The descriptor the task was deployed from.
    #[must_use]
    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// Parallelism the task was deployed with.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Number of compiled runners; zero for a task without a plan.
    #[must_use]
    pub fn runners(&self) -> usize {
        self.runners.len()
    }

    /// Snapshot of the aggregation sink, if the task has one.
    #[must_use]
    pub fn aggregation(&self) -> Option<AggregationSink> {
        match &*self.sink.lock() {
            TaskSink::Aggregation(agg) => Some(agg.clone()),
            TaskSink::None => None,
        }
    }

    /// Runs the task on `input` using the runner for `worker` (slots wrap
    /// around the task's parallelism) and feeds the output to the sink.
    ///
    /// # Errors
    ///
    /// Returns any executor error; blocks produced before the error have
    /// already reached the sink.
    pub fn exec(&self, input: StreamInput, worker: usize) -> Result<ExecSummary> {
        let mut summary = ExecSummary::default();
        let mut emit = |blk: &ResultBlock| {
            summary.blocks += 1;
            summary.rows += blk.cols.num_rows();
            self.sink.lock().absorb(&blk.cols);
        };

        if self.runners.is_empty() {
            let blocks = match input {
                StreamInput::Submit(msg) => msg.blocks,
                StreamInput::Blocks(blocks) => blocks,
            };
            for blk in blocks.into_iter().filter(|b| !b.rows.is_empty()) {
                let ts = blk.rows.key_at(blk.rows.num_rows() - 1);
                emit(&ResultBlock {
                    uid: blk.uid,
                    cols: blk.rows,
                    ts,
                });
            }
        } else {
            let mut runner = self.runners[worker % self.runners.len()].lock();
            runner.set_input(input)?;
            while let Some(blk) = runner.next_block()? {
                emit(&blk);
            }
        }

        debug!(
            target: "tessel::tq",
            task_id = self.id(),
            worker,
            blocks = summary.blocks,
            rows = summary.rows,
            "stream task executed"
        );
        Ok(summary)
    }
}

/// Outcome of running every task on one input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Tasks that ran to completion.
    pub executed: usize,
    /// Tasks that failed, with the error text.
    pub failed: Vec<(i32, String)>,
}

/// Concurrent map of task id to [`StreamTask`].
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<i32, Arc<StreamTask>>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compiled task.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::DuplicateTask`] if the id is taken.
    pub fn deploy(&self, task: StreamTask) -> Result<Arc<StreamTask>> {
        let mut tasks = self.tasks.write();
        let task_id = task.id();
        if tasks.contains_key(&task_id) {
            return Err(ConsistencyError::DuplicateTask { task_id }.into());
        }
        let task = Arc::new(task);
        tasks.insert(task_id, Arc::clone(&task));
        info!(
            target: "tessel::tq",
            task_id,
            parallelism = task.parallelism(),
            sink = ?task.descriptor.sink,
            "stream task deployed"
        );
        Ok(task)
    }

    /// Looks up a task.
    #[must_use]
    pub fn get(&self, task_id: i32) -> Option<Arc<StreamTask>> {
        self.tasks.read().get(&task_id).cloned()
    }

    /// Removes a task.
    pub fn remove(&self, task_id: i32) -> Option<Arc<StreamTask>> {
        self.tasks.write().remove(&task_id)
    }

    /// Every task, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<StreamTask>> {
        let mut all: Vec<_> = self.tasks.read().values().cloned().collect();
        all.sort_by_key(|t| t.id());
        all
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// True if no task is deployed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every task on `input`. Failures are logged and reported but do
    /// not stop the remaining tasks.
    pub fn trigger_all(&self, input: &StreamInput, worker: usize) -> TriggerReport {
        let mut report = TriggerReport::default();
        for task in self.snapshot() {
            match task.exec(input.clone(), worker) {
                Ok(_) => report.executed += 1,
                Err(e) => {
                    warn!(target: "tessel::tq", task_id = task.id(), worker, error = %e, "stream task failed");
                    report.failed.push((task.id(), e.to_string()));
                }
            }
        }
        report
    }
}
