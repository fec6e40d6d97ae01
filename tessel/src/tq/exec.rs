//! Stream execution seam.
//!
//! A subscription or stream task compiles its [`QueryPlan`] once per worker
//! slot through a [`QueryCompiler`]. The resulting [`StreamExecutor`] is fed
//! one input at a time and drained with [`StreamExecutor::next_block`] until
//! it returns `None`.
//!
//! [`ScanCompiler`] is the built-in compiler: a table filter, a column
//! projection and a key-range filter over submitted rows.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::cols::DataCols;
use crate::error::Result;
use crate::tq::submit::{SubmitBlock, SubmitMsg};

/// What a subscription or task selects from submitted data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Table uids to read; empty means every table.
    #[serde(default)]
    pub tables: Vec<u64>,
    /// Column ids to project; empty means every column. The key column is
    /// always kept.
    #[serde(default)]
    pub columns: Vec<i16>,
    /// Inclusive key range; `None` keeps every row.
    #[serde(default)]
    pub key_range: Option<(i64, i64)>,
}

impl QueryPlan {
    fn projection(&self) -> Option<&[i16]> {
        (!self.columns.is_empty()).then_some(self.columns.as_slice())
    }
}

/// Input handed to an executor.
#[derive(Debug, Clone)]
pub enum StreamInput {
    /// A data submission read from the log.
    Submit(SubmitMsg),
    /// Already materialised blocks, as sent by an upstream task.
    Blocks(Vec<SubmitBlock>),
}

impl StreamInput {
    fn into_blocks(self) -> Vec<SubmitBlock> {
        match self {
            Self::Submit(msg) => msg.blocks,
            Self::Blocks(blocks) => blocks,
        }
    }
}

/// One block of executor output.
#[derive(Debug, Clone)]
pub struct ResultBlock {
    /// Table the rows came from.
    pub uid: u64,
    /// Produced rows.
    pub cols: DataCols,
    /// Progress timestamp: the largest key in the block.
    pub ts: i64,
}

/// A compiled, stateful executor bound to one worker slot.
pub trait StreamExecutor: Send {
    /// Replaces the pending input.
    ///
    /// # Errors
    ///
    /// Implementations may reject input they cannot process.
    fn set_input(&mut self, input: StreamInput) -> Result<()>;

    /// Produces the next non-empty block, or `None` once the input is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Implementations return an error if execution fails.
    fn next_block(&mut self) -> Result<Option<ResultBlock>>;
}

/// Compiles plans into executors.
pub trait QueryCompiler: Send + Sync {
    /// Builds a fresh executor for `plan`.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the plan cannot be executed.
    fn compile(&self, plan: &QueryPlan) -> Result<Box<dyn StreamExecutor>>;
}

/// Input-scan handle: hands out the submitted blocks of the tables a plan
/// reads, in submission order.
#[derive(Debug, Default)]
pub struct SubmitScanner {
    tables: Vec<u64>,
    pending: VecDeque<SubmitBlock>,
}

impl SubmitScanner {
    /// Scanner restricted to `tables` (every table if empty).
    #[must_use]
    pub fn new(tables: Vec<u64>) -> Self {
        Self {
            tables,
            pending: VecDeque::new(),
        }
    }

    /// Replaces the pending blocks.
    pub fn set_input(&mut self, blocks: Vec<SubmitBlock>) {
        self.pending.clear();
        self.pending.extend(
            blocks
                .into_iter()
                .filter(|b| self.tables.is_empty() || self.tables.contains(&b.uid)),
        );
    }

    /// Next block of a selected table.
    pub fn next_block(&mut self) -> Option<SubmitBlock> {
        self.pending.pop_front()
    }
}

/// Built-in compiler producing [`ScanExecutor`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanCompiler;

impl QueryCompiler for ScanCompiler {
    fn compile(&self, plan: &QueryPlan) -> Result<Box<dyn StreamExecutor>> {
        Ok(Box::new(ScanExecutor {
            scanner: SubmitScanner::new(plan.tables.clone()),
            plan: plan.clone(),
        }))
    }
}

/// Projection and key-range filter over a [`SubmitScanner`].
#[derive(Debug)]
pub struct ScanExecutor {
    plan: QueryPlan,
    scanner: SubmitScanner,
}

impl StreamExecutor for ScanExecutor {
    fn set_input(&mut self, input: StreamInput) -> Result<()> {
        self.scanner.set_input(input.into_blocks());
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<ResultBlock>> {
        while let Some(blk) = self.scanner.next_block() {
            let rows = &blk.rows;
            let (start, end) = match self.plan.key_range {
                None => (0, rows.num_rows()),
                Some((lo, hi)) => {
                    let start = if lo == i64::MIN { 0 } else { rows.rows_le(lo - 1) };
                    (start, rows.rows_le(hi).max(start))
                }
            };
            if start == end {
                continue;
            }
            let cols = rows.project(self.plan.projection(), start..end)?;
            let ts = cols.key_at(cols.num_rows() - 1);
            return Ok(Some(ResultBlock {
                uid: blk.uid,
                cols,
                ts,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cols::tests::{batch, test_schema};

    fn drain(exec: &mut dyn StreamExecutor) -> Vec<ResultBlock> {
        let mut out = Vec::new();
        while let Some(b) = exec.next_block().unwrap() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_scan_filters_tables_and_keys() {
        let schema = test_schema();
        let plan = QueryPlan {
            tables: vec![1],
            columns: vec![2],
            key_range: Some((3, 6)),
        };
        let mut exec = ScanCompiler.compile(&plan).unwrap();
        let msg = SubmitMsg {
            blocks: vec![
                SubmitBlock { uid: 1, rows: batch(&schema, 1..=10) },
                SubmitBlock { uid: 2, rows: batch(&schema, 1..=10) },
                SubmitBlock { uid: 1, rows: batch(&schema, [20, 30]) },
            ],
        };
        exec.set_input(StreamInput::Submit(msg)).unwrap();

        let out = drain(exec.as_mut());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].uid, 1);
        assert_eq!(out[0].cols.num_rows(), 4);
        assert_eq!(out[0].cols.num_cols(), 2);
        assert_eq!(out[0].ts, 6);
    }

    #[test]
    fn test_default_plan_passes_everything() {
        let schema = test_schema();
        let mut exec = ScanCompiler.compile(&QueryPlan::default()).unwrap();
        exec.set_input(StreamInput::Blocks(vec![
            SubmitBlock { uid: 5, rows: batch(&schema, [1, 2]) },
            SubmitBlock { uid: 6, rows: batch(&schema, [3]) },
        ]))
        .unwrap();
        let out = drain(exec.as_mut());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].cols.num_cols(), 3);

        // drained executors stay empty until new input arrives
        assert!(exec.next_block().unwrap().is_none());
    }
}
