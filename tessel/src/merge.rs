//! Placement of incoming rows into a table's blocks.
//!
//! # Design
//!
//! [`Helper::write_data_block`] takes a sorted batch and writes a prefix of
//! it, returning how many rows it consumed. Callers loop until the batch is
//! exhausted ([`Helper::write_batch`] does this). Each call picks one of:
//!
//! - **append**: the batch starts after every stored key and the table has
//!   no last block. Full batches become a new super-block in the data file,
//!   small ones extend the trailing data block in place when it has room,
//!   otherwise they become a new last block.
//! - **merge with the last block**: the batch starts after every stored key
//!   but the trailing block lives in the last file.
//! - **merge into a covering block**: binary search for the first block
//!   whose `key_last >= key_first`.
//!
//! A merge either appends a sub-block segment in place (cheap, bounded by
//! `max_sub_blocks`) or reads the block back, merge-sorts it with the new
//! rows and writes the result as fresh simple blocks. Rows whose key is
//! already stored are dropped; the stored row wins.

use tracing::debug;

use crate::block;
use crate::cols::DataCols;
use crate::error::{ConsistencyError, Result};
use crate::helper::{Helper, HelperState};
use crate::index::CompBlock;

/// How many incoming rows a block can take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MergePlan {
    /// Leading incoming rows handled, duplicates included.
    pub(crate) consumed: usize,
    /// Of those, rows whose key is not yet stored.
    pub(crate) added: usize,
}

/// Walks the first `candidates` incoming rows against the stored keys (if
/// the batch overlaps the block) and stops before the first new row that
/// would exceed `capacity`.
pub(crate) fn rows_can_merge(
    existing: Option<&DataCols>,
    incoming: &DataCols,
    candidates: usize,
    capacity: usize,
) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut i = 0;
    for row in 0..candidates {
        let key = incoming.key_at(row);
        let dup = existing.is_some_and(|e| {
            while i < e.num_rows() && e.key_at(i) < key {
                i += 1;
            }
            i < e.num_rows() && e.key_at(i) == key
        });
        if !dup {
            if plan.added == capacity {
                break;
            }
            plan.added += 1;
        }
        plan.consumed += 1;
    }
    plan
}

fn next_sub_blocks(blk: &CompBlock) -> u8 {
    if blk.num_sub_blocks == 1 {
        3
    } else {
        blk.num_sub_blocks.saturating_add(1)
    }
}

impl Helper {
    /// Writes a prefix of `cols` into the current table and returns the
    /// number of rows consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if the helper is not a write helper
    /// positioned on a table, or the batch is empty, unsorted, outside the
    /// group's key range or laid out differently from the table schema.
    /// Returns [`crate::error::FileIoError`] or
    /// [`crate::TesselError::OutOfMemory`] if a write fails; in that case no
    /// descriptor is recorded for the failed block.
    pub fn write_data_block(&mut self, cols: &DataCols) -> Result<usize> {
        self.require_write("write_data_block")?;
        self.require(
            HelperState::IDX_LOAD | HelperState::TABLE_SET,
            "write_data_block",
        )?;
        self.check_batch(cols)?;
        self.load_block_info()?;

        let key_first = cols.key_at(0);
        let tail = self.info.blocks.last().map(|b| (b.key_last, b.last));
        let tail_idx = self.info.blocks.len().saturating_sub(1);
        let written = match tail {
            None => self.append_or_extend(cols)?,
            Some((key_last, false)) if key_first > key_last => self.append_or_extend(cols)?,
            Some((key_last, true)) if key_first > key_last => {
                self.merge_into_block(tail_idx, cols)?
            }
            Some(_) => {
                let blk = self
                    .info
                    .blocks
                    .partition_point(|b| b.key_last < key_first)
                    .min(tail_idx);
                self.merge_into_block(blk, cols)?
            }
        };
        self.sync_table_idx();
        Ok(written)
    }

    /// Writes all of `cols` by calling [`Self::write_data_block`] until every
    /// row is consumed.
    ///
    /// # Errors
    ///
    /// Propagates the first error of [`Self::write_data_block`], or returns
    /// [`ConsistencyError::BlockLayout`] if a call makes no progress.
    pub fn write_batch(&mut self, cols: &DataCols) -> Result<usize> {
        let total = cols.num_rows();
        let mut rest = cols.clone();
        while !rest.is_empty() {
            let n = self.write_data_block(&rest)?;
            if n == 0 {
                let tid = self.table.as_ref().map_or(0, |t| t.info.tid);
                return Err(ConsistencyError::BlockLayout {
                    tid,
                    reason: "write made no progress".to_string(),
                }
                .into());
            }
            let mut tail = rest.clone();
            tail.clear();
            tail.copy_rows_from(&rest, n..rest.num_rows())?;
            rest = tail;
        }
        Ok(total)
    }

    fn check_batch(&self, cols: &DataCols) -> Result<()> {
        let table = self.table_ctx("write_data_block")?;
        let (Some(first), Some(last)) = (cols.key_first(), cols.key_last()) else {
            return Err(ConsistencyError::InvalidBatch {
                reason: "batch has no rows".to_string(),
            }
            .into());
        };
        let same_layout = cols.num_cols() == table.schema.columns.len()
            && cols
                .columns()
                .iter()
                .zip(&table.schema.columns)
                .all(|(c, s)| c.spec() == *s);
        if !same_layout {
            return Err(ConsistencyError::InvalidBatch {
                reason: format!(
                    "batch columns do not match schema version {}",
                    table.schema.version
                ),
            }
            .into());
        }
        cols.check_sorted()?;
        if let Some(group) = self.group() {
            let (lo, hi) = group.key_range();
            if first < lo || last > hi {
                return Err(ConsistencyError::InvalidBatch {
                    reason: format!(
                        "keys {first}..={last} outside file group range {lo}..={hi}"
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Appends a new super-block, or extends the trailing data block when
    /// the batch is too small for a block of its own.
    fn append_or_extend(&mut self, cols: &DataCols) -> Result<usize> {
        let rows = cols.num_rows().min(self.config.max_rows_per_file_block as usize);
        if rows < self.config.min_rows_per_file_block as usize
            && self.info.blocks.last().is_some_and(|tail| {
                !tail.last
                    && tail.rows < self.config.max_rows_per_file_block
                    && next_sub_blocks(tail) <= self.config.max_sub_blocks
            })
        {
            return self.merge_data_with_block(self.info.blocks.len() - 1, cols);
        }
        self.append_block(cols, rows)
    }

    /// Writes the first `rows` rows as a new super-block.
    fn append_block(&mut self, cols: &DataCols, rows: usize) -> Result<usize> {
        let to_last = rows < self.config.min_rows_per_file_block as usize;
        let compression = self.config.compression;
        let table = self.table_ctx("append block")?;
        let (tid, uid) = (table.info.tid, table.info.uid);
        let files = self.files_mut("append block")?;

        let (file, in_shadow) = match (to_last, files.shadow_last.as_mut()) {
            (false, _) => (&mut files.data, false),
            (true, Some(shadow)) => (shadow, true),
            (true, None) => (&mut files.last, false),
        };
        let blk = block::write_block_to_file(file, cols, 0..rows, uid, to_last, compression)?;
        debug!(
            target: "tessel::merge",
            tid,
            rows,
            last = to_last,
            offset = blk.offset,
            key_first = blk.key_first,
            key_last = blk.key_last,
            "appended super-block"
        );
        self.info.blocks.push(blk);
        if to_last && let Some(table) = self.table.as_mut() {
            table.last_in_shadow = in_shadow;
        }
        self.stats.blocks_written += 1;
        Ok(rows)
    }

    /// Merges the leading rows of `cols` into block `blk_idx`.
    ///
    /// Rows are bounded by the next block's first key (or the group's
    /// largest key for the final block) and by the block's remaining row
    /// capacity. Returns the number of rows consumed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::FileIoError`] if reading or writing a block
    /// fails, or [`ConsistencyError::BlockLayout`] if no row fits the
    /// block's key bound.
    pub fn merge_data_with_block(&mut self, blk_idx: usize, cols: &DataCols) -> Result<usize> {
        let written = self.merge_into_block(blk_idx, cols)?;
        self.sync_table_idx();
        Ok(written)
    }

    fn merge_into_block(&mut self, blk_idx: usize, cols: &DataCols) -> Result<usize> {
        self.require_write("merge_data_with_block")?;
        self.require(HelperState::INFO_LOAD, "merge_data_with_block")?;
        let tid = self.table_ctx("merge_data_with_block")?.info.tid;
        let Some(blk) = self.info.blocks.get(blk_idx).cloned() else {
            return Err(ConsistencyError::BlockOutOfRange {
                index: blk_idx,
                count: self.info.blocks.len(),
            }
            .into());
        };
        let key_max = self.group().map_or(i64::MAX, |g| g.key_range().1);
        let key_limit = self
            .info
            .blocks
            .get(blk_idx + 1)
            .map_or(key_max, |next| next.key_first - 1);

        let candidates = cols.rows_le(key_limit);
        if candidates == 0 {
            return Err(ConsistencyError::BlockLayout {
                tid,
                reason: format!("no incoming row fits below key {key_limit} for block {blk_idx}"),
            }
            .into());
        }

        let capacity = self
            .config
            .max_rows_per_file_block
            .saturating_sub(blk.rows) as usize;
        let overlaps = cols.key_at(0) <= blk.key_last;
        let existing_keys = if overlaps {
            Some(self.decode_block_at(blk_idx, Some(&[]))?)
        } else {
            None
        };
        let plan = rows_can_merge(existing_keys.as_ref(), cols, candidates, capacity);

        if plan.added == 0 && plan.consumed > 0 {
            debug!(target: "tessel::merge", tid, blk = blk_idx, rows = plan.consumed, "dropped duplicate rows");
            return Ok(plan.consumed);
        }
        if plan.consumed == 0 {
            // block is full: merge everything up to the key bound and split
            return self.rewrite_block(blk_idx, cols, candidates);
        }

        let rows_after = blk.rows as usize + plan.added;
        let in_place = next_sub_blocks(&blk) <= self.config.max_sub_blocks
            && (!blk.last
                || (!self.has_shadow_last()
                    && rows_after < self.config.min_rows_per_file_block as usize));
        if in_place {
            self.append_sub_block(blk_idx, cols, plan, existing_keys.as_ref())
        } else {
            self.rewrite_block(blk_idx, cols, plan.consumed)
        }
    }

    /// Writes the new rows among the first `plan.consumed` as a segment next
    /// to block `blk_idx` and folds it into the block's descriptor.
    fn append_sub_block(
        &mut self,
        blk_idx: usize,
        cols: &DataCols,
        plan: MergePlan,
        existing: Option<&DataCols>,
    ) -> Result<usize> {
        let segment = &mut self.scratch[1];
        segment.clear();
        match existing {
            None => segment.copy_rows_from(cols, 0..plan.consumed)?,
            Some(existing) => {
                let mut run_start = None;
                let mut i = 0;
                for row in 0..plan.consumed {
                    let key = cols.key_at(row);
                    while i < existing.num_rows() && existing.key_at(i) < key {
                        i += 1;
                    }
                    let dup = i < existing.num_rows() && existing.key_at(i) == key;
                    match (dup, run_start) {
                        (false, None) => run_start = Some(row),
                        (true, Some(start)) => {
                            segment.copy_rows_from(cols, start..row)?;
                            run_start = None;
                        }
                        _ => {}
                    }
                }
                if let Some(start) = run_start {
                    segment.copy_rows_from(cols, start..plan.consumed)?;
                }
            }
        }

        let compression = self.config.compression;
        let table = self.table_ctx("append sub-block")?;
        let (tid, uid) = (table.info.tid, table.info.uid);
        let files = self.files.as_mut().ok_or(ConsistencyError::InvalidState {
            operation: "append sub-block",
            state: self.state.bits(),
        })?;
        let is_last = self.info.blocks[blk_idx].last;
        let file = if is_last { &mut files.last } else { &mut files.data };
        let seg = block::write_block_to_file(
            file,
            &self.scratch[1],
            0..self.scratch[1].num_rows(),
            uid,
            is_last,
            compression,
        )?;

        let blk = &mut self.info.blocks[blk_idx];
        if blk.is_super() {
            blk.sub_blocks.push(seg.clone());
            blk.num_sub_blocks += 1;
        } else {
            let original = CompBlock {
                sub_blocks: Vec::new(),
                ..blk.clone()
            };
            blk.sub_blocks = vec![original, seg.clone()];
            blk.num_sub_blocks = 3;
        }
        blk.rows += seg.rows;
        blk.len += seg.len;
        blk.key_first = blk.key_first.min(seg.key_first);
        blk.key_last = blk.key_last.max(seg.key_last);
        blk.num_cols = blk.num_cols.max(seg.num_cols);
        blk.sversion = blk.sversion.max(seg.sversion);

        self.stats.blocks_written += 1;
        self.stats.sub_blocks_appended += 1;
        debug!(
            target: "tessel::merge",
            tid,
            blk = blk_idx,
            added = seg.rows,
            consumed = plan.consumed,
            sub_blocks = blk.num_sub_blocks,
            rows = blk.rows,
            "appended sub-block in place"
        );
        Ok(plan.consumed)
    }

    /// Reads block `blk_idx`, merges it with the first `rows` rows of `cols`
    /// and replaces it with as many evenly sized simple blocks as the row
    /// limit requires.
    fn rewrite_block(&mut self, blk_idx: usize, cols: &DataCols, rows: usize) -> Result<usize> {
        let old = self.info.blocks[blk_idx].clone();
        self.scratch[0] = self.decode_block_at(blk_idx, None)?;

        let max_rows = self.config.max_rows_per_file_block as usize;
        let min_rows = self.config.min_rows_per_file_block as usize;
        let compression = self.config.compression;
        let table = self.table_ctx("rewrite block")?;
        let (tid, uid) = (table.info.tid, table.info.uid);

        let [existing, merged] = &mut self.scratch;
        let counts = merged.merge_sorted(existing, cols, rows)?;
        let total = merged.num_rows();
        let chunks = total.div_ceil(max_rows).max(1);

        let files = self.files.as_mut().ok_or(ConsistencyError::InvalidState {
            operation: "rewrite block",
            state: self.state.bits(),
        })?;
        let mut new_blocks = Vec::with_capacity(chunks);
        let mut last_in_shadow = false;
        let mut start = 0;
        for chunk in 0..chunks {
            let size = total / chunks + usize::from(chunk < total % chunks);
            let to_last = old.last && chunk + 1 == chunks && size < min_rows;
            let (file, in_shadow) = match (to_last, files.shadow_last.as_mut()) {
                (false, _) => (&mut files.data, false),
                (true, Some(shadow)) => (shadow, true),
                (true, None) => (&mut files.last, false),
            };
            new_blocks.push(block::write_block_to_file(
                file,
                merged,
                start..start + size,
                uid,
                to_last,
                compression,
            )?);
            last_in_shadow |= to_last && in_shadow;
            start += size;
        }

        debug!(
            target: "tessel::merge",
            tid,
            blk = blk_idx,
            old_rows = old.rows,
            old_sub_blocks = old.num_sub_blocks,
            added = counts.added,
            duplicates = counts.duplicates,
            new_blocks = chunks,
            "rewrote block"
        );
        self.info.blocks.splice(blk_idx..=blk_idx, new_blocks);
        if old.last
            && let Some(table) = self.table.as_mut()
        {
            table.last_in_shadow = last_in_shadow;
        }
        self.stats.blocks_rewritten += 1;
        self.stats.blocks_written += chunks as u64;
        Ok(rows)
    }

    fn sync_table_idx(&mut self) {
        let Some(table) = self.table.as_mut() else {
            return;
        };
        table.dirty = true;
        table.idx.num_super_blocks = u32::try_from(self.info.blocks.len()).unwrap_or(u32::MAX);
        table.idx.has_last = self.info.blocks.last().is_some_and(|b| b.last);
        if let Some(tail) = self.info.blocks.last() {
            table.idx.max_key = tail.key_last;
        }
    }
}
