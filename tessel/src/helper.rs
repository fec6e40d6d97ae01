//! Read/write helper over one file group.
//!
//! The helper is a small state machine. Each stage sets a bit in
//! [`HelperState`] and later stages check the bits they depend on:
//!
//! ```text
//! init ─► set_and_open_file ─► (load_index) ─► set_table ─► load_block_info ─► load_block_data…
//!              FILE_SET_AND_OPEN    IDX_LOAD       TABLE_SET     INFO_LOAD
//! ```
//!
//! `set_table` clears the table-scoped bits and keeps the file-scoped ones,
//! so the index is read once per file session and block info once per
//! table session.
//!
//! A write helper never modifies the head file in place. It copies the
//! header and index region into a shadow head (`v{fid}.h`), appends new
//! block-info blobs there, and [`Helper::commit`] renames it over the head
//! file. When the last file has grown past its threshold a shadow last file
//! of the next generation is opened as well and live last blocks are moved
//! into it. Closing with an error, or dropping an uncommitted session,
//! removes both shadows.
//!
//! A helper is owned by one writer thread; it has no internal locking.

use std::borrow::Cow;
use std::path::PathBuf;

use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::block::{self, CompData};
use crate::cols::{DataCols, Schema};
use crate::config::{HelperConfig, HelperKind};
use crate::error::{ConsistencyError, FileIoError, Result, TesselError, len_u32};
use crate::group::{self, BlockFileKind, FileGroup, OpenMode, TsFile};
use crate::index::{self, CompBlock, CompIdx, CompInfo, FileHeader, COMP_IDX_SIZE, HEAD_SIZE};

/// Composable helper state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HelperState(u8);

impl HelperState {
    /// Nothing open.
    pub const CLEAR: u8 = 0;
    /// A file group is open.
    pub const FILE_SET_AND_OPEN: u8 = 0b0001;
    /// The index array is loaded.
    pub const IDX_LOAD: u8 = 0b0010;
    /// A table is set.
    pub const TABLE_SET: u8 = 0b0100;
    /// The table's block info is loaded.
    pub const INFO_LOAD: u8 = 0b1000;

    /// True if every bit of `flags` is set.
    #[must_use]
    pub fn has(self, flags: u8) -> bool {
        self.0 & flags == flags
    }

    /// Raw bits.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    fn set(&mut self, flags: u8) {
        self.0 |= flags;
    }
}

/// The table a helper is positioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    /// Slot in the file group's index.
    pub tid: u32,
    /// Unique table id, recorded in the index and block info.
    pub uid: u64,
}

/// I/O counters of a helper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelperStats {
    /// Times the index region was read from disk.
    pub index_loads: u64,
    /// Times a block-info blob was read from disk.
    pub info_loads: u64,
    /// Simple blocks written (new blocks, segments and rewrites).
    pub blocks_written: u64,
    /// Blocks replaced by a read-merge-rewrite.
    pub blocks_rewritten: u64,
    /// Segments appended in place.
    pub sub_blocks_appended: u64,
}

/// Where a block's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockSource {
    Data,
    Last,
    ShadowLast,
}

pub(crate) struct TableCtx {
    pub(crate) info: TableInfo,
    pub(crate) schema: Schema,
    pub(crate) idx: CompIdx,
    /// The table's last block, if any, already lives in the shadow last file.
    pub(crate) last_in_shadow: bool,
    /// Blocks were written since the last `write_block_info`.
    pub(crate) dirty: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ShadowEntry {
    pub(crate) idx: CompIdx,
    pub(crate) last_in_shadow: bool,
}

pub(crate) struct OpenFiles {
    pub(crate) group: FileGroup,
    pub(crate) header: FileHeader,
    pub(crate) head: TsFile,
    pub(crate) data: TsFile,
    pub(crate) last: TsFile,
    data_map: Option<Mmap>,
    last_map: Option<Mmap>,
    pub(crate) shadow_head: Option<TsFile>,
    pub(crate) shadow_last: Option<TsFile>,
}

impl OpenFiles {
    fn shadow_paths(&self) -> Vec<PathBuf> {
        [&self.shadow_head, &self.shadow_last]
            .into_iter()
            .flatten()
            .map(|f| f.path().to_path_buf())
            .collect()
    }

    /// Raw bytes of one simple block.
    pub(crate) fn read_segment(&mut self, src: BlockSource, seg: &CompBlock) -> Result<Cow<'_, [u8]>> {
        let len = seg.len as usize;
        let mapped = match src {
            BlockSource::Data => self.data_map.is_some(),
            BlockSource::Last => self.last_map.is_some(),
            BlockSource::ShadowLast => false,
        };
        if mapped {
            let (map, file) = match src {
                BlockSource::Data => (self.data_map.as_ref(), &self.data),
                _ => (self.last_map.as_ref(), &self.last),
            };
            let map: &[u8] = map.map_or(&[], |m| &m[..]);
            let start = usize::try_from(seg.offset).unwrap_or(usize::MAX);
            return match start.checked_add(len).and_then(|end| map.get(start..end)) {
                Some(bytes) => Ok(Cow::Borrowed(bytes)),
                None => Err(FileIoError::Corrupted {
                    path: file.path_str(),
                    reason: format!(
                        "block at {}+{len} beyond end of file ({} bytes)",
                        seg.offset,
                        map.len()
                    ),
                }
                .into()),
            };
        }
        let file = match src {
            BlockSource::Data => &mut self.data,
            BlockSource::Last => &mut self.last,
            BlockSource::ShadowLast => self.shadow_last.as_mut().ok_or(
                ConsistencyError::InvalidState {
                    operation: "read from shadow last file",
                    state: 0,
                },
            )?,
        };
        Ok(Cow::Owned(file.read_at(seg.offset, len)?))
    }

    /// Decodes every segment of `blk` and merges them into one batch.
    pub(crate) fn decode_block(
        &mut self,
        src: BlockSource,
        blk: &CompBlock,
        schema: &Schema,
        wanted: Option<&[i16]>,
    ) -> Result<DataCols> {
        let mut acc: Option<DataCols> = None;
        for seg in blk.segments() {
            let path = match src {
                BlockSource::Data => self.data.path_str(),
                BlockSource::Last => self.last.path_str(),
                BlockSource::ShadowLast => self
                    .shadow_last
                    .as_ref()
                    .map(TsFile::path_str)
                    .unwrap_or_default(),
            };
            let bytes = self.read_segment(src, seg)?;
            let cols =
                block::decode_block(&bytes, &path, seg.algorithm, &schema.columns, seg.sversion, wanted)?;
            acc = Some(match acc {
                None => cols,
                Some(prev) => {
                    let mut merged = DataCols::from_columns(blk.sversion, Vec::new(), 0);
                    merged.merge_sorted(&prev, &cols, cols.num_rows())?;
                    merged
                }
            });
        }
        let cols = acc.unwrap_or_else(|| DataCols::from_columns(blk.sversion, Vec::new(), 0));
        if cols.num_rows() != blk.rows as usize {
            return Err(FileIoError::Corrupted {
                path: self.data.path_str(),
                reason: format!(
                    "block decoded to {} rows, descriptor says {}",
                    cols.num_rows(),
                    blk.rows
                ),
            }
            .into());
        }
        Ok(cols)
    }

    /// Copies every segment of a last block into the shadow last file and
    /// repoints the descriptor.
    pub(crate) fn move_last_segments(&mut self, blk: &mut CompBlock) -> Result<()> {
        let segments: Vec<CompBlock> = blk.segments().to_vec();
        let mut moved = Vec::with_capacity(segments.len());
        for seg in &segments {
            let bytes = self.last.read_at(seg.offset, seg.len as usize)?;
            let shadow = self.shadow_last.as_mut().ok_or(ConsistencyError::InvalidState {
                operation: "move last block",
                state: 0,
            })?;
            moved.push(shadow.append(&bytes)?);
        }
        if blk.is_super() {
            for (seg, offset) in blk.sub_blocks.iter_mut().zip(&moved) {
                seg.offset = *offset;
            }
        }
        if let Some(first) = moved.first() {
            blk.offset = *first;
        }
        Ok(())
    }
}

/// Read/write helper over one file group at a time.
pub struct Helper {
    pub(crate) config: HelperConfig,
    pub(crate) state: HelperState,
    pub(crate) files: Option<OpenFiles>,
    pub(crate) idx: Vec<CompIdx>,
    pub(crate) shadow_idx: Vec<Option<ShadowEntry>>,
    pub(crate) table: Option<TableCtx>,
    pub(crate) info: CompInfo,
    pub(crate) scratch: [DataCols; 2],
    pub(crate) stats: HelperStats,
}

impl std::fmt::Debug for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Helper")
            .field("kind", &self.config.kind)
            .field("state", &self.state)
            .field("fid", &self.files.as_ref().map(|fs| fs.group.fid()))
            .field("tid", &self.table.as_ref().map(|t| t.info.tid))
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Helper {
    /// Validates `config` and allocates the index buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] if the configuration is
    /// invalid, or [`TesselError::OutOfMemory`] if the index buffer cannot
    /// be reserved.
    pub fn init(config: HelperConfig) -> Result<Self> {
        config.validate()?;
        let n = config.max_tables as usize;
        let mut idx = Vec::new();
        idx.try_reserve_exact(n)
            .map_err(|_| TesselError::oom("index array", n * COMP_IDX_SIZE))?;
        let mut shadow_idx = Vec::new();
        if config.kind == HelperKind::Write {
            shadow_idx
                .try_reserve_exact(n)
                .map_err(|_| TesselError::oom("shadow index", n))?;
        }
        debug!(target: "tessel::helper", kind = ?config.kind, max_tables = config.max_tables, "helper initialised");
        Ok(Self {
            config,
            state: HelperState::default(),
            files: None,
            idx,
            shadow_idx,
            table: None,
            info: CompInfo::default(),
            scratch: [
                DataCols::from_columns(0, Vec::new(), 0),
                DataCols::from_columns(0, Vec::new(), 0),
            ],
            stats: HelperStats::default(),
        })
    }

    /// Helper configuration.
    #[must_use]
    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Current state bits.
    #[must_use]
    pub fn state(&self) -> HelperState {
        self.state
    }

    /// I/O counters.
    #[must_use]
    pub fn stats(&self) -> HelperStats {
        self.stats
    }

    /// The open file group, if any.
    #[must_use]
    pub fn group(&self) -> Option<&FileGroup> {
        self.files.as_ref().map(|f| &f.group)
    }

    /// Working copy of the current table's index entry.
    #[must_use]
    pub fn table_idx(&self) -> Option<&CompIdx> {
        self.table.as_ref().map(|t| &t.idx)
    }

    /// The loaded block info of the current table (empty until loaded).
    #[must_use]
    pub fn block_info(&self) -> &CompInfo {
        &self.info
    }

    /// True if a shadow last file is open in this session.
    #[must_use]
    pub fn has_shadow_last(&self) -> bool {
        self.files.as_ref().is_some_and(|f| f.shadow_last.is_some())
    }

    pub(crate) fn require(&self, flags: u8, operation: &'static str) -> Result<()> {
        if self.state.has(flags) {
            Ok(())
        } else {
            Err(ConsistencyError::InvalidState {
                operation,
                state: self.state.bits(),
            }
            .into())
        }
    }

    pub(crate) fn require_write(&self, operation: &'static str) -> Result<()> {
        if self.config.kind == HelperKind::Write {
            Ok(())
        } else {
            Err(ConsistencyError::ReadOnlyHelper { operation }.into())
        }
    }

    pub(crate) fn files_mut(&mut self, operation: &'static str) -> Result<&mut OpenFiles> {
        let state = self.state.bits();
        self.files
            .as_mut()
            .ok_or_else(|| ConsistencyError::InvalidState { operation, state }.into())
    }

    pub(crate) fn table_ctx(&self, operation: &'static str) -> Result<&TableCtx> {
        self.table.as_ref().ok_or_else(|| {
            ConsistencyError::InvalidState {
                operation,
                state: self.state.bits(),
            }
            .into()
        })
    }

    /// Where the bytes of `blk` of the current table live.
    pub(crate) fn source_of(&self, blk: &CompBlock) -> BlockSource {
        if !blk.last {
            BlockSource::Data
        } else if self.has_shadow_last() && self.table.as_ref().is_some_and(|t| t.last_in_shadow) {
            BlockSource::ShadowLast
        } else {
            BlockSource::Last
        }
    }

    /// Opens `group`, discarding any previous session, and loads its index.
    ///
    /// A read helper opens the head read-only and memory-maps the data and
    /// last files. A write helper opens them read-write, creates the shadow
    /// head from the head's header and index region and, if the last file
    /// is over its threshold, a shadow last file of the next generation.
    /// If any step fails everything opened so far is closed and the shadow
    /// files are removed.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] on any open, read, copy or validation
    /// failure.
    pub fn set_and_open_file(&mut self, group: &FileGroup) -> Result<()> {
        self.close(false);

        let files = open_files(&self.config, group)?;
        info!(
            target: "tessel::helper",
            fid = group.fid(),
            kind = ?self.config.kind,
            last_gen = files.header.last_gen,
            new_last = files.shadow_last.is_some(),
            "file group opened"
        );
        self.files = Some(files);
        self.state.set(HelperState::FILE_SET_AND_OPEN);
        if self.config.kind == HelperKind::Write {
            self.shadow_idx.clear();
            self.shadow_idx.resize(self.config.max_tables as usize, None);
        }

        if let Err(e) = self.load_index() {
            self.close(true);
            return Err(e);
        }
        Ok(())
    }

    /// Loads the index array once per file session and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] on a short read or checksum mismatch, or
    /// [`ConsistencyError::InvalidState`] if no file group is open.
    pub fn load_index(&mut self) -> Result<&[CompIdx]> {
        self.require(HelperState::FILE_SET_AND_OPEN, "load_index")?;
        if !self.state.has(HelperState::IDX_LOAD) {
            let max_tables = self.config.max_tables;
            let files = self.files_mut("load_index")?;
            let region = files
                .head
                .read_at(HEAD_SIZE as u64, COMP_IDX_SIZE * max_tables as usize)?;
            let checksum = files.header.idx_checksum;
            let path = files.head.path_str();
            index::decode_idx_region(&region, checksum, &path, &mut self.idx)?;
            self.stats.index_loads += 1;
            self.state.set(HelperState::IDX_LOAD);
            debug!(target: "tessel::helper", tables = max_tables, "index loaded");
        }
        Ok(&self.idx)
    }

    /// Positions the helper on a table.
    ///
    /// Writes the block info of the previous table if it has unwritten
    /// blocks, then clears the table-scoped state, re-targets both scratch
    /// batches at `schema` and takes a working copy of the table's index
    /// entry (the shadow entry if the table was already written this
    /// session).
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if no file group is open, `tid` is out
    /// of range, or the slot holds blocks of a different table; a
    /// [`crate::error::ConfigError`] if `schema` is invalid; or any error
    /// from writing the previous table's block info.
    pub fn set_table(&mut self, table: TableInfo, schema: &Schema) -> Result<()> {
        self.require(
            HelperState::FILE_SET_AND_OPEN | HelperState::IDX_LOAD,
            "set_table",
        )?;
        schema.validate()?;
        let tid = table.tid as usize;
        if table.tid >= self.config.max_tables {
            return Err(ConsistencyError::TableOutOfRange {
                tid: table.tid,
                max_tables: self.config.max_tables,
            }
            .into());
        }

        self.flush_table("set_table")?;
        self.state = HelperState(self.state.bits() & (HelperState::TABLE_SET - 1));
        self.table = None;
        self.info.blocks.clear();
        for scratch in &mut self.scratch {
            scratch.reset(schema);
        }

        let shadow = self.shadow_idx.get(tid).copied().flatten();
        let mut idx = shadow.map_or(self.idx[tid], |s| s.idx);
        if idx.has_blocks() && idx.uid != table.uid {
            return Err(ConsistencyError::BlockLayout {
                tid: table.tid,
                reason: format!("slot holds table uid {}, expected {}", idx.uid, table.uid),
            }
            .into());
        }
        idx.uid = table.uid;
        self.table = Some(TableCtx {
            info: table,
            schema: schema.clone(),
            idx,
            last_in_shadow: shadow.is_some_and(|s| s.last_in_shadow),
            dirty: false,
        });
        self.state.set(HelperState::TABLE_SET);
        debug!(target: "tessel::helper", tid = table.tid, uid = table.uid, blocks = idx.num_super_blocks, "table set");
        Ok(())
    }

    /// Loads the current table's block array once per table session.
    ///
    /// A table without blocks gets an empty array without any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] on a short read or a blob that fails
    /// validation, or [`ConsistencyError`] if no table is set or the blob
    /// disagrees with the index entry.
    pub fn load_block_info(&mut self) -> Result<&CompInfo> {
        self.require(HelperState::TABLE_SET, "load_block_info")?;
        if !self.state.has(HelperState::INFO_LOAD) {
            let table = self.table_ctx("load_block_info")?;
            let (tid, uid, idx) = (table.info.tid, table.info.uid, table.idx);
            let in_shadow = self
                .shadow_idx
                .get(tid as usize)
                .is_some_and(Option::is_some);

            let mut info = if idx.has_blocks() {
                let files = self.files_mut("load_block_info")?;
                let file = match (in_shadow, files.shadow_head.as_mut()) {
                    (true, Some(shadow)) => shadow,
                    _ => &mut files.head,
                };
                let blob = file.read_at(idx.offset, idx.len as usize)?;
                let info = CompInfo::decode(&blob, &idx, &file.path_str())?;
                if info.blocks.len() != idx.num_super_blocks as usize {
                    return Err(ConsistencyError::BlockLayout {
                        tid,
                        reason: format!(
                            "index records {} super-blocks, block info has {}",
                            idx.num_super_blocks,
                            info.blocks.len()
                        ),
                    }
                    .into());
                }
                self.stats.info_loads += 1;
                info
            } else {
                CompInfo::default()
            };
            info.tid = tid;
            info.uid = uid;
            self.info = info;
            self.state.set(HelperState::INFO_LOAD);
            debug!(target: "tessel::helper", tid, blocks = self.info.blocks.len(), "block info loaded");
        }
        Ok(&self.info)
    }

    fn block(&self, blk: usize) -> Result<&CompBlock> {
        self.require(HelperState::INFO_LOAD, "load block")?;
        self.info.blocks.get(blk).ok_or_else(|| {
            ConsistencyError::BlockOutOfRange {
                index: blk,
                count: self.info.blocks.len(),
            }
            .into()
        })
    }

    /// Column directories of block `blk`, one per segment.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if the block does not exist, or
    /// [`FileIoError`] if its bytes cannot be read or validated.
    pub fn load_comp_data(&mut self, blk: usize) -> Result<Vec<CompData>> {
        let block = self.block(blk)?.clone();
        let src = self.source_of(&block);
        let files = self.files_mut("load_comp_data")?;
        let path = match src {
            BlockSource::Data => files.data.path_str(),
            BlockSource::Last => files.last.path_str(),
            BlockSource::ShadowLast => files
                .shadow_last
                .as_ref()
                .map(TsFile::path_str)
                .unwrap_or_default(),
        };
        let mut out = Vec::with_capacity(block.segments().len());
        for seg in block.segments() {
            let bytes = files.read_segment(src, seg)?;
            out.push(CompData::decode(&bytes, &path)?);
        }
        Ok(out)
    }

    /// Decodes all columns of block `blk` into the first scratch batch.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if the block does not exist, or
    /// [`FileIoError`] / [`crate::error::CodecError`] if decoding fails.
    pub fn load_block_data(&mut self, blk: usize) -> Result<&DataCols> {
        self.scratch[0] = self.decode_block_at(blk, None)?;
        Ok(&self.scratch[0])
    }

    /// Decodes only `col_ids` (and the key) of block `blk`; other columns
    /// come back all-null.
    ///
    /// # Errors
    ///
    /// Same as [`Self::load_block_data`].
    pub fn load_block_data_cols(&mut self, blk: usize, col_ids: &[i16]) -> Result<DataCols> {
        self.decode_block_at(blk, Some(col_ids))
    }

    pub(crate) fn decode_block_at(&mut self, blk: usize, wanted: Option<&[i16]>) -> Result<DataCols> {
        let block = self.block(blk)?.clone();
        let src = self.source_of(&block);
        let Some(table) = self.table.as_ref() else {
            return Err(ConsistencyError::InvalidState {
                operation: "load block data",
                state: self.state.bits(),
            }
            .into());
        };
        let Some(files) = self.files.as_mut() else {
            return Err(ConsistencyError::InvalidState {
                operation: "load block data",
                state: self.state.bits(),
            }
            .into());
        };
        files.decode_block(src, &block, &table.schema, wanted)
    }

    /// Moves the current table's last block into the shadow last file, if
    /// one is open and the block is not there yet.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the copy fails.
    pub fn move_last_block_if_necessary(&mut self) -> Result<()> {
        self.require_write("move_last_block_if_necessary")?;
        self.require(HelperState::INFO_LOAD, "move_last_block_if_necessary")?;
        let Some(table) = self.table.as_ref() else {
            return Ok(());
        };
        if !self.has_shadow_last() || !table.idx.has_last || table.last_in_shadow {
            return Ok(());
        }
        let tid = table.info.tid;
        let Some(mut blk) = self.info.blocks.last().cloned() else {
            return Ok(());
        };
        let files = self.files_mut("move_last_block_if_necessary")?;
        files.move_last_segments(&mut blk)?;
        debug!(target: "tessel::helper", tid, offset = blk.offset, segments = blk.segments().len(), "moved last block to new last file");
        if let Some(slot) = self.info.blocks.last_mut() {
            *slot = blk;
        }
        if let Some(table) = self.table.as_mut() {
            table.last_in_shadow = true;
            table.dirty = true;
        }
        Ok(())
    }

    /// Persists the current table's block info into the shadow head.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if moving the last block or appending the
    /// blob fails.
    pub fn write_block_info(&mut self) -> Result<()> {
        self.require_write("write_block_info")?;
        self.require(HelperState::TABLE_SET, "write_block_info")?;
        self.load_block_info()?;
        self.move_last_block_if_necessary()?;

        let Some(table) = self.table.as_mut() else {
            return Ok(());
        };
        let tid = table.info.tid;
        if self.info.blocks.is_empty() {
            table.idx = CompIdx::default();
        } else {
            let (blob, checksum) = self.info.encode()?;
            let Some(files) = self.files.as_mut() else {
                return Ok(());
            };
            let shadow = files.shadow_head.as_mut().ok_or(ConsistencyError::ReadOnlyHelper {
                operation: "write_block_info",
            })?;
            let len = len_u32("block-info blob", blob.len())?;
            let num_super_blocks = len_u32("super-block array", self.info.blocks.len())?;
            let offset = shadow.append(&blob)?;
            table.idx.offset = offset;
            table.idx.len = len;
            table.idx.checksum = checksum;
            table.idx.num_super_blocks = num_super_blocks;
            table.idx.has_last = self.info.blocks.last().is_some_and(|b| b.last);
            table.idx.max_key = self.info.blocks.last().map_or(0, |b| b.key_last);
        }
        self.shadow_idx[tid as usize] = Some(ShadowEntry {
            idx: table.idx,
            last_in_shadow: table.last_in_shadow,
        });
        table.dirty = false;
        debug!(
            target: "tessel::helper",
            tid,
            offset = table.idx.offset,
            len = table.idx.len,
            blocks = table.idx.num_super_blocks,
            "block info written"
        );
        Ok(())
    }

    /// Commits the write session.
    ///
    /// Writes the current table's pending block info, carries forward the
    /// block info of every table not written in this session, writes the
    /// index region and header into the shadow head, syncs all files, then
    /// renames the shadow head over the head file.
    /// The rename is the commit point: a crash before it leaves the previous
    /// head authoritative. Afterwards the directory is synced and the
    /// superseded last-file generation removed. The helper is closed on
    /// return.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if any write, sync or rename fails. Failures
    /// before the rename discard the shadow files; later failures leave the
    /// committed state in place.
    pub fn commit(&mut self) -> Result<()> {
        self.require_write("commit")?;
        self.require(HelperState::FILE_SET_AND_OPEN | HelperState::IDX_LOAD, "commit")?;

        let prepared = self
            .flush_table("commit")
            .and_then(|()| self.prepare_commit());
        let (header, new_idx) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.close(true);
                return Err(e);
            }
        };

        let Some(files) = self.files.take() else {
            return Ok(());
        };
        let group = files.group.clone();
        let old_gen = files.header.last_gen;
        let new_last = files.shadow_last.is_some();
        let from = group.shadow_head_path();
        let to = group.head_path();
        drop(files);

        if let Err(source) = std::fs::rename(&from, &to) {
            let _ = std::fs::remove_file(&from);
            if new_last {
                let _ = std::fs::remove_file(group.last_path(old_gen + 1));
            }
            self.reset_state();
            return Err(FileIoError::Rename {
                from: from.display().to_string(),
                to: to.display().to_string(),
                source,
            }
            .into());
        }

        self.idx = new_idx;
        self.reset_state();
        group::sync_dir(group.dir())?;
        if new_last {
            let stale = group.last_path(old_gen);
            match std::fs::remove_file(&stale) {
                Ok(()) => group::sync_dir(group.dir())?,
                Err(e) => warn!(target: "tessel::helper", path = %stale.display(), error = %e, "failed to remove superseded last file"),
            }
        }
        info!(
            target: "tessel::helper",
            fid = group.fid(),
            last_gen = header.last_gen,
            tables = self.idx.iter().filter(|i| i.has_blocks()).count(),
            "file group committed"
        );
        Ok(())
    }

    /// Writes the current table's block info if blocks were written since
    /// the last [`Self::write_block_info`], so rows already acknowledged by
    /// a write call are never dropped by a table switch or a commit.
    fn flush_table(&mut self, operation: &'static str) -> Result<()> {
        if !self.table.as_ref().is_some_and(|t| t.dirty) {
            return Ok(());
        }
        let tid = self.table.as_ref().map_or(0, |t| t.info.tid);
        debug!(target: "tessel::helper", tid, operation, "flushing unwritten block info");
        self.write_block_info()
    }

    fn prepare_commit(&mut self) -> Result<(FileHeader, Vec<CompIdx>)> {
        let max_tables = self.config.max_tables as usize;
        let mut out = Vec::new();
        out.try_reserve_exact(max_tables)
            .map_err(|_| TesselError::oom("committed index", max_tables * COMP_IDX_SIZE))?;

        let Some(files) = self.files.as_mut() else {
            return Err(ConsistencyError::InvalidState {
                operation: "commit",
                state: self.state.bits(),
            }
            .into());
        };
        for tid in 0..max_tables {
            let entry = match self.shadow_idx.get(tid).copied().flatten() {
                Some(shadow) => shadow.idx,
                None if self.idx[tid].has_blocks() => carry_forward(files, self.idx[tid])?,
                None => CompIdx::default(),
            };
            out.push(entry);
        }

        let region = index::encode_idx_region(&out)?;
        let header = FileHeader {
            last_gen: files.header.last_gen + u32::from(files.shadow_last.is_some()),
            idx_checksum: crc32fast::hash(&region),
            ..files.header
        };
        let shadow = files
            .shadow_head
            .as_mut()
            .ok_or(ConsistencyError::ReadOnlyHelper { operation: "commit" })?;
        shadow.write_at(HEAD_SIZE as u64, &region)?;
        shadow.write_at(0, &header.encode())?;

        files.data.sync()?;
        files.last.sync()?;
        if let Some(last) = &files.shadow_last {
            last.sync()?;
        }
        shadow.sync()?;
        Ok((header, out))
    }

    fn reset_state(&mut self) {
        self.state = HelperState::default();
        self.table = None;
        self.info = CompInfo::default();
        self.shadow_idx.clear();
    }

    /// Closes every file of the session.
    ///
    /// Shadow files of an uncommitted write session are removed, so a
    /// failed write never leaves a partial replacement behind. `has_error`
    /// only selects how loudly that is reported.
    pub fn close(&mut self, has_error: bool) {
        if let Some(files) = self.files.take() {
            let fid = files.group.fid();
            let shadows = files.shadow_paths();
            drop(files);
            for path in &shadows {
                if let Err(e) = std::fs::remove_file(path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(target: "tessel::helper", path = %path.display(), error = %e, "failed to remove shadow file");
                }
            }
            if has_error {
                warn!(target: "tessel::helper", fid, removed = shadows.len(), "file group closed on error");
            } else {
                debug!(target: "tessel::helper", fid, removed = shadows.len(), "file group closed");
            }
        }
        self.reset_state();
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        if self.files.as_ref().is_some_and(|f| f.shadow_head.is_some()) {
            self.close(true);
        }
    }
}

fn should_create_new_last(config: &HelperConfig, last: &TsFile) -> bool {
    last.len() > config.last_file_rewrite_threshold
}

fn open_files(config: &HelperConfig, group: &FileGroup) -> Result<OpenFiles> {
    let mut head = TsFile::open(group.head_path(), OpenMode::Read)?;
    let header_bytes = head.read_at(0, HEAD_SIZE)?;
    let header = FileHeader::decode(&header_bytes, &head.path_str())?;
    if header.max_tables != config.max_tables || header.fid != group.fid() {
        return Err(FileIoError::Corrupted {
            path: head.path_str(),
            reason: format!(
                "head describes fid {} with {} table slots, expected fid {} with {}",
                header.fid,
                header.max_tables,
                group.fid(),
                config.max_tables
            ),
        }
        .into());
    }

    let mode = match config.kind {
        HelperKind::Read => OpenMode::Read,
        HelperKind::Write => OpenMode::ReadWrite,
    };
    let mut data = TsFile::open(group.data_path(), mode)?;
    group::check_block_file_header(&mut data, BlockFileKind::Data)?;
    let mut last = TsFile::open(group.last_path(header.last_gen), mode)?;
    group::check_block_file_header(&mut last, BlockFileKind::Last)?;

    let mut files = OpenFiles {
        group: group.clone(),
        header,
        head,
        data,
        last,
        data_map: None,
        last_map: None,
        shadow_head: None,
        shadow_last: None,
    };

    match config.kind {
        HelperKind::Read => {
            files.data_map = Some(map_file(&files.data)?);
            files.last_map = Some(map_file(&files.last)?);
        }
        HelperKind::Write => {
            if header.last_gen > 0 {
                // left behind by a crash between commit and cleanup
                let _ = std::fs::remove_file(group.last_path(header.last_gen - 1));
            }
            if let Err(e) = create_shadows(config, &mut files) {
                let new_last = group.last_path(header.last_gen + 1);
                let shadow_head = group.shadow_head_path();
                drop(files);
                let _ = std::fs::remove_file(shadow_head);
                let _ = std::fs::remove_file(new_last);
                return Err(e);
            }
        }
    }
    Ok(files)
}

fn create_shadows(config: &HelperConfig, files: &mut OpenFiles) -> Result<()> {
    let mut shadow_head = TsFile::open(files.group.shadow_head_path(), OpenMode::Create)?;
    shadow_head.append_from(&mut files.head, 0, files.header.prefix_len())?;
    files.shadow_head = Some(shadow_head);

    if should_create_new_last(config, &files.last) {
        let mut shadow_last = TsFile::open(
            files.group.last_path(files.header.last_gen + 1),
            OpenMode::Create,
        )?;
        group::write_block_file_header(&mut shadow_last, BlockFileKind::Last, files.group.fid())?;
        files.shadow_last = Some(shadow_last);
    }
    Ok(())
}

fn map_file(file: &TsFile) -> Result<Mmap> {
    // SAFETY: the file is opened read-only here. Write sessions only append
    // to data and last files and never rewrite bytes a committed head
    // references; superseded last files are unlinked, not truncated.
    unsafe { Mmap::map(file.file()) }.map_err(|source| {
        FileIoError::Open {
            path: file.path_str(),
            source,
        }
        .into()
    })
}

/// Copies an untouched table's block info into the shadow head, moving its
/// last block when a new last file is open.
fn carry_forward(files: &mut OpenFiles, old: CompIdx) -> Result<CompIdx> {
    let blob = files.head.read_at(old.offset, old.len as usize)?;
    let shadow_path = files
        .shadow_head
        .as_ref()
        .map(TsFile::path_str)
        .unwrap_or_default();

    if old.has_last && files.shadow_last.is_some() {
        let mut info = CompInfo::decode(&blob, &old, &files.head.path_str())?;
        if let Some(mut blk) = info.blocks.pop() {
            files.move_last_segments(&mut blk)?;
            info.blocks.push(blk);
        }
        let (blob, checksum) = info.encode()?;
        let shadow = files.shadow_head.as_mut().ok_or(ConsistencyError::ReadOnlyHelper {
            operation: "commit",
        })?;
        let offset = shadow.append(&blob)?;
        debug!(target: "tessel::helper", tid = info.tid, "carried forward block info with moved last block");
        return Ok(CompIdx {
            offset,
            len: len_u32("block-info blob", blob.len())?,
            checksum,
            ..old
        });
    }

    if crc32fast::hash(&blob) != old.checksum {
        return Err(FileIoError::Corrupted {
            path: files.head.path_str(),
            reason: format!("block-info checksum mismatch for uid {}", old.uid),
        }
        .into());
    }
    let shadow = files.shadow_head.as_mut().ok_or(ConsistencyError::ReadOnlyHelper {
        operation: "commit",
    })?;
    let offset = shadow.append(&blob)?;
    debug!(target: "tessel::helper", uid = old.uid, offset, path = %shadow_path, "carried forward block info");
    Ok(CompIdx { offset, ..old })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cols::tests::{batch, test_schema};

    fn write_config() -> HelperConfig {
        HelperConfig {
            max_tables: 8,
            min_rows_per_file_block: 10,
            max_rows_per_file_block: 100,
            ..HelperConfig::new(HelperKind::Write)
        }
    }

    #[test]
    fn test_state_bits() {
        let mut state = HelperState::default();
        assert!(state.has(HelperState::CLEAR));
        state.set(HelperState::FILE_SET_AND_OPEN | HelperState::IDX_LOAD);
        assert!(state.has(HelperState::FILE_SET_AND_OPEN));
        assert!(!state.has(HelperState::TABLE_SET));
        assert_eq!(state.bits() & (HelperState::TABLE_SET - 1), state.bits());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = HelperConfig {
            max_tables: 0,
            ..write_config()
        };
        assert!(Helper::init(config).is_err());
    }

    #[test]
    fn test_operations_require_state() {
        let mut helper = Helper::init(write_config()).unwrap();
        let err = helper.load_index().unwrap_err();
        assert!(matches!(
            err,
            TesselError::Consistency(ConsistencyError::InvalidState { .. })
        ));
        assert!(helper.load_block_info().is_err());
        assert!(helper.commit().is_err());
    }

    #[test]
    fn test_open_creates_and_close_removes_shadow_head() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 1, (0, 10_000), 8).unwrap();
        let mut helper = Helper::init(write_config()).unwrap();

        helper.set_and_open_file(&group).unwrap();
        assert!(group.shadow_head_path().exists());
        assert!(helper.state().has(HelperState::FILE_SET_AND_OPEN | HelperState::IDX_LOAD));
        assert!(!helper.has_shadow_last());

        helper.close(true);
        assert!(!group.shadow_head_path().exists());
        assert_eq!(helper.state().bits(), HelperState::CLEAR);
    }

    #[test]
    fn test_open_mismatched_capacity_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 1, (0, 100), 4).unwrap();
        let mut helper = Helper::init(write_config()).unwrap();
        assert!(helper.set_and_open_file(&group).is_err());
        assert!(!group.shadow_head_path().exists());
        assert_eq!(helper.state().bits(), HelperState::CLEAR);
    }

    #[test]
    fn test_set_table_bounds_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 1, (0, 10_000), 8).unwrap();
        let mut helper = Helper::init(write_config()).unwrap();
        helper.set_and_open_file(&group).unwrap();

        let schema = test_schema();
        let err = helper
            .set_table(TableInfo { tid: 8, uid: 1 }, &schema)
            .unwrap_err();
        assert!(matches!(
            err,
            TesselError::Consistency(ConsistencyError::TableOutOfRange { .. })
        ));

        helper.set_table(TableInfo { tid: 2, uid: 42 }, &schema).unwrap();
        helper.load_block_info().unwrap();
        assert!(helper.state().has(HelperState::INFO_LOAD));
        helper.set_table(TableInfo { tid: 3, uid: 43 }, &schema).unwrap();
        assert!(!helper.state().has(HelperState::INFO_LOAD));
        assert!(helper.state().has(HelperState::IDX_LOAD));
    }

    #[test]
    fn test_read_helper_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 1, (0, 10_000), 8).unwrap();
        let config = HelperConfig {
            kind: HelperKind::Read,
            ..write_config()
        };
        let mut helper = Helper::init(config).unwrap();
        helper.set_and_open_file(&group).unwrap();
        assert!(!group.shadow_head_path().exists());

        let schema = test_schema();
        helper.set_table(TableInfo { tid: 0, uid: 1 }, &schema).unwrap();
        let err = helper.write_data_block(&batch(&schema, 1..=5)).unwrap_err();
        assert!(matches!(
            err,
            TesselError::Consistency(ConsistencyError::ReadOnlyHelper { .. })
        ));
    }

    #[test]
    fn test_drop_removes_uncommitted_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 1, (0, 10_000), 8).unwrap();
        {
            let mut helper = Helper::init(write_config()).unwrap();
            helper.set_and_open_file(&group).unwrap();
            assert!(group.shadow_head_path().exists());
        }
        assert!(!group.shadow_head_path().exists());
    }
}
