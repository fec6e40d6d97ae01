//! Configuration for the file-group helper and the log-consumption layer.
//!
//! Both configs are plain serde structs with a `Default` and a `validate()`
//! that rejects combinations the storage code cannot honour. They are
//! normally built in code, or loaded from a JSON file by the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Upper bound on tables per file group.
pub const MAX_TABLES: u32 = 100_000;

/// Upper bound on rows stored in a single file block.
pub const MAX_ROWS_PER_BLOCK: u32 = 10_000;

/// Smallest usable sub-block cap: the original block plus two appended segments.
pub const MIN_SUB_BLOCKS: u8 = 3;

/// Upper bound on sub-blocks aggregated under one super-block.
pub const MAX_SUB_BLOCKS: u8 = 16;

/// Whether a helper reads a file group or rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperKind {
    /// Read-only access; data and last files are memory-mapped.
    Read,
    /// Read-write access with shadow head and last files.
    Write,
}

/// Compression applied to column payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Raw little-endian bytes.
    None,
    /// Snappy raw encoding.
    #[default]
    Snappy,
}

impl Compression {
    /// On-disk tag for this algorithm.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Snappy => 1,
        }
    }

    /// Parses an on-disk tag.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Snappy),
            _ => None,
        }
    }
}

/// Configuration of a read or write helper.
///
/// # Example
///
/// ```rust
/// use tessel::config::{HelperConfig, HelperKind};
///
/// let config = HelperConfig {
///     max_tables: 16,
///     min_rows_per_file_block: 50,
///     ..HelperConfig::new(HelperKind::Write)
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Read or write helper.
    pub kind: HelperKind,

    /// Number of table slots in each file group's index.
    pub max_tables: u32,

    /// A block never holds more rows than this.
    pub max_rows_per_file_block: u32,

    /// Blocks with fewer rows than this go to the last file.
    pub min_rows_per_file_block: u32,

    /// Cap on sub-blocks per super-block; reaching it forces a rewrite.
    pub max_sub_blocks: u8,

    /// Column payload compression for newly written blocks.
    pub compression: Compression,

    /// Size in bytes above which a write session starts a new last-file
    /// generation and moves live last blocks into it.
    pub last_file_rewrite_threshold: u64,
}

impl HelperConfig {
    /// Default configuration for the given helper kind.
    #[must_use]
    pub fn new(kind: HelperKind) -> Self {
        Self {
            kind,
            max_tables: 1_000,
            max_rows_per_file_block: 4_096,
            min_rows_per_file_block: 100,
            max_sub_blocks: 8,
            compression: Compression::Snappy,
            last_file_rewrite_threshold: 32 * 1024 * 1024,
        }
    }

    /// Checks capacity limits and row thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any field is out of range or the row
    /// thresholds contradict each other.
    pub fn validate(&self) -> Result<()> {
        if self.max_tables == 0 || self.max_tables > MAX_TABLES {
            return Err(ConfigError::InvalidMaxTables {
                value: self.max_tables,
                max: MAX_TABLES,
            }
            .into());
        }

        let rows_err = |reason| ConfigError::InvalidRowThresholds {
            min_rows: self.min_rows_per_file_block,
            max_rows: self.max_rows_per_file_block,
            reason,
        };
        if self.min_rows_per_file_block == 0 {
            return Err(rows_err("min_rows must be positive").into());
        }
        if self.min_rows_per_file_block > self.max_rows_per_file_block {
            return Err(rows_err("min_rows exceeds max_rows").into());
        }
        if self.max_rows_per_file_block > MAX_ROWS_PER_BLOCK {
            return Err(rows_err("max_rows exceeds the per-block limit").into());
        }

        if !(MIN_SUB_BLOCKS..=MAX_SUB_BLOCKS).contains(&self.max_sub_blocks) {
            return Err(ConfigError::InvalidMaxSubBlocks {
                value: self.max_sub_blocks,
                min: MIN_SUB_BLOCKS,
                max: MAX_SUB_BLOCKS,
            }
            .into());
        }

        Ok(())
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self::new(HelperKind::Write)
    }
}

/// Timestamp precision of the rows handed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Milliseconds.
    #[default]
    Milli,
    /// Microseconds.
    Micro,
    /// Nanoseconds.
    Nano,
}

impl Precision {
    /// Wire code for this precision.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Milli => 0,
            Self::Micro => 1,
            Self::Nano => 2,
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Milli),
            1 => Some(Self::Micro),
            2 => Some(Self::Nano),
            _ => None,
        }
    }
}

/// Configuration of the log-consumption layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TqConfig {
    /// Number of worker slots per subscription; each gets its own executor.
    pub worker_slots: usize,

    /// Runner count for stream tasks deployed without an explicit parallelism.
    pub default_parallelism: usize,

    /// Compress row payloads in poll responses.
    pub response_compression: Compression,

    /// Timestamp precision reported in poll responses.
    pub precision: Precision,
}

impl TqConfig {
    /// Checks slot and parallelism counts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTq`] if either count is zero.
    pub fn validate(&self) -> Result<()> {
        if self.worker_slots == 0 {
            return Err(ConfigError::InvalidTq {
                reason: "worker_slots must be at least 1".to_string(),
            }
            .into());
        }
        if self.default_parallelism == 0 {
            return Err(ConfigError::InvalidTq {
                reason: "default_parallelism must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl Default for TqConfig {
    fn default() -> Self {
        Self {
            worker_slots: 4,
            default_parallelism: 1,
            response_compression: Compression::Snappy,
            precision: Precision::Milli,
        }
    }
}

/// Both configs as stored in a JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Helper settings.
    pub helper: HelperConfig,
    /// Log layer settings.
    pub tq: TqConfig,
}

impl FileConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::FileIoError::Open`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON, or any validation error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            crate::error::FileIoError::Open {
                path: path.display().to_string(),
                source,
            }
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.helper.validate()?;
        config.tq.validate()?;
        Ok(config)
    }
}
