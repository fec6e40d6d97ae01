//! # tessel
//!
//! Block-structured time-series file storage with log-based stream
//! consumption.
//!
//! tessel stores the rows of many tables in a *file group*: a head file
//! holding one index slot per table, a data file for full blocks and a last
//! file for the small trailing blocks of each table. A write helper merges
//! sorted batches into those blocks (appending, growing a block in place
//! with sub-blocks, or rewriting and splitting it) and commits by renaming a
//! shadow head over the old one. The [`tq`] layer serves consumers that
//! poll the write-ahead log and stream tasks that run on every submission.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Columnar blocks with per-column Snappy compression and CRC-32 checksums
//! - Crash-safe commit: a session is visible only after its shadow head is renamed into place
//! - Bounded block sizes: rows per block and sub-blocks per block are configured limits
//! - Lock-free epoch fencing for concurrent polls of one subscription
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tessel::{
//!     ColumnSpec, ColumnType, DataCols, FileGroup, Helper, HelperConfig, HelperKind, Schema,
//!     TableInfo, Value,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::new(
//!     1,
//!     vec![
//!         ColumnSpec { id: 0, ty: ColumnType::Timestamp },
//!         ColumnSpec { id: 1, ty: ColumnType::Double },
//!     ],
//! )?;
//!
//! // One file group covering a day of millisecond keys, 16 table slots.
//! let group = FileGroup::create("./my_data", 0, (0, 86_400_000), 16)?;
//!
//! let mut helper = Helper::init(HelperConfig {
//!     max_tables: 16,
//!     ..HelperConfig::new(HelperKind::Write)
//! })?;
//! helper.set_and_open_file(&group)?;
//! helper.set_table(TableInfo { tid: 1, uid: 1001 }, &schema)?;
//!
//! let mut rows = DataCols::new(&schema, 100)?;
//! for ts in 0..100 {
//!     rows.push_row(&[Value::Timestamp(ts * 1000), Value::Double(0.5)])?;
//! }
//! helper.write_batch(&rows)?;
//! helper.write_block_info()?;
//! helper.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`cols`]: schemas and in-memory columnar batches
//! - [`config`]: helper and log-layer configuration
//! - [`group`]: file-group naming, creation and positioned file I/O
//! - [`index`]: head-file header, index slots and block descriptors
//! - [`block`]: block encoding and decoding
//! - [`helper`]: the read/write helper state machine and commit protocol
//! - [`merge`]: placement of incoming rows into blocks
//! - [`tq`]: log polling, subscriptions and stream tasks
//! - [`error`]: error types

pub mod block;
pub mod cols;
pub mod config;
pub mod error;
pub mod group;
pub mod helper;
pub mod index;
pub mod merge;
pub mod tq;

// Re-export primary API types at crate root for convenience.
pub use cols::{ColumnSpec, ColumnType, DataCols, Schema, Value};
pub use config::{Compression, FileConfig, HelperConfig, HelperKind, Precision, TqConfig};
pub use error::{Result, TesselError};
pub use group::FileGroup;
pub use helper::{Helper, HelperState, HelperStats, TableInfo};
pub use index::{CompBlock, CompIdx, CompInfo};
pub use tq::Tq;
