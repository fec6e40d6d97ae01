//! Error types for the tessel storage engine.

use thiserror::Error;

/// The main error type for all tessel operations.
///
/// Storage-side failures fall into three families: allocation failure
/// ([`TesselError::OutOfMemory`]), file I/O or on-disk corruption
/// ([`TesselError::FileIo`]) and invariant violations detected at runtime
/// ([`TesselError::Consistency`]). None of them abort the process.
#[derive(Error, Debug)]
pub enum TesselError {
    /// Invalid helper or log-layer configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// File open, read, write, seek, sync or rename failure.
    #[error("file I/O error: {0}")]
    FileIo(#[from] FileIoError),

    /// A runtime invariant did not hold.
    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    /// A buffer could not be allocated.
    #[error("out of memory: could not reserve {requested} bytes for {what}")]
    OutOfMemory {
        /// What the buffer was for.
        what: &'static str,
        /// Number of bytes (or elements) requested.
        requested: usize,
    },

    /// Persisted consumer or task records could not be loaded or saved.
    #[error("meta store error: {0}")]
    MetaStore(#[from] MetaStoreError),

    /// Payload compression or message decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised while validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `max_tables` is outside the supported range.
    #[error("invalid max_tables {value}: must be in 1..={max}")]
    InvalidMaxTables {
        /// The configured value.
        value: u32,
        /// The largest supported value.
        max: u32,
    },

    /// Row thresholds are inconsistent.
    #[error("invalid row thresholds: min_rows {min_rows}, max_rows {max_rows} ({reason})")]
    InvalidRowThresholds {
        /// Minimum rows per file block.
        min_rows: u32,
        /// Maximum rows per file block.
        max_rows: u32,
        /// Why the combination is rejected.
        reason: &'static str,
    },

    /// `max_sub_blocks` is outside the supported range.
    #[error("invalid max_sub_blocks {value}: must be in {min}..={max}")]
    InvalidMaxSubBlocks {
        /// The configured value.
        value: u8,
        /// The smallest supported value.
        min: u8,
        /// The largest supported value.
        max: u8,
    },

    /// A schema definition is unusable.
    #[error("invalid schema: {reason}")]
    InvalidSchema {
        /// Description of the problem.
        reason: String,
    },

    /// Log-layer configuration is unusable.
    #[error("invalid tq config: {reason}")]
    InvalidTq {
        /// Description of the problem.
        reason: String,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The config file path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by file access.
#[derive(Error, Debug)]
pub enum FileIoError {
    /// A file could not be opened or created.
    #[error("failed to open '{path}': {source}")]
    Open {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read failed or came back short.
    #[error("failed to read '{path}' at offset {offset}: {source}")]
    Read {
        /// The file path.
        path: String,
        /// Byte offset of the read.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A write failed or came back short.
    #[error("failed to write '{path}' at offset {offset}: {source}")]
    Write {
        /// The file path.
        path: String,
        /// Byte offset of the write.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Flushing a file or directory to disk failed.
    #[error("failed to sync '{path}': {source}")]
    Sync {
        /// The file or directory path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Replacing a file with its shadow failed.
    #[error("failed to rename '{from}' to '{to}': {source}")]
    Rename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A file does not have the expected layout.
    #[error("'{path}' is corrupted: {reason}")]
    Corrupted {
        /// The file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },
}

/// Runtime invariant violations.
#[derive(Error, Debug)]
pub enum ConsistencyError {
    /// An operation was called in a helper state that does not allow it.
    #[error("helper state {state:#04x} does not allow {operation}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The raw state bits at the time of the call.
        state: u8,
    },

    /// A write operation was called on a read helper.
    #[error("{operation} requires a write helper")]
    ReadOnlyHelper {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A table id is outside the file group's capacity.
    #[error("table id {tid} out of range (max_tables {max_tables})")]
    TableOutOfRange {
        /// The table id.
        tid: u32,
        /// The configured capacity.
        max_tables: u32,
    },

    /// A block index does not exist for the current table.
    #[error("block {index} out of range ({count} super-blocks)")]
    BlockOutOfRange {
        /// The requested block.
        index: usize,
        /// Number of super-blocks loaded.
        count: usize,
    },

    /// Batch keys are not strictly ascending.
    #[error("batch keys not strictly ascending at row {row}")]
    UnsortedBatch {
        /// First row whose key does not exceed its predecessor.
        row: usize,
    },

    /// A batch had no rows, or more columns than the schema.
    #[error("invalid batch: {reason}")]
    InvalidBatch {
        /// Description of the problem.
        reason: String,
    },

    /// The block array disagrees with the table's index entry.
    #[error("block layout mismatch for table {tid}: {reason}")]
    BlockLayout {
        /// The table id.
        tid: u32,
        /// Description of the mismatch.
        reason: String,
    },

    /// A rebalance named an owner that does not hold the subscription.
    #[error(
        "rebalance of '{sub_key}' expected consumer {expected}, but subscription is held by {actual}"
    )]
    ConsumerMismatch {
        /// Subscription key.
        sub_key: String,
        /// The `old_consumer_id` in the request.
        expected: i64,
        /// The consumer id currently stored.
        actual: i64,
    },

    /// A subscription was polled before any rebalance assigned it.
    #[error("no exec registered for subscription '{sub_key}'")]
    UnknownSubscription {
        /// Subscription key.
        sub_key: String,
    },

    /// A stream task id was not deployed.
    #[error("no stream task with id {task_id}")]
    UnknownTask {
        /// The task id.
        task_id: i32,
    },

    /// A stream task id was deployed twice.
    #[error("stream task {task_id} is already deployed")]
    DuplicateTask {
        /// The task id.
        task_id: i32,
    },

    /// A worker slot has no executor.
    #[error("worker slot {worker_id} out of range ({slots} slots)")]
    WorkerOutOfRange {
        /// The requested slot.
        worker_id: usize,
        /// Number of configured slots.
        slots: usize,
    },
}

/// Errors raised by the persisted record store.
#[derive(Error, Debug)]
pub enum MetaStoreError {
    /// The store file could not be read.
    #[error("failed to load records from '{}': {source}", path.display())]
    Load {
        /// The store file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The store file could not be parsed.
    #[error("failed to parse records from '{}': {source}", path.display())]
    Parse {
        /// The store file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The store file could not be written.
    #[error("failed to save records to '{}': {source}", path.display())]
    Save {
        /// The store file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize records: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while encoding or decoding payloads and messages.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Snappy compression failed.
    #[error("failed to compress column payload: {source}")]
    Compress {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// Snappy decompression failed.
    #[error("failed to decompress column payload: {source}")]
    Decompress {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// A message or payload ended early or carried an invalid field.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// What was being decoded.
        what: &'static str,
        /// Description of the problem.
        reason: String,
    },

    /// A length or count does not fit the field that records it.
    #[error("{what} of {len} does not fit its length field")]
    TooLarge {
        /// What was being measured.
        what: &'static str,
        /// The offending length.
        len: usize,
    },

    /// A task descriptor could not be decoded.
    #[error("failed to decode task descriptor: {source}")]
    TaskDescriptor {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl TesselError {
    /// Shorthand for an allocation failure reported by `try_reserve`.
    pub(crate) fn oom(what: &'static str, requested: usize) -> Self {
        Self::OutOfMemory { what, requested }
    }
}

/// Converts a length for a `u32` on-disk or wire field.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if `len` exceeds `u32::MAX`.
pub(crate) fn len_u32(what: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge { what, len }.into())
}

/// Type alias for `Result<T, TesselError>`.
pub type Result<T> = std::result::Result<T, TesselError>;
