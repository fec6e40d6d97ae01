//! Write-ahead log access used by the poll responder.
//!
//! The log itself lives outside this crate; [`WalReader`] and
//! [`WalReadHandle`] are the two calls the responder needs. [`MemWal`] is an
//! in-process log for tests and the CLI demo.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, TesselError};

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// A data submission carrying a [`crate::tq::SubmitMsg`] body.
    Submit,
    /// A queued stream-trigger request.
    StreamTrigger,
    /// Anything else; the responder skips these.
    Other(u16),
}

impl MsgType {
    /// Wire code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Submit => 1,
            Self::StreamTrigger => 2,
            Self::Other(code) => code,
        }
    }

    /// Parses a wire code; unknown codes map to [`MsgType::Other`].
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Submit,
            2 => Self::StreamTrigger,
            other => Self::Other(other),
        }
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Log version (offset).
    pub version: i64,
    /// Entry kind.
    pub msg_type: MsgType,
    /// Raw message body.
    pub body: Vec<u8>,
}

/// A cursor-like reader opened on a log.
pub trait WalReadHandle: Send {
    /// Reads the entry at `version`, or `None` if it does not exist yet (or
    /// has been pruned).
    ///
    /// # Errors
    ///
    /// Implementations return an error if the log cannot be read.
    fn read_at(&mut self, version: i64) -> Result<Option<WalEntry>>;
}

/// A log that read handles can be opened on.
pub trait WalReader: Send + Sync {
    /// Opens an independent read handle.
    fn open_read_handle(&self) -> Box<dyn WalReadHandle>;

    /// First retained version; `0` for an empty log.
    fn first_version(&self) -> i64;

    /// Last written version; `-1` for an empty log.
    fn last_version(&self) -> i64;
}

#[derive(Debug, Default)]
struct MemWalInner {
    first: i64,
    entries: VecDeque<WalEntry>,
}

impl MemWalInner {
    fn last(&self) -> i64 {
        self.first + self.entries.len() as i64 - 1
    }
}

/// In-memory log. Cloning shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemWal {
    inner: Arc<RwLock<MemWalInner>>,
}

impl MemWal {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns its version.
    ///
    /// # Errors
    ///
    /// Returns [`TesselError::OutOfMemory`] if the body cannot be copied.
    pub fn append(&self, msg_type: MsgType, body: &[u8]) -> Result<i64> {
        let mut copy = Vec::new();
        copy.try_reserve_exact(body.len())
            .map_err(|_| TesselError::oom("log entry", body.len()))?;
        copy.extend_from_slice(body);

        let mut inner = self.inner.write();
        let version = inner.last() + 1;
        inner.entries.push_back(WalEntry {
            version,
            msg_type,
            body: copy,
        });
        Ok(version)
    }

    /// Drops every entry older than `version`.
    pub fn prune_before(&self, version: i64) {
        let mut inner = self.inner.write();
        while inner.first < version && inner.entries.pop_front().is_some() {
            inner.first += 1;
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WalReader for MemWal {
    fn open_read_handle(&self) -> Box<dyn WalReadHandle> {
        Box::new(MemWalHandle {
            inner: Arc::clone(&self.inner),
        })
    }

    fn first_version(&self) -> i64 {
        self.inner.read().first
    }

    fn last_version(&self) -> i64 {
        self.inner.read().last()
    }
}

struct MemWalHandle {
    inner: Arc<RwLock<MemWalInner>>,
}

impl WalReadHandle for MemWalHandle {
    fn read_at(&mut self, version: i64) -> Result<Option<WalEntry>> {
        let inner = self.inner.read();
        let Ok(pos) = usize::try_from(version - inner.first) else {
            return Ok(None);
        };
        Ok(inner.entries.get(pos).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log_versions() {
        let wal = MemWal::new();
        assert_eq!(wal.first_version(), 0);
        assert_eq!(wal.last_version(), -1);
        assert!(wal.open_read_handle().read_at(0).unwrap().is_none());
    }

    #[test]
    fn test_append_and_read() {
        let wal = MemWal::new();
        assert_eq!(wal.append(MsgType::Submit, b"a").unwrap(), 0);
        assert_eq!(wal.append(MsgType::Other(9), b"b").unwrap(), 1);
        assert_eq!(wal.last_version(), 1);

        let mut handle = wal.open_read_handle();
        let entry = handle.read_at(1).unwrap().unwrap();
        assert_eq!(entry.msg_type, MsgType::Other(9));
        assert_eq!(entry.body, b"b");
        assert!(handle.read_at(2).unwrap().is_none());
        assert!(handle.read_at(-1).unwrap().is_none());
    }

    #[test]
    fn test_prune_moves_first_version() {
        let wal = MemWal::new();
        for _ in 0..5 {
            wal.append(MsgType::Submit, &[]).unwrap();
        }
        wal.prune_before(3);
        assert_eq!(wal.first_version(), 3);
        assert_eq!(wal.last_version(), 4);
        assert_eq!(wal.len(), 2);

        let mut handle = wal.open_read_handle();
        assert!(handle.read_at(2).unwrap().is_none());
        assert_eq!(handle.read_at(3).unwrap().unwrap().version, 3);
        // versions keep counting after a prune
        assert_eq!(wal.append(MsgType::Submit, &[]).unwrap(), 5);
    }

    #[test]
    fn test_msg_type_codes() {
        for ty in [MsgType::Submit, MsgType::StreamTrigger, MsgType::Other(40)] {
            assert_eq!(MsgType::from_code(ty.code()), ty);
        }
    }
}
