//! File groups and the file handles the helper works through.
//!
//! A file group is one time partition of a vnode's data, identified by its
//! file id (`fid`). It is stored as three files in a directory:
//!
//! ```text
//! dir/
//! ├── v{fid}.head          <- header, per-table index, block-info blobs
//! ├── v{fid}.data          <- full-size block payloads
//! ├── v{fid}-{gen}.last    <- small (last) block payloads, generation `gen`
//! ├── v{fid}.h             <- shadow head, only during a write session
//! └── v{fid}-{gen+1}.last  <- shadow last, only when a rewrite is due
//! ```
//!
//! Data and last files start with a 16-byte header so that every block
//! offset is non-zero.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{FileIoError, Result};
use crate::index::{self, CompIdx, FileHeader};

/// Size of the data/last file header.
pub const BLOCK_FILE_HEADER_SIZE: u64 = 16;

const DATA_MAGIC: [u8; 4] = *b"TSLD";
const LAST_MAGIC: [u8; 4] = *b"TSLL";
const BLOCK_FILE_VERSION: u32 = 1;

/// Open mode of a [`TsFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read-only.
    Read,
    /// Existing file, read-write.
    ReadWrite,
    /// New file, truncated if present.
    Create,
}

/// A file in a group, tracking its path and current length.
#[derive(Debug)]
pub struct TsFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl TsFile {
    /// Opens `path` in `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Open`] if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self> {
        let path = path.into();
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::Read => opts.read(true),
            OpenMode::ReadWrite => opts.read(true).write(true),
            OpenMode::Create => opts.read(true).write(true).create(true).truncate(true),
        };
        let file = opts.open(&path).map_err(|source| FileIoError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| FileIoError::Open {
                path: path.display().to_string(),
                source,
            })?
            .len();
        Ok(Self { path, file, size })
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    /// Current length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.size
    }

    /// True if the file has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The underlying file, for memory mapping.
    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Appends `bytes` at the end of the file and returns their offset.
    ///
    /// On failure the file is truncated back to its previous length, so a
    /// short write never leaves a partial block behind.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Write`] on any seek or write failure.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.size;
        let res = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(bytes));
        if let Err(source) = res {
            let _ = self.file.set_len(offset);
            return Err(FileIoError::Write {
                path: self.path_str(),
                offset,
                source,
            }
            .into());
        }
        self.size += bytes.len() as u64;
        Ok(offset)
    }

    /// Overwrites bytes at `offset`, extending the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Write`] on any seek or write failure.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|source| FileIoError::Write {
                path: self.path_str(),
                offset,
                source,
            })?;
        self.size = self.size.max(offset + bytes.len() as u64);
        Ok(())
    }

    /// Reads exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Read`] on a short read, or
    /// [`crate::TesselError::OutOfMemory`].
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| crate::TesselError::oom("file read buffer", len))?;
        buf.resize(len, 0);
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut buf))
            .map_err(|source| FileIoError::Read {
                path: self.path_str(),
                offset,
                source,
            })?;
        Ok(buf)
    }

    /// Copies `len` bytes at `offset` of `src` to the end of this file.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the read or the append fails.
    pub fn append_from(&mut self, src: &mut TsFile, offset: u64, len: usize) -> Result<u64> {
        let bytes = src.read_at(offset, len)?;
        self.append(&bytes)
    }

    /// Flushes data and metadata to disk.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Sync`] on failure.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|source| {
            FileIoError::Sync {
                path: self.path_str(),
                source,
            }
            .into()
        })
    }
}

/// Flushes directory entries (renames, creates, removes) to disk.
///
/// # Errors
///
/// Returns [`FileIoError::Sync`] on failure.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|source| FileIoError::Open {
            path: dir.display().to_string(),
            source,
        })?;
        handle.sync_all().map_err(|source| FileIoError::Sync {
            path: dir.display().to_string(),
            source,
        })?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Which kind of block file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockFileKind {
    Data,
    Last,
}

/// Writes the header of a fresh data or last file.
pub(crate) fn write_block_file_header(file: &mut TsFile, kind: BlockFileKind, fid: i32) -> Result<()> {
    let mut buf = [0u8; BLOCK_FILE_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(match kind {
        BlockFileKind::Data => &DATA_MAGIC,
        BlockFileKind::Last => &LAST_MAGIC,
    });
    buf[4..8].copy_from_slice(&BLOCK_FILE_VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&fid.to_le_bytes());
    file.write_at(0, &buf)
}

/// Checks the header of an existing data or last file.
pub(crate) fn check_block_file_header(file: &mut TsFile, kind: BlockFileKind) -> Result<()> {
    let expected = match kind {
        BlockFileKind::Data => DATA_MAGIC,
        BlockFileKind::Last => LAST_MAGIC,
    };
    let path = file.path_str();
    let corrupted = |reason: String| FileIoError::Corrupted {
        path: path.clone(),
        reason,
    };
    if file.len() < BLOCK_FILE_HEADER_SIZE {
        return Err(corrupted(format!("file is {} bytes, shorter than its header", file.len())).into());
    }
    let buf = file.read_at(0, BLOCK_FILE_HEADER_SIZE as usize)?;
    if buf[0..4] != expected {
        return Err(corrupted(format!(
            "invalid magic bytes: expected {expected:?}, found {:?}",
            &buf[0..4]
        ))
        .into());
    }
    Ok(())
}

/// One time partition: its directory, file id and key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    dir: PathBuf,
    fid: i32,
    key_min: i64,
    key_max: i64,
}

impl FileGroup {
    /// Creates an empty file group: a head file with a zeroed index, an
    /// empty data file and a generation-0 last file.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding the group's files (created if missing)
    /// * `fid` - File id
    /// * `key_range` - Inclusive range of keys the group accepts
    /// * `max_tables` - Number of index slots
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if any file cannot be created or written.
    pub fn create(
        dir: impl AsRef<Path>,
        fid: i32,
        key_range: (i64, i64),
        max_tables: u32,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| FileIoError::Open {
            path: dir.display().to_string(),
            source,
        })?;
        let group = Self {
            dir,
            fid,
            key_min: key_range.0,
            key_max: key_range.1,
        };

        let region = index::encode_idx_region(&vec![CompIdx::default(); max_tables as usize])?;
        let header = FileHeader {
            max_tables,
            fid,
            key_min: group.key_min,
            key_max: group.key_max,
            last_gen: 0,
            idx_checksum: crc32fast::hash(&region),
        };
        let mut head = TsFile::open(group.head_path(), OpenMode::Create)?;
        head.write_at(0, &header.encode())?;
        head.write_at(index::HEAD_SIZE as u64, &region)?;
        head.sync()?;

        let mut data = TsFile::open(group.data_path(), OpenMode::Create)?;
        write_block_file_header(&mut data, BlockFileKind::Data, fid)?;
        data.sync()?;
        let mut last = TsFile::open(group.last_path(0), OpenMode::Create)?;
        write_block_file_header(&mut last, BlockFileKind::Last, fid)?;
        last.sync()?;
        sync_dir(&group.dir)?;

        info!(
            target: "tessel::group",
            fid,
            max_tables,
            key_min = group.key_min,
            key_max = group.key_max,
            dir = %group.dir.display(),
            "created file group"
        );
        Ok(group)
    }

    /// Opens an existing group, reading its key range from the head file.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the head file is missing or corrupted.
    pub fn open(dir: impl AsRef<Path>, fid: i32) -> Result<Self> {
        let mut group = Self {
            dir: dir.as_ref().to_path_buf(),
            fid,
            key_min: i64::MIN,
            key_max: i64::MAX,
        };
        let header = group.read_header()?;
        group.key_min = header.key_min;
        group.key_max = header.key_max;
        debug!(target: "tessel::group", fid, key_min = group.key_min, key_max = group.key_max, "opened file group");
        Ok(group)
    }

    /// Reads and validates the head file header.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the head file is missing or corrupted.
    pub fn read_header(&self) -> Result<FileHeader> {
        let mut head = TsFile::open(self.head_path(), OpenMode::Read)?;
        let len = usize::try_from(head.len().min(index::HEAD_SIZE as u64)).unwrap_or(0);
        let buf = head.read_at(0, len)?;
        FileHeader::decode(&buf, &head.path_str())
    }

    /// Group directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File id.
    #[must_use]
    pub fn fid(&self) -> i32 {
        self.fid
    }

    /// Inclusive key range.
    #[must_use]
    pub fn key_range(&self) -> (i64, i64) {
        (self.key_min, self.key_max)
    }

    /// Path of the head file.
    #[must_use]
    pub fn head_path(&self) -> PathBuf {
        self.dir.join(format!("v{}.head", self.fid))
    }

    /// Path of the shadow head file.
    #[must_use]
    pub fn shadow_head_path(&self) -> PathBuf {
        self.dir.join(format!("v{}.h", self.fid))
    }

    /// Path of the data file.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.dir.join(format!("v{}.data", self.fid))
    }

    /// Path of the last file of generation `generation`.
    #[must_use]
    pub fn last_path(&self, generation: u32) -> PathBuf {
        self.dir.join(format!("v{}-{generation}.last", self.fid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open_group() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 7, (0, 999), 16).unwrap();

        assert!(group.head_path().exists());
        assert!(group.data_path().exists());
        assert!(group.last_path(0).exists());
        assert!(!group.shadow_head_path().exists());

        let header = group.read_header().unwrap();
        assert_eq!(header.fid, 7);
        assert_eq!(header.max_tables, 16);
        assert_eq!(header.last_gen, 0);

        let reopened = FileGroup::open(dir.path(), 7).unwrap();
        assert_eq!(reopened, group);
        assert_eq!(reopened.key_range(), (0, 999));
    }

    #[test]
    fn test_open_missing_group_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileGroup::open(dir.path(), 1).unwrap_err();
        assert!(matches!(
            err,
            crate::TesselError::FileIo(FileIoError::Open { .. })
        ));
    }

    #[test]
    fn test_append_and_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = TsFile::open(dir.path().join("x"), OpenMode::Create).unwrap();
        assert!(f.is_empty());
        assert_eq!(f.append(b"hello").unwrap(), 0);
        assert_eq!(f.append(b"world").unwrap(), 5);
        assert_eq!(f.len(), 10);
        assert_eq!(f.read_at(5, 5).unwrap(), b"world");
        assert!(f.read_at(8, 5).is_err());
    }

    #[test]
    fn test_block_file_header_check() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::create(dir.path(), 1, (0, 10), 4).unwrap();
        let mut data = TsFile::open(group.data_path(), OpenMode::Read).unwrap();
        check_block_file_header(&mut data, BlockFileKind::Data).unwrap();
        assert!(check_block_file_header(&mut data, BlockFileKind::Last).is_err());
    }
}
