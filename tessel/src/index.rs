//! Head-file structures: file header, per-table index and block-info blobs.
//!
//! # File Format
//!
//! ```text
//! head file
//! [0..64)                 FileHeader
//! [64..64+40*max_tables)  CompIdx[max_tables]
//! [..)                    block-info blobs, one per table with data
//!
//! block-info blob
//! [0..24)                 delimiter, tid, uid, super-block count, segment count
//! [24..)                  CompBlock[super-blocks] then CompBlock[segments]
//! ```
//!
//! All integers are little-endian. Each `CompIdx` carries the CRC-32 of its
//! table's blob; the header carries the CRC-32 of the index region.

use crate::config::Compression;
use crate::error::{FileIoError, Result, TesselError, len_u32};

/// Magic bytes identifying a head file.
pub const HEAD_MAGIC: [u8; 4] = *b"TSLH";

/// Head file format version.
pub const HEAD_VERSION: u32 = 1;

/// Size of the head file header in bytes.
pub const HEAD_SIZE: usize = 64;

/// Size of one encoded [`CompIdx`].
pub const COMP_IDX_SIZE: usize = 40;

/// Size of one encoded [`CompBlock`].
pub const COMP_BLOCK_SIZE: usize = 48;

/// Size of the block-info blob header.
pub const INFO_HEADER_SIZE: usize = 24;

/// Marks the start of a block-info blob.
const INFO_DELIMITER: u32 = 0xF00A_FA0F;

/// Little-endian field reader over a byte slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.buf.len());
        let Some(end) = end else {
            return Err(crate::error::CodecError::Malformed {
                what: self.what,
                reason: format!(
                    "need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                ),
            }
            .into());
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }
    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }
    pub(crate) fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }
    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }
    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Header of a head file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Number of index slots.
    pub max_tables: u32,
    /// File id (time partition).
    pub fid: i32,
    /// Smallest key the group accepts.
    pub key_min: i64,
    /// Largest key the group accepts.
    pub key_max: i64,
    /// Generation of the live last file.
    pub last_gen: u32,
    /// CRC-32 of the index region.
    pub idx_checksum: u32,
}

impl FileHeader {
    /// Encodes the header into its fixed 64-byte form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEAD_SIZE] {
        let mut buf = [0u8; HEAD_SIZE];
        buf[0..4].copy_from_slice(&HEAD_MAGIC);
        buf[4..8].copy_from_slice(&HEAD_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.max_tables.to_le_bytes());
        buf[12..16].copy_from_slice(&self.fid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.key_min.to_le_bytes());
        buf[24..32].copy_from_slice(&self.key_max.to_le_bytes());
        buf[32..36].copy_from_slice(&self.last_gen.to_le_bytes());
        buf[36..40].copy_from_slice(&self.idx_checksum.to_le_bytes());
        let crc = crc32fast::hash(&buf[..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Corrupted`] on short input, bad magic,
    /// unsupported version or checksum mismatch.
    pub fn decode(buf: &[u8], path: &str) -> Result<Self> {
        let corrupted = |reason: String| -> TesselError {
            FileIoError::Corrupted {
                path: path.to_string(),
                reason,
            }
            .into()
        };
        if buf.len() < HEAD_SIZE {
            return Err(corrupted(format!(
                "header truncated: {} of {HEAD_SIZE} bytes",
                buf.len()
            )));
        }
        let mut r = Reader::new(&buf[..HEAD_SIZE], "file header");
        let magic = r.take(4)?;
        if magic != HEAD_MAGIC {
            return Err(corrupted(format!(
                "invalid magic bytes: expected {HEAD_MAGIC:?}, found {magic:?}"
            )));
        }
        let version = r.u32()?;
        if version != HEAD_VERSION {
            return Err(corrupted(format!(
                "unsupported version: expected {HEAD_VERSION}, found {version}"
            )));
        }
        let header = Self {
            max_tables: r.u32()?,
            fid: r.i32()?,
            key_min: r.i64()?,
            key_max: r.i64()?,
            last_gen: r.u32()?,
            idx_checksum: r.u32()?,
        };
        let stored = r.u32()?;
        let actual = crc32fast::hash(&buf[..40]);
        if stored != actual {
            return Err(corrupted(format!(
                "header checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }
        Ok(header)
    }

    /// Byte length of header plus index region.
    #[must_use]
    pub fn prefix_len(&self) -> usize {
        HEAD_SIZE + COMP_IDX_SIZE * self.max_tables as usize
    }
}

/// Per-table index entry.
///
/// `offset == 0` means the table has no blocks in this file group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompIdx {
    /// Table uid, checked against the block-info blob.
    pub uid: u64,
    /// Offset of the table's block-info blob in the head file.
    pub offset: u64,
    /// Length of the blob in bytes.
    pub len: u32,
    /// CRC-32 of the blob.
    pub checksum: u32,
    /// Largest key stored for the table.
    pub max_key: i64,
    /// Number of super-blocks.
    pub num_super_blocks: u32,
    /// True if the final super-block lives in the last file.
    pub has_last: bool,
}

impl CompIdx {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.max_key.to_le_bytes());
        out.extend_from_slice(&self.num_super_blocks.to_le_bytes());
        out.extend_from_slice(&[u8::from(self.has_last), 0, 0, 0]);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        let idx = Self {
            uid: r.u64()?,
            offset: r.u64()?,
            len: r.u32()?,
            checksum: r.u32()?,
            max_key: r.i64()?,
            num_super_blocks: r.u32()?,
            has_last: r.u8()? != 0,
        };
        r.take(3)?;
        Ok(idx)
    }

    /// True if the table has at least one block.
    #[must_use]
    pub fn has_blocks(&self) -> bool {
        self.offset > 0 && self.len > 0
    }
}

/// Encodes an index array into its on-disk region.
///
/// # Errors
///
/// Returns [`TesselError::OutOfMemory`] if the buffer cannot be reserved.
pub fn encode_idx_region(idx: &[CompIdx]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let bytes = idx.len() * COMP_IDX_SIZE;
    out.try_reserve_exact(bytes)
        .map_err(|_| TesselError::oom("index region", bytes))?;
    for entry in idx {
        entry.encode_into(&mut out);
    }
    Ok(out)
}

/// Decodes an index region into `out`, verifying its checksum.
///
/// `out` is cleared first; its allocation is reused.
///
/// # Errors
///
/// Returns [`FileIoError::Corrupted`] on checksum mismatch or short input,
/// or [`TesselError::OutOfMemory`].
pub fn decode_idx_region(
    buf: &[u8],
    checksum: u32,
    path: &str,
    out: &mut Vec<CompIdx>,
) -> Result<()> {
    let actual = crc32fast::hash(buf);
    if actual != checksum {
        return Err(FileIoError::Corrupted {
            path: path.to_string(),
            reason: format!(
                "index checksum mismatch: stored {checksum:#010x}, computed {actual:#010x}"
            ),
        }
        .into());
    }
    let n = buf.len() / COMP_IDX_SIZE;
    out.clear();
    out.try_reserve_exact(n)
        .map_err(|_| TesselError::oom("index array", n * COMP_IDX_SIZE))?;
    let mut r = Reader::new(buf, "index region");
    for _ in 0..n {
        out.push(CompIdx::decode_from(&mut r)?);
    }
    Ok(())
}

/// Block descriptor.
///
/// A simple block has `num_sub_blocks == 1` and no `sub_blocks`. A
/// super-block with `n > 1` sub-blocks carries `n - 1` segments, each a
/// simple block in the same file; its `rows` and key range cover them all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompBlock {
    /// Byte offset of the block payload (first segment for a super-block).
    pub offset: u64,
    /// Payload length (total over segments for a super-block).
    pub len: u32,
    /// Column payload compression.
    pub algorithm: Compression,
    /// Sub-block count: 1, or 3 and above.
    pub num_sub_blocks: u8,
    /// True if the payload lives in the last file.
    pub last: bool,
    /// Row count.
    pub rows: u32,
    /// Columns present in the directory.
    pub num_cols: u16,
    /// First key.
    pub key_first: i64,
    /// Last key.
    pub key_last: i64,
    /// Schema version of the rows.
    pub sversion: i32,
    /// Segments of a super-block, in write order.
    pub sub_blocks: Vec<CompBlock>,
}

impl CompBlock {
    /// True if the block aggregates appended segments.
    #[must_use]
    pub fn is_super(&self) -> bool {
        self.num_sub_blocks > 1
    }

    /// The simple blocks that make up this block.
    #[must_use]
    pub fn segments(&self) -> &[CompBlock] {
        if self.is_super() {
            &self.sub_blocks
        } else {
            std::slice::from_ref(self)
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>, first_segment: u32) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&[
            self.algorithm.tag(),
            self.num_sub_blocks,
            u8::from(self.last),
            0,
        ]);
        out.extend_from_slice(&self.rows.to_le_bytes());
        out.extend_from_slice(&self.num_cols.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.key_first.to_le_bytes());
        out.extend_from_slice(&self.key_last.to_le_bytes());
        out.extend_from_slice(&self.sversion.to_le_bytes());
        out.extend_from_slice(&first_segment.to_le_bytes());
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<(Self, u32)> {
        let offset = r.u64()?;
        let len = r.u32()?;
        let tag = r.u8()?;
        let algorithm =
            Compression::from_tag(tag).ok_or_else(|| crate::error::CodecError::Malformed {
                what: "block descriptor",
                reason: format!("unknown compression tag {tag}"),
            })?;
        let num_sub_blocks = r.u8()?;
        let last = r.u8()? != 0;
        r.u8()?;
        let rows = r.u32()?;
        let num_cols = r.u16()?;
        r.u16()?;
        let block = Self {
            offset,
            len,
            algorithm,
            num_sub_blocks,
            last,
            rows,
            num_cols,
            key_first: r.i64()?,
            key_last: r.i64()?,
            sversion: r.i32()?,
            sub_blocks: Vec::new(),
        };
        let first_segment = r.u32()?;
        Ok((block, first_segment))
    }
}

/// In-memory block array of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompInfo {
    /// Table id the blob belongs to.
    pub tid: u32,
    /// Table uid.
    pub uid: u64,
    /// Super-blocks, ordered by key range.
    pub blocks: Vec<CompBlock>,
}

impl CompInfo {
    /// Encodes the block array into a blob. Returns the blob and its CRC-32.
    ///
    /// # Errors
    ///
    /// Returns [`TesselError::OutOfMemory`] if the buffer cannot be reserved.
    pub fn encode(&self) -> Result<(Vec<u8>, u32)> {
        let segments: usize = self.blocks.iter().map(|b| b.sub_blocks.len()).sum();
        let bytes = INFO_HEADER_SIZE + (self.blocks.len() + segments) * COMP_BLOCK_SIZE;
        let mut out = Vec::new();
        out.try_reserve_exact(bytes)
            .map_err(|_| TesselError::oom("block-info blob", bytes))?;

        out.extend_from_slice(&INFO_DELIMITER.to_le_bytes());
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&len_u32("super-block array", self.blocks.len())?.to_le_bytes());
        out.extend_from_slice(&len_u32("segment area", segments)?.to_le_bytes());

        let mut next_segment = 0u32;
        for block in &self.blocks {
            block.encode_into(&mut out, next_segment);
            next_segment += len_u32("segment list", block.sub_blocks.len())?;
        }
        for block in &self.blocks {
            for seg in &block.sub_blocks {
                seg.encode_into(&mut out, 0);
            }
        }
        let crc = crc32fast::hash(&out);
        Ok((out, crc))
    }

    /// Decodes a blob, verifying the checksum recorded in `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Corrupted`] if the checksum, delimiter, uid or
    /// segment references do not match.
    pub fn decode(buf: &[u8], idx: &CompIdx, path: &str) -> Result<Self> {
        let corrupted = |reason: String| -> TesselError {
            FileIoError::Corrupted {
                path: path.to_string(),
                reason,
            }
            .into()
        };
        let actual = crc32fast::hash(buf);
        if actual != idx.checksum {
            return Err(corrupted(format!(
                "block-info checksum mismatch: stored {:#010x}, computed {actual:#010x}",
                idx.checksum
            )));
        }

        let mut r = Reader::new(buf, "block-info blob");
        if r.u32()? != INFO_DELIMITER {
            return Err(corrupted("block-info delimiter missing".to_string()));
        }
        let tid = r.u32()?;
        let uid = r.u64()?;
        if uid != idx.uid {
            return Err(corrupted(format!(
                "block-info uid {uid} does not match index uid {}",
                idx.uid
            )));
        }
        let num_blocks = r.u32()? as usize;
        let num_segments = r.u32()? as usize;
        if r.remaining() != (num_blocks + num_segments) * COMP_BLOCK_SIZE {
            return Err(corrupted(format!(
                "block-info length {} does not fit {num_blocks} blocks and {num_segments} segments",
                buf.len()
            )));
        }

        let mut heads = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            heads.push(CompBlock::decode_from(&mut r)?);
        }
        let mut segments = Vec::with_capacity(num_segments);
        for _ in 0..num_segments {
            segments.push(CompBlock::decode_from(&mut r)?.0);
        }

        let mut blocks = Vec::with_capacity(num_blocks);
        for (mut block, first) in heads {
            if block.is_super() {
                let first = first as usize;
                let end = first + usize::from(block.num_sub_blocks) - 1;
                let Some(segs) = segments.get(first..end) else {
                    return Err(corrupted(format!(
                        "super-block segments {first}..{end} out of range ({num_segments})"
                    )));
                };
                block.sub_blocks = segs.to_vec();
            }
            blocks.push(block);
        }
        Ok(Self { tid, uid, blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(offset: u64, rows: u32, first: i64, last: i64) -> CompBlock {
        CompBlock {
            offset,
            len: 100,
            algorithm: Compression::Snappy,
            num_sub_blocks: 1,
            last: false,
            rows,
            num_cols: 3,
            key_first: first,
            key_last: last,
            sversion: 1,
            sub_blocks: Vec::new(),
        }
    }

    #[test]
    fn test_header_validation() {
        let header = FileHeader {
            max_tables: 8,
            fid: 3,
            key_min: 0,
            key_max: 999,
            last_gen: 2,
            idx_checksum: 0xdead_beef,
        };
        let mut bytes = header.encode();
        assert_eq!(FileHeader::decode(&bytes, "h").unwrap(), header);
        assert_eq!(header.prefix_len(), HEAD_SIZE + 8 * COMP_IDX_SIZE);

        bytes[20] ^= 0xff;
        let err = FileHeader::decode(&bytes, "h").unwrap_err();
        assert!(err.to_string().contains("header checksum mismatch"));

        bytes[0] = b'X';
        let err = FileHeader::decode(&bytes, "h").unwrap_err();
        assert!(err.to_string().contains("invalid magic"));

        assert!(FileHeader::decode(&bytes[..10], "h").is_err());
    }

    #[test]
    fn test_idx_region_checksum() {
        let mut idx = vec![CompIdx::default(); 4];
        idx[2] = CompIdx {
            uid: 7,
            offset: 500,
            len: 72,
            checksum: 1,
            max_key: 42,
            num_super_blocks: 1,
            has_last: true,
        };
        let region = encode_idx_region(&idx).unwrap();
        assert_eq!(region.len(), 4 * COMP_IDX_SIZE);
        let crc = crc32fast::hash(&region);
        let mut out = Vec::new();
        decode_idx_region(&region, crc, "h", &mut out).unwrap();
        assert_eq!(out, idx);
        assert!(decode_idx_region(&region, crc ^ 1, "h", &mut out).is_err());
    }

    #[test]
    fn test_comp_info_with_segments() {
        let mut sup = simple(0, 0, 0, 0);
        sup.num_sub_blocks = 3;
        sup.sub_blocks = vec![simple(16, 10, 1, 10), simple(200, 5, 11, 15)];
        sup.offset = 16;
        sup.rows = 15;
        sup.key_first = 1;
        sup.key_last = 15;
        let info = CompInfo {
            tid: 4,
            uid: 99,
            blocks: vec![sup, simple(300, 20, 16, 35)],
        };

        let (blob, crc) = info.encode().unwrap();
        assert_eq!(blob.len(), INFO_HEADER_SIZE + 4 * COMP_BLOCK_SIZE);
        let idx = CompIdx {
            uid: 99,
            offset: 1,
            len: 1,
            checksum: crc,
            ..CompIdx::default()
        };
        let decoded = CompInfo::decode(&blob, &idx, "h").unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.blocks[0].segments().len(), 2);
        assert_eq!(decoded.blocks[1].segments().len(), 1);
    }

    #[test]
    fn test_comp_info_rejects_wrong_uid() {
        let info = CompInfo {
            tid: 0,
            uid: 5,
            blocks: vec![simple(16, 1, 1, 1)],
        };
        let (blob, crc) = info.encode().unwrap();
        let idx = CompIdx {
            uid: 6,
            checksum: crc,
            ..CompIdx::default()
        };
        let err = CompInfo::decode(&blob, &idx, "h").unwrap_err();
        assert!(err.to_string().contains("does not match index uid"));
    }
}
