//! Block payload codec.
//!
//! # Block Format
//!
//! ```text
//! [0..24)          header: delimiter u32, num_cols u32, uid u64, rows u32, crc u32
//! [24..24+16*n)    CompCol[n]: col_id i16, type u8, flags u8, len u32, offset u32, crc u32
//! [..)             column payloads, back to back
//! ```
//!
//! A column payload is the column's little-endian values followed, when the
//! column has nulls, by a null bitmap (bit set = null). With Snappy the whole
//! payload is raw-compressed and `len` is the compressed length. Columns that
//! are entirely null are left out of the directory. The header CRC covers the
//! first 20 header bytes and the directory; each column CRC covers its stored
//! bytes.

use std::ops::Range;

use crate::cols::{ColumnData, ColumnSpec, ColumnType, DataCols};
use crate::config::Compression;
use crate::error::{CodecError, ConsistencyError, FileIoError, Result, TesselError, len_u32};
use crate::group::TsFile;
use crate::index::{CompBlock, Reader};

/// Marks the start of a block payload.
pub const BLOCK_DELIMITER: u32 = 0xB10C_DA7A;

/// Size of the block header.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Size of one column directory entry.
pub const COMP_COL_SIZE: usize = 16;

const FLAG_HAS_NULLS: u8 = 0x01;

/// Column directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompCol {
    /// Column id.
    pub col_id: i16,
    /// Value type.
    pub ty: ColumnType,
    /// Payload carries a null bitmap.
    pub has_nulls: bool,
    /// Stored payload length.
    pub len: u32,
    /// Payload offset from the end of the directory.
    pub offset: u32,
    /// CRC-32 of the stored payload.
    pub checksum: u32,
}

/// Decoded block header and column directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompData {
    /// Table uid.
    pub uid: u64,
    /// Row count.
    pub rows: u32,
    /// Column directory.
    pub cols: Vec<CompCol>,
}

impl CompData {
    /// Bytes taken by the header and directory.
    #[must_use]
    pub fn directory_len(&self) -> usize {
        BLOCK_HEADER_SIZE + COMP_COL_SIZE * self.cols.len()
    }

    /// Parses the header and directory at the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::Corrupted`] on a bad delimiter, checksum or
    /// type tag, or if the input is too short.
    pub fn decode(bytes: &[u8], path: &str) -> Result<Self> {
        let corrupted = |reason: String| -> TesselError {
            FileIoError::Corrupted {
                path: path.to_string(),
                reason,
            }
            .into()
        };
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(corrupted(format!("block truncated at {} bytes", bytes.len())));
        }
        let mut r = Reader::new(bytes, "block header");
        if r.u32()? != BLOCK_DELIMITER {
            return Err(corrupted("block delimiter missing".to_string()));
        }
        let num_cols = r.u32()? as usize;
        let uid = r.u64()?;
        let rows = r.u32()?;
        let stored = r.u32()?;

        let dir_end = BLOCK_HEADER_SIZE + num_cols * COMP_COL_SIZE;
        if bytes.len() < dir_end {
            return Err(corrupted(format!(
                "column directory of {num_cols} entries truncated"
            )));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..20]);
        hasher.update(&bytes[BLOCK_HEADER_SIZE..dir_end]);
        let actual = hasher.finalize();
        if actual != stored {
            return Err(corrupted(format!(
                "block checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }

        let mut cols = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            let col_id = r.i16()?;
            let tag = r.u8()?;
            let ty = ColumnType::from_tag(tag)
                .ok_or_else(|| corrupted(format!("unknown column type tag {tag}")))?;
            let flags = r.u8()?;
            cols.push(CompCol {
                col_id,
                ty,
                has_nulls: flags & FLAG_HAS_NULLS != 0,
                len: r.u32()?,
                offset: r.u32()?,
                checksum: r.u32()?,
            });
        }
        Ok(Self { uid, rows, cols })
    }
}

/// Bytes of an encoded block and its directory.
#[derive(Debug)]
pub struct EncodedBlock {
    /// The full block payload.
    pub bytes: Vec<u8>,
    /// The directory written at its head.
    pub comp_data: CompData,
}

/// Encodes rows `range` of `cols`.
///
/// # Errors
///
/// Returns [`CodecError::Compress`] if Snappy fails, or
/// [`TesselError::OutOfMemory`].
pub fn encode_block(
    cols: &DataCols,
    range: Range<usize>,
    uid: u64,
    compression: Compression,
) -> Result<EncodedBlock> {
    let rows = range.len();
    let mut dir = Vec::new();
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    let mut offset = 0u32;

    for col in cols.columns() {
        let nulls = &col.nulls()[range.clone()];
        if nulls.iter().all(|n| *n) {
            continue;
        }
        let has_nulls = nulls.iter().any(|n| *n);
        let width = col.spec().ty.width();

        let mut raw = Vec::new();
        let raw_len = rows * width + if has_nulls { rows.div_ceil(8) } else { 0 };
        raw.try_reserve_exact(raw_len)
            .map_err(|_| TesselError::oom("column payload", raw_len))?;
        raw.extend_from_slice(&col.bytes()[range.start * width..range.end * width]);
        if has_nulls {
            let mut bitmap = vec![0u8; rows.div_ceil(8)];
            for (i, _) in nulls.iter().enumerate().filter(|(_, n)| **n) {
                bitmap[i / 8] |= 1 << (i % 8);
            }
            raw.extend_from_slice(&bitmap);
        }

        let stored = match compression {
            Compression::None => raw,
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(&raw)
                .map_err(|source| CodecError::Compress { source })?,
        };
        let len = len_u32("column payload", stored.len())?;
        dir.push(CompCol {
            col_id: col.spec().id,
            ty: col.spec().ty,
            has_nulls,
            len,
            offset,
            checksum: crc32fast::hash(&stored),
        });
        offset = len_u32("block payload", offset as usize + stored.len())?;
        payloads.push(stored);
    }

    let comp_data = CompData {
        uid,
        rows: len_u32("block rows", rows)?,
        cols: dir,
    };
    let total = comp_data.directory_len() + offset as usize;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(total)
        .map_err(|_| TesselError::oom("block buffer", total))?;
    bytes.extend_from_slice(&BLOCK_DELIMITER.to_le_bytes());
    bytes.extend_from_slice(&len_u32("column directory", comp_data.cols.len())?.to_le_bytes());
    bytes.extend_from_slice(&uid.to_le_bytes());
    bytes.extend_from_slice(&comp_data.rows.to_le_bytes());
    bytes.extend_from_slice(&[0; 4]);
    for c in &comp_data.cols {
        bytes.extend_from_slice(&c.col_id.to_le_bytes());
        bytes.push(c.ty.tag());
        bytes.push(if c.has_nulls { FLAG_HAS_NULLS } else { 0 });
        bytes.extend_from_slice(&c.len.to_le_bytes());
        bytes.extend_from_slice(&c.offset.to_le_bytes());
        bytes.extend_from_slice(&c.checksum.to_le_bytes());
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..20]);
    hasher.update(&bytes[BLOCK_HEADER_SIZE..]);
    let crc = hasher.finalize();
    bytes[20..24].copy_from_slice(&crc.to_le_bytes());
    for p in &payloads {
        bytes.extend_from_slice(p);
    }

    Ok(EncodedBlock { bytes, comp_data })
}

/// Decodes a block payload into a batch laid out as `specs`.
///
/// Only columns in `wanted` are decoded (the key column always is); the
/// rest, and columns absent from the directory, come back all-null.
///
/// # Errors
///
/// Returns [`FileIoError::Corrupted`] on any checksum, length or type
/// mismatch, or [`CodecError::Decompress`].
pub fn decode_block(
    bytes: &[u8],
    path: &str,
    algorithm: Compression,
    specs: &[ColumnSpec],
    sversion: i32,
    wanted: Option<&[i16]>,
) -> Result<DataCols> {
    let comp = CompData::decode(bytes, path)?;
    let rows = comp.rows as usize;
    let base = comp.directory_len();
    let corrupted = |reason: String| -> TesselError {
        FileIoError::Corrupted {
            path: path.to_string(),
            reason,
        }
        .into()
    };

    let mut out = Vec::with_capacity(specs.len());
    for (pos, spec) in specs.iter().enumerate() {
        let selected = pos == 0 || wanted.is_none_or(|ids| ids.contains(&spec.id));
        let entry = comp.cols.iter().find(|c| c.col_id == spec.id);
        let (true, Some(entry)) = (selected, entry) else {
            if pos == 0 {
                return Err(corrupted("block has no key column".to_string()));
            }
            out.push(ColumnData::null_filled(*spec, rows)?);
            continue;
        };
        if entry.ty != spec.ty {
            return Err(corrupted(format!(
                "column {} stored as {:?}, schema says {:?}",
                spec.id, entry.ty, spec.ty
            )));
        }

        let start = base + entry.offset as usize;
        let stored = bytes
            .get(start..start + entry.len as usize)
            .ok_or_else(|| corrupted(format!("column {} payload out of bounds", spec.id)))?;
        if crc32fast::hash(stored) != entry.checksum {
            return Err(corrupted(format!("column {} checksum mismatch", spec.id)));
        }
        let raw = match algorithm {
            Compression::None => stored.to_vec(),
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(stored)
                .map_err(|source| CodecError::Decompress { source })?,
        };

        let width = spec.ty.width();
        let bitmap_len = if entry.has_nulls { rows.div_ceil(8) } else { 0 };
        if raw.len() != rows * width + bitmap_len {
            return Err(corrupted(format!(
                "column {} payload is {} bytes, expected {}",
                spec.id,
                raw.len(),
                rows * width + bitmap_len
            )));
        }
        let nulls = if entry.has_nulls {
            let bitmap = &raw[rows * width..];
            (0..rows).map(|i| bitmap[i / 8] & (1 << (i % 8)) != 0).collect()
        } else {
            vec![false; rows]
        };
        let mut data = raw;
        data.truncate(rows * width);
        out.push(ColumnData::from_parts(*spec, data, nulls));
    }

    Ok(DataCols::from_columns(sversion, out, rows))
}

/// Encodes rows `range` of `cols` and appends the block to `file`.
///
/// The returned descriptor is a simple block (one sub-block). If the append
/// fails the file is left at its previous length and nothing is returned,
/// so the caller has no descriptor to commit.
///
/// # Errors
///
/// Returns [`ConsistencyError::InvalidBatch`] if `range` is empty or runs
/// past the batch, [`FileIoError::Write`] on a failed append, or any
/// encoding error.
pub fn write_block_to_file(
    file: &mut TsFile,
    cols: &DataCols,
    range: Range<usize>,
    uid: u64,
    last: bool,
    compression: Compression,
) -> Result<CompBlock> {
    if range.is_empty() || range.end > cols.num_rows() {
        return Err(ConsistencyError::InvalidBatch {
            reason: format!(
                "row range {}..{} is empty or beyond the batch's {} rows",
                range.start,
                range.end,
                cols.num_rows()
            ),
        }
        .into());
    }
    let key_first = cols.key_at(range.start);
    let key_last = cols.key_at(range.end - 1);
    let encoded = encode_block(cols, range, uid, compression)?;
    let offset = file.append(&encoded.bytes)?;

    Ok(CompBlock {
        offset,
        len: len_u32("block", encoded.bytes.len())?,
        algorithm: compression,
        num_sub_blocks: 1,
        last,
        rows: encoded.comp_data.rows,
        num_cols: u16::try_from(encoded.comp_data.cols.len()).map_err(|_| CodecError::TooLarge {
            what: "column directory",
            len: encoded.comp_data.cols.len(),
        })?,
        key_first,
        key_last,
        sversion: cols.sversion(),
        sub_blocks: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cols::Value;
    use crate::cols::tests::{batch, test_schema};
    use crate::group::OpenMode;

    #[test]
    fn test_encode_decode_with_nulls() {
        let schema = test_schema();
        let mut cols = DataCols::new(&schema, 0).unwrap();
        for k in 0..20 {
            let v = if k % 3 == 0 { Value::Null } else { Value::Double(f64::from(k)) };
            cols.push_row(&[Value::Timestamp(k.into()), v]).unwrap();
        }

        for compression in [Compression::None, Compression::Snappy] {
            let enc = encode_block(&cols, 0..20, 11, compression).unwrap();
            // column 2 is entirely null and skipped
            assert_eq!(enc.comp_data.cols.len(), 2);
            assert!(enc.comp_data.cols[1].has_nulls);

            let back =
                decode_block(&enc.bytes, "t", compression, &schema.columns, 1, None).unwrap();
            assert_eq!(back.num_rows(), 20);
            for r in 0..20 {
                assert_eq!(back.row(r), cols.row(r));
            }
            assert!(back.is_all_null(2));
        }
    }

    #[test]
    fn test_decode_selected_columns() {
        let schema = test_schema();
        let cols = batch(&schema, 1..=10);
        let enc = encode_block(&cols, 2..6, 1, Compression::Snappy).unwrap();

        let back =
            decode_block(&enc.bytes, "t", Compression::Snappy, &schema.columns, 1, Some(&[2]))
                .unwrap();
        assert_eq!(back.num_rows(), 4);
        assert_eq!(back.key_first(), Some(3));
        assert_eq!(back.value_at(2, 0), Value::Int(3));
        assert!(back.is_all_null(1));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let schema = test_schema();
        let cols = batch(&schema, 1..=10);
        let mut enc = encode_block(&cols, 0..10, 1, Compression::None).unwrap();
        let last = enc.bytes.len() - 1;
        enc.bytes[last] ^= 0x55;
        let err = decode_block(&enc.bytes, "t", Compression::None, &schema.columns, 1, None)
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));

        enc.bytes[0] = 0;
        assert!(CompData::decode(&enc.bytes, "t").is_err());
    }

    #[test]
    fn test_write_block_to_file_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = TsFile::open(dir.path().join("d"), OpenMode::Create).unwrap();
        file.append(&[0; 16]).unwrap();

        let schema = test_schema();
        let cols = batch(&schema, 1..=100);
        let blk =
            write_block_to_file(&mut file, &cols, 0..40, 5, false, Compression::Snappy).unwrap();

        assert_eq!(blk.offset, 16);
        assert_eq!(u64::from(blk.len), file.len() - 16);
        assert_eq!(blk.rows, 40);
        assert_eq!((blk.key_first, blk.key_last), (1, 40));
        assert_eq!(blk.num_cols, 3);
        assert_eq!(blk.num_sub_blocks, 1);

        let bytes = file.read_at(blk.offset, blk.len as usize).unwrap();
        let comp = CompData::decode(&bytes, "d").unwrap();
        assert_eq!(comp.rows, 40);
        assert_eq!(comp.uid, 5);
    }

    #[test]
    fn test_write_block_to_file_rejects_bad_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = TsFile::open(dir.path().join("d"), OpenMode::Create).unwrap();
        let cols = batch(&test_schema(), 1..=10);

        for range in [0..0, 5..5, 8..11] {
            let err = write_block_to_file(&mut file, &cols, range, 5, false, Compression::None)
                .unwrap_err();
            assert!(matches!(
                err,
                TesselError::Consistency(ConsistencyError::InvalidBatch { .. })
            ));
        }
        assert_eq!(file.len(), 0);
    }
}
