//! Data-submission messages carried in the log.
//!
//! # Wire format
//!
//! ```text
//! magic "TSUB" | u32 block count
//! per block:
//!   u64 uid | i32 sversion | u8 compression | u16 column count
//!   column count × (i16 id, u8 type tag)
//!   u32 payload length | encoded block (see the block codec)
//! ```
//!
//! All integers are little-endian.

use crate::block;
use crate::cols::{ColumnSpec, ColumnType, DataCols};
use crate::config::Compression;
use crate::error::{CodecError, ConsistencyError, FileIoError, Result, TesselError, len_u32};
use crate::index::Reader;

const SUBMIT_MAGIC: &[u8; 4] = b"TSUB";

/// Rows for one table inside a submission.
#[derive(Debug, Clone)]
pub struct SubmitBlock {
    /// Table uid.
    pub uid: u64,
    /// Rows, sorted by key.
    pub rows: DataCols,
}

/// A batch of per-table rows written to the log as one entry.
#[derive(Debug, Clone, Default)]
pub struct SubmitMsg {
    /// One entry per table.
    pub blocks: Vec<SubmitBlock>,
}

impl SubmitMsg {
    /// Wraps a single table's rows.
    #[must_use]
    pub fn single(uid: u64, rows: DataCols) -> Self {
        Self {
            blocks: vec![SubmitBlock { uid, rows }],
        }
    }

    /// Total rows across blocks.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.blocks.iter().map(|b| b.rows.num_rows()).sum()
    }

    /// Encodes the message.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::InvalidBatch`] if a block has no rows,
    /// or any block-codec error.
    pub fn encode(&self, compression: Compression) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(SUBMIT_MAGIC);
        out.extend_from_slice(&len_u32("submit block list", self.blocks.len())?.to_le_bytes());
        for blk in &self.blocks {
            let rows = blk.rows.num_rows();
            if rows == 0 {
                return Err(ConsistencyError::InvalidBatch {
                    reason: format!("submit block for uid {} has no rows", blk.uid),
                }
                .into());
            }
            let encoded = block::encode_block(&blk.rows, 0..rows, blk.uid, compression)?;

            out.extend_from_slice(&blk.uid.to_le_bytes());
            out.extend_from_slice(&blk.rows.sversion().to_le_bytes());
            out.push(compression.tag());
            let specs: Vec<ColumnSpec> = blk.rows.columns().iter().map(|c| c.spec()).collect();
            let num_specs = u16::try_from(specs.len()).map_err(|_| CodecError::TooLarge {
                what: "submit column list",
                len: specs.len(),
            })?;
            out.extend_from_slice(&num_specs.to_le_bytes());
            for spec in &specs {
                out.extend_from_slice(&spec.id.to_le_bytes());
                out.push(spec.ty.tag());
            }
            let len = len_u32("submit block", encoded.bytes.len())?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&encoded.bytes);
        }
        Ok(out)
    }

    /// Decodes a message produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the bytes are truncated or carry
    /// an unknown tag or a corrupted block.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let malformed = |reason: String| -> TesselError {
            CodecError::Malformed {
                what: "submit message",
                reason,
            }
            .into()
        };
        let mut r = Reader::new(bytes, "submit message");
        if r.take(4)? != SUBMIT_MAGIC {
            return Err(malformed("bad magic".to_string()));
        }
        let count = r.u32()? as usize;
        let mut blocks = Vec::new();
        blocks
            .try_reserve(count)
            .map_err(|_| TesselError::oom("submit blocks", count))?;

        for _ in 0..count {
            let uid = r.u64()?;
            let sversion = r.i32()?;
            let tag = r.u8()?;
            let compression = Compression::from_tag(tag)
                .ok_or_else(|| malformed(format!("unknown compression tag {tag}")))?;
            let ncols = r.u16()? as usize;
            let mut specs = Vec::with_capacity(ncols);
            for _ in 0..ncols {
                let id = r.i16()?;
                let tag = r.u8()?;
                let ty = ColumnType::from_tag(tag)
                    .ok_or_else(|| malformed(format!("unknown column type tag {tag}")))?;
                specs.push(ColumnSpec { id, ty });
            }
            let len = r.u32()? as usize;
            let payload = r.take(len)?;
            let rows = block::decode_block(payload, "<submit>", compression, &specs, sversion, None)
                .map_err(|e| match e {
                    TesselError::FileIo(FileIoError::Corrupted { reason, .. }) => malformed(reason),
                    other => other,
                })?;
            blocks.push(SubmitBlock { uid, rows });
        }
        if r.remaining() != 0 {
            return Err(malformed(format!("{} trailing bytes", r.remaining())));
        }
        Ok(Self { blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cols::tests::{batch, test_schema};

    #[test]
    fn test_submit_round_trip() {
        let schema = test_schema();
        let msg = SubmitMsg {
            blocks: vec![
                SubmitBlock { uid: 7, rows: batch(&schema, 1..=4) },
                SubmitBlock { uid: 9, rows: batch(&schema, [100, 200]) },
            ],
        };
        let bytes = msg.encode(Compression::Snappy).unwrap();
        let back = SubmitMsg::decode(&bytes).unwrap();
        assert_eq!(back.blocks.len(), 2);
        assert_eq!(back.num_rows(), 6);
        assert_eq!(back.blocks[1].uid, 9);
        assert_eq!(back.blocks[1].rows.row(1), msg.blocks[1].rows.row(1));
    }

    #[test]
    fn test_submit_rejects_garbage() {
        assert!(SubmitMsg::decode(b"nope").is_err());
        let schema = test_schema();
        let bytes = SubmitMsg::single(1, batch(&schema, [1]))
            .encode(Compression::None)
            .unwrap();
        assert!(SubmitMsg::decode(&bytes[..bytes.len() - 3]).is_err());

        let empty = SubmitMsg::single(1, batch(&schema, []));
        assert!(empty.encode(Compression::None).is_err());
    }
}
