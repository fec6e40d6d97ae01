//! Poll requests and responses.
//!
//! A poll resolves its start offset, raises the subscription's epoch to the
//! request's epoch, then reads log entries one by one. The first entry that
//! produces rows ends the scan (one batch per poll); entries that produce
//! nothing are counted as skipped. If a newer epoch shows up mid-scan the
//! poll is abandoned and nothing is returned for it.
//!
//! # Response format
//!
//! ```text
//! header: u16 msg type | i32 epoch | i64 consumer id
//! body:   i64 req offset | i64 rsp offset | i64 skip count | i32 block count
//! block:  u32 length | i64 use_seconds | u8 precision | u8 compressed
//!         | u8 completed | u32 rows | encoded block
//! ```

use tracing::{debug, warn};

use crate::block;
use crate::config::{Compression, Precision, TqConfig};
use crate::error::{CodecError, Result};
use crate::index::Reader;
use crate::tq::exec::StreamInput;
use crate::tq::registry::Exec;
use crate::tq::submit::SubmitMsg;
use crate::tq::wal::{MsgType, WalReader};

/// Message type of a poll response.
pub const MSG_TYPE_POLL_RSP: u16 = 0x0201;

const RETRIEVE_HEADER_SIZE: usize = 15;

/// Where a poll starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOffset {
    /// The first retained log version.
    Earliest,
    /// The last written log version.
    Latest,
    /// The entry after this already-consumed version.
    After(i64),
}

impl FetchOffset {
    /// Wire value of [`FetchOffset::Earliest`].
    pub const EARLIEST: i64 = -2;
    /// Wire value of [`FetchOffset::Latest`].
    pub const LATEST: i64 = -1;

    /// Parses a wire offset.
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            Self::EARLIEST => Self::Earliest,
            Self::LATEST => Self::Latest,
            v => Self::After(v),
        }
    }

    /// Wire offset.
    #[must_use]
    pub fn raw(self) -> i64 {
        match self {
            Self::Earliest => Self::EARLIEST,
            Self::Latest => Self::LATEST,
            Self::After(v) => v,
        }
    }

    /// First version to read from `wal`.
    #[must_use]
    pub fn resolve(self, wal: &dyn WalReader) -> i64 {
        match self {
            Self::Earliest => wal.first_version(),
            Self::Latest => wal.last_version(),
            Self::After(v) => v + 1,
        }
    }
}

/// A consumer's poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    /// Polling consumer.
    pub consumer_id: i64,
    /// Epoch the consumer believes is current.
    pub epoch: i32,
    /// Subscription key.
    pub sub_key: String,
    /// Start position.
    pub offset: FetchOffset,
}

/// One encoded result block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRsp {
    /// Progress timestamp reported by the executor.
    pub use_seconds: i64,
    /// Timestamp precision.
    pub precision: Precision,
    /// True if column payloads are compressed.
    pub compressed: bool,
    /// Always true: each block is complete.
    pub completed: bool,
    /// Row count.
    pub num_rows: u32,
    /// Encoded block.
    pub payload: Vec<u8>,
}

/// The single reply to a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResponse {
    /// Request epoch, mirrored.
    pub epoch: i32,
    /// Consumer id, mirrored.
    pub consumer_id: i64,
    /// Request offset (wire value), mirrored.
    pub req_offset: i64,
    /// Last version consumed; `fetch - 1` if nothing was produced.
    pub rsp_offset: i64,
    /// Entries read that produced no rows.
    pub skip_log_num: i64,
    /// Result blocks.
    pub blocks: Vec<RetrieveRsp>,
}

impl PollResponse {
    /// Encodes the reply message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self
            .blocks
            .iter()
            .map(|b| 4 + RETRIEVE_HEADER_SIZE + b.payload.len())
            .sum();
        let mut out = Vec::with_capacity(14 + 28 + body);
        out.extend_from_slice(&MSG_TYPE_POLL_RSP.to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.consumer_id.to_le_bytes());
        out.extend_from_slice(&self.req_offset.to_le_bytes());
        out.extend_from_slice(&self.rsp_offset.to_le_bytes());
        out.extend_from_slice(&self.skip_log_num.to_le_bytes());
        out.extend_from_slice(&i32::try_from(self.blocks.len()).unwrap_or(i32::MAX).to_le_bytes());
        for b in &self.blocks {
            let len = u32::try_from(RETRIEVE_HEADER_SIZE + b.payload.len()).unwrap_or(u32::MAX);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&b.use_seconds.to_le_bytes());
            out.push(b.precision.code());
            out.push(u8::from(b.compressed));
            out.push(u8::from(b.completed));
            out.extend_from_slice(&b.num_rows.to_le_bytes());
            out.extend_from_slice(&b.payload);
        }
        out
    }

    /// Decodes a reply message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the message is truncated or has
    /// the wrong type.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let malformed = |reason: String| CodecError::Malformed {
            what: "poll response",
            reason,
        };
        let mut r = Reader::new(bytes, "poll response");
        let msg_type = r.u16()?;
        if msg_type != MSG_TYPE_POLL_RSP {
            return Err(malformed(format!("unexpected message type {msg_type:#06x}")).into());
        }
        let epoch = r.i32()?;
        let consumer_id = r.i64()?;
        let req_offset = r.i64()?;
        let rsp_offset = r.i64()?;
        let skip_log_num = r.i64()?;
        let count = r.i32()?;
        let count = usize::try_from(count).map_err(|_| malformed(format!("negative block count {count}")))?;

        let mut blocks = Vec::with_capacity(count.min(r.remaining() / 4));
        for _ in 0..count {
            let len = r.u32()? as usize;
            let mut b = Reader::new(r.take(len)?, "poll response block");
            let use_seconds = b.i64()?;
            let code = b.u8()?;
            let precision = Precision::from_code(code)
                .ok_or_else(|| malformed(format!("unknown precision {code}")))?;
            let compressed = b.u8()? != 0;
            let completed = b.u8()? != 0;
            let num_rows = b.u32()?;
            let payload = b.take(b.remaining())?.to_vec();
            blocks.push(RetrieveRsp {
                use_seconds,
                precision,
                compressed,
                completed,
                num_rows,
                payload,
            });
        }
        Ok(Self {
            epoch,
            consumer_id,
            req_offset,
            rsp_offset,
            skip_log_num,
            blocks,
        })
    }
}

/// Result of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The reply to send.
    Response(PollResponse),
    /// A newer epoch took over while scanning; nothing is sent.
    Superseded {
        /// The live epoch that superseded the request.
        live_epoch: i32,
        /// The offset the scan had reached.
        offset: i64,
    },
}

/// Runs one poll against `exec` on worker slot `worker`. The live epoch is
/// checked before every log read and once more before the reply is built.
pub(crate) fn poll(
    exec: &Exec,
    wal: &dyn WalReader,
    config: &TqConfig,
    req: &PollRequest,
    worker: usize,
) -> Result<PollOutcome> {
    let mut fetch = req.offset.resolve(wal);
    debug!(
        target: "tessel::tq",
        consumer_id = req.consumer_id,
        epoch = req.epoch,
        sub_key = %req.sub_key,
        req_offset = req.offset.raw(),
        offset = fetch,
        "poll received"
    );
    exec.advance_epoch(req.epoch);

    let mut blocks = Vec::new();
    let mut skipped = 0i64;
    loop {
        let live = exec.epoch();
        if live > req.epoch {
            warn!(
                target: "tessel::tq",
                consumer_id = req.consumer_id,
                epoch = req.epoch,
                live_epoch = live,
                offset = fetch,
                "poll superseded by newer epoch"
            );
            return Ok(PollOutcome::Superseded {
                live_epoch: live,
                offset: fetch,
            });
        }

        let Some(entry) = exec.read_at(fetch)? else {
            debug!(target: "tessel::tq", consumer_id = req.consumer_id, offset = fetch, "no more log");
            break;
        };
        debug!(
            target: "tessel::tq",
            consumer_id = req.consumer_id,
            offset = fetch,
            msg_type = entry.msg_type.code(),
            "poll iterating log"
        );

        if entry.msg_type == MsgType::Submit {
            let msg = SubmitMsg::decode(&entry.body)?;
            let mut executor = exec.executor(worker)?;
            executor.set_input(StreamInput::Submit(msg))?;
            while let Some(out) = executor.next_block()? {
                let rows = out.cols.num_rows();
                let encoded = block::encode_block(&out.cols, 0..rows, out.uid, config.response_compression)?;
                blocks.push(RetrieveRsp {
                    use_seconds: out.ts,
                    precision: config.precision,
                    compressed: config.response_compression != Compression::None,
                    completed: true,
                    num_rows: encoded.comp_data.rows,
                    payload: encoded.bytes,
                });
            }
        }

        if !blocks.is_empty() {
            break;
        }
        skipped += 1;
        fetch += 1;
    }

    // The epoch may have moved while the executor ran.
    let live = exec.epoch();
    if live > req.epoch {
        warn!(
            target: "tessel::tq",
            consumer_id = req.consumer_id,
            epoch = req.epoch,
            live_epoch = live,
            offset = fetch,
            blocks = blocks.len(),
            "poll superseded before reply"
        );
        return Ok(PollOutcome::Superseded {
            live_epoch: live,
            offset: fetch,
        });
    }

    let rsp_offset = if blocks.is_empty() { fetch - 1 } else { fetch };
    debug!(
        target: "tessel::tq",
        consumer_id = req.consumer_id,
        epoch = req.epoch,
        blocks = blocks.len(),
        req_offset = req.offset.raw(),
        rsp_offset,
        "poll response ready"
    );
    Ok(PollOutcome::Response(PollResponse {
        epoch: req.epoch,
        consumer_id: req.consumer_id,
        req_offset: req.offset.raw(),
        rsp_offset,
        skip_log_num: skipped,
        blocks,
    }))
}

/// Decodes the payload of a [`RetrieveRsp`] back into rows, given the
/// column layout the subscription projects.
///
/// # Errors
///
/// Returns any block-codec error.
pub fn decode_retrieved(
    rsp: &RetrieveRsp,
    specs: &[crate::cols::ColumnSpec],
    sversion: i32,
) -> Result<crate::cols::DataCols> {
    let algorithm = if rsp.compressed { Compression::Snappy } else { Compression::None };
    block::decode_block(&rsp.payload, "<poll response>", algorithm, specs, sversion, None)
}
