//! Integration tests for the log-consumption layer.
//!
//! A [`MemWal`] stands in for the write-ahead log; every test drives the
//! public [`Tq`] API the way a vnode's worker threads would.

use std::sync::{Arc, OnceLock};

use tempfile::tempdir;
use tessel::error::ConsistencyError;
use tessel::tq::poll::decode_retrieved;
use tessel::tq::{
    Exec, FetchOffset, MemWal, MsgType, NO_CONSUMER, PollOutcome, PollRequest, PollResponse,
    QueryCompiler, QueryPlan, RebalanceRequest, ResultBlock, ScanCompiler, StreamExecutor,
    StreamInput, SubmitBlock, SubmitMsg,
};
use tessel::{
    ColumnSpec, ColumnType, Compression, DataCols, Schema, TesselError, Tq, TqConfig, Value,
};

fn schema() -> Schema {
    Schema::new(
        1,
        vec![
            ColumnSpec { id: 0, ty: ColumnType::Timestamp },
            ColumnSpec { id: 1, ty: ColumnType::Double },
            ColumnSpec { id: 2, ty: ColumnType::Int },
        ],
    )
    .unwrap()
}

fn rows(keys: std::ops::RangeInclusive<i64>) -> DataCols {
    let mut cols = DataCols::new(&schema(), 16).unwrap();
    for k in keys {
        cols.push_row(&[
            Value::Timestamp(k),
            Value::Double(k as f64),
            Value::Int(i32::try_from(k).unwrap()),
        ])
        .unwrap();
    }
    cols
}

fn submit(wal: &MemWal, uid: u64, keys: std::ops::RangeInclusive<i64>) -> i64 {
    let body = SubmitMsg::single(uid, rows(keys))
        .encode(Compression::Snappy)
        .unwrap();
    wal.append(MsgType::Submit, &body).unwrap()
}

fn open(wal: &MemWal, meta: Option<std::path::PathBuf>) -> Tq {
    Tq::open(TqConfig::default(), Arc::new(wal.clone()), Arc::new(ScanCompiler), meta).unwrap()
}

fn subscribe(tq: &Tq, sub_key: &str, consumer: i64, plan: QueryPlan) {
    tq.apply_rebalance(&RebalanceRequest {
        sub_key: sub_key.to_string(),
        old_consumer_id: NO_CONSUMER,
        new_consumer_id: consumer,
        plan,
    })
    .unwrap();
}

fn poll(tq: &Tq, sub_key: &str, epoch: i32, offset: FetchOffset) -> PollResponse {
    let req = PollRequest {
        consumer_id: 1,
        epoch,
        sub_key: sub_key.to_string(),
        offset,
    };
    match tq.process_poll_req(&req, 0).unwrap() {
        PollOutcome::Response(rsp) => rsp,
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_latest_on_empty_log() {
    let wal = MemWal::new();
    let tq = open(&wal, None);
    subscribe(&tq, "cg:t", 1, QueryPlan::default());

    let rsp = poll(&tq, "cg:t", 0, FetchOffset::Latest);
    assert_eq!(rsp.req_offset, FetchOffset::LATEST);
    assert_eq!(rsp.rsp_offset, -2);
    assert_eq!(rsp.skip_log_num, 0);
    assert!(rsp.blocks.is_empty());
}

#[test]
fn test_poll_skips_entries_without_rows() {
    let wal = MemWal::new();
    wal.append(MsgType::Other(0x31), b"config change").unwrap();
    submit(&wal, 9, 1..=4);
    submit(&wal, 1, 10..=15);

    let tq = open(&wal, None);
    subscribe(&tq, "cg:t", 1, QueryPlan {
        tables: vec![1],
        ..QueryPlan::default()
    });

    let rsp = poll(&tq, "cg:t", 0, FetchOffset::Earliest);
    assert_eq!(rsp.skip_log_num, 2);
    assert_eq!(rsp.rsp_offset, 2);
    assert_eq!(rsp.blocks.len(), 1);
    assert_eq!(rsp.blocks[0].num_rows, 6);
    assert_eq!(rsp.blocks[0].use_seconds, 15);
    assert!(rsp.blocks[0].compressed);

    let decoded = decode_retrieved(&rsp.blocks[0], &schema().columns, 1).unwrap();
    assert_eq!(decoded.num_rows(), 6);
    assert_eq!(decoded.value_at(2, 5), Value::Int(15));

    // the encoded reply survives a round trip
    assert_eq!(PollResponse::decode(&rsp.encode()).unwrap(), rsp);

    // caught up: nothing new, offset stays put
    let rsp = poll(&tq, "cg:t", 0, FetchOffset::After(2));
    assert!(rsp.blocks.is_empty());
    assert_eq!(rsp.rsp_offset, 2);
    assert_eq!(rsp.skip_log_num, 0);
}

#[test]
fn test_one_entry_per_poll() {
    let wal = MemWal::new();
    for m in 0..4 {
        submit(&wal, 1, m * 10..=m * 10 + 4);
    }
    let tq = open(&wal, None);
    subscribe(&tq, "cg:t", 1, QueryPlan {
        columns: vec![2],
        ..QueryPlan::default()
    });

    let mut offset = FetchOffset::Earliest;
    let mut seen = Vec::new();
    loop {
        let rsp = poll(&tq, "cg:t", 0, offset);
        if rsp.blocks.is_empty() {
            break;
        }
        assert_eq!(rsp.blocks.len(), 1);
        seen.push(rsp.rsp_offset);
        offset = FetchOffset::After(rsp.rsp_offset);
    }
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn test_stale_epoch_is_superseded() {
    let wal = MemWal::new();
    submit(&wal, 1, 1..=3);
    let tq = open(&wal, None);
    subscribe(&tq, "cg:t", 1, QueryPlan::default());

    poll(&tq, "cg:t", 2, FetchOffset::Earliest);
    assert_eq!(tq.subscription("cg:t").unwrap().epoch(), 2);

    let req = PollRequest {
        consumer_id: 1,
        epoch: 1,
        sub_key: "cg:t".to_string(),
        offset: FetchOffset::Earliest,
    };
    let outcome = tq.process_poll_req(&req, 0).unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Superseded {
            live_epoch: 2,
            offset: 0
        }
    );
    assert_eq!(tq.subscription("cg:t").unwrap().epoch(), 2);
}

/// Scan executor that raises the subscription's epoch each time it hands out
/// a block, as a rebalance landing mid-poll would.
struct EpochBumpCompiler {
    exec: Arc<OnceLock<Arc<Exec>>>,
    bump_to: i32,
}

struct EpochBumpExecutor {
    inner: Box<dyn StreamExecutor>,
    exec: Arc<OnceLock<Arc<Exec>>>,
    bump_to: i32,
}

impl QueryCompiler for EpochBumpCompiler {
    fn compile(&self, plan: &QueryPlan) -> tessel::Result<Box<dyn StreamExecutor>> {
        Ok(Box::new(EpochBumpExecutor {
            inner: ScanCompiler.compile(plan)?,
            exec: Arc::clone(&self.exec),
            bump_to: self.bump_to,
        }))
    }
}

impl StreamExecutor for EpochBumpExecutor {
    fn set_input(&mut self, input: StreamInput) -> tessel::Result<()> {
        self.inner.set_input(input)
    }

    fn next_block(&mut self) -> tessel::Result<Option<ResultBlock>> {
        let out = self.inner.next_block()?;
        if out.is_some()
            && let Some(exec) = self.exec.get()
        {
            exec.advance_epoch(self.bump_to);
        }
        Ok(out)
    }
}

#[test]
fn test_epoch_raised_during_execution_discards_reply() {
    let wal = MemWal::new();
    submit(&wal, 1, 1..=3);
    let slot = Arc::new(OnceLock::new());
    let compiler = EpochBumpCompiler {
        exec: Arc::clone(&slot),
        bump_to: 100,
    };
    let tq = Tq::open(TqConfig::default(), Arc::new(wal.clone()), Arc::new(compiler), None).unwrap();
    subscribe(&tq, "cg:t", 1, QueryPlan::default());
    slot.set(tq.subscription("cg:t").unwrap()).unwrap();

    let req = PollRequest {
        consumer_id: 1,
        epoch: 1,
        sub_key: "cg:t".to_string(),
        offset: FetchOffset::Earliest,
    };
    let outcome = tq.process_poll_req(&req, 0).unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Superseded {
            live_epoch: 100,
            offset: 0
        }
    );
    assert_eq!(tq.subscription("cg:t").unwrap().epoch(), 100);

    // a poll at the live epoch gets the rows
    let rsp = poll(&tq, "cg:t", 100, FetchOffset::Earliest);
    assert_eq!(rsp.blocks.len(), 1);
    assert_eq!(rsp.blocks[0].num_rows, 3);
}

#[test]
fn test_rebalance_mismatch_changes_nothing() {
    let wal = MemWal::new();
    let tq = open(&wal, None);
    subscribe(&tq, "cg:t", 1, QueryPlan::default());
    poll(&tq, "cg:t", 4, FetchOffset::Latest);

    let err = tq
        .apply_rebalance(&RebalanceRequest {
            sub_key: "cg:t".to_string(),
            old_consumer_id: 5,
            new_consumer_id: 6,
            plan: QueryPlan::default(),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        TesselError::Consistency(ConsistencyError::ConsumerMismatch {
            expected: 5,
            actual: 1,
            ..
        })
    ));
    let exec = tq.subscription("cg:t").unwrap();
    assert_eq!(exec.consumer_id(), 1);
    assert_eq!(exec.epoch(), 4);

    // the holder hands over: epoch restarts at 0
    let exec = tq
        .apply_rebalance(&RebalanceRequest {
            sub_key: "cg:t".to_string(),
            old_consumer_id: 1,
            new_consumer_id: 2,
            plan: QueryPlan::default(),
        })
        .unwrap();
    assert_eq!(exec.consumer_id(), 2);
    assert_eq!(exec.epoch(), 0);

    // an unknown key needs no previous consumer
    assert!(tq
        .apply_rebalance(&RebalanceRequest {
            sub_key: "cg:other".to_string(),
            old_consumer_id: 3,
            new_consumer_id: 4,
            plan: QueryPlan::default(),
        })
        .is_err());
    assert!(tq.subscription("cg:other").is_none());
}

#[test]
fn test_concurrent_polls_on_separate_workers() {
    let wal = MemWal::new();
    for m in 0..8 {
        submit(&wal, 1, m * 10..=m * 10 + 9);
    }
    let tq = open(&wal, None);
    subscribe(&tq, "cg:t", 1, QueryPlan::default());
    let slots = tq.config().worker_slots;

    let rows: Vec<u32> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..slots)
            .map(|worker| {
                let tq = &tq;
                s.spawn(move || {
                    let req = PollRequest {
                        consumer_id: 1,
                        epoch: 0,
                        sub_key: "cg:t".to_string(),
                        offset: FetchOffset::After(i64::try_from(worker).unwrap()),
                    };
                    match tq.process_poll_req(&req, worker).unwrap() {
                        PollOutcome::Response(rsp) => rsp.blocks.iter().map(|b| b.num_rows).sum::<u32>(),
                        PollOutcome::Superseded { .. } => 0,
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(rows.iter().all(|&r| r == 10));
}

#[test]
fn test_stream_tasks_on_triggers() {
    let wal = MemWal::new();
    let tq = open(&wal, None);
    tq.deploy_task(
        br#"{"task_id": 1, "plan": {"tables": [1], "columns": [1]}, "sink": "aggregation"}"#,
        Some(2),
    )
    .unwrap();
    tq.deploy_task(br#"{"task_id": 2, "sink": "aggregation"}"#, None)
        .unwrap();
    assert!(tq.deploy_task(br#"{"task_id": 2}"#, None).is_err());
    assert!(tq.deploy_task(b"not json", None).is_err());

    for (uid, keys) in [(1, 1..=4), (2, 5..=6)] {
        let body = SubmitMsg::single(uid, rows(keys))
            .encode(Compression::None)
            .unwrap();
        let version = wal.append(MsgType::Submit, &body).unwrap();
        let trigger = tq.push_msg(MsgType::Submit, &body, version).unwrap().unwrap();
        let report = tq.process_stream_trigger(&trigger, 3).unwrap();
        assert_eq!(report.executed, 2);
        assert!(report.failed.is_empty());
    }

    let filtered = tq.task(1).unwrap().aggregation().unwrap();
    assert_eq!(filtered.rows, 4);
    assert_eq!(filtered.key_range, Some((1, 4)));
    assert_eq!(filtered.columns[&1].sum, 10.0);
    assert!(!filtered.columns.contains_key(&2));

    let passthrough = tq.task(2).unwrap().aggregation().unwrap();
    assert_eq!(passthrough.rows, 6);
    assert_eq!(passthrough.columns[&2].max, 6.0);

    let summary = tq
        .process_task_exec(
            1,
            StreamInput::Blocks(vec![SubmitBlock {
                uid: 1,
                rows: rows(7..=9),
            }]),
            0,
        )
        .unwrap();
    assert_eq!((summary.blocks, summary.rows), (1, 3));
    assert_eq!(tq.task(1).unwrap().aggregation().unwrap().rows, 7);
}

#[test]
fn test_commit_and_reopen_restores_state() {
    let dir = tempdir().unwrap();
    let meta = dir.path().join("tq.json");
    let wal = MemWal::new();
    submit(&wal, 1, 1..=3);

    {
        let tq = open(&wal, Some(meta.clone()));
        subscribe(&tq, "cg:a", 11, QueryPlan {
            tables: vec![1],
            ..QueryPlan::default()
        });
        subscribe(&tq, "cg:b", 12, QueryPlan::default());
        poll(&tq, "cg:a", 3, FetchOffset::Earliest);
        tq.deploy_task(br#"{"task_id": 5, "plan": {}, "sink": "none"}"#, Some(3))
            .unwrap();
        tq.deploy_task(br#"{"task_id": 6, "sink": "aggregation"}"#, Some(2))
            .unwrap();
        tq.commit().unwrap();
    }

    let tq = open(&wal, Some(meta));
    let a = tq.subscription("cg:a").unwrap();
    assert_eq!(a.consumer_id(), 11);
    assert_eq!(a.epoch(), 3);
    assert_eq!(a.plan().tables, vec![1]);
    assert_eq!(tq.subscription("cg:b").unwrap().consumer_id(), 12);
    assert_eq!(tq.task(5).unwrap().parallelism(), 3);
    // a task without a plan has no runners but keeps its parallelism
    let passthrough = tq.task(6).unwrap();
    assert_eq!(passthrough.parallelism(), 2);
    assert_eq!(passthrough.runners(), 0);

    // restored subscriptions are fully usable
    let rsp = poll(&tq, "cg:a", 3, FetchOffset::Earliest);
    assert_eq!(rsp.blocks.len(), 1);

    assert!(tq.remove_subscription("cg:b").is_some());
    assert!(tq.remove_subscription("cg:b").is_none());
}

#[test]
fn test_open_without_meta_commits_nothing() {
    let dir = tempdir().unwrap();
    let tq = open(&MemWal::new(), None);
    subscribe(&tq, "cg:t", 1, QueryPlan::default());
    tq.commit().unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
