//! Integration tests for merging batches into existing blocks.
//!
//! Each test checks the block layout invariants after every write: blocks
//! ordered and non-overlapping, no block above `max_rows`, and the table
//! reading back as the sorted union of everything written.

use std::collections::BTreeMap;

use tempfile::tempdir;
use tessel::{
    ColumnSpec, ColumnType, CompInfo, DataCols, FileGroup, Helper, HelperConfig, HelperKind, Schema,
    TableInfo, Value,
};

const TABLE: TableInfo = TableInfo { tid: 0, uid: 7 };

fn schema() -> Schema {
    Schema::new(
        2,
        vec![
            ColumnSpec { id: 0, ty: ColumnType::Timestamp },
            ColumnSpec { id: 4, ty: ColumnType::BigInt },
        ],
    )
    .unwrap()
}

/// Rows whose value column records which write produced them.
fn rows(keys: impl IntoIterator<Item = i64>, tag: i64) -> DataCols {
    let keys: Vec<i64> = keys.into_iter().collect();
    let mut cols = DataCols::new(&schema(), keys.len()).unwrap();
    for k in keys {
        cols.push_row(&[Value::Timestamp(k), Value::BigInt(tag)]).unwrap();
    }
    cols
}

fn helper(dir: &std::path::Path, min_rows: u32, max_rows: u32, max_sub: u8) -> (FileGroup, Helper) {
    let group = FileGroup::create(dir, 0, (0, 1_000_000), 2).unwrap();
    let mut helper = Helper::init(HelperConfig {
        max_tables: 2,
        min_rows_per_file_block: min_rows,
        max_rows_per_file_block: max_rows,
        max_sub_blocks: max_sub,
        ..HelperConfig::new(HelperKind::Write)
    })
    .unwrap();
    helper.set_and_open_file(&group).unwrap();
    helper.set_table(TABLE, &schema()).unwrap();
    (group, helper)
}

fn check_layout(info: &CompInfo, max_rows: u32) {
    for blk in &info.blocks {
        assert!(blk.rows <= max_rows, "block of {} rows", blk.rows);
        assert!(blk.key_first <= blk.key_last);
        if blk.is_super() {
            assert!(blk.num_sub_blocks >= 3);
            assert_eq!(blk.sub_blocks.len(), usize::from(blk.num_sub_blocks) - 1);
        }
    }
    for pair in info.blocks.windows(2) {
        assert!(pair[0].key_last < pair[1].key_first);
    }
    // only the final block may live in the last file
    let n = info.blocks.len();
    assert!(info.blocks.iter().take(n.saturating_sub(1)).all(|b| !b.last));
}

fn contents(helper: &mut Helper) -> BTreeMap<i64, i64> {
    let blocks = helper.block_info().blocks.len();
    let mut out = BTreeMap::new();
    for blk in 0..blocks {
        let cols = helper.load_block_data(blk).unwrap();
        for r in 0..cols.num_rows() {
            let Value::BigInt(tag) = cols.value_at(1, r) else {
                panic!("value column missing at row {r}");
            };
            assert!(out.insert(cols.key_at(r), tag).is_none(), "duplicate key");
        }
    }
    out
}

#[test]
fn test_large_block_then_small_extension() {
    let dir = tempdir().unwrap();
    let (_group, mut helper) = helper(dir.path(), 50, 1000, 8);

    helper.write_batch(&rows(1..=100, 0)).unwrap();
    let info = helper.block_info().clone();
    assert_eq!(info.blocks.len(), 1);
    assert!(!info.blocks[0].last);
    assert_eq!((info.blocks[0].key_first, info.blocks[0].key_last), (1, 100));

    helper.write_batch(&rows(101..=110, 1)).unwrap();
    let blk = &helper.block_info().blocks[0];
    assert_eq!(blk.num_sub_blocks, 3);
    assert_eq!(blk.rows, 110);
    check_layout(helper.block_info(), 1000);
    assert_eq!(contents(&mut helper).len(), 110);
}

#[test]
fn test_interleaved_writes_read_back_sorted() {
    let dir = tempdir().unwrap();
    let (group, mut helper) = helper(dir.path(), 8, 32, 4);

    let mut expected = BTreeMap::new();
    let writes: [(Vec<i64>, i64); 5] = [
        ((0..100).map(|k| k * 10).collect(), 1),
        ((0..50).map(|k| k * 20 + 5).collect(), 2),
        ((0..30).map(|k| k * 33 + 1).collect(), 3),
        ((990..1100).collect(), 4),
        (vec![7, 8, 9, 503, 504], 5),
    ];
    for (keys, tag) in &writes {
        helper.write_batch(&rows(keys.iter().copied(), *tag)).unwrap();
        for k in keys {
            expected.entry(*k).or_insert(*tag);
        }
        check_layout(helper.block_info(), 32);
    }
    assert_eq!(contents(&mut helper), expected);
    assert_eq!(helper.table_idx().unwrap().max_key, 1099);

    helper.write_block_info().unwrap();
    helper.commit().unwrap();

    let mut reader = Helper::init(HelperConfig {
        max_tables: 2,
        ..HelperConfig::new(HelperKind::Read)
    })
    .unwrap();
    reader.set_and_open_file(&group).unwrap();
    reader.set_table(TABLE, &schema()).unwrap();
    reader.load_block_info().unwrap();
    assert_eq!(contents(&mut reader), expected);
}

#[test]
fn test_existing_rows_win_over_duplicates() {
    let dir = tempdir().unwrap();
    let (_group, mut helper) = helper(dir.path(), 5, 100, 8);

    helper.write_batch(&rows(1..=20, 1)).unwrap();
    let before = helper.stats();
    helper.write_batch(&rows([3, 4, 5], 2)).unwrap();
    assert_eq!(helper.stats(), before);

    // a mix of new and duplicate keys keeps the stored values
    helper.write_batch(&rows([10, 21, 22], 3)).unwrap();
    let data = contents(&mut helper);
    assert_eq!(data[&10], 1);
    assert_eq!(data[&21], 3);
    assert_eq!(data.len(), 22);
}

#[test]
fn test_sub_block_cap_triggers_rewrite() {
    let dir = tempdir().unwrap();
    let (_group, mut helper) = helper(dir.path(), 4, 100, 3);

    helper.write_batch(&rows((0..10).map(|k| k * 10), 0)).unwrap();
    helper.write_batch(&rows([5, 15], 1)).unwrap();
    assert_eq!(helper.block_info().blocks[0].num_sub_blocks, 3);
    assert_eq!(helper.stats().sub_blocks_appended, 1);

    helper.write_batch(&rows([25], 2)).unwrap();
    let blk = &helper.block_info().blocks[0];
    assert_eq!(blk.num_sub_blocks, 1);
    assert_eq!(blk.rows, 13);
    assert_eq!(helper.stats().blocks_rewritten, 1);
    check_layout(helper.block_info(), 100);
}

#[test]
fn test_batch_larger_than_a_block_is_split() {
    let dir = tempdir().unwrap();
    let (_group, mut helper) = helper(dir.path(), 10, 64, 8);

    assert_eq!(helper.write_batch(&rows(0..1000, 0)).unwrap(), 1000);
    let info = helper.block_info();
    check_layout(info, 64);
    let total: u32 = info.blocks.iter().map(|b| b.rows).sum();
    assert_eq!(total, 1000);
    assert_eq!(helper.table_idx().unwrap().num_super_blocks as usize, info.blocks.len());
}

#[test]
fn test_table_switch_keeps_written_state() {
    let dir = tempdir().unwrap();
    let (_group, mut helper) = helper(dir.path(), 10, 64, 8);
    let other = TableInfo { tid: 1, uid: 8 };

    helper.write_batch(&rows(0..40, 0)).unwrap();
    helper.write_block_info().unwrap();

    helper.set_table(other, &schema()).unwrap();
    helper.write_batch(&rows(0..5, 1)).unwrap();
    helper.write_block_info().unwrap();

    // back to the first table: the shadow entry is picked up
    helper.set_table(TABLE, &schema()).unwrap();
    helper.load_block_info().unwrap();
    assert_eq!(contents(&mut helper).len(), 40);
    helper.write_batch(&rows(40..45, 2)).unwrap();
    assert_eq!(contents(&mut helper).len(), 45);
}

#[test]
fn test_table_switch_and_commit_flush_pending_blocks() {
    let dir = tempdir().unwrap();
    let (group, mut helper) = helper(dir.path(), 10, 64, 8);
    let other = TableInfo { tid: 1, uid: 8 };

    // no write_block_info between writes, switches and the commit
    assert_eq!(helper.write_batch(&rows(0..50, 0)).unwrap(), 50);
    helper.set_table(other, &schema()).unwrap();
    assert_eq!(helper.write_batch(&rows(0..5, 1)).unwrap(), 5);
    helper.commit().unwrap();

    let mut reader = Helper::init(HelperConfig {
        max_tables: 2,
        ..HelperConfig::new(HelperKind::Read)
    })
    .unwrap();
    reader.set_and_open_file(&group).unwrap();
    for (table, expected) in [(TABLE, 50), (other, 5)] {
        reader.set_table(table, &schema()).unwrap();
        reader.load_block_info().unwrap();
        assert_eq!(contents(&mut reader).len(), expected, "table {}", table.tid);
    }
}
