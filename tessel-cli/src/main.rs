//! CLI for the tessel time-series file storage engine.
//!
//! Provides commands for creating, loading, inspecting and dumping file
//! groups, plus a demo of the log-polling layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use tessel::tq::{
    FetchOffset, MemWal, MsgType, PollOutcome, PollRequest, QueryPlan, RebalanceRequest, ScanCompiler,
    SubmitMsg, NO_CONSUMER,
};
use tessel::{
    ColumnSpec, ColumnType, DataCols, FileConfig, FileGroup, Helper, HelperConfig, HelperKind, Schema,
    TableInfo, Tq, Value,
};
use tracing_subscriber::EnvFilter;

/// tessel: block-structured time-series file storage CLI.
#[derive(Parser)]
#[command(name = "tessel", version, about)]
struct Cli {
    /// Optional JSON config file with `helper` and `tq` sections.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create an empty file group.
    Init {
        /// Directory holding the group's files.
        dir: PathBuf,

        /// File id of the group.
        #[arg(long, default_value = "0")]
        fid: i32,

        /// Smallest key the group accepts.
        #[arg(long, default_value = "0")]
        key_min: i64,

        /// Largest key the group accepts.
        #[arg(long, default_value = "9223372036854775807")]
        key_max: i64,
    },

    /// Display the header and per-table index of a file group.
    Info {
        /// Directory holding the group's files.
        dir: PathBuf,

        /// File id of the group.
        #[arg(long, default_value = "0")]
        fid: i32,
    },

    /// Write rows into one table, generated or read from a CSV file.
    Ingest {
        /// Directory holding the group's files.
        dir: PathBuf,

        /// File id of the group.
        #[arg(long, default_value = "0")]
        fid: i32,

        /// Table slot.
        #[arg(long)]
        tid: u32,

        /// Table uid.
        #[arg(long)]
        uid: u64,

        /// Number of rows to generate.
        #[arg(long, default_value = "1000")]
        rows: u32,

        /// First generated key.
        #[arg(long, default_value = "0")]
        start: i64,

        /// Distance between generated keys.
        #[arg(long, default_value = "1000")]
        step: i64,

        /// Read `timestamp,value` lines from this CSV file instead of
        /// generating rows.
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Print every row of one table.
    Dump {
        /// Directory holding the group's files.
        dir: PathBuf,

        /// File id of the group.
        #[arg(long, default_value = "0")]
        fid: i32,

        /// Table slot.
        #[arg(long)]
        tid: u32,

        /// Table uid.
        #[arg(long)]
        uid: u64,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Feed synthetic submissions through an in-memory log and poll them.
    PollDemo {
        /// Number of submissions to append.
        #[arg(long, default_value = "8")]
        messages: u32,

        /// Rows per submission.
        #[arg(long, default_value = "100")]
        rows: u32,
    },
}

/// Output format for dumped rows.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Init {
            dir,
            fid,
            key_min,
            key_max,
        } => cmd_init(&config, &dir, fid, key_min, key_max),
        Commands::Info { dir, fid } => cmd_info(&config, &dir, fid),
        Commands::Ingest {
            dir,
            fid,
            tid,
            uid,
            rows,
            start,
            step,
            csv,
        } => {
            let source = match csv {
                Some(path) => RowSource::Csv(path),
                None => RowSource::Generated { rows, start, step },
            };
            cmd_ingest(&config, &dir, &source, fid, TableInfo { tid, uid })
        }
        Commands::Dump {
            dir,
            fid,
            tid,
            uid,
            format,
        } => cmd_dump(&config, &dir, fid, TableInfo { tid, uid }, &format),
        Commands::PollDemo { messages, rows } => cmd_poll_demo(&config, messages, rows),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn load_config(path: Option<&Path>) -> CliResult<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let config = FileConfig::load(path)?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// The two-column layout every CLI table uses.
fn cli_schema() -> CliResult<Schema> {
    Ok(Schema::new(
        1,
        vec![
            ColumnSpec {
                id: 0,
                ty: ColumnType::Timestamp,
            },
            ColumnSpec {
                id: 1,
                ty: ColumnType::Double,
            },
        ],
    )?)
}

fn helper_config(config: &FileConfig, kind: HelperKind) -> HelperConfig {
    HelperConfig {
        kind,
        ..config.helper.clone()
    }
}

/// Implements `tessel init <dir>`.
fn cmd_init(config: &FileConfig, dir: &Path, fid: i32, key_min: i64, key_max: i64) -> CliResult<()> {
    if key_min > key_max {
        return Err(format!("key range [{key_min}, {key_max}] is empty").into());
    }
    if FileGroup::open(dir, fid).is_ok() {
        return Err(format!("file group {fid} already exists in '{}'", dir.display()).into());
    }
    let group = FileGroup::create(dir, fid, (key_min, key_max), config.helper.max_tables)?;
    println!("Created file group {fid} in {}", group.dir().display());
    println!("  Key range: [{key_min}, {key_max}]");
    println!("  Table slots: {}", config.helper.max_tables);
    Ok(())
}

/// Implements `tessel info <dir>`.
fn cmd_info(config: &FileConfig, dir: &Path, fid: i32) -> CliResult<()> {
    let group = FileGroup::open(dir, fid)?;
    let header = group.read_header()?;

    println!("File group: {} (fid={fid})", group.dir().display());
    println!("  Key range: [{}, {}]", header.key_min, header.key_max);
    println!("  Table slots: {}", header.max_tables);
    println!("  Last file generation: {}", header.last_gen);
    println!();

    for (label, path) in [
        ("head", group.head_path()),
        ("data", group.data_path()),
        ("last", group.last_path(header.last_gen)),
    ] {
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        println!("  {label:<5} {} ({})", path.display(), format_bytes(size));
    }
    println!();

    let mut helper = Helper::init(HelperConfig {
        max_tables: header.max_tables,
        ..helper_config(config, HelperKind::Read)
    })?;
    helper.set_and_open_file(&group)?;
    let tables: Vec<_> = helper
        .load_index()?
        .iter()
        .enumerate()
        .filter(|(_, idx)| idx.has_blocks())
        .map(|(tid, idx)| (tid, *idx))
        .collect();

    // Block descriptors do not depend on the column layout, so the CLI
    // schema is enough to position on any table.
    let schema = cli_schema()?;
    println!("Tables with data: {}", tables.len());
    for (tid, idx) in tables {
        println!(
            "  - tid={tid} uid={} blocks={} max_key={} last_block={}",
            idx.uid, idx.num_super_blocks, idx.max_key, idx.has_last
        );
        helper.set_table(TableInfo { tid: u32::try_from(tid)?, uid: idx.uid }, &schema)?;
        for (i, blk) in helper.load_block_info()?.blocks.iter().enumerate() {
            println!(
                "      block {i}: keys=[{}, {}] rows={} sub_blocks={} file={} offset={} len={} alg={:?}",
                blk.key_first,
                blk.key_last,
                blk.rows,
                blk.num_sub_blocks,
                if blk.last { "last" } else { "data" },
                blk.offset,
                blk.len,
                blk.algorithm
            );
        }
    }
    helper.close(false);
    Ok(())
}

/// Rows for `tessel ingest`.
enum RowSource {
    /// `timestamp,value` lines.
    Csv(PathBuf),
    /// `rows` keys from `start`, `step` apart, valued 0, 1, 2, ...
    Generated { rows: u32, start: i64, step: i64 },
}

impl RowSource {
    /// Sorted points with unique timestamps.
    fn points(&self) -> CliResult<Vec<(i64, f64)>> {
        let mut points = Vec::new();
        match self {
            Self::Generated { rows, start, step } => {
                if *step <= 0 {
                    return Err("--step must be positive".into());
                }
                let mut ts = *start;
                for i in 0..*rows {
                    points.push((ts, f64::from(i)));
                    ts = ts.checked_add(*step).ok_or("generated keys overflow")?;
                }
            }
            Self::Csv(path) => {
                let text = std::fs::read_to_string(path)?;
                for (lineno, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') || line.starts_with("timestamp") {
                        continue;
                    }
                    let (ts, value) = line
                        .split_once(',')
                        .ok_or_else(|| format!("line {}: expected 'timestamp,value'", lineno + 1))?;
                    let ts: i64 = ts.trim().parse().map_err(|e| format!("line {}: {e}", lineno + 1))?;
                    let value: f64 = value.trim().parse().map_err(|e| format!("line {}: {e}", lineno + 1))?;
                    points.push((ts, value));
                }
                // Later lines win on duplicate timestamps.
                points.reverse();
                points.sort_by_key(|(ts, _)| *ts);
                points.dedup_by_key(|(ts, _)| *ts);
            }
        }
        Ok(points)
    }
}

/// Implements `tessel ingest <dir>`.
fn cmd_ingest(config: &FileConfig, dir: &Path, source: &RowSource, fid: i32, table: TableInfo) -> CliResult<()> {
    let points = source.points()?;
    let schema = cli_schema()?;
    let mut rows = DataCols::new(&schema, points.len())?;
    for (ts, value) in &points {
        rows.push_row(&[Value::Timestamp(*ts), Value::Double(*value)])?;
    }
    if rows.is_empty() {
        println!("No rows to ingest");
        return Ok(());
    }

    let group = FileGroup::open(dir, fid)?;
    let header = group.read_header()?;
    let mut helper = Helper::init(HelperConfig {
        max_tables: header.max_tables,
        ..helper_config(config, HelperKind::Write)
    })?;

    let start = Instant::now();
    let written = write_table(&mut helper, &group, table, &schema, &rows);
    if written.is_err() {
        helper.close(true);
    }
    let written = written?;
    let elapsed = start.elapsed();
    let stats = helper.stats();

    println!("Ingested {written} rows into tid={} uid={} in {elapsed:.3?}", table.tid, table.uid);
    println!(
        "  Blocks written: {} (rewrites: {}, sub-blocks appended: {})",
        stats.blocks_written, stats.blocks_rewritten, stats.sub_blocks_appended
    );
    Ok(())
}

fn write_table(
    helper: &mut Helper,
    group: &FileGroup,
    table: TableInfo,
    schema: &Schema,
    rows: &DataCols,
) -> CliResult<usize> {
    helper.set_and_open_file(group)?;
    helper.set_table(table, schema)?;
    let written = helper.write_batch(rows)?;
    helper.write_block_info()?;
    helper.commit()?;
    Ok(written)
}

/// Implements `tessel dump <dir>`.
fn cmd_dump(config: &FileConfig, dir: &Path, fid: i32, table: TableInfo, format: &OutputFormat) -> CliResult<()> {
    let group = FileGroup::open(dir, fid)?;
    let header = group.read_header()?;
    let schema = cli_schema()?;
    let mut helper = Helper::init(HelperConfig {
        max_tables: header.max_tables,
        ..helper_config(config, HelperKind::Read)
    })?;
    helper.set_and_open_file(&group)?;
    helper.set_table(table, &schema)?;
    let blocks = helper.load_block_info()?.blocks.len();

    let mut data = Vec::new();
    for blk in 0..blocks {
        let cols = helper.load_block_data(blk)?;
        for row in 0..cols.num_rows() {
            let value = match cols.value_at(1, row) {
                Value::Double(v) => Some(v),
                _ => None,
            };
            data.push((cols.key_at(row), value));
        }
    }
    helper.close(false);

    match format {
        OutputFormat::Csv => {
            println!("# tid={}, uid={}, blocks={blocks}, rows={}", table.tid, table.uid, data.len());
            println!("timestamp,value");
            for (ts, value) in &data {
                match value {
                    Some(v) => println!("{ts},{v}"),
                    None => println!("{ts},"),
                }
            }
        }
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = data
                .iter()
                .map(|(ts, value)| serde_json::json!({ "timestamp": ts, "value": value }))
                .collect();
            let output = serde_json::json!({
                "tid": table.tid,
                "uid": table.uid,
                "blocks": blocks,
                "count": data.len(),
                "data": rows,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `tessel poll-demo`.
fn cmd_poll_demo(config: &FileConfig, messages: u32, rows_per_msg: u32) -> CliResult<()> {
    let schema = cli_schema()?;
    let wal = MemWal::new();
    let tq = Tq::open(config.tq.clone(), Arc::new(wal.clone()), Arc::new(ScanCompiler), None)?;

    tq.apply_rebalance(&RebalanceRequest {
        sub_key: "demo:sub".to_string(),
        old_consumer_id: NO_CONSUMER,
        new_consumer_id: 1,
        plan: QueryPlan::default(),
    })?;

    let mut ts = 1_700_000_000_000i64;
    for m in 0..messages {
        let mut rows = DataCols::new(&schema, rows_per_msg as usize)?;
        for i in 0..rows_per_msg {
            rows.push_row(&[Value::Timestamp(ts), Value::Double(f64::from(i))])?;
            ts += 1000;
        }
        let body = SubmitMsg::single(u64::from(m % 2) + 1, rows).encode(config.tq.response_compression)?;
        let version = wal.append(MsgType::Submit, &body)?;
        tq.push_msg(MsgType::Submit, &body, version)?;
    }
    println!("Appended {messages} submissions of {rows_per_msg} rows");

    let mut offset = FetchOffset::Earliest;
    let mut polls = 0u32;
    let mut total_rows = 0u64;
    let start = Instant::now();
    loop {
        let req = PollRequest {
            consumer_id: 1,
            epoch: 0,
            sub_key: "demo:sub".to_string(),
            offset,
        };
        let rsp = match tq.process_poll_req(&req, 0)? {
            PollOutcome::Response(rsp) => rsp,
            PollOutcome::Superseded { live_epoch, .. } => {
                return Err(format!("poll superseded by epoch {live_epoch}").into());
            }
        };
        polls += 1;
        if rsp.blocks.is_empty() {
            println!("  poll {polls}: caught up at offset {}", rsp.rsp_offset);
            break;
        }
        let rows: u64 = rsp.blocks.iter().map(|b| u64::from(b.num_rows)).sum();
        total_rows += rows;
        println!(
            "  poll {polls}: offset {} -> {}, {} block(s), {rows} rows, {} bytes",
            rsp.req_offset,
            rsp.rsp_offset,
            rsp.blocks.len(),
            rsp.encode().len()
        );
        offset = FetchOffset::After(rsp.rsp_offset);
    }

    println!();
    println!("Results:");
    println!("  Polls: {polls}");
    println!("  Rows delivered: {total_rows}");
    println!("  Elapsed: {:.3?}", start.elapsed());
    Ok(())
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1_048_576), "3.0 MB");
    }

    #[test]
    fn test_ingest_then_dump_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::default();
        cmd_init(&config, dir.path(), 0, 0, 1_000_000).unwrap();

        let csv = dir.path().join("rows.csv");
        std::fs::write(&csv, "timestamp,value\n3,1.5\n1,0.5\n2,1.0\n2,9.0\n").unwrap();
        let table = TableInfo { tid: 2, uid: 77 };
        cmd_ingest(&config, dir.path(), &RowSource::Csv(csv), 0, table).unwrap();

        let group = FileGroup::open(dir.path(), 0).unwrap();
        let mut helper = Helper::init(helper_config(&config, HelperKind::Read)).unwrap();
        helper.set_and_open_file(&group).unwrap();
        helper.set_table(table, &cli_schema().unwrap()).unwrap();
        assert_eq!(helper.load_block_info().unwrap().blocks.len(), 1);
        let cols = helper.load_block_data(0).unwrap();
        assert_eq!(cols.num_rows(), 3);
        assert_eq!(cols.key_first(), Some(1));
        assert_eq!(cols.value_at(1, 1), Value::Double(9.0));
        assert_eq!(cols.value_at(1, 2), Value::Double(1.5));
    }

    #[test]
    fn test_generated_rows() {
        let source = RowSource::Generated {
            rows: 4,
            start: 100,
            step: 10,
        };
        let points = source.points().unwrap();
        assert_eq!(points.iter().map(|p| p.0).collect::<Vec<_>>(), vec![100, 110, 120, 130]);
        assert_eq!(points[3].1, 3.0);

        let bad = RowSource::Generated {
            rows: 4,
            start: 0,
            step: 0,
        };
        assert!(bad.points().is_err());
    }

    #[test]
    fn test_init_refuses_existing_group() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::default();
        cmd_init(&config, dir.path(), 0, 0, 100).unwrap();
        assert!(cmd_init(&config, dir.path(), 0, 0, 100).is_err());
        assert!(cmd_init(&config, dir.path(), 1, 10, 5).is_err());
    }
}
