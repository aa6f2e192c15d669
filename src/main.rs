//! Maintenance entry point for the lightcurve archive (`lcdb`).
//!
//! This binary runs one inspection command against the archive and prints
//! the result as JSON on stdout. The startup sequence is:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Dispatching the command through the store traits
//!
//! # Commands
//! - `partition <record-id>` – partition range and table for a record id (offline)
//! - `lengths <host-id>`     – distinct cadence count per record of a host
//! - `points <record-id>`    – deduplicated, cadence-ordered points of a record
//! - `dump <record-id>`      – raw rows of the partition holding a record
//! - `lineage <record-id>`   – sources and derived records of a record
//!
//! Pass `--pretty` for indented output.
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `PARTITION_SIZE` (optional) – record ids per point partition (default: 1000)
//! - `LCDB_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `LCDB_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, fmt, io::IsTerminal};

use anyhow::{anyhow, bail, Result};
use dotenvy::dotenv;
use serde_json::{json, Value};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use lightcurvedb::partition::{PartitionRouter, POINTS_TABLE};
use lightcurvedb::store::{LineageStore, PointStore};
use lightcurvedb::{config, schema, ArchiveError, Db, RecordId};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let (command, operand) = parse_command()?;

    let cfg = config::load_from_env()?;
    cfg.log_config();

    // Routing needs no database
    if command == Command::Partition {
        return print_json(&partition_json(cfg.router(), operand));
    }

    let mut db = Db::new(cfg);
    let output = db
        .scope(|store| async move {
            schema::create_schema(store.pool()).await?;
            let id = RecordId(operand);

            let value = match command {
                Command::Partition => partition_json(store.router(), operand),
                Command::Lengths => {
                    let lengths = store.get_record_lengths(operand).await?;
                    let rows: Vec<Value> = lengths
                        .into_iter()
                        .map(|(id, length)| json!({ "record_id": id, "length": length }))
                        .collect();
                    Value::Array(rows)
                }
                Command::Points => json!(store.get_points_by_record_id(id).await?),
                Command::Dump => json!(store.dump_partition(id).await?),
                Command::Lineage => json!({
                    "record_id": id,
                    "sources": store.sources_of(id).await?,
                    "derived": store.derived_from(id).await?,
                }),
            };
            Ok::<_, ArchiveError>(value)
        })
        .await
        .map_err(|e| anyhow!("{} {} failed: {}", command, operand, e))?;

    print_json(&output)
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Partition,
    Lengths,
    Points,
    Dump,
    Lineage,
}

impl Command {
    const ALL: [Command; 5] = [
        Command::Partition,
        Command::Lengths,
        Command::Points,
        Command::Dump,
        Command::Lineage,
    ];

    fn name(self) -> &'static str {
        match self {
            Command::Partition => "partition",
            Command::Lengths => "lengths",
            Command::Points => "points",
            Command::Dump => "dump",
            Command::Lineage => "lineage",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read `<command> <integer>` from the process arguments.
fn parse_command() -> Result<(Command, i64)> {
    // ---
    let names: Vec<&str> = Command::ALL.iter().map(|c| c.name()).collect();
    let usage = || anyhow!("usage: lcdb <{}> <id> [--pretty]", names.join("|"));
    let mut args = env::args().skip(1).filter(|arg| !arg.starts_with("--"));

    let name = args.next().ok_or_else(usage)?;
    let Some(command) = Command::ALL.into_iter().find(|c| c.name() == name) else {
        bail!("unknown command '{}'; expected one of {}", name, names.join(", "));
    };

    let operand = args.next().ok_or_else(usage)?;
    let operand = operand
        .parse::<i64>()
        .map_err(|e| anyhow!("Invalid id '{}': {}", operand, e))?;

    Ok((command, operand))
}

fn partition_json(router: PartitionRouter, record_id: i64) -> Value {
    // ---
    let range = router.partition_for(RecordId(record_id));
    json!({
        "record_id": record_id,
        "begin": range.begin,
        "end": range.end,
        "table": range.table_name(POINTS_TABLE),
    })
}

fn has_flag(flag: &str) -> bool {
    env::args().any(|arg| arg == flag)
}

fn print_json(value: &Value) -> Result<()> {
    // ---
    let text = if has_flag("--pretty") {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// Logs go to stderr so stdout carries only JSON. Configuration:
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `LCDB_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else the `LCDB_LOG_LEVEL` env var
fn init_tracing() {
    // ---
    let span_events = match env::var("LCDB_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LCDB_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
