//! Telemetry parser tool
//!
//! Reads a telemetry stream produced by either store backend and prints one
//! line per record:
//!
//! ```text
//! * TIME [PREFIX] TOPIC VALUE...
//! ```
//!
//! Malformed records are reported on stderr and skipped. `--json` emits one
//! JSON object per record instead of the starred text lines.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use maestro_io::telemetry::{
    TelemetryParser, TelemetryRec, TelemetryStoreType, TelemetryValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Log,
    Binary,
}

impl From<StoreKind> for TelemetryStoreType {
    fn from(kind: StoreKind) -> TelemetryStoreType {
        match kind {
            StoreKind::Log => TelemetryStoreType::Log,
            StoreKind::Binary => TelemetryStoreType::Binary,
        }
    }
}

/// Render an MIO telemetry stream as text.
#[derive(Debug, Parser)]
#[command(name = "mio-telemetry-parser", version)]
struct Cli {
    /// Telemetry stream to parse.
    file: PathBuf,

    /// Which store backend produced the stream.
    #[arg(value_enum)]
    store: StoreKind,

    /// Emit one JSON object per record instead of text lines.
    #[arg(long)]
    json: bool,
}

fn values_of(value: &TelemetryValue) -> Vec<serde_json::Value> {
    match value {
        TelemetryValue::None => Vec::new(),
        TelemetryValue::U16(v) => vec![(*v).into()],
        TelemetryValue::U32(v) => vec![(*v).into()],
        TelemetryValue::U64(v)
        | TelemetryValue::Timespan(v)
        | TelemetryValue::Timepoint(v) => vec![(*v).into()],
        TelemetryValue::Str(s) => vec![s.clone().into()],
        TelemetryValue::ArrayU16(a) => a.iter().map(|v| (*v).into()).collect(),
        TelemetryValue::ArrayU32(a) => a.iter().map(|v| (*v).into()).collect(),
        TelemetryValue::ArrayU64(a) => a.iter().map(|v| (*v).into()).collect(),
    }
}

fn print_text(rec: &TelemetryRec) {
    let mut line = String::from("* ");
    if let Some(time) = &rec.time_str {
        line.push_str(time);
        line.push(' ');
    }
    if let Some(prefix) = &rec.prefix {
        line.push_str(prefix);
        line.push(' ');
    }
    line.push_str(&rec.topic);
    for value in values_of(&rec.value) {
        line.push(' ');
        match value {
            serde_json::Value::String(s) => line.push_str(&s),
            other => line.push_str(&other.to_string()),
        }
    }
    println!("{}", line);
}

fn print_json(rec: &TelemetryRec) -> Result<()> {
    let object = serde_json::json!({
        "time": rec.time_str,
        "prefix": rec.prefix,
        "topic": rec.topic,
        "type": rec.value.type_name(),
        "values": values_of(&rec.value),
    });
    println!("{}", serde_json::to_string(&object)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = File::open(&cli.file)
        .with_context(|| format!("cannot open {}", cli.file.display()))?;
    let mut parser = TelemetryParser::new(cli.store.into(), BufReader::new(file))
        .context("telemetry parser setup")?;

    let mut nr_records = 0u64;
    let mut nr_bad = 0u64;
    loop {
        match parser.next_rec() {
            Ok(Some(rec)) => {
                nr_records += 1;
                if cli.json {
                    print_json(&rec)?;
                } else {
                    print_text(&rec);
                }
            }
            Ok(None) => break,
            Err(err) => {
                nr_bad += 1;
                eprintln!("skipping bad record: {}", err);
            }
        }
    }
    if nr_bad > 0 {
        eprintln!("{} records parsed, {} skipped", nr_records, nr_bad);
    }
    Ok(())
}
