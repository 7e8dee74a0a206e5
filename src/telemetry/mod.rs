//! Telemetry pipeline
//!
//! MIO and the applications above it advertise telemetry records — tuples of
//! `{prefix?, topic, value}` — through a process-wide sink, and read them
//! back through a generic parse driver. Two store backends exist:
//!
//! * **binary** ([`binary`]): a compact fixed-frame file format preserving
//!   the backend instrumentation payload layout (little-endian, magic
//!   `0x202E`, zero-padded to 8 bytes, at most 120 payload bytes), and
//! * **log** ([`text`]): human-readable `topic TYPE values` lines written
//!   through the log subsystem with a `[telem]` tag.
//!
//! The sink is global, like the `log` crate's logger: deep call sites
//! (IO submission paths, attribute queries) advertise without threading a
//! handle through every layer. With no sink configured, advertising is a
//! cheap no-op.

pub mod binary;
pub mod text;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::sync::Mutex;

use crate::config::TelemetryConfig;
use crate::error::Error;
use crate::logger;
use crate::util::time;
use crate::Result;

/// Which store backend records go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryStoreType {
    /// Telemetry is off.
    #[default]
    None,
    /// Text records through the log subsystem.
    Log,
    /// Fixed-frame binary file.
    Binary,
}

/// Value carried by one telemetry record.
///
/// Arrays carry at most `120 / element_width - 1` elements in the binary
/// encoding; timespan and timepoint are nanosecond quantities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryValue {
    None,
    U16(u16),
    U32(u32),
    U64(u64),
    Timespan(u64),
    Timepoint(u64),
    Str(String),
    ArrayU16(Vec<u16>),
    ArrayU32(Vec<u32>),
    ArrayU64(Vec<u64>),
}

impl TelemetryValue {
    /// Wire code of the value type.
    pub fn type_code(&self) -> u8 {
        match self {
            TelemetryValue::None => 1,
            TelemetryValue::U16(_) => 2,
            TelemetryValue::U32(_) => 3,
            TelemetryValue::U64(_) => 4,
            TelemetryValue::Timespan(_) => 5,
            TelemetryValue::Timepoint(_) => 6,
            TelemetryValue::Str(_) => 7,
            TelemetryValue::ArrayU16(_) => 8,
            TelemetryValue::ArrayU32(_) => 9,
            TelemetryValue::ArrayU64(_) => 10,
        }
    }

    /// Text name of the value type, as used by the log backend.
    pub fn type_name(&self) -> &'static str {
        match self {
            TelemetryValue::None => "NONE",
            TelemetryValue::U16(_) => "UINT16",
            TelemetryValue::U32(_) => "UINT32",
            TelemetryValue::U64(_) => "UINT64",
            TelemetryValue::Timespan(_) => "TIMESPAN",
            TelemetryValue::Timepoint(_) => "TIMEPOINT",
            TelemetryValue::Str(_) => "STRING",
            TelemetryValue::ArrayU16(_) => "ARRAY_UINT16",
            TelemetryValue::ArrayU32(_) => "ARRAY_UINT32",
            TelemetryValue::ArrayU64(_) => "ARRAY_UINT64",
        }
    }
}

/// One telemetry record. `time_str` is filled by the loaders only; encoders
/// never consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRec {
    pub time_str: Option<String>,
    pub prefix: Option<String>,
    pub topic: String,
    pub value: TelemetryValue,
}

impl TelemetryRec {
    pub fn new(topic: impl Into<String>, value: TelemetryValue) -> TelemetryRec {
        TelemetryRec { time_str: None, prefix: None, topic: topic.into(), value }
    }
}

enum Sink {
    Log,
    Binary(BufWriter<File>),
}

struct TelemetryState {
    prefix: Option<String>,
    sink: Sink,
}

static STATE: Mutex<Option<TelemetryState>> = Mutex::new(None);

/// Initialise the telemetry subsystem. `TelemetryStoreType::None` leaves
/// every advertise call a no-op. The log backend requires the log subsystem
/// to be initialised first; the binary backend requires an output path.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let sink = match config.store {
        TelemetryStoreType::None => {
            *STATE.lock().expect("telemetry state poisoned") = None;
            return Ok(());
        }
        TelemetryStoreType::Log => {
            if !logger::is_initialised() {
                return Err(Error::io(
                    "log subsystem must be initialised before log telemetry",
                ));
            }
            Sink::Log
        }
        TelemetryStoreType::Binary => {
            let path = config.path.as_ref().ok_or_else(|| {
                Error::invalid("binary telemetry store needs a path")
            })?;
            Sink::Binary(BufWriter::new(File::create(path)?))
        }
    };
    let state = TelemetryState { prefix: config.prefix.clone(), sink };
    *STATE.lock().expect("telemetry state poisoned") = Some(state);
    Ok(())
}

/// Flush and drop the sink.
pub fn fini() {
    let mut guard = STATE.lock().expect("telemetry state poisoned");
    if let Some(state) = guard.as_mut() {
        if let Sink::Binary(writer) = &mut state.sink {
            let _ = writer.flush();
        }
    }
    *guard = None;
}

/// Flush buffered records so a parser can read them back.
pub fn flush() -> Result<()> {
    let mut guard = STATE.lock().expect("telemetry state poisoned");
    match guard.as_mut() {
        Some(state) => match &mut state.sink {
            Sink::Binary(writer) => {
                writer.flush()?;
                Ok(())
            }
            Sink::Log => logger::flush(),
        },
        None => Ok(()),
    }
}

fn do_advertise(with_prefix: bool, topic: &str, value: TelemetryValue) -> Result<()> {
    let mut guard = STATE.lock().expect("telemetry state poisoned");
    let state = match guard.as_mut() {
        Some(state) => state,
        // Telemetry store not selected: do nothing.
        None => return Ok(()),
    };

    let rec = TelemetryRec {
        time_str: None,
        prefix: if with_prefix { state.prefix.clone() } else { None },
        topic: topic.to_string(),
        value,
    };
    match &mut state.sink {
        Sink::Log => {
            let line = text::encode(&rec)?;
            logger::telem_record(&line)
        }
        Sink::Binary(writer) => {
            let payload = binary::encode(&rec)?;
            binary::store_frame(writer, time::now_nanos(), &payload)
        }
    }
}

/// Advertise one record with the configured prefix.
pub fn advertise(topic: &str, value: TelemetryValue) -> Result<()> {
    do_advertise(true, topic, value)
}

/// Advertise one record without the prefix (internal MIO instrumentation).
pub fn advertise_noprefix(topic: &str, value: TelemetryValue) -> Result<()> {
    do_advertise(false, topic, value)
}

/// Generic parse driver: pulls records out of a stream produced by one of
/// the store backends.
pub struct TelemetryParser<R: BufRead> {
    store: TelemetryStoreType,
    reader: R,
}

impl<R: BufRead> TelemetryParser<R> {
    pub fn new(store: TelemetryStoreType, reader: R) -> Result<TelemetryParser<R>> {
        if store == TelemetryStoreType::None {
            return Err(Error::unsupported("no telemetry store selected"));
        }
        Ok(TelemetryParser { store, reader })
    }

    /// Load and decode the next record; `Ok(None)` at end of stream.
    pub fn next_rec(&mut self) -> Result<Option<TelemetryRec>> {
        match self.store {
            TelemetryStoreType::Binary => {
                match binary::load_frame(&mut self.reader)? {
                    Some((time_str, payload)) => {
                        let mut rec = binary::decode(&payload)?;
                        rec.time_str = Some(time_str);
                        Ok(Some(rec))
                    }
                    None => Ok(None),
                }
            }
            TelemetryStoreType::Log => {
                match text::load_line(&mut self.reader)? {
                    Some((time_str, body)) => {
                        let mut rec = text::decode(&body)?;
                        rec.time_str = Some(time_str);
                        Ok(Some(rec))
                    }
                    None => Ok(None),
                }
            }
            TelemetryStoreType::None => unreachable!("checked in new()"),
        }
    }
}
