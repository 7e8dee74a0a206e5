//! Log file backend
//!
//! MIO writes its diagnostics and the text-backend telemetry records into a
//! single process-wide log file. Records have the shape
//!
//! ```text
//! [level] 2021-03-05-14:02:07.123456789 message
//! ```
//!
//! Diagnostics go through the `log` crate façade (a [`MioLogger`] is
//! installed on first init); telemetry records are written directly with the
//! reserved `[telem]` tag so that the telemetry loader can pick them out of
//! the stream again. Writes are buffered and flushed once a byte threshold
//! is crossed.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Error;
use crate::util::time;
use crate::Result;

/// Tag used for telemetry records in the log stream.
pub const TELEM_TAG: &str = "telem";

const FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

struct LogSink {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_since_flush: usize,
}

static SINK: Mutex<Option<LogSink>> = Mutex::new(None);

/// Initialise the log subsystem: create a fresh log file named
/// `<app>-<pid>-<timestamp>.log` under `dir` (current directory if `None`)
/// and install the `log` façade backend at `level`.
pub fn init(level: &str, dir: Option<&Path>) -> Result<PathBuf> {
    let app = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "mio-app".to_string());
    let fname = format!("{}-{}-{}.log", app, std::process::id(), time::file_timestamp());
    let path = match dir {
        Some(d) => d.join(fname),
        None => PathBuf::from(fname),
    };
    init_at(level, &path)?;
    Ok(path)
}

/// Initialise the log subsystem with an explicit file path.
pub fn init_at(level: &str, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let sink = LogSink {
        writer: BufWriter::new(file),
        path: path.to_path_buf(),
        bytes_since_flush: 0,
    };
    let mut guard = SINK.lock().expect("log sink poisoned");
    *guard = Some(sink);
    drop(guard);

    // Install the façade backend once; re-init only retargets the file.
    let filter = parse_level(level)?;
    let _ = log::set_boxed_logger(Box::new(MioLogger));
    log::set_max_level(filter);
    Ok(())
}

/// Whether a log file is currently open.
pub fn is_initialised() -> bool {
    SINK.lock().expect("log sink poisoned").is_some()
}

/// Path of the current log file, if any.
pub fn current_path() -> Option<PathBuf> {
    SINK.lock().expect("log sink poisoned").as_ref().map(|s| s.path.clone())
}

/// Flush and close the log file.
pub fn fini() {
    let mut guard = SINK.lock().expect("log sink poisoned");
    if let Some(sink) = guard.as_mut() {
        let _ = sink.writer.flush();
    }
    *guard = None;
}

fn parse_level(level: &str) -> Result<log::LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Ok(log::LevelFilter::Off),
        "error" => Ok(log::LevelFilter::Error),
        "warn" | "warning" => Ok(log::LevelFilter::Warn),
        "info" => Ok(log::LevelFilter::Info),
        "debug" => Ok(log::LevelFilter::Debug),
        "trace" => Ok(log::LevelFilter::Trace),
        other => Err(Error::invalid(format!("unknown log level '{}'", other))),
    }
}

fn write_record(tag: &str, message: &str) -> Result<()> {
    let mut guard = SINK.lock().expect("log sink poisoned");
    let sink = guard
        .as_mut()
        .ok_or_else(|| Error::io("log subsystem not initialised"))?;
    let line = format!(
        "[{}] {} {}\n",
        tag,
        time::format_timestamp(time::now_nanos()),
        message
    );
    sink.writer.write_all(line.as_bytes())?;
    sink.bytes_since_flush += line.len();
    if sink.bytes_since_flush >= FLUSH_THRESHOLD {
        sink.writer.flush()?;
        sink.bytes_since_flush = 0;
    }
    Ok(())
}

/// Append one telemetry record line, tagged `[telem]`.
pub fn telem_record(encoded: &str) -> Result<()> {
    write_record(TELEM_TAG, encoded)
}

/// Flush buffered records to disk (telemetry loaders read the file back).
pub fn flush() -> Result<()> {
    let mut guard = SINK.lock().expect("log sink poisoned");
    if let Some(sink) = guard.as_mut() {
        sink.writer.flush()?;
        sink.bytes_since_flush = 0;
    }
    Ok(())
}

/// Serialises tests that retarget the process-wide log sink.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

/// `log` façade backend writing into the MIO log file.
struct MioLogger;

impl log::Log for MioLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            log::Level::Error => "error",
            log::Level::Warn => "warning",
            log::Level::Info => "info",
            log::Level::Debug => "debug",
            log::Level::Trace => "trace",
        };
        let _ = write_record(tag, &format!("{}", record.args()));
    }

    fn flush(&self) {
        let _ = flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_telem_records_share_the_file() {
        let _guard = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mio-test.log");
        init_at("debug", &path).unwrap();

        log::info!("driver initialised");
        telem_record("mio-obj-open UINT64 42").unwrap();
        flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().any(|l| l.starts_with("[info]")));
        assert!(text
            .lines()
            .any(|l| l.starts_with("[telem]") && l.ends_with("mio-obj-open UINT64 42")));
        fini();
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(parse_level("loud").is_err());
        assert!(parse_level("TRACE").is_ok());
    }
}
