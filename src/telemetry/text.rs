//! Text (log) telemetry codec
//!
//! The log backend stores each record as one readable line,
//!
//! ```text
//! [telem] TIMESTAMP [PREFIX] TOPIC TYPE VALUE...
//! ```
//!
//! where the `[telem]` tag and the timestamp are supplied by the log
//! subsystem. Array values are written as an element count followed by the
//! elements. The loader scans an arbitrary log stream and picks out the
//! tagged lines, returning the timestamp and the record body separately.

use std::io::BufRead;

use super::{TelemetryRec, TelemetryValue};
use crate::error::Error;
use crate::logger;
use crate::Result;

/// Marker distinguishing a prefixed record body from a plain topic token.
const PREFIX_MARK: char = '@';

fn type_by_name(name: &str) -> Option<u8> {
    match name {
        "NONE" => Some(1),
        "UINT16" => Some(2),
        "UINT32" => Some(3),
        "UINT64" => Some(4),
        "TIMESPAN" => Some(5),
        "TIMEPOINT" => Some(6),
        "STRING" => Some(7),
        "ARRAY_UINT16" => Some(8),
        "ARRAY_UINT32" => Some(9),
        "ARRAY_UINT64" => Some(10),
        _ => None,
    }
}

/// Encode a record body (everything after the log timestamp).
pub fn encode(rec: &TelemetryRec) -> Result<String> {
    let mut out = String::new();
    if let Some(prefix) = &rec.prefix {
        if prefix.contains(char::is_whitespace) {
            return Err(Error::invalid("prefix must not contain whitespace"));
        }
        out.push(PREFIX_MARK);
        out.push_str(prefix);
        out.push(' ');
    }
    if rec.topic.is_empty() || rec.topic.contains(char::is_whitespace) {
        return Err(Error::invalid("topic must be one non-empty token"));
    }
    out.push_str(&rec.topic);
    out.push(' ');
    out.push_str(rec.value.type_name());
    match &rec.value {
        TelemetryValue::None => {}
        TelemetryValue::U16(v) => out.push_str(&format!(" {}", v)),
        TelemetryValue::U32(v) => out.push_str(&format!(" {}", v)),
        TelemetryValue::U64(v)
        | TelemetryValue::Timespan(v)
        | TelemetryValue::Timepoint(v) => out.push_str(&format!(" {}", v)),
        TelemetryValue::Str(s) => {
            if s.is_empty() || s.contains(char::is_whitespace) {
                return Err(Error::invalid("string value must be one token"));
            }
            out.push_str(&format!(" {}", s));
        }
        TelemetryValue::ArrayU16(a) => {
            out.push_str(&format!(" {}", a.len()));
            for v in a {
                out.push_str(&format!(" {}", v));
            }
        }
        TelemetryValue::ArrayU32(a) => {
            out.push_str(&format!(" {}", a.len()));
            for v in a {
                out.push_str(&format!(" {}", v));
            }
        }
        TelemetryValue::ArrayU64(a) => {
            out.push_str(&format!(" {}", a.len()));
            for v in a {
                out.push_str(&format!(" {}", v));
            }
        }
    }
    Ok(out)
}

fn parse_scalar<T: std::str::FromStr>(token: Option<&str>, what: &str) -> Result<T> {
    token
        .ok_or_else(|| Error::io(format!("record is missing the {} field", what)))?
        .parse::<T>()
        .map_err(|_| Error::io(format!("cannot parse {} field", what)))
}

fn parse_array<T: std::str::FromStr>(
    tokens: &mut std::str::SplitWhitespace<'_>,
) -> Result<Vec<T>> {
    let nr_elms: usize = parse_scalar(tokens.next(), "array count")?;
    let mut elms = Vec::with_capacity(nr_elms);
    for _ in 0..nr_elms {
        elms.push(parse_scalar(tokens.next(), "array element")?);
    }
    Ok(elms)
}

/// Decode a record body produced by [`encode`].
pub fn decode(body: &str) -> Result<TelemetryRec> {
    let mut tokens = body.split_whitespace();
    let mut first = tokens
        .next()
        .ok_or_else(|| Error::io("empty telemetry record"))?;

    let prefix = if let Some(stripped) = first.strip_prefix(PREFIX_MARK) {
        let prefix = stripped.to_string();
        first = tokens
            .next()
            .ok_or_else(|| Error::io("record has prefix but no topic"))?;
        Some(prefix)
    } else {
        None
    };
    let topic = first.to_string();

    let type_name = tokens
        .next()
        .ok_or_else(|| Error::io("record is missing the type field"))?;
    let type_code = type_by_name(type_name)
        .ok_or_else(|| Error::io(format!("unknown record type '{}'", type_name)))?;

    let value = match type_code {
        1 => TelemetryValue::None,
        2 => TelemetryValue::U16(parse_scalar(tokens.next(), "value")?),
        3 => TelemetryValue::U32(parse_scalar(tokens.next(), "value")?),
        4 => TelemetryValue::U64(parse_scalar(tokens.next(), "value")?),
        5 => TelemetryValue::Timespan(parse_scalar(tokens.next(), "value")?),
        6 => TelemetryValue::Timepoint(parse_scalar(tokens.next(), "value")?),
        7 => TelemetryValue::Str(parse_scalar(tokens.next(), "value")?),
        8 => TelemetryValue::ArrayU16(parse_array(&mut tokens)?),
        9 => TelemetryValue::ArrayU32(parse_array(&mut tokens)?),
        10 => TelemetryValue::ArrayU64(parse_array(&mut tokens)?),
        _ => unreachable!("type_by_name covers all codes"),
    };
    Ok(TelemetryRec { time_str: None, prefix, topic, value })
}

/// Scan `reader` for the next `[telem]` line; returns the timestamp token
/// and the record body. `Ok(None)` at end of stream.
pub fn load_line(reader: &mut impl BufRead) -> Result<Option<(String, String)>> {
    let tag = format!("[{}] ", logger::TELEM_TAG);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let Some(rest) = line.trim_end().strip_prefix(&tag) else {
            continue;
        };
        let mut split = rest.splitn(2, ' ');
        let time_str = match split.next() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => continue,
        };
        let body = match split.next() {
            Some(b) if !b.trim().is_empty() => b.to_string(),
            _ => continue,
        };
        return Ok(Some((time_str, body)));
    }
}
