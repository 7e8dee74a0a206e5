//! Binary telemetry codec and store
//!
//! The payload layout matches the backend instrumentation format the records
//! were originally packed into, so existing dumps keep decoding:
//!
//! ```text
//! magic 0x202E (u16 LE)
//! prefix flag (u8, 0 or 1)
//! [prefix length (u8) + prefix bytes]      if flag == 1
//! topic length (u8) + topic bytes
//! value type (u8)
//! value payload (scalars LE; arrays: u8 count + packed LE elements;
//!                strings: u8 length + bytes)
//! zero padding to the next multiple of 8 bytes
//! ```
//!
//! A payload is at most 120 bytes (15 u64 words); an over-size record fails
//! with `TooBig`. The file store wraps each payload in a fixed 128-byte
//! frame: a u64 LE wall-clock nanosecond timestamp followed by the payload
//! zero-padded to 120 bytes.

use std::io::{Read, Write};

use super::{TelemetryRec, TelemetryValue};
use crate::error::Error;
use crate::util::{time, wire};
use crate::Result;

/// Record magic, little-endian `0x2E 0x20` on the wire.
pub const MAGIC: u16 = 0x202e;

/// Upper bound on one encoded payload.
pub const MAX_PAYLOAD: usize = 120;

/// On-disk frame: timestamp word plus full-width payload.
pub const FRAME_LEN: usize = 8 + MAX_PAYLOAD;

const NO_PREFIX_SIGN: u8 = 0;
const PREFIX_SIGN: u8 = 1;

fn array_max_elms(elm_width: usize) -> usize {
    MAX_PAYLOAD / elm_width - 1
}

fn value_encoded_len(value: &TelemetryValue) -> Result<usize> {
    let len = match value {
        TelemetryValue::None => 0,
        TelemetryValue::U16(_) => 2,
        TelemetryValue::U32(_) => 4,
        TelemetryValue::U64(_)
        | TelemetryValue::Timespan(_)
        | TelemetryValue::Timepoint(_) => 8,
        TelemetryValue::Str(s) => 1 + s.len(),
        TelemetryValue::ArrayU16(a) => 1 + a.len() * 2,
        TelemetryValue::ArrayU32(a) => 1 + a.len() * 4,
        TelemetryValue::ArrayU64(a) => 1 + a.len() * 8,
    };
    Ok(len)
}

fn check_array_bounds(value: &TelemetryValue) -> Result<()> {
    let (len, width) = match value {
        TelemetryValue::ArrayU16(a) => (a.len(), 2),
        TelemetryValue::ArrayU32(a) => (a.len(), 4),
        TelemetryValue::ArrayU64(a) => (a.len(), 8),
        _ => return Ok(()),
    };
    if len == 0 || len > array_max_elms(width) {
        return Err(Error::invalid(format!(
            "array of {} elements outside 1..={}",
            len,
            array_max_elms(width)
        )));
    }
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.is_empty() || s.len() >= MAX_PAYLOAD {
        return Err(Error::invalid(format!(
            "string field of {} bytes outside 1..{}",
            s.len(),
            MAX_PAYLOAD
        )));
    }
    wire::put_u8(buf, s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_value(buf: &mut Vec<u8>, value: &TelemetryValue) -> Result<()> {
    match value {
        TelemetryValue::None => {}
        TelemetryValue::U16(v) => wire::put_u16_le(buf, *v),
        TelemetryValue::U32(v) => wire::put_u32_le(buf, *v),
        TelemetryValue::U64(v)
        | TelemetryValue::Timespan(v)
        | TelemetryValue::Timepoint(v) => wire::put_u64_le(buf, *v),
        TelemetryValue::Str(s) => put_string(buf, s)?,
        TelemetryValue::ArrayU16(a) => {
            wire::put_u8(buf, a.len() as u8);
            for v in a {
                wire::put_u16_le(buf, *v);
            }
        }
        TelemetryValue::ArrayU32(a) => {
            wire::put_u8(buf, a.len() as u8);
            for v in a {
                wire::put_u32_le(buf, *v);
            }
        }
        TelemetryValue::ArrayU64(a) => {
            wire::put_u8(buf, a.len() as u8);
            for v in a {
                wire::put_u64_le(buf, *v);
            }
        }
    }
    Ok(())
}

/// Encode one record into its padded payload.
pub fn encode(rec: &TelemetryRec) -> Result<Vec<u8>> {
    check_array_bounds(&rec.value)?;

    let mut len = 2 + 1; // magic + prefix flag
    if let Some(prefix) = &rec.prefix {
        len += 1 + prefix.len();
    }
    len += 1 + rec.topic.len();
    len += 1; // value type
    len += value_encoded_len(&rec.value)?;
    let padded = len.div_ceil(8) * 8;
    if padded > MAX_PAYLOAD {
        return Err(Error::too_big(format!(
            "encoded record is {} bytes, limit {}",
            padded, MAX_PAYLOAD
        )));
    }

    let mut buf = Vec::with_capacity(padded);
    wire::put_u16_le(&mut buf, MAGIC);
    match &rec.prefix {
        Some(prefix) => {
            wire::put_u8(&mut buf, PREFIX_SIGN);
            put_string(&mut buf, prefix)?;
        }
        None => wire::put_u8(&mut buf, NO_PREFIX_SIGN),
    }
    put_string(&mut buf, &rec.topic)?;
    wire::put_u8(&mut buf, rec.value.type_code());
    put_value(&mut buf, &rec.value)?;
    buf.resize(padded, 0x00);
    Ok(buf)
}

fn get_string(cur: &mut &[u8]) -> Result<String> {
    let len = wire::get_u8(cur)? as usize;
    if len == 0 || len >= MAX_PAYLOAD {
        return Err(Error::io("bad string length in record"));
    }
    let bytes = wire::get_bytes(cur, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::io("record string is not valid UTF-8"))
}

fn get_array<T>(
    cur: &mut &[u8],
    width: usize,
    mut get: impl FnMut(&mut &[u8]) -> Result<T>,
) -> Result<Vec<T>> {
    let nr_elms = wire::get_u8(cur)? as usize;
    if nr_elms > array_max_elms(width) {
        return Err(Error::io("array element count out of bounds"));
    }
    let mut elms = Vec::with_capacity(nr_elms);
    for _ in 0..nr_elms {
        elms.push(get(cur)?);
    }
    Ok(elms)
}

fn get_value(cur: &mut &[u8], type_code: u8) -> Result<TelemetryValue> {
    let value = match type_code {
        1 => TelemetryValue::None,
        2 => TelemetryValue::U16(wire::get_u16_le(cur)?),
        3 => TelemetryValue::U32(wire::get_u32_le(cur)?),
        4 => TelemetryValue::U64(wire::get_u64_le(cur)?),
        5 => TelemetryValue::Timespan(wire::get_u64_le(cur)?),
        6 => TelemetryValue::Timepoint(wire::get_u64_le(cur)?),
        7 => TelemetryValue::Str(get_string(cur)?),
        8 => TelemetryValue::ArrayU16(get_array(cur, 2, wire::get_u16_le)?),
        9 => TelemetryValue::ArrayU32(get_array(cur, 4, wire::get_u32_le)?),
        10 => TelemetryValue::ArrayU64(get_array(cur, 8, wire::get_u64_le)?),
        other => {
            return Err(Error::io(format!("unknown value type {}", other)));
        }
    };
    Ok(value)
}

/// Decode one payload back into a record. The time string is left unset;
/// the loader owns it.
pub fn decode(payload: &[u8]) -> Result<TelemetryRec> {
    let mut cur = payload;
    let magic = wire::get_u16_le(&mut cur)?;
    if magic != MAGIC {
        return Err(Error::io(format!("bad record magic {:#06x}", magic)));
    }
    let prefix = match wire::get_u8(&mut cur)? {
        NO_PREFIX_SIGN => None,
        PREFIX_SIGN => Some(get_string(&mut cur)?),
        other => {
            return Err(Error::io(format!("bad prefix flag {}", other)));
        }
    };
    let topic = get_string(&mut cur)?;
    let type_code = wire::get_u8(&mut cur)?;
    let value = get_value(&mut cur, type_code)?;
    Ok(TelemetryRec { time_str: None, prefix, topic, value })
}

/// Append one frame to the store.
pub fn store_frame(writer: &mut impl Write, nanos: u64, payload: &[u8]) -> Result<()> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut frame = [0u8; FRAME_LEN];
    frame[..8].copy_from_slice(&nanos.to_le_bytes());
    frame[8..8 + payload.len()].copy_from_slice(payload);
    writer.write_all(&frame)?;
    Ok(())
}

/// Read the next frame; `Ok(None)` at a clean end of stream.
pub fn load_frame(reader: &mut impl Read) -> Result<Option<(String, Vec<u8>)>> {
    let mut frame = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        let n = reader.read(&mut frame[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::io("truncated telemetry frame"));
        }
        filled += n;
    }
    let nanos = u64::from_le_bytes(frame[..8].try_into().expect("8-byte slice"));
    Ok(Some((time::format_timestamp(nanos), frame[8..].to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(rec: &TelemetryRec) -> TelemetryRec {
        let payload = encode(rec).unwrap();
        assert_eq!(payload.len() % 8, 0);
        assert!(payload.len() <= MAX_PAYLOAD);
        decode(&payload).unwrap()
    }

    #[test]
    fn test_roundtrip_every_type() {
        let values = vec![
            TelemetryValue::None,
            TelemetryValue::U16(0xbeef),
            TelemetryValue::U32(0xdead_beef),
            TelemetryValue::U64(u64::MAX - 3),
            TelemetryValue::Timespan(1_000_000_007),
            TelemetryValue::Timepoint(1_600_000_000_000_000_000),
            TelemetryValue::Str("checkpoint".to_string()),
            TelemetryValue::ArrayU16(vec![1, 2, 3, 4]),
            TelemetryValue::ArrayU32(vec![7; 9]),
            TelemetryValue::ArrayU64(vec![u64::MAX, 0, 42]),
        ];
        for value in values {
            let rec = TelemetryRec {
                time_str: None,
                prefix: Some("wf".to_string()),
                topic: "mio-rw".to_string(),
                value,
            };
            assert_eq!(roundtrip(&rec), rec);
        }
    }

    #[test]
    fn test_encoded_layout() {
        // {prefix="p", topic="t", ARRAY_U64 [1,2,3]}
        let rec = TelemetryRec {
            time_str: None,
            prefix: Some("p".to_string()),
            topic: "t".to_string(),
            value: TelemetryValue::ArrayU64(vec![1, 2, 3]),
        };
        let payload = encode(&rec).unwrap();
        assert_eq!(payload.len() % 8, 0);
        assert!(payload.len() <= MAX_PAYLOAD);
        assert_eq!(&payload[0..2], &[0x2e, 0x20]); // magic, LE
        assert_eq!(payload[2], 1); // prefix flag
        assert_eq!(payload[3], 1); // prefix length
        assert_eq!(payload[4], b'p');
        assert_eq!(payload[5], 1); // topic length
        assert_eq!(payload[6], b't');
        assert_eq!(payload[7], 10); // ARRAY_UINT64
        assert_eq!(payload[8], 3); // element count
        assert_eq!(&payload[9..17], &1u64.to_le_bytes());
    }

    #[test]
    fn test_no_prefix_flag() {
        let rec = TelemetryRec::new("topic", TelemetryValue::U64(9));
        let payload = encode(&rec).unwrap();
        assert_eq!(payload[2], 0);
        let back = decode(&payload).unwrap();
        assert_eq!(back.prefix, None);
    }

    #[test]
    fn test_oversize_record_rejected() {
        let rec = TelemetryRec::new(
            "x".repeat(110),
            TelemetryValue::U64(1),
        );
        let err = encode(&rec).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TooBig);
    }

    #[test]
    fn test_array_bounds() {
        // 14 u64 elements fit (1 + 14*8 = 113 value bytes won't fit with
        // headers, so use the documented bound check directly).
        let rec = TelemetryRec::new("t", TelemetryValue::ArrayU64(vec![0; 15]));
        assert!(encode(&rec).is_err());

        let rec = TelemetryRec::new("t", TelemetryValue::ArrayU16(vec![0; 60]));
        let err = encode(&rec).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        let rec = TelemetryRec::new("t", TelemetryValue::ArrayU16(vec![7; 50]));
        assert!(encode(&rec).is_ok());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let rec = TelemetryRec::new("t", TelemetryValue::U16(1));
        let mut payload = encode(&rec).unwrap();
        payload[0] = 0xff;
        assert!(decode(&payload).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let rec = TelemetryRec::new("t", TelemetryValue::U64(77));
        let payload = encode(&rec).unwrap();

        let mut store: Vec<u8> = Vec::new();
        store_frame(&mut store, 1_600_000_000_000_000_000, &payload).unwrap();
        store_frame(&mut store, 1_600_000_000_000_000_001, &payload).unwrap();
        assert_eq!(store.len(), 2 * FRAME_LEN);

        let mut cursor = store.as_slice();
        let (time_str, loaded) = load_frame(&mut cursor).unwrap().unwrap();
        assert!(!time_str.is_empty());
        assert_eq!(&loaded[..payload.len()], payload.as_slice());
        assert!(load_frame(&mut cursor).unwrap().is_some());
        assert!(load_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut store: Vec<u8> = vec![0u8; FRAME_LEN - 1];
        store[..2].copy_from_slice(&[0, 0]);
        let mut cursor = store.as_slice();
        assert!(load_frame(&mut cursor).is_err());
    }
}
