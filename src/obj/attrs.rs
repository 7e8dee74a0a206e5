//! Object attributes: wire format and metadata-KVS access
//!
//! The backend does not keep an object size of its own, so MIO stores the
//! attributes of every object — size, access statistics and the persistent
//! hints — as one record in the reserved metadata KV set, keyed by the
//! 16-byte object id. The record layout is
//!
//! ```text
//! size     u64 LE
//! stats    6 x u64 LE  (rcount rbytes rtime wcount wbytes wtime)
//! nr_hints i32 LE      (persistent hints only, 0..=32)
//! keys     nr_hints x i32 LE
//! values   nr_hints x u64 LE
//! ```
//!
//! Decoding validates the hint count and that the declared layout matches
//! the buffer length exactly.
//!
//! Attribute queries ride the normal KV path: [`attrs_query`] appends the
//! GET/PUT/DEL sub-op to the caller's op, with a decode post-processor for
//! GET. [`store_sync`] is the synchronous PUT used by close and the hint
//! API.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::hints::{self, HintMap, OBJ_HINT_CAPACITY};
use crate::kvs::{KvPair, KvsBatch};
use crate::op::{Op, OpCode, OpOutput, PostProc, Progress};
use crate::telemetry::{self, TelemetryValue};
use crate::util::wire;
use crate::Result;

use super::ObjInner;

/// Object access statistics, persisted with the object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjStats {
    pub rcount: u64,
    pub rbytes: u64,
    /// Cumulative read latency in nanoseconds.
    pub rtime: u64,
    pub wcount: u64,
    pub wbytes: u64,
    /// Cumulative write latency in nanoseconds.
    pub wtime: u64,
}

/// Attributes stored to and loaded from the metadata KV set.
#[derive(Debug, Clone, Default)]
pub struct ObjAttrs {
    /// Logical byte length: the highest end-of-write seen.
    pub size: u64,
    pub stats: ObjStats,
    /// Persistent hints only.
    pub phints: HintMap,
}

const NONHINT_SIZE: usize = 8 + 6 * 8;

/// Encode attributes for the metadata PUT. The persistent subset is
/// rebuilt from the full hint map so the record always reflects the
/// handle's current hints.
pub fn encode_attrs(attrs: &ObjAttrs, all_hints: &HintMap) -> Vec<u8> {
    let phints = hints::persistent_hints(all_hints);
    let mut buf =
        Vec::with_capacity(NONHINT_SIZE + 4 + phints.len() * (4 + 8));
    wire::put_u64_le(&mut buf, attrs.size);
    wire::put_u64_le(&mut buf, attrs.stats.rcount);
    wire::put_u64_le(&mut buf, attrs.stats.rbytes);
    wire::put_u64_le(&mut buf, attrs.stats.rtime);
    wire::put_u64_le(&mut buf, attrs.stats.wcount);
    wire::put_u64_le(&mut buf, attrs.stats.wbytes);
    wire::put_u64_le(&mut buf, attrs.stats.wtime);
    wire::put_i32_le(&mut buf, phints.len() as i32);
    for (key, _) in phints.iter() {
        wire::put_i32_le(&mut buf, key);
    }
    for (_, value) in phints.iter() {
        wire::put_u64_le(&mut buf, value);
    }
    buf
}

/// Decode an attribute record.
pub fn decode_attrs(buf: &[u8]) -> Result<ObjAttrs> {
    let mut cur = buf;
    let size = wire::get_u64_le(&mut cur)?;
    let stats = ObjStats {
        rcount: wire::get_u64_le(&mut cur)?,
        rbytes: wire::get_u64_le(&mut cur)?,
        rtime: wire::get_u64_le(&mut cur)?,
        wcount: wire::get_u64_le(&mut cur)?,
        wbytes: wire::get_u64_le(&mut cur)?,
        wtime: wire::get_u64_le(&mut cur)?,
    };
    let nr_hints = wire::get_i32_le(&mut cur)?;
    if nr_hints < 0 || nr_hints as usize > OBJ_HINT_CAPACITY {
        return Err(Error::io(format!(
            "attribute record carries {} hints, limit {}",
            nr_hints, OBJ_HINT_CAPACITY
        )));
    }
    let nr_hints = nr_hints as usize;
    let expected = NONHINT_SIZE + 4 + nr_hints * (4 + 8);
    if buf.len() != expected {
        return Err(Error::io(format!(
            "attribute record is {} bytes, layout says {}",
            buf.len(),
            expected
        )));
    }

    let mut keys = Vec::with_capacity(nr_hints);
    for _ in 0..nr_hints {
        keys.push(wire::get_i32_le(&mut cur)?);
    }
    let mut phints = HintMap::for_obj();
    for key in keys {
        let value = wire::get_u64_le(&mut cur)?;
        phints
            .set(key, value)
            .map_err(|_| Error::io("attribute record hint overflow"))?;
    }
    Ok(ObjAttrs { size, stats, phints })
}

/// Kind of metadata query to chain onto an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrsQuery {
    /// Fetch and decode into the handle; optionally expose the size as the
    /// op output.
    Get { output_size: bool },
    /// Store the current attributes.
    Put,
    /// Remove the attribute record.
    Del,
}

/// Append the metadata sub-op for `query` to `op`.
pub(crate) fn attrs_query(
    obj: Arc<ObjInner>,
    query: AttrsQuery,
    op: &mut Op,
) -> Result<()> {
    let key = obj.id.as_bytes().to_vec();
    let _ = telemetry::advertise_noprefix(
        "mio-op-to-backend-kv",
        TelemetryValue::ArrayU64(vec![obj.sess_seqno, op.seqno()]),
    );
    match query {
        AttrsQuery::Get { output_size } => {
            let batch =
                Arc::new(Mutex::new(KvsBatch::new(vec![KvPair::key_only(key)])));
            let post = attrs_decode_post(obj.clone(), batch.clone(), output_size);
            obj.driver.kvs_get(&obj.md_kvs, batch, op, Some(post))
        }
        AttrsQuery::Put => {
            let val = {
                let state = obj.lock_state();
                encode_attrs(&state.attrs, &state.hints)
            };
            let batch =
                Arc::new(Mutex::new(KvsBatch::new(vec![KvPair::new(key, val)])));
            obj.driver.kvs_put(&obj.md_kvs, batch, op, None)
        }
        AttrsQuery::Del => {
            let batch =
                Arc::new(Mutex::new(KvsBatch::new(vec![KvPair::key_only(key)])));
            obj.driver.kvs_del(&obj.md_kvs, batch, op, None)
        }
    }
}

/// Post-processor decoding a fetched attribute record into the handle.
/// A missing record (fresh object) leaves the defaults in place.
fn attrs_decode_post(
    obj: Arc<ObjInner>,
    batch: Arc<Mutex<KvsBatch>>,
    output_size: bool,
) -> PostProc {
    Box::new(move |op: &mut Op| {
        let record = {
            let guard = batch.lock().expect("attrs batch poisoned");
            match guard.rcs.first() {
                Some(Ok(())) if !guard.pairs[0].val.is_empty() => {
                    Some(guard.pairs[0].val.clone())
                }
                _ => None,
            }
        };
        let mut state = obj.lock_state();
        if let Some(buf) = record {
            let attrs = decode_attrs(&buf)?;
            state.attrs.size = attrs.size;
            state.attrs.stats = attrs.stats;
            state.hints.copy_from(&attrs.phints)?;
            state.attrs.phints = attrs.phints;
        }
        if output_size {
            op.output = OpOutput::Size(state.attrs.size);
        }
        Ok(Progress::Final)
    })
}

/// Synchronously persist the attribute record (used by close and by the
/// hint API). Clears the dirty flag on success.
pub(crate) fn store_sync(obj: &Arc<ObjInner>) -> Result<()> {
    let mut op = obj.new_op(OpCode::ObjAttrsSet);
    attrs_query(obj.clone(), AttrsQuery::Put, &mut op)?;
    op.wait(None)?;
    obj.lock_state().attrs_updated = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints::ObjHintKey;

    fn sample_attrs() -> (ObjAttrs, HintMap) {
        let attrs = ObjAttrs {
            size: 123456,
            stats: ObjStats {
                rcount: 1,
                rbytes: 2,
                rtime: 3,
                wcount: 4,
                wbytes: 5,
                wtime: 6,
            },
            phints: HintMap::for_obj(),
        };
        let mut hints = HintMap::for_obj();
        hints.set(ObjHintKey::Lifetime as i32, 100).unwrap();
        hints.set(ObjHintKey::Where as i32, 0x101).unwrap();
        hints.set(ObjHintKey::HotIndex as i32, 9).unwrap();
        (attrs, hints)
    }

    #[test]
    fn test_codec_roundtrip_filters_session_hints() {
        let (attrs, hints) = sample_attrs();
        let buf = encode_attrs(&attrs, &hints);
        // size + stats + count + 2 persistent hints
        assert_eq!(buf.len(), 56 + 4 + 2 * 12);

        let decoded = decode_attrs(&buf).unwrap();
        assert_eq!(decoded.size, attrs.size);
        assert_eq!(decoded.stats, attrs.stats);
        assert_eq!(decoded.phints.len(), 2);
        assert_eq!(decoded.phints.get(ObjHintKey::Lifetime as i32), Some(100));
        assert_eq!(decoded.phints.get(ObjHintKey::HotIndex as i32), Some(9));
        assert_eq!(decoded.phints.get(ObjHintKey::Where as i32), None);
    }

    #[test]
    fn test_codec_no_hints() {
        let attrs = ObjAttrs::default();
        let buf = encode_attrs(&attrs, &HintMap::for_obj());
        assert_eq!(buf.len(), 60);
        let decoded = decode_attrs(&buf).unwrap();
        assert_eq!(decoded.size, 0);
        assert!(decoded.phints.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_hint_count() {
        let (attrs, hints) = sample_attrs();
        let mut buf = encode_attrs(&attrs, &hints);
        // overwrite nr_hints with 33
        buf[56..60].copy_from_slice(&33i32.to_le_bytes());
        assert!(decode_attrs(&buf).is_err());
        buf[56..60].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(decode_attrs(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let (attrs, hints) = sample_attrs();
        let mut buf = encode_attrs(&attrs, &hints);
        buf.push(0);
        assert!(decode_attrs(&buf).is_err());
        buf.truncate(buf.len() - 2);
        assert!(decode_attrs(&buf).is_err());
    }
}
