//! Object access layer
//!
//! An [`Obj`] is the in-memory handle of an opened (or freshly created)
//! object. The handle shares its mutable state — attributes, hints, the
//! dirty flag — behind a mutex so that post-processors running from the
//! polling or dispatcher thread can update it while the application still
//! holds the handle.
//!
//! Opening fetches the object's attribute record from the metadata KV set
//! and merges the persisted hints into the handle; closing writes the
//! record back when anything changed. Every open session gets a fresh
//! session sequence number so telemetry can correlate all operations issued
//! through one handle.

pub mod attrs;
pub mod composite;
pub mod io;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::driver::Driver;
use crate::error::Error;
use crate::hints::{self, HintMap, ObjHintKey};
use crate::kvs::{KvsId, OBJ_MD_KVS_ID};
use crate::op::{Op, OpCode, OpSubject};
use crate::pool::PoolId;
use crate::{Mio, Result};

use attrs::ObjAttrs;

pub const OBJ_ID_LEN: usize = 16;

/// Object identifier: 16 bytes, two big-endian u64 words. The byte
/// representation is what goes on the wire (metadata keys, extent keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId([u8; OBJ_ID_LEN]);

impl ObjId {
    pub const fn from_hi_lo(hi: u64, lo: u64) -> ObjId {
        let h = hi.to_be_bytes();
        let l = lo.to_be_bytes();
        let mut bytes = [0u8; OBJ_ID_LEN];
        let mut i = 0;
        while i < 8 {
            bytes[i] = h[i];
            bytes[i + 8] = l[i];
            i += 1;
        }
        ObjId(bytes)
    }

    pub fn hi_lo(&self) -> (u64, u64) {
        let hi = u64::from_be_bytes(self.0[..8].try_into().expect("8 bytes"));
        let lo = u64::from_be_bytes(self.0[8..].try_into().expect("8 bytes"));
        (hi, lo)
    }

    pub fn as_bytes(&self) -> &[u8; OBJ_ID_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ObjId> {
        let arr: [u8; OBJ_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::invalid("object id must be 16 bytes"))?;
        Ok(ObjId(arr))
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hi, lo) = self.hi_lo();
        write!(f, "{:x}:{:x}", hi, lo)
    }
}

/// Mutable per-handle state, shared with post-processors.
pub(crate) struct ObjState {
    pub attrs: ObjAttrs,
    /// Persistent + session hints set for this object.
    pub hints: HintMap,
    /// Attributes changed since the last metadata PUT.
    pub attrs_updated: bool,
    /// Whole-object lock held by this handle.
    pub locked: bool,
}

/// Shared core of an object handle. Post-processors capture an
/// `Arc<ObjInner>` and go through [`ObjInner::state`].
pub struct ObjInner {
    pub(crate) id: ObjId,
    pub(crate) sess_seqno: u64,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) md_kvs: KvsId,
    pub(crate) op_seqno: Arc<AtomicU64>,
    pub(crate) state: Mutex<ObjState>,
}

impl ObjInner {
    pub(crate) fn new(
        id: ObjId,
        driver: Arc<dyn Driver>,
        op_seqno: Arc<AtomicU64>,
        sess_seqno: u64,
    ) -> Arc<ObjInner> {
        Arc::new(ObjInner {
            id,
            sess_seqno,
            driver,
            md_kvs: OBJ_MD_KVS_ID,
            op_seqno,
            state: Mutex::new(ObjState {
                attrs: ObjAttrs::default(),
                hints: HintMap::for_obj(),
                attrs_updated: false,
                locked: false,
            }),
        })
    }

    pub fn id(&self) -> ObjId {
        self.id
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ObjState> {
        self.state.lock().expect("object state poisoned")
    }

    pub(crate) fn new_op(&self, opcode: OpCode) -> Op {
        let seqno = self.op_seqno.fetch_add(1, Ordering::Relaxed) + 1;
        Op::new(self.driver.clone(), seqno, opcode, OpSubject::Obj(self.id))
    }
}

/// Handle of an opened object.
pub struct Obj {
    pub(crate) inner: Arc<ObjInner>,
}

impl Obj {
    pub fn id(&self) -> ObjId {
        self.inner.id
    }

    /// Sequence number of this open session.
    pub fn sess_seqno(&self) -> u64 {
        self.inner.sess_seqno
    }

    /// Object size as currently known to the handle. Refresh with
    /// [`Obj::query_size`].
    pub fn size(&self) -> u64 {
        self.inner.lock_state().attrs.size
    }

    /// Access statistics as currently known to the handle.
    pub fn stats(&self) -> attrs::ObjStats {
        self.inner.lock_state().attrs.stats
    }

    /// Launch an attribute refresh; the completed op carries the size in
    /// its output and the handle attributes are updated.
    pub fn query_size(&self) -> Result<Op> {
        let mut op = self.inner.new_op(OpCode::ObjAttrsGet);
        attrs::attrs_query(
            self.inner.clone(),
            attrs::AttrsQuery::Get { output_size: true },
            &mut op,
        )?;
        Ok(op)
    }

    /// Launch a sync of all previous writes on this object.
    pub fn sync(&self) -> Result<Op> {
        let mut op = self.inner.new_op(OpCode::ObjSync);
        self.inner.driver.obj_sync(&self.inner, &mut op, None)?;
        Ok(op)
    }

    /// Pool this object lives in.
    pub fn pool_id(&self) -> Result<PoolId> {
        self.inner.driver.obj_pool_id(&self.inner)
    }

    /// Acquire the exclusive whole-object lock; blocks until granted.
    /// Re-entrant acquisition is not supported.
    pub fn lock(&self) -> Result<()> {
        self.inner.driver.obj_lock(&self.inner)?;
        self.inner.lock_state().locked = true;
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        {
            let state = self.inner.lock_state();
            if !state.locked {
                return Err(Error::invalid("object is not locked by this handle"));
            }
        }
        self.inner.driver.obj_unlock(&self.inner)?;
        self.inner.lock_state().locked = false;
        Ok(())
    }

    /// Set several hints at once and persist the persistent subset.
    pub fn hints_set(&self, new_hints: &HintMap) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            state.hints.copy_from(new_hints)?;
            state.attrs.phints = hints::persistent_hints(&state.hints);
        }
        attrs::store_sync(&self.inner)
    }

    /// Copy out all hints currently set for the object. Persistent hints
    /// were loaded when the object was opened.
    pub fn hints_get(&self) -> Result<HintMap> {
        self.inner.driver.obj_hint_load(&self.inner)?;
        let state = self.inner.lock_state();
        let mut out = HintMap::new(state.hints.capacity());
        out.copy_from(&state.hints)?;
        Ok(out)
    }

    /// Set one hint and persist the persistent subset.
    pub fn hint_set(&self, key: ObjHintKey, value: u64) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            state.hints.set(key as i32, value)?;
            state.attrs.phints = hints::persistent_hints(&state.hints);
        }
        attrs::store_sync(&self.inner)
    }

    /// Get one hint. Dynamic hints are recomputed on query: the hot index
    /// is the sum of read and write counts at this moment.
    pub fn hint_get(&self, key: ObjHintKey) -> Result<u64> {
        self.inner.driver.obj_hint_load(&self.inner)?;
        let mut state = self.inner.lock_state();
        if key == ObjHintKey::HotIndex {
            let hotness = state.attrs.stats.rcount + state.attrs.stats.wcount;
            log::debug!("object {} hotness = {}", self.inner.id, hotness);
            state.hints.set(key as i32, hotness)?;
        }
        state
            .hints
            .get(key as i32)
            .ok_or_else(|| Error::not_found(format!("hint {:?} not set", key)))
    }

    /// Close the handle. A dirty attribute record is flushed with a
    /// synchronous metadata PUT first; its failure is returned and the
    /// driver state is released regardless.
    pub fn close(self) -> Result<()> {
        let flush = {
            let state = self.inner.lock_state();
            state.attrs_updated
        };
        let flush_result = if flush {
            attrs::store_sync(&self.inner)
        } else {
            Ok(())
        };
        let close_result = self.inner.driver.obj_close(&self.inner);
        flush_result.and(close_result)
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obj")
            .field("id", &self.inner.id.to_string())
            .field("sess_seqno", &self.inner.sess_seqno)
            .finish()
    }
}

impl Mio {
    fn obj_handle(&self, oid: &ObjId) -> Arc<ObjInner> {
        ObjInner::new(
            *oid,
            self.driver(),
            self.op_seqno_counter(),
            self.next_sess_seqno(),
        )
    }

    /// Open the object `oid`. The returned handle becomes usable once the
    /// op completes; completion has fetched the attribute record and merged
    /// the persistent hints.
    pub fn obj_open(&self, oid: &ObjId) -> Result<(Obj, Op)> {
        let inner = self.obj_handle(oid);
        let mut op = self.new_op(OpCode::ObjOpen, OpSubject::Obj(*oid));

        let fetch_inner = inner.clone();
        let fetch: crate::op::PostProc = Box::new(move |op: &mut Op| {
            // The backend open completed; chase it with the attribute GET.
            attrs::attrs_query(
                fetch_inner.clone(),
                attrs::AttrsQuery::Get { output_size: false },
                op,
            )?;
            Ok(crate::op::Progress::Next)
        });
        inner.driver.obj_open(&inner, &mut op, Some(fetch))?;
        Ok((Obj { inner }, op))
    }

    /// Create the object `oid`. The pool is resolved in order: explicit
    /// `pool_id`, the `Where` hint (a tier pool id low word), the
    /// `HotIndex` hint through the hotness mapping, then the default pool.
    /// Creating an existing object fails the op with `AlreadyExists`.
    pub fn obj_create(
        &self,
        oid: &ObjId,
        pool_id: Option<&PoolId>,
        create_hints: Option<&HintMap>,
    ) -> Result<(Obj, Op)> {
        let pool = self.resolve_create_pool(pool_id, create_hints)?;
        let inner = self.obj_handle(oid);
        if let Some(h) = create_hints {
            inner.lock_state().hints.copy_from(h)?;
        }
        let mut op = self.new_op(OpCode::ObjCreate, OpSubject::Obj(*oid));
        inner.driver.obj_create(&pool, &inner, &mut op, None)?;
        Ok((Obj { inner }, op))
    }

    fn resolve_create_pool(
        &self,
        pool_id: Option<&PoolId>,
        create_hints: Option<&HintMap>,
    ) -> Result<PoolId> {
        if let Some(id) = pool_id {
            return match self.pools().by_id(id) {
                Some(pool) => Ok(pool.id),
                None => Err(Error::invalid(format!("unknown pool {}", id))),
            };
        }
        if let Some(h) = create_hints {
            if let Some(tier) = h.get(ObjHintKey::Where as i32) {
                let id = PoolId::new(0, tier);
                return match self.pools().by_id(&id) {
                    Some(pool) => Ok(pool.id),
                    None => Err(Error::invalid(format!(
                        "where-hint names unknown pool {}",
                        id
                    ))),
                };
            }
            if let Some(hotness) = h.get(ObjHintKey::HotIndex as i32) {
                return Ok(self.hotness_to_pool_id(hotness));
            }
        }
        Ok(self.pools().default_pool().id)
    }

    /// Delete the object `oid`: its data and its attribute record.
    pub fn obj_delete(&self, oid: &ObjId) -> Result<Op> {
        let mut op = self.new_op(OpCode::ObjDelete, OpSubject::Obj(*oid));
        self.driver().obj_delete(oid, &mut op, None)?;
        Ok(op)
    }
}
