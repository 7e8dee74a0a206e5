//! Driver interface
//!
//! The [`Driver`] trait is the only seam between the MIO core and a storage
//! backend. One trait covers the whole surface — system lifecycle, pool
//! queries, op waiting, object access, key-value sets and composite-object
//! support — with the optional groups defaulting to `Unsupported`, so a
//! minimal backend only implements what it has.
//!
//! Asynchronous driver operations append one or more sub-ops to the caller's
//! [`Op`] (via [`Op::add_driver_op`]) and must attach the caller-supplied
//! post-processor to the *final* sub-op they create, so the core can chain
//! follow-up work (attribute fetches, size updates) behind backend RPCs.
//!
//! The extent-catalog operations come with default implementations that
//! store extents in the reserved extent KV set through the driver's own KV
//! operations; a backend with native extent indexes can override them.

pub mod mem;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Config, DriverKind};
use crate::error::Error;
use crate::kvs::{KvPair, KvsBatch, KvsId, COMP_EXTENT_KVS_ID};
use crate::obj::composite::{self, CompObjLayer, ObjExtent};
use crate::obj::io::IoChunk;
use crate::obj::{ObjId, ObjInner};
use crate::op::{Op, OpOutput, OpState, PostProc, Progress};
use crate::pool::{Pool, PoolId};
use crate::Result;

/// Read or write, for the aligned RW primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwOpcode {
    Read,
    Write,
}

/// Per-object IO bounds exposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLimits {
    /// Backend page size; aligned vectors are multiples of this.
    pub pagesize: usize,
    /// Upper bound on the bytes of one RW sub-op.
    pub max_per_op: u64,
}

/// Backend driver surface.
pub trait Driver: Send + Sync {
    // ---- System ----

    /// Bring the backend up. Called once from `Mio::init`.
    fn init(&self) -> Result<()>;

    /// Tear the backend down; outstanding ops are not tracked here.
    fn fini(&self);

    /// Check that the current user may access the backend.
    fn user_perm(&self) -> Result<()> {
        Ok(())
    }

    /// Per-thread setup for backends carrying thread-local state.
    fn thread_init(&self) -> Result<()> {
        Ok(())
    }

    fn thread_fini(&self) {}

    // ---- Pool ----

    /// Fill in the performance parameters (alignment, optimal block sizes,
    /// per-op bound) of the pool identified by `pool_id`.
    fn pool_get(&self, pool_id: &PoolId, pool: &mut Pool) -> Result<()>;

    // ---- Op ----

    /// Wait up to `timeout` (`None` = forever) for the head sub-op of `op`.
    /// Returns the observed state; `OnFly` means the budget expired.
    fn op_wait(&self, op: &mut Op, timeout: Option<Duration>) -> (OpState, Option<Error>);

    // ---- Object ----

    fn obj_open(
        &self,
        _obj: &Arc<ObjInner>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("obj_open"))
    }

    /// Release backend state of an object handle. Synchronous.
    fn obj_close(&self, _obj: &Arc<ObjInner>) -> Result<()> {
        Ok(())
    }

    /// Create the object in `pool_id`. Must fail the op with
    /// `AlreadyExists` when the id is taken.
    fn obj_create(
        &self,
        _pool_id: &PoolId,
        _obj: &Arc<ObjInner>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("obj_create"))
    }

    /// Delete object data and its attribute row.
    fn obj_delete(
        &self,
        _oid: &ObjId,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("obj_delete"))
    }

    /// Submit one aligned RW sub-op covering `chunk`. Every vector in the
    /// chunk has page-aligned offset and length and the chunk total is
    /// within [`IoLimits::max_per_op`].
    fn obj_rw(
        &self,
        _obj: &Arc<ObjInner>,
        _opcode: RwOpcode,
        _chunk: IoChunk,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("obj_rw"))
    }

    fn obj_sync(
        &self,
        _obj: &Arc<ObjInner>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("obj_sync"))
    }

    /// IO bounds for an opened object, derived from its pool.
    fn obj_io_limits(&self, _obj: &Arc<ObjInner>) -> Result<IoLimits> {
        Err(Error::unsupported("obj_io_limits"))
    }

    /// Pool the object lives in.
    fn obj_pool_id(&self, _obj: &Arc<ObjInner>) -> Result<PoolId> {
        Err(Error::unsupported("obj_pool_id"))
    }

    /// Blocking exclusive whole-object lock. Not re-entrant.
    fn obj_lock(&self, _obj: &Arc<ObjInner>) -> Result<()> {
        Err(Error::unsupported("obj_lock"))
    }

    fn obj_unlock(&self, _obj: &Arc<ObjInner>) -> Result<()> {
        Err(Error::unsupported("obj_unlock"))
    }

    /// Make sure persistent hints are loaded into the handle. The default
    /// is a no-op: hints are fetched with the attribute record at open.
    /// Backends keeping hints elsewhere override this.
    fn obj_hint_load(&self, _obj: &Arc<ObjInner>) -> Result<()> {
        Ok(())
    }

    // ---- Key-value sets ----

    fn kvs_create_set(
        &self,
        _kvs_id: &KvsId,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("kvs_create_set"))
    }

    fn kvs_del_set(
        &self,
        _kvs_id: &KvsId,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("kvs_del_set"))
    }

    /// Look up the values for the batch's keys; per-pair statuses go into
    /// the batch's `rcs`.
    fn kvs_get(
        &self,
        _kvs_id: &KvsId,
        _batch: Arc<Mutex<KvsBatch>>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("kvs_get"))
    }

    fn kvs_put(
        &self,
        _kvs_id: &KvsId,
        _batch: Arc<Mutex<KvsBatch>>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("kvs_put"))
    }

    fn kvs_del(
        &self,
        _kvs_id: &KvsId,
        _batch: Arc<Mutex<KvsBatch>>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("kvs_del"))
    }

    /// Iterate pairs starting at the first pair's key (empty key = start of
    /// the set); exhausted slots get `EndOfIteration`.
    fn kvs_next(
        &self,
        _kvs_id: &KvsId,
        _batch: Arc<Mutex<KvsBatch>>,
        _exclude_start_key: bool,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("kvs_next"))
    }

    // ---- Composite objects ----

    fn comp_obj_create(
        &self,
        _obj: &Arc<ObjInner>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("comp_obj_create"))
    }

    fn comp_obj_delete(
        &self,
        _oid: &ObjId,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("comp_obj_delete"))
    }

    fn comp_obj_add_layers(
        &self,
        _obj: &Arc<ObjInner>,
        _layers: Vec<CompObjLayer>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("comp_obj_add_layers"))
    }

    fn comp_obj_del_layers(
        &self,
        _obj: &Arc<ObjInner>,
        _layers: Vec<CompObjLayer>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("comp_obj_del_layers"))
    }

    /// Fetch the layout; the post-processor installed by the driver must
    /// leave the priority-ordered layer list in the op output.
    fn comp_obj_list_layers(
        &self,
        _obj: &Arc<ObjInner>,
        _op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        Err(Error::unsupported("comp_obj_list_layers"))
    }

    /// Store extents of `layer_id` in the extent catalog.
    fn comp_obj_add_extents(
        &self,
        _obj: &Arc<ObjInner>,
        layer_id: &ObjId,
        exts: Vec<ObjExtent>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        let pairs: Vec<KvPair> = exts
            .iter()
            .map(|ext| KvPair {
                key: composite::extent_key(layer_id, ext.off),
                val: composite::extent_val(ext.len),
            })
            .collect();
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));
        self.kvs_put(&COMP_EXTENT_KVS_ID, batch, op, post)
    }

    /// Remove extents of `layer_id` from the extent catalog.
    fn comp_obj_del_extents(
        &self,
        _obj: &Arc<ObjInner>,
        layer_id: &ObjId,
        exts: Vec<ObjExtent>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        let pairs: Vec<KvPair> = exts
            .iter()
            .map(|ext| KvPair {
                key: composite::extent_key(layer_id, ext.off),
                val: Vec::new(),
            })
            .collect();
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));
        self.kvs_del(&COMP_EXTENT_KVS_ID, batch, op, post)
    }

    /// Query up to `nr_exts` extents of `layer_id` with offsets at or after
    /// `offset`; the result lands in the op output as `Extents`.
    fn comp_obj_get_extents(
        &self,
        _obj: &Arc<ObjInner>,
        layer_id: &ObjId,
        offset: u64,
        nr_exts: usize,
        op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        if nr_exts == 0 {
            return Err(Error::invalid("extent query for zero extents"));
        }
        let mut pairs = vec![KvPair::default(); nr_exts];
        pairs[0].key = composite::extent_key(layer_id, offset);
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));

        let decode_batch = batch.clone();
        let layer = *layer_id;
        let decode: PostProc = Box::new(move |op: &mut Op| {
            let batch = decode_batch.lock().expect("extent batch poisoned");
            let mut exts = Vec::new();
            for (pair, rc) in batch.pairs.iter().zip(batch.rcs.iter()) {
                if rc.is_err() {
                    break;
                }
                // NEXT may run past this layer's key range.
                match composite::extent_from_pair(pair) {
                    Some((pair_layer, ext)) if pair_layer == layer => {
                        exts.push(ext)
                    }
                    _ => break,
                }
            }
            op.output = OpOutput::Extents(exts);
            Ok(Progress::Final)
        });
        self.kvs_next(&COMP_EXTENT_KVS_ID, batch, false, op, Some(decode))
    }
}

/// Instantiate the configured driver.
pub fn new_driver(config: &Config) -> Result<Arc<dyn Driver>> {
    match config.driver {
        DriverKind::Mem => Ok(Arc::new(mem::MemDriver::new(config)?)),
    }
}
