//! In-memory driver
//!
//! A complete backend living in process memory, used by the test suite and
//! for bring-up without a cluster. It keeps the asynchronous contract
//! honest: every driver operation becomes a task on a submission channel,
//! a background worker executes tasks in order and posts results to a
//! completion board, and `op_wait` blocks on the board with the caller's
//! timeout. Multi-step operations (object delete, layer delete) are built
//! as real sub-op chains, so the core's post-processor machinery is
//! exercised exactly as it would be against a remote backend.
//!
//! Every executed backend task leaves a [`TraceEntry`]; tests assert the
//! trace to verify which RPCs a pipeline produced.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};

use crate::config::{Config, PoolConfig};
use crate::error::{Error, ErrorKind};
use crate::kvs::{KvPair, KvsBatch, KvsId, COMP_EXTENT_KVS_ID, OBJ_MD_KVS_ID};
use crate::obj::composite::CompObjLayer;
use crate::obj::io::IoChunk;
use crate::obj::{ObjId, ObjInner};
use crate::op::{Op, OpState, PostProc, Progress};
use crate::pool::{self, Pool, PoolId};
use crate::Result;

use super::{Driver, IoLimits, RwOpcode};

/// One executed backend task, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    ObjOpen(ObjId),
    ObjCreate(ObjId),
    ObjDelete(ObjId),
    Read { oid: ObjId, off: u64, len: u64 },
    Write { oid: ObjId, off: u64, len: u64 },
    Sync { oid: ObjId },
    KvsGet { nr_pairs: usize },
    KvsPut { nr_pairs: usize },
    KvsDel { nr_pairs: usize },
    KvsNext { nr_pairs: usize },
    LayoutSet(ObjId),
    LayoutGet(ObjId),
}

struct MemObj {
    data: Vec<u8>,
    pool: PoolId,
}

#[derive(Default)]
struct MemStore {
    objects: HashMap<ObjId, MemObj>,
    kvs: HashMap<KvsId, BTreeMap<Vec<u8>, Vec<u8>>>,
    layouts: HashMap<ObjId, Vec<CompObjLayer>>,
}

enum MemTask {
    ObjOpen { oid: ObjId },
    ObjCreate { oid: ObjId, pool: PoolId },
    ObjDeleteData { oid: ObjId },
    ObjRw { oid: ObjId, opcode: RwOpcode, chunk: IoChunk },
    ObjSync { oid: ObjId },
    KvsCreate { id: KvsId },
    KvsDelete { id: KvsId },
    KvsGet { id: KvsId, batch: Arc<Mutex<KvsBatch>> },
    KvsPut { id: KvsId, batch: Arc<Mutex<KvsBatch>> },
    KvsDel { id: KvsId, batch: Arc<Mutex<KvsBatch>> },
    KvsNext { id: KvsId, batch: Arc<Mutex<KvsBatch>>, exclude_start: bool },
    LayoutSet { oid: ObjId, layers: Vec<CompObjLayer> },
    LayoutMerge { oid: ObjId, layers: Vec<CompObjLayer> },
    LayoutRemove { oid: ObjId, removed: Vec<ObjId> },
    LayoutGet { oid: ObjId, out: Arc<Mutex<Vec<CompObjLayer>>> },
    CompDelete { oid: ObjId },
}

struct MemMsg {
    id: u64,
    task: MemTask,
}

/// Completion board: task id -> terminal result, plus the condvar `op_wait`
/// blocks on.
struct Board {
    done: Mutex<HashMap<u64, Option<Error>>>,
    cv: Condvar,
}

impl Board {
    fn new() -> Board {
        Board { done: Mutex::new(HashMap::new()), cv: Condvar::new() }
    }

    fn complete(&self, id: u64, result: Result<()>) {
        let mut done = self.done.lock().expect("board poisoned");
        done.insert(id, result.err());
        self.cv.notify_all();
    }

    /// Wait for `id`; `None` when the budget ran out first.
    fn wait(&self, id: u64, timeout: Option<Duration>) -> Option<Option<Error>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.done.lock().expect("board poisoned");
        loop {
            if let Some(result) = done.remove(&id) {
                return Some(result);
            }
            match deadline {
                None => {
                    done = self.cv.wait(done).expect("board poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .cv
                        .wait_timeout(done, deadline - now)
                        .expect("board poisoned");
                    done = guard;
                }
            }
        }
    }

    fn forget(&self, id: u64) {
        self.done.lock().expect("board poisoned").remove(&id);
    }
}

/// Chain-head handle: the task id to wait for on the board.
struct MemOpHandle {
    id: u64,
    board: Arc<Board>,
}

impl Drop for MemOpHandle {
    fn drop(&mut self) {
        // An op dropped without being waited leaves its board entry behind;
        // clear it if the worker already posted it.
        self.board.forget(self.id);
    }
}

struct MemInner {
    pools: Vec<PoolConfig>,
    store: Mutex<MemStore>,
    locks: Mutex<HashSet<ObjId>>,
    lock_cv: Condvar,
    board: Arc<Board>,
    next_task_id: AtomicU64,
    tx: Mutex<Option<Sender<MemMsg>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    trace: Mutex<Vec<TraceEntry>>,
}

/// The in-memory backend.
pub struct MemDriver {
    inner: Arc<MemInner>,
}

impl MemDriver {
    pub fn new(config: &Config) -> Result<MemDriver> {
        if config.pools.is_empty() {
            return Err(Error::invalid("mem driver needs at least one pool"));
        }
        Ok(MemDriver {
            inner: Arc::new(MemInner {
                pools: config.pools.clone(),
                store: Mutex::new(MemStore::default()),
                locks: Mutex::new(HashSet::new()),
                lock_cv: Condvar::new(),
                board: Arc::new(Board::new()),
                next_task_id: AtomicU64::new(0),
                tx: Mutex::new(None),
                worker: Mutex::new(None),
                trace: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Drain the backend op trace.
    pub fn take_trace(&self) -> Vec<TraceEntry> {
        std::mem::take(&mut *self.inner.trace.lock().expect("trace poisoned"))
    }
}

impl MemInner {
    fn lock_store(&self) -> std::sync::MutexGuard<'_, MemStore> {
        self.store.lock().expect("mem store poisoned")
    }

    fn push_trace(&self, entry: TraceEntry) {
        self.trace.lock().expect("trace poisoned").push(entry);
    }

    fn pool_config(&self, id: &PoolId) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| &p.id() == id)
    }

    fn submit(
        self: &Arc<Self>,
        task: MemTask,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let tx = self.tx.lock().expect("sender poisoned");
            let tx = tx
                .as_ref()
                .ok_or_else(|| Error::io("mem driver is not initialised"))?;
            tx.send(MemMsg { id, task })
                .map_err(|_| Error::io("mem driver worker is gone"))?;
        }
        op.add_driver_op(
            Box::new(MemOpHandle { id, board: self.board.clone() }),
            post,
        );
        Ok(())
    }

    fn run_worker(self: Arc<Self>, rx: Receiver<MemMsg>) {
        for msg in rx.iter() {
            let result = self.execute(msg.task);
            self.board.complete(msg.id, result);
        }
    }

    fn execute(&self, task: MemTask) -> Result<()> {
        match task {
            MemTask::ObjOpen { oid } => {
                self.push_trace(TraceEntry::ObjOpen(oid));
                let store = self.lock_store();
                if store.objects.contains_key(&oid) {
                    Ok(())
                } else {
                    Err(Error::not_found(format!("object {}", oid)))
                }
            }
            MemTask::ObjCreate { oid, pool } => {
                self.push_trace(TraceEntry::ObjCreate(oid));
                if self.pool_config(&pool).is_none() {
                    return Err(Error::invalid(format!("unknown pool {}", pool)));
                }
                let mut store = self.lock_store();
                if store.objects.contains_key(&oid) {
                    return Err(Error::already_exists(format!("object {}", oid)));
                }
                store.objects.insert(oid, MemObj { data: Vec::new(), pool });
                Ok(())
            }
            MemTask::ObjDeleteData { oid } => {
                self.push_trace(TraceEntry::ObjDelete(oid));
                let mut store = self.lock_store();
                store
                    .objects
                    .remove(&oid)
                    .map(|_| ())
                    .ok_or_else(|| Error::not_found(format!("object {}", oid)))
            }
            MemTask::ObjRw { oid, opcode, chunk } => {
                let mut store = self.lock_store();
                let obj = store
                    .objects
                    .get_mut(&oid)
                    .ok_or_else(|| Error::not_found(format!("object {}", oid)))?;
                match opcode {
                    RwOpcode::Write => chunk.for_each_src(|off, bytes| {
                        let end = off as usize + bytes.len();
                        if obj.data.len() < end {
                            obj.data.resize(end, 0);
                        }
                        obj.data[off as usize..end].copy_from_slice(bytes);
                        self.push_trace(TraceEntry::Write {
                            oid,
                            off,
                            len: bytes.len() as u64,
                        });
                        Ok(())
                    }),
                    RwOpcode::Read => chunk.for_each_dst(|off, buf| {
                        let start = (off as usize).min(obj.data.len());
                        let end = (off as usize + buf.len()).min(obj.data.len());
                        let have = end - start;
                        buf[..have].copy_from_slice(&obj.data[start..end]);
                        buf[have..].fill(0);
                        self.push_trace(TraceEntry::Read {
                            oid,
                            off,
                            len: buf.len() as u64,
                        });
                        Ok(())
                    }),
                }
            }
            MemTask::ObjSync { oid } => {
                self.push_trace(TraceEntry::Sync { oid });
                let store = self.lock_store();
                if store.objects.contains_key(&oid) {
                    Ok(())
                } else {
                    Err(Error::not_found(format!("object {}", oid)))
                }
            }
            MemTask::KvsCreate { id } => {
                let mut store = self.lock_store();
                if store.kvs.contains_key(&id) {
                    return Err(Error::already_exists(format!("kvs {}", id)));
                }
                store.kvs.insert(id, BTreeMap::new());
                Ok(())
            }
            MemTask::KvsDelete { id } => {
                let mut store = self.lock_store();
                store
                    .kvs
                    .remove(&id)
                    .map(|_| ())
                    .ok_or_else(|| Error::not_found(format!("kvs {}", id)))
            }
            MemTask::KvsGet { id, batch } => {
                let store = self.lock_store();
                let set = store
                    .kvs
                    .get(&id)
                    .ok_or_else(|| Error::not_found(format!("kvs {}", id)))?;
                let mut batch = batch.lock().expect("kvs batch poisoned");
                self.push_trace(TraceEntry::KvsGet { nr_pairs: batch.len() });
                for i in 0..batch.len() {
                    match set.get(&batch.pairs[i].key) {
                        Some(val) => {
                            batch.pairs[i].val = val.clone();
                            batch.rcs[i] = Ok(());
                        }
                        None => {
                            batch.pairs[i].val.clear();
                            batch.rcs[i] = Err(ErrorKind::NotFound);
                        }
                    }
                }
                Ok(())
            }
            MemTask::KvsPut { id, batch } => {
                let mut store = self.lock_store();
                let set = store
                    .kvs
                    .get_mut(&id)
                    .ok_or_else(|| Error::not_found(format!("kvs {}", id)))?;
                let mut batch = batch.lock().expect("kvs batch poisoned");
                self.push_trace(TraceEntry::KvsPut { nr_pairs: batch.len() });
                for i in 0..batch.len() {
                    set.insert(batch.pairs[i].key.clone(), batch.pairs[i].val.clone());
                    batch.rcs[i] = Ok(());
                }
                Ok(())
            }
            MemTask::KvsDel { id, batch } => {
                let mut store = self.lock_store();
                let set = store
                    .kvs
                    .get_mut(&id)
                    .ok_or_else(|| Error::not_found(format!("kvs {}", id)))?;
                let mut batch = batch.lock().expect("kvs batch poisoned");
                self.push_trace(TraceEntry::KvsDel { nr_pairs: batch.len() });
                for i in 0..batch.len() {
                    batch.rcs[i] = match set.remove(&batch.pairs[i].key) {
                        Some(_) => Ok(()),
                        None => Err(ErrorKind::NotFound),
                    };
                }
                Ok(())
            }
            MemTask::KvsNext { id, batch, exclude_start } => {
                let store = self.lock_store();
                let set = store
                    .kvs
                    .get(&id)
                    .ok_or_else(|| Error::not_found(format!("kvs {}", id)))?;
                let mut batch = batch.lock().expect("kvs batch poisoned");
                self.push_trace(TraceEntry::KvsNext { nr_pairs: batch.len() });

                let start = batch.pairs[0].key.clone();
                let mut iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)> + '_> =
                    if start.is_empty() {
                        Box::new(set.iter())
                    } else {
                        Box::new(set.range(start.clone()..))
                    };
                let mut filled = 0;
                while filled < batch.len() {
                    match iter.next() {
                        Some((key, _)) if exclude_start && *key == start && filled == 0 => {
                            continue;
                        }
                        Some((key, val)) => {
                            batch.pairs[filled].key = key.clone();
                            batch.pairs[filled].val = val.clone();
                            batch.rcs[filled] = Ok(());
                            filled += 1;
                        }
                        None => break,
                    }
                }
                for i in filled..batch.len() {
                    batch.pairs[i].key.clear();
                    batch.pairs[i].val.clear();
                    batch.rcs[i] = Err(ErrorKind::EndOfIteration);
                }
                Ok(())
            }
            MemTask::LayoutSet { oid, layers } => {
                self.push_trace(TraceEntry::LayoutSet(oid));
                let mut store = self.lock_store();
                if !store.objects.contains_key(&oid) {
                    return Err(Error::not_found(format!("object {}", oid)));
                }
                let mut layers = layers;
                layers.sort_by_key(|l| (l.priority, l.oid));
                store.layouts.insert(oid, layers);
                Ok(())
            }
            MemTask::LayoutMerge { oid, layers } => {
                self.push_trace(TraceEntry::LayoutSet(oid));
                let mut store = self.lock_store();
                if !store.objects.contains_key(&oid) {
                    return Err(Error::not_found(format!("object {}", oid)));
                }
                let layout = store.layouts.get_mut(&oid).ok_or_else(|| {
                    Error::not_found(format!("object {} has no composite layout", oid))
                })?;
                for layer in layers {
                    layout.retain(|l| l.oid != layer.oid);
                    layout.push(layer);
                }
                layout.sort_by_key(|l| (l.priority, l.oid));
                Ok(())
            }
            MemTask::LayoutRemove { oid, removed } => {
                self.push_trace(TraceEntry::LayoutSet(oid));
                let mut store = self.lock_store();
                let layout = store.layouts.get_mut(&oid).ok_or_else(|| {
                    Error::not_found(format!("object {} has no composite layout", oid))
                })?;
                layout.retain(|l| !removed.contains(&l.oid));
                for layer in &removed {
                    Self::drop_layer_extents(&mut store, layer);
                }
                Ok(())
            }
            MemTask::LayoutGet { oid, out } => {
                self.push_trace(TraceEntry::LayoutGet(oid));
                let store = self.lock_store();
                let layout = store.layouts.get(&oid).ok_or_else(|| {
                    Error::not_found(format!("object {} has no composite layout", oid))
                })?;
                *out.lock().expect("layout scratch poisoned") = layout.clone();
                Ok(())
            }
            MemTask::CompDelete { oid } => {
                self.push_trace(TraceEntry::ObjDelete(oid));
                let mut store = self.lock_store();
                if let Some(layers) = store.layouts.remove(&oid) {
                    for layer in &layers {
                        Self::drop_layer_extents(&mut store, &layer.oid);
                    }
                }
                store
                    .objects
                    .remove(&oid)
                    .ok_or_else(|| Error::not_found(format!("object {}", oid)))?;
                if let Some(md) = store.kvs.get_mut(&OBJ_MD_KVS_ID) {
                    md.remove(oid.as_bytes().as_slice());
                }
                Ok(())
            }
        }
    }

    /// Remove every extent row of `layer` from the extent catalog.
    fn drop_layer_extents(store: &mut MemStore, layer: &ObjId) {
        if let Some(set) = store.kvs.get_mut(&COMP_EXTENT_KVS_ID) {
            let mut lo = layer.as_bytes().to_vec();
            lo.extend_from_slice(&[0u8; 8]);
            let mut hi = layer.as_bytes().to_vec();
            hi.extend_from_slice(&[0xffu8; 8]);
            let doomed: Vec<Vec<u8>> =
                set.range(lo..=hi).map(|(k, _)| k.clone()).collect();
            for key in doomed {
                set.remove(&key);
            }
        }
    }
}

impl Driver for MemDriver {
    fn init(&self) -> Result<()> {
        {
            let mut store = self.inner.lock_store();
            store.kvs.entry(OBJ_MD_KVS_ID).or_default();
            store.kvs.entry(COMP_EXTENT_KVS_ID).or_default();
        }
        let (tx, rx) = crossbeam::channel::unbounded();
        let worker_inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("mio-mem-driver".to_string())
            .spawn(move || worker_inner.run_worker(rx))
            .map_err(|e| Error::io(format!("spawn mem worker: {}", e)))?;
        *self.inner.tx.lock().expect("sender poisoned") = Some(tx);
        *self.inner.worker.lock().expect("worker poisoned") = Some(handle);
        log::info!("mem driver up: {} pools", self.inner.pools.len());
        Ok(())
    }

    fn fini(&self) {
        self.inner.tx.lock().expect("sender poisoned").take();
        if let Some(handle) = self.inner.worker.lock().expect("worker poisoned").take()
        {
            let _ = handle.join();
        }
    }

    fn pool_get(&self, pool_id: &PoolId, out: &mut Pool) -> Result<()> {
        let config = self
            .inner
            .pool_config(pool_id)
            .ok_or_else(|| Error::not_found(format!("pool {}", pool_id)))?;
        let (blksizes, max_per_op) = pool::derive_opt_blksizes(
            config.unit_size,
            config.n_data,
            config.n_parity,
            config.n_devices,
        );
        out.opt_alignment = 4096;
        out.opt_blksizes = blksizes;
        out.max_per_op = max_per_op;
        Ok(())
    }

    fn op_wait(&self, op: &mut Op, timeout: Option<Duration>) -> (OpState, Option<Error>) {
        let handle = match op
            .head_handle()
            .and_then(|h| h.downcast_ref::<MemOpHandle>())
        {
            Some(handle) => handle,
            None => {
                return (
                    OpState::Failed,
                    Some(Error::invalid("op has no mem driver sub-op")),
                )
            }
        };
        match self.inner.board.wait(handle.id, timeout) {
            None => (OpState::OnFly, None),
            Some(None) => (OpState::Completed, None),
            Some(Some(err)) => (OpState::Failed, Some(err)),
        }
    }

    fn obj_open(
        &self,
        obj: &Arc<ObjInner>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::ObjOpen { oid: obj.id() }, op, post)
    }

    fn obj_create(
        &self,
        pool_id: &PoolId,
        obj: &Arc<ObjInner>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(
            MemTask::ObjCreate { oid: obj.id(), pool: *pool_id },
            op,
            post,
        )
    }

    /// Object deletion is the canonical three-step chain: open probe,
    /// delete the data, delete the attribute row.
    fn obj_delete(
        &self,
        oid: &ObjId,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        let inner = self.inner.clone();
        let oid = *oid;
        let open_pp: PostProc = Box::new(move |op: &mut Op| {
            let inner2 = inner.clone();
            let data_pp: PostProc = Box::new(move |op: &mut Op| {
                let key = oid.as_bytes().to_vec();
                let batch =
                    Arc::new(Mutex::new(KvsBatch::new(vec![KvPair::key_only(key)])));
                inner2.submit(
                    MemTask::KvsDel { id: OBJ_MD_KVS_ID, batch },
                    op,
                    post,
                )?;
                Ok(Progress::Next)
            });
            inner.submit(MemTask::ObjDeleteData { oid }, op, Some(data_pp))?;
            Ok(Progress::Next)
        });
        self.inner.submit(MemTask::ObjOpen { oid }, op, Some(open_pp))
    }

    fn obj_rw(
        &self,
        obj: &Arc<ObjInner>,
        opcode: RwOpcode,
        chunk: IoChunk,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner
            .submit(MemTask::ObjRw { oid: obj.id(), opcode, chunk }, op, post)
    }

    fn obj_sync(
        &self,
        obj: &Arc<ObjInner>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::ObjSync { oid: obj.id() }, op, post)
    }

    fn obj_io_limits(&self, obj: &Arc<ObjInner>) -> Result<IoLimits> {
        let pool = {
            let store = self.inner.lock_store();
            store
                .objects
                .get(&obj.id())
                .map(|o| o.pool)
                .ok_or_else(|| Error::not_found(format!("object {}", obj.id())))?
        };
        let config = self
            .inner
            .pool_config(&pool)
            .ok_or_else(|| Error::not_found(format!("pool {}", pool)))?;
        let (_, max_per_op) = pool::derive_opt_blksizes(
            config.unit_size,
            config.n_data,
            config.n_parity,
            config.n_devices,
        );
        Ok(IoLimits { pagesize: 4096, max_per_op })
    }

    fn obj_pool_id(&self, obj: &Arc<ObjInner>) -> Result<PoolId> {
        let store = self.inner.lock_store();
        store
            .objects
            .get(&obj.id())
            .map(|o| o.pool)
            .ok_or_else(|| Error::not_found(format!("object {}", obj.id())))
    }

    fn obj_lock(&self, obj: &Arc<ObjInner>) -> Result<()> {
        let mut locks = self.inner.locks.lock().expect("locks poisoned");
        while locks.contains(&obj.id()) {
            locks = self
                .inner
                .lock_cv
                .wait(locks)
                .expect("locks poisoned");
        }
        locks.insert(obj.id());
        Ok(())
    }

    fn obj_unlock(&self, obj: &Arc<ObjInner>) -> Result<()> {
        let mut locks = self.inner.locks.lock().expect("locks poisoned");
        if !locks.remove(&obj.id()) {
            return Err(Error::invalid(format!("object {} is not locked", obj.id())));
        }
        self.inner.lock_cv.notify_all();
        Ok(())
    }

    fn kvs_create_set(
        &self,
        kvs_id: &KvsId,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::KvsCreate { id: *kvs_id }, op, post)
    }

    fn kvs_del_set(
        &self,
        kvs_id: &KvsId,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::KvsDelete { id: *kvs_id }, op, post)
    }

    fn kvs_get(
        &self,
        kvs_id: &KvsId,
        batch: Arc<Mutex<KvsBatch>>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::KvsGet { id: *kvs_id, batch }, op, post)
    }

    fn kvs_put(
        &self,
        kvs_id: &KvsId,
        batch: Arc<Mutex<KvsBatch>>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::KvsPut { id: *kvs_id, batch }, op, post)
    }

    fn kvs_del(
        &self,
        kvs_id: &KvsId,
        batch: Arc<Mutex<KvsBatch>>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::KvsDel { id: *kvs_id, batch }, op, post)
    }

    fn kvs_next(
        &self,
        kvs_id: &KvsId,
        batch: Arc<Mutex<KvsBatch>>,
        exclude_start_key: bool,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(
            MemTask::KvsNext {
                id: *kvs_id,
                batch,
                exclude_start: exclude_start_key,
            },
            op,
            post,
        )
    }

    fn comp_obj_create(
        &self,
        obj: &Arc<ObjInner>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(
            MemTask::LayoutSet { oid: obj.id(), layers: Vec::new() },
            op,
            post,
        )
    }

    fn comp_obj_delete(
        &self,
        oid: &ObjId,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        self.inner.submit(MemTask::CompDelete { oid: *oid }, op, post)
    }

    fn comp_obj_add_layers(
        &self,
        obj: &Arc<ObjInner>,
        layers: Vec<CompObjLayer>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        let mut oids: Vec<ObjId> = layers.iter().map(|l| l.oid).collect();
        oids.sort_unstable();
        oids.dedup();
        if oids.len() != layers.len() {
            return Err(Error::invalid("duplicate sub-object ids in layer list"));
        }
        self.inner
            .submit(MemTask::LayoutMerge { oid: obj.id(), layers }, op, post)
    }

    /// Layer deletion fetches the layout first, then removes the named
    /// layers and stores the result — a two-step chain.
    fn comp_obj_del_layers(
        &self,
        obj: &Arc<ObjInner>,
        layers: Vec<CompObjLayer>,
        op: &mut Op,
        post: Option<PostProc>,
    ) -> Result<()> {
        let inner = self.inner.clone();
        let oid = obj.id();
        let removed: Vec<ObjId> = layers.iter().map(|l| l.oid).collect();
        let scratch = Arc::new(Mutex::new(Vec::new()));

        let get_pp: PostProc = Box::new(move |op: &mut Op| {
            inner.submit(MemTask::LayoutRemove { oid, removed }, op, post)?;
            Ok(Progress::Next)
        });
        self.inner
            .submit(MemTask::LayoutGet { oid, out: scratch }, op, Some(get_pp))
    }

    fn comp_obj_list_layers(
        &self,
        obj: &Arc<ObjInner>,
        op: &mut Op,
        _post: Option<PostProc>,
    ) -> Result<()> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let out_pp = out.clone();
        let list_pp: PostProc = Box::new(move |op: &mut Op| {
            let layers =
                std::mem::take(&mut *out_pp.lock().expect("layout scratch poisoned"));
            op.output = crate::op::OpOutput::Layers(layers);
            Ok(Progress::Final)
        });
        self.inner
            .submit(MemTask::LayoutGet { oid: obj.id(), out }, op, Some(list_pp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::op::{OpCode, OpSubject};

    fn ready_driver() -> MemDriver {
        let driver = MemDriver::new(&Config::mem_test_config()).unwrap();
        driver.init().unwrap();
        driver
    }

    fn raw_op(driver: &MemDriver) -> Op {
        // Tests below drive the driver directly, without a Mio context.
        let driver: Arc<dyn Driver> =
            Arc::new(MemDriver { inner: driver.inner.clone() });
        Op::new(driver, 1, OpCode::KvsPut, OpSubject::None)
    }

    #[test]
    fn test_wait_timeout_leaves_op_in_flight() {
        let driver = ready_driver();
        // No worker will ever complete this id.
        let mut op = raw_op(&driver);
        op.add_driver_op(
            Box::new(MemOpHandle { id: 0xdead, board: driver.inner.board.clone() }),
            None,
        );
        let (state, err) =
            driver.op_wait(&mut op, Some(Duration::from_millis(10)));
        assert_eq!(state, OpState::OnFly);
        assert!(err.is_none());
        driver.fini();
    }

    #[test]
    fn test_completed_task_is_observed_once() {
        let driver = ready_driver();
        let id = KvsId::from_hi_lo(5, 5);
        let mut op = raw_op(&driver);
        driver.kvs_create_set(&id, &mut op, None).unwrap();
        op.wait(None).unwrap();

        // The board entry was consumed by the wait.
        assert!(driver.inner.board.done.lock().unwrap().is_empty());
        driver.fini();
    }

    #[test]
    fn test_pool_get_fills_performance_parameters() {
        let driver = ready_driver();
        let config = Config::mem_test_config();
        let mut pool = crate::pool::pool_from_config(&config.pools[0]);
        driver.pool_get(&config.pools[0].id(), &mut pool).unwrap();
        assert_eq!(pool.opt_alignment, 4096);
        assert_eq!(pool.max_per_op, 32768);
        assert!(!pool.opt_blksizes.is_empty());
        assert!(pool.opt_blksizes.iter().all(|b| b % 4096 == 0));
        driver.fini();
    }

    #[test]
    fn test_unknown_pool_rejected() {
        let driver = ready_driver();
        let mut pool = crate::pool::pool_from_config(
            &Config::mem_test_config().pools[0],
        );
        assert!(driver.pool_get(&PoolId::new(9, 9), &mut pool).is_err());
        driver.fini();
    }

    #[test]
    fn test_fini_rejects_new_submissions() {
        let driver = ready_driver();
        driver.fini();
        let id = KvsId::from_hi_lo(6, 6);
        let mut op = raw_op(&driver);
        assert!(driver.kvs_create_set(&id, &mut op, None).is_err());
    }
}
