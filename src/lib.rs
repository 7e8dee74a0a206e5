//! Maestro I/O (MIO) — object and key-value client library
//!
//! MIO presents a uniform object and key-value abstraction over a pluggable
//! storage backend. Applications address immutable-id objects (128-bit
//! identifiers) and key-value sets; MIO brokers create/open/delete,
//! vectored reads and writes, sync and locking, KV get/put/del/next, and on
//! top of that manages per-object metadata (size, access counters,
//! persistent hints), hotness-driven pool placement, composite (layered)
//! objects, and a structured telemetry pipeline.
//!
//! # Architecture
//!
//! - **Typed asynchronous ops**: every backend interaction returns an
//!   [`Op`] carrying a chain of driver sub-ops; completion is driven by
//!   polling ([`poll`], [`Op::wait`]) or by callbacks ([`Mio::op_dispatch`])
//! - **Pluggable drivers**: the whole backend sits behind the
//!   [`driver::Driver`] trait; an in-memory driver ships for tests
//! - **Aligned IO pipeline**: application vectors are sorted, validated,
//!   page-aligned with read-before-write for partial pages, and chunked to
//!   the pool's per-op bound before submission
//! - **Pool tiers**: a catalog of pools with derived optimal IO sizes, and
//!   a hotness-to-tier mapping fed by per-object access statistics
//! - **Telemetry**: compact binary or readable log records, with a generic
//!   parser to read either stream back
//!
//! # Example
//!
//! ```no_run
//! use maestro_io::{Config, IoSpan, IoVec, Mio, ObjId};
//!
//! let mio = Mio::init(Config::mem_test_config())?;
//! let oid = ObjId::from_hi_lo(0, 42);
//!
//! let (obj, mut op) = mio.obj_create(&oid, None, None)?;
//! op.wait(None)?;
//!
//! let mut op = obj.writev(vec![IoVec::new(0, b"hello".to_vec())])?;
//! op.wait(None)?;
//!
//! let mut op = obj.readv(&[IoSpan::new(0, 5)])?;
//! op.wait(None)?;
//! let data = op.take_read_output().unwrap();
//! assert_eq!(data[0].data, b"hello");
//! obj.close()?;
//! # Ok::<(), maestro_io::Error>(())
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod hints;
pub mod kvs;
pub mod logger;
pub mod obj;
pub mod op;
pub mod pool;
pub mod telemetry;
pub mod util;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::Driver;
use crate::hints::{HintMap, SysHintKey};
use crate::op::{CbDispatcher, CbTask, OpCallback, OpSubject};
use crate::pool::{PoolId, Pools};

// Re-export the common types.
pub use crate::config::Config;
pub use crate::error::{Error, ErrorKind};
pub use crate::obj::composite::{CompObjLayer, ObjExtent};
pub use crate::obj::io::{IoSpan, IoVec};
pub use crate::obj::{Obj, ObjId};
pub use crate::kvs::{KvPair, KvsId};
pub use crate::op::{poll, Op, OpCode, OpState, PollOp};

/// Result type used throughout MIO.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-thread driver state token. Threads issuing ops should call
/// [`Mio::thread_init`] before their first op and hand the token back to
/// [`Mio::thread_fini`] at teardown.
pub struct MioThread {
    _private: (),
}

/// The MIO context: driver, pool registry, system hints and counters.
/// Built once by [`Mio::init`] and shared across threads.
pub struct Mio {
    driver: Arc<dyn Driver>,
    pools: Pools,
    sys_hints: Mutex<HintMap>,
    op_seqno: Arc<AtomicU64>,
    sess_seqno: AtomicU64,
    dispatcher: CbDispatcher,
}

impl Mio {
    /// Initialise MIO from a resolved configuration: logging, telemetry,
    /// the configured driver and the pool registry, in that order.
    pub fn init(config: Config) -> Result<Mio> {
        let driver = driver::new_driver(&config)?;
        Mio::init_with_driver(config, driver)
    }

    /// Initialise MIO with a caller-provided driver (custom backends,
    /// instrumented test drivers).
    pub fn init_with_driver(config: Config, driver: Arc<dyn Driver>) -> Result<Mio> {
        config.validate()?;
        if let Some(dir) = &config.log.dir {
            logger::init(&config.log.level, Some(dir))?;
        }
        // A `None` store leaves any previously configured sink untouched;
        // contexts without telemetry must not tear down another's.
        if config.telemetry.store != telemetry::TelemetryStoreType::None {
            telemetry::init(&config.telemetry)?;
        }

        driver.user_perm()?;
        driver.init()?;

        let mut pools = Vec::with_capacity(config.pools.len());
        for pool_config in &config.pools {
            let mut pool = pool::pool_from_config(pool_config);
            driver.pool_get(&pool_config.id(), &mut pool)?;
            pools.push(pool);
        }
        let pools = Pools::new(pools, config.default_pool.as_deref())?;

        log::info!("mio initialised: {} pools", pools.len());
        Ok(Mio {
            driver,
            pools,
            sys_hints: Mutex::new(HintMap::for_obj()),
            op_seqno: Arc::new(AtomicU64::new(0)),
            sess_seqno: AtomicU64::new(0),
            dispatcher: CbDispatcher::new(),
        })
    }

    /// The immutable pool registry.
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub(crate) fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    pub(crate) fn new_op(&self, opcode: OpCode, subject: OpSubject) -> Op {
        let seqno = self.op_seqno.fetch_add(1, Ordering::Relaxed) + 1;
        Op::new(self.driver.clone(), seqno, opcode, subject)
    }

    pub(crate) fn op_seqno_counter(&self) -> Arc<AtomicU64> {
        self.op_seqno.clone()
    }

    pub(crate) fn next_sess_seqno(&self) -> u64 {
        self.sess_seqno.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Set a system-wide hint.
    pub fn sys_hint_set(&self, key: SysHintKey, value: u64) -> Result<()> {
        self.sys_hints
            .lock()
            .expect("sys hints poisoned")
            .set(key as i32, value)
    }

    /// Get a system-wide hint.
    pub fn sys_hint_get(&self, key: SysHintKey) -> Option<u64> {
        self.sys_hints
            .lock()
            .expect("sys hints poisoned")
            .get(key as i32)
    }

    /// Map an object hotness to a pool index (0 = hottest tier).
    pub fn hotness_to_pool_idx(&self, hotness: u64) -> usize {
        let sys_hints = self.sys_hints.lock().expect("sys hints poisoned");
        hints::hotness_to_pool_idx(self.pools.len(), &sys_hints, hotness)
    }

    /// Map an object hotness to the pool it should live in.
    pub fn hotness_to_pool_id(&self, hotness: u64) -> PoolId {
        let idx = self.hotness_to_pool_idx(hotness);
        self.pools.by_idx(idx).expect("pool index in range").id
    }

    /// Hand the op to the dispatcher; exactly one of the callbacks runs
    /// with the finished op. A dispatched op can not be polled.
    pub fn op_dispatch(
        &self,
        op: Op,
        on_complete: impl FnOnce(Op) + Send + 'static,
        on_failed: impl FnOnce(Op) + Send + 'static,
    ) -> Result<()> {
        let task = CbTask {
            op,
            on_complete: Box::new(on_complete) as OpCallback,
            on_failed: Box::new(on_failed) as OpCallback,
        };
        self.dispatcher.dispatch(task)
    }

    /// Per-thread driver setup; call before the thread's first op.
    pub fn thread_init(&self) -> Result<MioThread> {
        self.driver.thread_init()?;
        Ok(MioThread { _private: () })
    }

    /// Per-thread driver teardown.
    pub fn thread_fini(&self, thread: MioThread) {
        drop(thread);
        self.driver.thread_fini();
    }
}

impl Drop for Mio {
    fn drop(&mut self) {
        // Stop delivering callbacks before the driver goes away.
        self.dispatcher.shutdown();
        self.driver.fini();
    }
}
