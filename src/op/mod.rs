//! Asynchronous operation model
//!
//! Every MIO call that talks to the backend returns an [`Op`]. Internally an
//! op carries a chain of *driver sub-ops*: each sub-op is one backend RPC
//! plus an optional post-processor that runs when the RPC completes and
//! either schedules the next sub-op ([`Progress::Next`]) or finishes the op
//! ([`Progress::Final`]). The chain is an owned stack — pushing a sub-op
//! makes it the new head, and only the head is ever waited on. Dropping the
//! op drops the whole chain, driver handles included.
//!
//! Completion is driven one of two ways:
//!
//! * [`poll`] / [`Op::wait`] — the caller blocks with a timeout budget while
//!   the core waits on head sub-ops and runs post-processors, or
//! * [`crate::Mio::op_dispatch`] — ownership of the op moves to a dispatcher
//!   thread which drives it terminal and then hands it to exactly one of the
//!   application callbacks.
//!
//! Because dispatching consumes the op, an op with callbacks can not also be
//! polled; the double post-processor hazard is unrepresentable.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::driver::Driver;
use crate::error::Error;
use crate::kvs::{KvsBatch, KvsId};
use crate::obj::composite::{CompObjLayer, ObjExtent};
use crate::obj::io::IoVec;
use crate::obj::ObjId;
use crate::Result;

/// Operation state visible to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    OnFly,
    Completed,
    Failed,
}

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    ObjCreate,
    ObjDelete,
    ObjOpen,
    ObjClose,
    ObjSync,
    ObjAttrsSet,
    ObjAttrsGet,
    ObjRead,
    ObjWrite,
    KvsCreateSet,
    KvsDeleteSet,
    KvsGet,
    KvsPut,
    KvsDel,
    KvsNext,
    CompObjCreate,
    CompObjDelete,
    CompObjAddLayers,
    CompObjDelLayers,
    CompObjListLayers,
    CompObjAddExtents,
    CompObjDelExtents,
    CompObjGetExtents,
}

/// Whose operation this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSubject {
    None,
    Obj(ObjId),
    Kvs(KvsId),
}

/// Outcome of a post-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A new head sub-op has been scheduled; keep waiting.
    Next,
    /// The op is terminal.
    Final,
}

/// Post-processor run at head sub-op completion. It closes over whatever
/// state it needs (shared IO arguments, the object handle, the driver).
pub type PostProc = Box<dyn FnOnce(&mut Op) -> Result<Progress> + Send>;

/// One step of the driver-op chain: the driver-specific handle for the
/// backend RPC plus the post-processor advancing the chain.
pub struct DriverOp {
    pub handle: Box<dyn Any + Send>,
    pub post: Option<PostProc>,
}

/// Typed result carried by a completed op.
pub enum OpOutput {
    None,
    /// Filled read buffers, in the caller's original vector order.
    Read(Vec<IoVec>),
    /// Key-value batch with per-pair status codes.
    Kvs(KvsBatch),
    /// Composite layers, highest precedence first.
    Layers(Vec<CompObjLayer>),
    /// Extents returned by a catalog query.
    Extents(Vec<ObjExtent>),
    /// Object size from an attribute query.
    Size(u64),
}

/// An asynchronous MIO operation.
pub struct Op {
    seqno: u64,
    opcode: OpCode,
    subject: OpSubject,
    state: OpState,
    error: Option<Error>,
    driver: Arc<dyn Driver>,
    chain: Vec<DriverOp>,
    pub(crate) output: OpOutput,
}

impl Op {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        seqno: u64,
        opcode: OpCode,
        subject: OpSubject,
    ) -> Op {
        Op {
            seqno,
            opcode,
            subject,
            state: OpState::OnFly,
            error: None,
            driver,
            chain: Vec::new(),
            output: OpOutput::None,
        }
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn subject(&self) -> OpSubject {
        self.subject
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    /// Terminal error of a failed op.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub(crate) fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    /// Append a driver sub-op; it becomes the new chain head. Drivers call
    /// this from their operation entry points and post-processors.
    pub fn add_driver_op(&mut self, handle: Box<dyn Any + Send>, post: Option<PostProc>) {
        self.chain.push(DriverOp { handle, post });
    }

    /// Driver handle of the current head sub-op.
    pub fn head_handle(&self) -> Option<&(dyn Any + Send)> {
        self.chain.last().map(|d| &*d.handle)
    }

    pub(crate) fn chain_len(&self) -> usize {
        self.chain.len()
    }

    fn take_head_post(&mut self) -> Option<PostProc> {
        self.chain.last_mut().and_then(|d| d.post.take())
    }

    /// Read buffers of a completed `readv`.
    pub fn take_read_output(&mut self) -> Option<Vec<IoVec>> {
        match std::mem::replace(&mut self.output, OpOutput::None) {
            OpOutput::Read(iovs) => Some(iovs),
            other => {
                self.output = other;
                None
            }
        }
    }

    /// Key-value batch of a completed KV op.
    pub fn take_kvs_output(&mut self) -> Option<KvsBatch> {
        match std::mem::replace(&mut self.output, OpOutput::None) {
            OpOutput::Kvs(batch) => Some(batch),
            other => {
                self.output = other;
                None
            }
        }
    }

    /// Layer list of a completed `list_layers`.
    pub fn take_layers_output(&mut self) -> Option<Vec<CompObjLayer>> {
        match std::mem::replace(&mut self.output, OpOutput::None) {
            OpOutput::Layers(layers) => Some(layers),
            other => {
                self.output = other;
                None
            }
        }
    }

    /// Extent list of a completed `get_extents`.
    pub fn take_extents_output(&mut self) -> Option<Vec<ObjExtent>> {
        match std::mem::replace(&mut self.output, OpOutput::None) {
            OpOutput::Extents(exts) => Some(exts),
            other => {
                self.output = other;
                None
            }
        }
    }

    /// Object size reported by a completed size query.
    pub fn size_output(&self) -> Option<u64> {
        match self.output {
            OpOutput::Size(size) => Some(size),
            _ => None,
        }
    }

    /// Drive this single op to a terminal state.
    ///
    /// `None` waits forever. With a budget, an op still in flight when the
    /// budget runs out yields a `Timeout` error; the op itself stays OnFly
    /// and may be waited again.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut ops = [PollOp::new(self)];
        poll(&mut ops, timeout);
        match self.state {
            OpState::Completed => Ok(()),
            OpState::Failed => Err(self
                .error
                .clone()
                .unwrap_or_else(|| Error::io("operation failed"))),
            OpState::OnFly => Err(Error::timeout("operation still in flight")),
        }
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Op")
            .field("seqno", &self.seqno)
            .field("opcode", &self.opcode)
            .field("state", &self.state)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// One entry of a [`poll`] set.
pub struct PollOp<'a> {
    pub op: &'a mut Op,
    /// State observed by the last polling pass.
    pub retstate: OpState,
}

impl<'a> PollOp<'a> {
    pub fn new(op: &'a mut Op) -> PollOp<'a> {
        PollOp { op, retstate: OpState::OnFly }
    }
}

/// Wait for a set of operations to reach a terminal state.
///
/// Each pass asks the driver to wait on every op's head sub-op for up to the
/// remaining budget; a completed head runs its post-processor, which may
/// schedule a new head (the op then shows OnFly again for the next pass).
/// `None` means wait until every op is terminal. Returns the number of
/// terminal ops.
pub fn poll(ops: &mut [PollOp<'_>], timeout: Option<Duration>) -> usize {
    let start = Instant::now();
    loop {
        let remaining = match timeout {
            None => None,
            Some(budget) => Some(budget.saturating_sub(start.elapsed())),
        };
        let mut nr_done = 0;

        for pop in ops.iter_mut() {
            let op: &mut Op = &mut *pop.op;
            if op.state != OpState::OnFly {
                pop.retstate = op.state;
                nr_done += 1;
                continue;
            }

            let driver = op.driver();
            let (state, err) = driver.op_wait(op, remaining);
            match state {
                OpState::OnFly => {
                    pop.retstate = OpState::OnFly;
                }
                OpState::Failed => {
                    op.state = OpState::Failed;
                    op.error =
                        err.or_else(|| Some(Error::io("backend op failed")));
                    pop.retstate = OpState::Failed;
                    nr_done += 1;
                }
                OpState::Completed => match op.take_head_post() {
                    None => {
                        op.state = OpState::Completed;
                        pop.retstate = OpState::Completed;
                        nr_done += 1;
                    }
                    Some(post) => match post(op) {
                        Ok(Progress::Next) => {
                            // A new head was scheduled; wait on it in the
                            // next pass.
                            pop.retstate = OpState::OnFly;
                        }
                        Ok(Progress::Final) => {
                            op.state = OpState::Completed;
                            pop.retstate = OpState::Completed;
                            nr_done += 1;
                        }
                        Err(e) => {
                            op.state = OpState::Failed;
                            op.error = Some(e);
                            pop.retstate = OpState::Failed;
                            nr_done += 1;
                        }
                    },
                },
            }
        }

        if nr_done == ops.len() {
            return nr_done;
        }
        if let Some(budget) = timeout {
            if start.elapsed() >= budget {
                return nr_done;
            }
        }
    }
}

/// Application callback invoked with the finished op.
pub type OpCallback = Box<dyn FnOnce(Op) + Send>;

pub(crate) struct CbTask {
    pub op: Op,
    pub on_complete: OpCallback,
    pub on_failed: OpCallback,
}

/// Dispatcher thread driving callback-mode ops to completion.
pub(crate) struct CbDispatcher {
    tx: Option<crossbeam::channel::Sender<CbTask>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CbDispatcher {
    pub(crate) fn new() -> CbDispatcher {
        let (tx, rx) = crossbeam::channel::unbounded::<CbTask>();
        let handle = std::thread::Builder::new()
            .name("mio-op-dispatch".to_string())
            .spawn(move || {
                for task in rx.iter() {
                    let mut op = task.op;
                    let _ = op.wait(None);
                    match op.state() {
                        OpState::Completed => (task.on_complete)(op),
                        _ => (task.on_failed)(op),
                    }
                }
            })
            .expect("spawn op dispatcher");
        CbDispatcher { tx: Some(tx), handle: Some(handle) }
    }

    pub(crate) fn dispatch(&self, task: CbTask) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .map_err(|_| Error::io("op dispatcher is shut down")),
            None => Err(Error::io("op dispatcher is shut down")),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CbDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Driver stub whose sub-ops complete instantly; handles are `u64` ids
    /// recorded in `waited` as they are observed.
    struct StubDriver {
        waited: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    impl StubDriver {
        fn new() -> StubDriver {
            StubDriver { waited: Mutex::new(Vec::new()), fail_on: None }
        }
    }

    impl Driver for StubDriver {
        fn init(&self) -> crate::Result<()> {
            Ok(())
        }
        fn fini(&self) {}
        fn pool_get(
            &self,
            _pool_id: &crate::pool::PoolId,
            _pool: &mut crate::pool::Pool,
        ) -> crate::Result<()> {
            Ok(())
        }
        fn op_wait(
            &self,
            op: &mut Op,
            _timeout: Option<Duration>,
        ) -> (OpState, Option<Error>) {
            let id = match op.head_handle().and_then(|h| h.downcast_ref::<u64>()) {
                Some(id) => *id,
                None => return (OpState::Failed, Some(Error::invalid("no head"))),
            };
            self.waited.lock().unwrap().push(id);
            if self.fail_on == Some(id) {
                return (OpState::Failed, Some(Error::io("injected failure")));
            }
            (OpState::Completed, None)
        }
    }

    fn stub_op(driver: Arc<StubDriver>) -> Op {
        Op::new(driver, 1, OpCode::ObjSync, OpSubject::None)
    }

    #[test]
    fn test_single_subop_completes() {
        let driver = Arc::new(StubDriver::new());
        let mut op = stub_op(driver.clone());
        op.add_driver_op(Box::new(10u64), None);

        op.wait(None).unwrap();
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(driver.waited.lock().unwrap().as_slice(), &[10]);
    }

    #[test]
    fn test_post_proc_chains_next_head() {
        let driver = Arc::new(StubDriver::new());
        let mut op = stub_op(driver.clone());

        // First sub-op chains a second one; the second finishes the op.
        op.add_driver_op(
            Box::new(1u64),
            Some(Box::new(|op: &mut Op| {
                op.add_driver_op(Box::new(2u64), None);
                Ok(Progress::Next)
            })),
        );

        op.wait(None).unwrap();
        assert_eq!(op.state(), OpState::Completed);
        // Chain order is strict: 1 then 2, each waited exactly once.
        assert_eq!(driver.waited.lock().unwrap().as_slice(), &[1, 2]);
        assert_eq!(op.chain_len(), 2);
    }

    #[test]
    fn test_post_proc_error_fails_op() {
        let driver = Arc::new(StubDriver::new());
        let mut op = stub_op(driver);
        op.add_driver_op(
            Box::new(1u64),
            Some(Box::new(|_op: &mut Op| Err(Error::io("post failed")))),
        );

        let err = op.wait(None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert_eq!(op.state(), OpState::Failed);
    }

    #[test]
    fn test_failed_subop_is_terminal() {
        let mut driver = StubDriver::new();
        driver.fail_on = Some(2);
        let driver = Arc::new(driver);
        let mut op = stub_op(driver.clone());
        op.add_driver_op(
            Box::new(1u64),
            Some(Box::new(|op: &mut Op| {
                op.add_driver_op(Box::new(2u64), None);
                Ok(Progress::Next)
            })),
        );

        assert!(op.wait(None).is_err());
        assert_eq!(op.state(), OpState::Failed);
        assert_eq!(driver.waited.lock().unwrap().as_slice(), &[1, 2]);
    }

    #[test]
    fn test_poll_set_counts_terminal_ops() {
        let driver = Arc::new(StubDriver::new());
        let mut op1 = stub_op(driver.clone());
        op1.add_driver_op(Box::new(1u64), None);
        let mut op2 = stub_op(driver.clone());
        op2.add_driver_op(
            Box::new(2u64),
            Some(Box::new(|op: &mut Op| {
                op.add_driver_op(Box::new(3u64), None);
                Ok(Progress::Next)
            })),
        );

        let mut set = [PollOp::new(&mut op1), PollOp::new(&mut op2)];
        let done = poll(&mut set, None);
        assert_eq!(done, 2);
        assert_eq!(set[0].retstate, OpState::Completed);
        assert_eq!(set[1].retstate, OpState::Completed);
    }

    #[test]
    fn test_already_terminal_op_is_not_rewaited() {
        let driver = Arc::new(StubDriver::new());
        let mut op = stub_op(driver.clone());
        op.add_driver_op(Box::new(5u64), None);
        op.wait(None).unwrap();
        op.wait(None).unwrap();
        assert_eq!(driver.waited.lock().unwrap().as_slice(), &[5]);
    }

    #[test]
    fn test_dispatcher_invokes_exactly_one_callback() {
        static COMPLETED: AtomicUsize = AtomicUsize::new(0);
        static FAILED: AtomicUsize = AtomicUsize::new(0);

        let driver = Arc::new(StubDriver::new());
        let mut op = stub_op(driver);
        op.add_driver_op(Box::new(9u64), None);

        let dispatcher = CbDispatcher::new();
        dispatcher
            .dispatch(CbTask {
                op,
                on_complete: Box::new(|op| {
                    assert_eq!(op.state(), OpState::Completed);
                    COMPLETED.fetch_add(1, Ordering::SeqCst);
                }),
                on_failed: Box::new(|_| {
                    FAILED.fetch_add(1, Ordering::SeqCst);
                }),
            })
            .unwrap();
        drop(dispatcher); // joins the thread

        assert_eq!(COMPLETED.load(Ordering::SeqCst), 1);
        assert_eq!(FAILED.load(Ordering::SeqCst), 0);
    }
}
