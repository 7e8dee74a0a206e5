//! Object I/O engine
//!
//! Reads and writes share one pipeline:
//!
//! 1. **Sort and validate.** The application vectors are sorted by object
//!    offset; overlapping ranges are rejected before any sub-op exists.
//!    Writes also compute the highest end-of-write for the size update.
//! 2. **Align.** Each vector is split against the backend page size into
//!    fully aligned spans (submitted zero-copy out of the caller's buffer)
//!    and partial pages. A partial page gets a private page buffer, an
//!    aligned vector covering it, and a pair of data-copy descriptors
//!    locating the application bytes within it. Consecutive partial pages
//!    landing on the same page share one buffer. For writes every partial
//!    page is also queued for read-before-write; a scan over the copy
//!    descriptors then zeroes the RBW entries whose copies cover the whole
//!    page, so the backend skips reading them.
//! 3. **Chunked submission.** Aligned vectors are accumulated into backend
//!    RW sub-ops no larger than the pool's per-op byte bound; each sub-op's
//!    post-processor submits the next chunk until the list is drained.
//! 4. **Post-I/O.** The final write completion updates the persisted size
//!    when it grew and folds the transfer into the access statistics; the
//!    final read completion copies partial pages back out and surfaces the
//!    filled buffers as the op output.

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::driver::RwOpcode;
use crate::error::Error;
use crate::op::{Op, OpCode, OpOutput, PostProc, Progress};
use crate::telemetry::{self, TelemetryValue};
use crate::Result;

use super::attrs::AttrsQuery;
use super::{attrs, Obj, ObjInner};

/// One application IO vector: a byte range of the object and the bytes
/// themselves (payload for writes, destination for reads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoVec {
    pub off: u64,
    pub data: Vec<u8>,
}

impl IoVec {
    pub fn new(off: u64, data: Vec<u8>) -> IoVec {
        IoVec { off, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A byte range of the object, for read requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSpan {
    pub off: u64,
    pub len: usize,
}

impl IoSpan {
    pub fn new(off: u64, len: usize) -> IoSpan {
        IoSpan { off, len }
    }
}

/// Where a segment's bytes live: an application vector or a private page
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufRef {
    App(usize),
    Page(usize),
}

/// One aligned vector handed to the backend: an object byte range backed by
/// `len` bytes at `buf_off` inside `buf`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Seg {
    pub off: u64,
    pub len: usize,
    pub buf: BufRef,
    pub buf_off: usize,
}

/// One side of a data-copy descriptor: `len` bytes at `off` inside `buf`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopySeg {
    pub buf: BufRef,
    pub off: usize,
    pub len: usize,
}

/// Shared state of one read/write pipeline run. Post-processors and the
/// driver's executor both reach it through an `Arc<Mutex<..>>`.
pub(crate) struct RwArgs {
    pub is_write: bool,
    pub max_eow: u64,
    pub total_bytes: u64,
    pub pagesize: usize,
    pub max_per_op: u64,
    pub started: Instant,

    /// Application vectors, original order.
    pub app: Vec<IoVec>,
    /// Private page buffers for partial pages.
    pub pages: Vec<Vec<u8>>,

    pub aligned: Vec<Seg>,
    pub aligned_progress: usize,

    /// Read-before-write vectors (writes only). Zero-length entries are
    /// pages whose copies cover them entirely; the backend skips those.
    pub rbw: Vec<Seg>,
    pub rbw_progress: usize,

    pub dc_src: Vec<CopySeg>,
    pub dc_dst: Vec<CopySeg>,
}

/// Which list of a pipeline run a chunk draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RwList {
    Aligned,
    Rbw,
}

/// A contiguous run of aligned vectors submitted as one backend RW sub-op.
/// Drivers resolve the vectors through [`IoChunk::for_each_src`] (writes)
/// or [`IoChunk::for_each_dst`] (reads); zero-length vectors are skipped.
pub struct IoChunk {
    pub(crate) args: Arc<Mutex<RwArgs>>,
    pub(crate) list: RwList,
    pub(crate) range: Range<usize>,
}

impl IoChunk {
    fn lock_args(&self) -> MutexGuard<'_, RwArgs> {
        self.args.lock().expect("rw args poisoned")
    }

    fn segs(&self, args: &RwArgs) -> Vec<Seg> {
        let list = match self.list {
            RwList::Aligned => &args.aligned,
            RwList::Rbw => &args.rbw,
        };
        list[self.range.clone()].to_vec()
    }

    /// Visit `(object_offset, bytes)` of every vector, for writing.
    pub fn for_each_src(
        &self,
        mut f: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let args = self.lock_args();
        for seg in self.segs(&args) {
            if seg.len == 0 {
                continue;
            }
            let slice = match seg.buf {
                BufRef::App(i) => {
                    &args.app[i].data[seg.buf_off..seg.buf_off + seg.len]
                }
                BufRef::Page(p) => {
                    &args.pages[p][seg.buf_off..seg.buf_off + seg.len]
                }
            };
            f(seg.off, slice)?;
        }
        Ok(())
    }

    /// Visit `(object_offset, buffer)` of every vector, for reading into.
    pub fn for_each_dst(
        &self,
        mut f: impl FnMut(u64, &mut [u8]) -> Result<()>,
    ) -> Result<()> {
        let mut args = self.lock_args();
        for seg in self.segs(&args) {
            if seg.len == 0 {
                continue;
            }
            let slice = match seg.buf {
                BufRef::App(i) => {
                    &mut args.app[i].data[seg.buf_off..seg.buf_off + seg.len]
                }
                BufRef::Page(p) => {
                    &mut args.pages[p][seg.buf_off..seg.buf_off + seg.len]
                }
            };
            f(seg.off, slice)?;
        }
        Ok(())
    }
}

impl RwArgs {
    fn new(
        app: Vec<IoVec>,
        is_write: bool,
        pagesize: usize,
        max_per_op: u64,
    ) -> RwArgs {
        let total_bytes = app.iter().map(|v| v.data.len() as u64).sum();
        RwArgs {
            is_write,
            max_eow: 0,
            total_bytes,
            pagesize,
            max_per_op,
            started: Instant::now(),
            app,
            pages: Vec::new(),
            aligned: Vec::new(),
            aligned_progress: 0,
            rbw: Vec::new(),
            rbw_progress: 0,
            dc_src: Vec::new(),
            dc_dst: Vec::new(),
        }
    }

    /// Sorted view of the application vectors: `(off, len, app index)`.
    /// Fails on overlap; records the end-of-write for writes.
    fn sort_and_validate(&mut self) -> Result<Vec<(u64, usize, usize)>> {
        let mut sorted: Vec<(u64, usize, usize)> = self
            .app
            .iter()
            .enumerate()
            .map(|(i, v)| (v.off, v.data.len(), i))
            .collect();
        sorted.sort_by_key(|&(off, _, _)| off);

        let mut max_eow = sorted[0].0 + sorted[0].1 as u64;
        for i in 1..sorted.len() {
            let (off, len, _) = sorted[i];
            let (prev_off, prev_len, _) = sorted[i - 1];
            if off < prev_off + prev_len as u64 {
                return Err(Error::invalid(format!(
                    "IO vectors overlap at offset {}",
                    off
                )));
            }
            if off + len as u64 > max_eow {
                max_eow = off + len as u64;
            }
        }
        if self.is_write {
            self.max_eow = max_eow;
        }
        Ok(sorted)
    }

    /// Clone an already aligned span into the submission list, chunked by
    /// the per-op bound.
    fn clone_aligned(&mut self, off: u64, len: usize, app_idx: usize, app_off: usize) {
        debug_assert!(off % self.pagesize as u64 == 0);
        debug_assert!(len % self.pagesize == 0);
        let mut done = 0usize;
        while done < len {
            let chunk = (len - done).min(self.max_per_op as usize);
            self.aligned.push(Seg {
                off: off + done as u64,
                len: chunk,
                buf: BufRef::App(app_idx),
                buf_off: app_off + done,
            });
            done += chunk;
        }
    }

    /// Route a partial page through a private page buffer. Consecutive
    /// partials on the same page share the buffer and the RBW entry.
    fn partial_page(&mut self, off: u64, len: usize, app_idx: usize, app_off: usize) {
        debug_assert!(len > 0 && len < self.pagesize);
        let pagesize = self.pagesize as u64;
        let aligned_off = off / pagesize * pagesize;

        let reuse = match self.aligned.last() {
            // An aligned clone starting here would mean the input
            // overlapped, which was rejected during validation.
            Some(seg) if seg.off == aligned_off => match seg.buf {
                BufRef::Page(p) => Some(p),
                BufRef::App(_) => None,
            },
            _ => None,
        };
        let page_idx = match reuse {
            Some(p) => p,
            None => self.new_page(aligned_off),
        };

        let in_page = (off % pagesize) as usize;
        if self.is_write {
            self.dc_src.push(CopySeg { buf: BufRef::App(app_idx), off: app_off, len });
            self.dc_dst.push(CopySeg { buf: BufRef::Page(page_idx), off: in_page, len });
        } else {
            self.dc_src.push(CopySeg { buf: BufRef::Page(page_idx), off: in_page, len });
            self.dc_dst.push(CopySeg { buf: BufRef::App(app_idx), off: app_off, len });
        }
    }

    fn new_page(&mut self, aligned_off: u64) -> usize {
        let page_idx = self.pages.len();
        self.pages.push(vec![0u8; self.pagesize]);
        let seg = Seg {
            off: aligned_off,
            len: self.pagesize,
            buf: BufRef::Page(page_idx),
            buf_off: 0,
        };
        self.aligned.push(seg);
        if self.is_write {
            self.rbw.push(seg);
        }
        page_idx
    }

    /// Aligned offset, length not a page multiple: an aligned body followed
    /// by a partial last page.
    fn split_aligned_off(&mut self, off: u64, len: usize, app_idx: usize) {
        let pagesize = self.pagesize;
        if len < pagesize {
            self.partial_page(off, len, app_idx, 0);
            return;
        }
        let len1 = len - len % pagesize;
        self.clone_aligned(off, len1, app_idx, 0);
        self.partial_page(off + len1 as u64, len - len1, app_idx, len1);
    }

    /// Unaligned offset: two or three parts depending on whether the first
    /// and last touched pages are distinct.
    fn split_unaligned_off(&mut self, off: u64, len: usize, app_idx: usize) {
        let pagesize = self.pagesize as u64;
        let first_page = off / pagesize;
        let last_page = (off + len as u64 - 1) / pagesize;

        if first_page == last_page {
            self.partial_page(off, len, app_idx, 0);
            return;
        }

        // Leading partial page.
        let len1 = (pagesize - off % pagesize) as usize;
        self.partial_page(off, len1, app_idx, 0);

        if last_page == first_page + 1 {
            // The rest lives in the next page.
            let len2 = len - len1;
            if len2 == self.pagesize {
                self.clone_aligned(off + len1 as u64, len2, app_idx, len1);
            } else {
                self.partial_page(off + len1 as u64, len2, app_idx, len1);
            }
            return;
        }

        // Aligned body; the last page joins it when the end is aligned.
        let end_aligned = (off + len as u64) % pagesize == 0;
        let body_pages = if end_aligned {
            last_page - first_page
        } else {
            last_page - first_page - 1
        };
        let len2 = (body_pages * pagesize) as usize;
        self.clone_aligned(off + len1 as u64, len2, app_idx, len1);

        let len3 = len - len1 - len2;
        if len3 > 0 {
            self.partial_page(
                off + (len1 + len2) as u64,
                len3,
                app_idx,
                len1 + len2,
            );
        }
    }

    /// Step 2: build the aligned, RBW and data-copy lists from the sorted
    /// view.
    fn adjust(&mut self, sorted: &[(u64, usize, usize)]) {
        let pagesize = self.pagesize;
        for &(off, len, app_idx) in sorted {
            let off_aligned = off % pagesize as u64 == 0;
            let len_aligned = len % pagesize == 0;
            if off_aligned && len_aligned {
                self.clone_aligned(off, len, app_idx, 0);
            } else if off_aligned {
                self.split_aligned_off(off, len, app_idx);
            } else {
                self.split_unaligned_off(off, len, app_idx);
            }
        }
    }

    /// Zero the RBW entries whose data copies cover the whole page from
    /// offset 0: nothing of the old content would survive the merge, so
    /// the read is skipped. Copy destinations for one page sit next to
    /// each other because the sorted input is processed in offset order.
    fn optimise_rbw(&mut self) {
        let pagesize = self.pagesize;
        let mut dst_cursor = 0;
        for i in 0..self.rbw.len() {
            let page = match self.rbw[i].buf {
                BufRef::Page(p) => p,
                BufRef::App(_) => continue,
            };
            let mut j = dst_cursor;
            while j < self.dc_dst.len() && self.dc_dst[j].buf != BufRef::Page(page) {
                j += 1;
            }
            if j == self.dc_dst.len() {
                continue;
            }
            dst_cursor = j;
            if self.dc_dst[j].off != 0 {
                continue;
            }
            let mut covered = self.dc_dst[j].len;
            let mut k = j + 1;
            while covered < pagesize && k < self.dc_dst.len() {
                let dst = self.dc_dst[k];
                if dst.buf != BufRef::Page(page) || dst.off > covered {
                    break;
                }
                covered += dst.len;
                k += 1;
            }
            if covered == pagesize {
                self.rbw[i].len = 0;
                self.rbw[i].off = 0;
            }
        }
    }

    /// Run the pending data-copy descriptors: application bytes onto the
    /// page buffers for writes, page bytes back out for reads.
    fn data_copy(&mut self) {
        let RwArgs { is_write, app, pages, dc_src, dc_dst, .. } = self;
        for (src, dst) in dc_src.iter().zip(dc_dst.iter()) {
            if *is_write {
                let (BufRef::App(a), BufRef::Page(p)) = (src.buf, dst.buf) else {
                    debug_assert!(false, "write copy must be app to page");
                    continue;
                };
                let bytes = &app[a].data[src.off..src.off + src.len];
                pages[p][dst.off..dst.off + dst.len].copy_from_slice(bytes);
            } else {
                let (BufRef::Page(p), BufRef::App(a)) = (src.buf, dst.buf) else {
                    debug_assert!(false, "read copy must be page to app");
                    continue;
                };
                let bytes = &pages[p][src.off..src.off + src.len];
                app[a].data[dst.off..dst.off + dst.len].copy_from_slice(bytes);
            }
        }
    }
}

fn lock_args(args: &Arc<Mutex<RwArgs>>) -> MutexGuard<'_, RwArgs> {
    args.lock().expect("rw args poisoned")
}

/// Step 3: submit the next chunk of `list`, accumulating vectors until the
/// per-op bound would be exceeded. A single vector larger than the bound
/// fails with `TooBig`.
fn rw_aligned(
    obj: &Arc<ObjInner>,
    args_arc: &Arc<Mutex<RwArgs>>,
    list: RwList,
    opcode: RwOpcode,
    op: &mut Op,
    post: PostProc,
) -> Result<()> {
    let range = {
        let mut args = lock_args(args_arc);
        let (cursor, total) = match list {
            RwList::Aligned => (args.aligned_progress, args.aligned.len()),
            RwList::Rbw => (args.rbw_progress, args.rbw.len()),
        };
        let mut io_size = 0u64;
        let mut count = 0usize;
        for i in cursor..total {
            let len = match list {
                RwList::Aligned => args.aligned[i].len,
                RwList::Rbw => args.rbw[i].len,
            } as u64;
            if io_size + len > args.max_per_op {
                break;
            }
            io_size += len;
            count += 1;
        }
        if count == 0 {
            return Err(Error::too_big(
                "one IO vector exceeds the pool's per-op limit",
            ));
        }
        match list {
            RwList::Aligned => args.aligned_progress += count,
            RwList::Rbw => args.rbw_progress += count,
        }
        cursor..cursor + count
    };

    let _ = telemetry::advertise_noprefix(
        "mio-op-to-backend-io",
        TelemetryValue::ArrayU64(vec![obj.sess_seqno, op.seqno()]),
    );
    let chunk = IoChunk { args: args_arc.clone(), list, range };
    obj.driver.obj_rw(obj, opcode, chunk, op, Some(post))
}

fn write_post(obj: Arc<ObjInner>, args: Arc<Mutex<RwArgs>>) -> PostProc {
    Box::new(move |op: &mut Op| {
        let pending = {
            let a = lock_args(&args);
            a.aligned_progress != a.aligned.len()
        };
        if pending {
            let next = write_post(obj.clone(), args.clone());
            rw_aligned(&obj, &args, RwList::Aligned, RwOpcode::Write, op, next)?;
            return Ok(Progress::Next);
        }

        let (max_eow, total_bytes, elapsed) = {
            let a = lock_args(&args);
            (a.max_eow, a.total_bytes, a.started.elapsed().as_nanos() as u64)
        };
        let size_grew = {
            let mut state = obj.lock_state();
            state.attrs.stats.wcount += 1;
            state.attrs.stats.wbytes += total_bytes;
            state.attrs.stats.wtime += elapsed;
            state.attrs_updated = true;
            if max_eow > state.attrs.size {
                state.attrs.size = max_eow;
                // The PUT below persists everything that just changed.
                state.attrs_updated = false;
                true
            } else {
                false
            }
        };
        if size_grew {
            attrs::attrs_query(obj.clone(), AttrsQuery::Put, op)?;
            Ok(Progress::Next)
        } else {
            Ok(Progress::Final)
        }
    })
}

fn rbw_post(obj: Arc<ObjInner>, args: Arc<Mutex<RwArgs>>) -> PostProc {
    Box::new(move |op: &mut Op| {
        let pending = {
            let a = lock_args(&args);
            a.rbw_progress != a.rbw.len()
        };
        if pending {
            let next = rbw_post(obj.clone(), args.clone());
            rw_aligned(&obj, &args, RwList::Rbw, RwOpcode::Read, op, next)?;
        } else {
            // All old pages are in; merge the application bytes on top and
            // start the write chain.
            lock_args(&args).data_copy();
            let next = write_post(obj.clone(), args.clone());
            rw_aligned(&obj, &args, RwList::Aligned, RwOpcode::Write, op, next)?;
        }
        Ok(Progress::Next)
    })
}

fn read_post(obj: Arc<ObjInner>, args: Arc<Mutex<RwArgs>>) -> PostProc {
    Box::new(move |op: &mut Op| {
        let pending = {
            let a = lock_args(&args);
            a.aligned_progress != a.aligned.len()
        };
        if pending {
            let next = read_post(obj.clone(), args.clone());
            rw_aligned(&obj, &args, RwList::Aligned, RwOpcode::Read, op, next)?;
            return Ok(Progress::Next);
        }

        let (iovs, total_bytes, elapsed) = {
            let mut a = lock_args(&args);
            a.data_copy();
            let total = a.total_bytes;
            let elapsed = a.started.elapsed().as_nanos() as u64;
            (std::mem::take(&mut a.app), total, elapsed)
        };
        {
            let mut state = obj.lock_state();
            state.attrs.stats.rcount += 1;
            state.attrs.stats.rbytes += total_bytes;
            state.attrs.stats.rtime += elapsed;
            state.attrs_updated = true;
        }
        op.output = OpOutput::Read(iovs);
        Ok(Progress::Final)
    })
}

fn build_args(
    obj: &Arc<ObjInner>,
    iovs: Vec<IoVec>,
    is_write: bool,
) -> Result<RwArgs> {
    if iovs.is_empty() {
        return Err(Error::invalid("empty IO vector array"));
    }
    if iovs.iter().any(|v| v.data.is_empty()) {
        return Err(Error::invalid("zero-length IO vector"));
    }
    let limits = obj.driver.obj_io_limits(obj)?;
    let mut args = RwArgs::new(iovs, is_write, limits.pagesize, limits.max_per_op);
    let sorted = args.sort_and_validate()?;
    args.adjust(&sorted);
    Ok(args)
}

pub(crate) fn writev_start(
    obj: &Arc<ObjInner>,
    iovs: Vec<IoVec>,
    op: &mut Op,
) -> Result<()> {
    let mut args = build_args(obj, iovs, true)?;
    args.optimise_rbw();
    let has_rbw = !args.rbw.is_empty();
    if !has_rbw {
        args.data_copy();
    }
    let args = Arc::new(Mutex::new(args));
    if has_rbw {
        let post = rbw_post(obj.clone(), args.clone());
        rw_aligned(obj, &args, RwList::Rbw, RwOpcode::Read, op, post)
    } else {
        let post = write_post(obj.clone(), args.clone());
        rw_aligned(obj, &args, RwList::Aligned, RwOpcode::Write, op, post)
    }
}

pub(crate) fn readv_start(
    obj: &Arc<ObjInner>,
    spans: &[IoSpan],
    op: &mut Op,
) -> Result<()> {
    let iovs: Vec<IoVec> = spans
        .iter()
        .map(|s| IoVec::new(s.off, vec![0u8; s.len]))
        .collect();
    let args = Arc::new(Mutex::new(build_args(obj, iovs, false)?));
    let post = read_post(obj.clone(), args.clone());
    rw_aligned(obj, &args, RwList::Aligned, RwOpcode::Read, op, post)
}

impl Obj {
    /// Write the vectors to the object. Vectors may be unordered and
    /// unaligned but must not overlap. The op completes after all data
    /// sub-ops and, when the object grew, the attribute update.
    pub fn writev(&self, iovs: Vec<IoVec>) -> Result<Op> {
        let mut op = self.inner.new_op(OpCode::ObjWrite);
        writev_start(&self.inner, iovs, &mut op)?;
        Ok(op)
    }

    /// Read the spans from the object. The completed op's read output holds
    /// one filled vector per requested span, in request order.
    pub fn readv(&self, spans: &[IoSpan]) -> Result<Op> {
        let mut op = self.inner.new_op(OpCode::ObjRead);
        readv_start(&self.inner, spans, &mut op)?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::driver::mem::{MemDriver, TraceEntry};
    use crate::error::ErrorKind;
    use crate::obj::ObjId;
    use crate::Mio;

    const P: u64 = 4096;

    fn test_env() -> (Mio, Arc<MemDriver>) {
        let config = Config::mem_test_config();
        let driver = Arc::new(MemDriver::new(&config).unwrap());
        let mio = Mio::init_with_driver(config, driver.clone()).unwrap();
        (mio, driver)
    }

    fn make_obj(mio: &Mio, lo: u64) -> Obj {
        let id = ObjId::from_hi_lo(0xb, lo);
        let (obj, mut op) = mio.obj_create(&id, None, None).unwrap();
        op.wait(None).unwrap();
        obj
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    fn rw_trace(driver: &MemDriver) -> Vec<TraceEntry> {
        driver
            .take_trace()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    TraceEntry::Read { .. }
                        | TraceEntry::Write { .. }
                        | TraceEntry::KvsPut { .. }
                )
            })
            .collect()
    }

    #[test]
    fn test_unaligned_write_across_one_page() {
        // Scenario: pagesize 4096, writev([{off=100, len=200}]).
        let (mio, driver) = test_env();
        let obj = make_obj(&mio, 1);
        driver.take_trace();

        let mut op = obj
            .writev(vec![IoVec::new(100, pattern(200, 1))])
            .unwrap();
        op.wait(None).unwrap();

        let trace = rw_trace(&driver);
        assert_eq!(
            trace,
            vec![
                TraceEntry::Read { oid: obj.id(), off: 0, len: P },
                TraceEntry::Write { oid: obj.id(), off: 0, len: P },
                TraceEntry::KvsPut { nr_pairs: 1 },
            ]
        );
        assert_eq!(obj.size(), 300);
        obj.close().unwrap();
    }

    #[test]
    fn test_two_vectors_second_unaligned() {
        // Scenario: full page at 0 plus 200 bytes at 8000, which crosses
        // the page boundary at 8192.
        let (mio, driver) = test_env();
        let obj = make_obj(&mio, 2);
        driver.take_trace();

        let mut op = obj
            .writev(vec![
                IoVec::new(0, pattern(P as usize, 2)),
                IoVec::new(8000, pattern(200, 3)),
            ])
            .unwrap();
        op.wait(None).unwrap();
        assert_eq!(obj.size(), 8200);

        let trace = rw_trace(&driver);
        let reads: Vec<_> = trace
            .iter()
            .filter(|e| matches!(e, TraceEntry::Read { .. }))
            .collect();
        let writes: Vec<_> = trace
            .iter()
            .filter(|e| matches!(e, TraceEntry::Write { .. }))
            .collect();
        // RBW for both partial pages, then the full page and the two
        // RBW-backed pages.
        assert_eq!(
            reads,
            vec![
                &TraceEntry::Read { oid: obj.id(), off: P, len: P },
                &TraceEntry::Read { oid: obj.id(), off: 2 * P, len: P },
            ]
        );
        assert_eq!(
            writes,
            vec![
                &TraceEntry::Write { oid: obj.id(), off: 0, len: P },
                &TraceEntry::Write { oid: obj.id(), off: P, len: P },
                &TraceEntry::Write { oid: obj.id(), off: 2 * P, len: P },
            ]
        );
        obj.close().unwrap();
    }

    #[test]
    fn test_overlap_rejected_without_subops() {
        let (mio, driver) = test_env();
        let obj = make_obj(&mio, 3);
        driver.take_trace();

        let err = obj
            .writev(vec![
                IoVec::new(0, pattern(100, 1)),
                IoVec::new(50, pattern(100, 2)),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(rw_trace(&driver).is_empty());
        obj.close().unwrap();
    }

    #[test]
    fn test_write_read_roundtrip_unaligned() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 4);

        let payload_a = pattern(200, 11);
        let payload_b = pattern(5000, 23);
        let mut op = obj
            .writev(vec![
                IoVec::new(100, payload_a.clone()),
                IoVec::new(6000, payload_b.clone()),
            ])
            .unwrap();
        op.wait(None).unwrap();

        let mut op = obj
            .readv(&[IoSpan::new(100, 200), IoSpan::new(6000, 5000)])
            .unwrap();
        op.wait(None).unwrap();
        let iovs = op.take_read_output().unwrap();
        assert_eq!(iovs[0].off, 100);
        assert_eq!(iovs[0].data, payload_a);
        assert_eq!(iovs[1].data, payload_b);
        obj.close().unwrap();
    }

    #[test]
    fn test_unsorted_vectors_are_sorted_first() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 5);

        let lo = pattern(300, 5);
        let hi = pattern(300, 7);
        let mut op = obj
            .writev(vec![
                IoVec::new(10000, hi.clone()),
                IoVec::new(0, lo.clone()),
            ])
            .unwrap();
        op.wait(None).unwrap();
        assert_eq!(obj.size(), 10300);

        let mut op = obj.readv(&[IoSpan::new(0, 300), IoSpan::new(10000, 300)]).unwrap();
        op.wait(None).unwrap();
        let iovs = op.take_read_output().unwrap();
        assert_eq!(iovs[0].data, lo);
        assert_eq!(iovs[1].data, hi);
        obj.close().unwrap();
    }

    #[test]
    fn test_rbw_preserves_old_bytes() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 6);

        let base = pattern(P as usize, 0);
        obj.writev(vec![IoVec::new(0, base.clone())])
            .unwrap()
            .wait(None)
            .unwrap();

        // Overwrite the middle of the page only.
        let patch = vec![0xEE; 100];
        obj.writev(vec![IoVec::new(1000, patch.clone())])
            .unwrap()
            .wait(None)
            .unwrap();

        let mut op = obj.readv(&[IoSpan::new(0, P as usize)]).unwrap();
        op.wait(None).unwrap();
        let got = op.take_read_output().unwrap().remove(0).data;
        assert_eq!(&got[..1000], &base[..1000]);
        assert_eq!(&got[1000..1100], patch.as_slice());
        assert_eq!(&got[1100..], &base[1100..]);
        // size unchanged, so no second attribute PUT was required
        assert_eq!(obj.size(), P);
        obj.close().unwrap();
    }

    #[test]
    fn test_full_page_coverage_skips_rbw_read() {
        // Two partials covering one whole page: the RBW entry is zeroed.
        let (mio, driver) = test_env();
        let obj = make_obj(&mio, 7);
        // Give the object some size so RBW would otherwise really read.
        obj.writev(vec![IoVec::new(0, pattern(2 * P as usize, 9))])
            .unwrap()
            .wait(None)
            .unwrap();
        driver.take_trace();

        let mut op = obj
            .writev(vec![
                IoVec::new(0, pattern(2048, 1)),
                IoVec::new(2048, pattern(2048, 2)),
            ])
            .unwrap();
        op.wait(None).unwrap();

        let trace = rw_trace(&driver);
        assert!(
            trace
                .iter()
                .all(|e| !matches!(e, TraceEntry::Read { .. })),
            "whole-page coverage must skip the RBW read: {:?}",
            trace
        );
        obj.close().unwrap();
    }

    #[test]
    fn test_large_write_is_chunked_by_max_per_op() {
        let (mio, driver) = test_env();
        let obj = make_obj(&mio, 8);
        driver.take_trace();

        // Pool bound is 32768 (unit 4096, N=1, K=0, P=4); write 3.5x that.
        let total = 32768 * 3 + 16384;
        obj.writev(vec![IoVec::new(0, pattern(total, 1))])
            .unwrap()
            .wait(None)
            .unwrap();

        let writes: Vec<(u64, u64)> = driver
            .take_trace()
            .into_iter()
            .filter_map(|e| match e {
                TraceEntry::Write { off, len, .. } => Some((off, len)),
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![(0, 32768), (32768, 32768), (65536, 32768), (98304, 16384)]
        );
        // Invariant: every submitted vector is page-aligned and bounded.
        for (off, len) in writes {
            assert_eq!(off % P, 0);
            assert_eq!(len % P, 0);
            assert!(len <= 32768);
        }
        assert_eq!(obj.size(), total as u64);
        obj.close().unwrap();
    }

    #[test]
    fn test_write_updates_stats() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 9);

        obj.writev(vec![IoVec::new(0, pattern(100, 1))])
            .unwrap()
            .wait(None)
            .unwrap();
        obj.readv(&[IoSpan::new(0, 100)]).unwrap().wait(None).unwrap();

        let stats = obj.stats();
        assert_eq!(stats.wcount, 1);
        assert_eq!(stats.wbytes, 100);
        assert_eq!(stats.rcount, 1);
        assert_eq!(stats.rbytes, 100);

        // Hot index reflects the access counters.
        assert_eq!(
            obj.hint_get(crate::hints::ObjHintKey::HotIndex).unwrap(),
            2
        );
        obj.close().unwrap();
    }

    #[test]
    fn test_size_only_grows() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 10);

        obj.writev(vec![IoVec::new(0, pattern(10000, 1))])
            .unwrap()
            .wait(None)
            .unwrap();
        assert_eq!(obj.size(), 10000);

        obj.writev(vec![IoVec::new(0, pattern(100, 2))])
            .unwrap()
            .wait(None)
            .unwrap();
        assert_eq!(obj.size(), 10000);

        let mut op = obj.query_size().unwrap();
        op.wait(None).unwrap();
        assert_eq!(op.size_output(), Some(10000));
        obj.close().unwrap();
    }

    #[test]
    fn test_size_survives_reopen() {
        let (mio, _driver) = test_env();
        let id = ObjId::from_hi_lo(0xb, 11);
        let (obj, mut op) = mio.obj_create(&id, None, None).unwrap();
        op.wait(None).unwrap();
        obj.writev(vec![IoVec::new(4000, pattern(500, 1))])
            .unwrap()
            .wait(None)
            .unwrap();
        obj.close().unwrap();

        let (obj, mut op) = mio.obj_open(&id).unwrap();
        op.wait(None).unwrap();
        assert_eq!(obj.size(), 4500);
        obj.close().unwrap();
    }

    #[test]
    fn test_empty_and_zero_length_vectors_rejected() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 12);
        assert!(obj.writev(Vec::new()).is_err());
        assert!(obj.writev(vec![IoVec::new(0, Vec::new())]).is_err());
        assert!(obj.readv(&[]).is_err());
        obj.close().unwrap();
    }

    #[test]
    fn test_read_of_sparse_range_returns_zeroes() {
        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 13);
        obj.writev(vec![IoVec::new(0, pattern(100, 1))])
            .unwrap()
            .wait(None)
            .unwrap();

        let mut op = obj.readv(&[IoSpan::new(P, 64)]).unwrap();
        op.wait(None).unwrap();
        let got = op.take_read_output().unwrap().remove(0).data;
        assert_eq!(got, vec![0u8; 64]);
        obj.close().unwrap();
    }

    #[test]
    fn test_randomized_vectors_roundtrip() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (mio, _driver) = test_env();
        let obj = make_obj(&mio, 15);
        let mut rng = StdRng::seed_from_u64(0x1a2b3c);

        // Non-overlapping vectors with random gaps, lengths and alignment.
        let mut iovs = Vec::new();
        let mut off = 0u64;
        for _ in 0..12 {
            off += rng.gen_range(1..6000);
            let len = rng.gen_range(1..10000);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            iovs.push(IoVec::new(off, data));
            off += len as u64;
        }
        let expected_size = iovs.iter().map(|v| v.off + v.len() as u64).max().unwrap();

        // Submit in a scrambled order; the engine sorts them back.
        let mut scrambled = iovs.clone();
        scrambled.swap(0, 7);
        scrambled.swap(3, 11);
        scrambled.reverse();
        obj.writev(scrambled).unwrap().wait(None).unwrap();
        assert_eq!(obj.size(), expected_size);

        let spans: Vec<IoSpan> =
            iovs.iter().map(|v| IoSpan::new(v.off, v.len())).collect();
        let mut op = obj.readv(&spans).unwrap();
        op.wait(None).unwrap();
        let got = op.take_read_output().unwrap();
        for (read, written) in got.iter().zip(iovs.iter()) {
            assert_eq!(read.off, written.off);
            assert_eq!(read.data, written.data);
        }
        obj.close().unwrap();
    }

    #[test]
    fn test_sync_is_forwarded() {
        let (mio, driver) = test_env();
        let obj = make_obj(&mio, 14);
        driver.take_trace();
        obj.sync().unwrap().wait(None).unwrap();
        assert!(driver
            .take_trace()
            .iter()
            .any(|e| matches!(e, TraceEntry::Sync { .. })));
        obj.close().unwrap();
    }
}
