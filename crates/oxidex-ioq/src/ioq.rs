//! Bounded asynchronous queue for directory-related syscalls.
//!
//! [`Ioq`] offloads `close`, `opendir`, and `closedir` syscalls to a fixed
//! pool of worker threads so a single-threaded traversal loop can overlap
//! directory bookkeeping with I/O latency. Producers [`Ioq::close`] /
//! [`Ioq::opendir`] / [`Ioq::closedir`] requests; a single consumer reaps
//! completions with [`Ioq::pop`] / [`Ioq::trypop`].
//!
//! # Backpressure
//!
//! Every in-flight request is backed by one of exactly `depth`
//! preallocated [`IoqEnt`] records. There is no separate bound on the
//! pending or ready queues — the free pool itself is the only capacity
//! limit, so submission fails fast with [`SubmitError::QueueFull`] instead
//! of growing unboundedly.
//!
//! # Cancellation
//!
//! [`Ioq::cancel`] tells workers to stop executing queued requests; every
//! request still in the pending queue at that point completes with
//! [`libc::ECANCELED`] instead of running. Requests already being executed
//! by a worker run to completion. Once cancellation has been signalled,
//! further submissions are rejected outright with
//! [`SubmitError::Cancelled`] instead of being accepted and then marked
//! cancelled. Dropping an `Ioq` implies `cancel`, joins every worker
//! thread, and silently drops any unreaped completions.

use std::collections::VecDeque;
use std::ffi::{CString, c_void};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// The asynchronous operation an [`IoqEnt`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `close(fd)`.
    Close,
    /// Open a directory relative to a base descriptor.
    OpenDir,
    /// Close a previously opened directory.
    CloseDir,
}

/// A single pointer-sized slot a caller allocates to receive the real
/// platform directory handle produced by [`Ioq::opendir`], and later hands
/// back to [`Ioq::closedir`].
///
/// The queue does not interpret anything about the caller's surrounding
/// data structure — it only reads and writes this one slot. The type and
/// meaning of whatever the caller wraps this slot in is entirely up to the
/// external filesystem layer that consumes this crate.
pub type DirHandle = *mut *mut libc::DIR;

/// Operation-specific arguments, private to the queue: callers never see
/// or construct a [`Payload`] directly, they only read `op`/`ret`/`error`/
/// `ptr` off the completed [`IoqEnt`].
enum Payload {
    Close { fd: libc::c_int },
    OpenDir {
        dir: DirHandle,
        dfd: libc::c_int,
        path: CString,
    },
    CloseDir { dir: DirHandle },
}

impl Payload {
    fn empty() -> Self {
        Payload::Close { fd: -1 }
    }
}

/// One I/O queue entry: a request on the way in, a completion on the way
/// out.
///
/// Ownership flows producer → queue → worker → queue → consumer → free.
/// Between [`Ioq::close`]/[`Ioq::opendir`]/[`Ioq::closedir`] and the
/// matching [`Ioq::pop`]/[`Ioq::trypop`], the entry belongs to the queue;
/// the caller must not inspect it.
pub struct IoqEnt {
    /// The operation this entry describes.
    pub op: Op,
    /// The syscall's return value, valid once the entry is popped.
    pub ret: i32,
    /// The errno on failure, 0 on success, valid once the entry is popped.
    pub error: i32,
    /// Arbitrary caller-supplied correlation token, returned unchanged.
    pub ptr: *mut c_void,
    payload: Payload,
}

// SAFETY: an `IoqEnt` is never aliased: at any point in its FREE -> PENDING
// -> IN_FLIGHT -> READY -> FREE lifecycle exactly one owner (the free
// pool, a producer, a worker, or the consumer) holds the `Box`. Moving
// that exclusive ownership across threads is sound even though the
// payload contains raw pointers.
unsafe impl Send for IoqEnt {}

impl IoqEnt {
    fn empty() -> Box<Self> {
        Box::new(IoqEnt {
            op: Op::Close,
            ret: 0,
            error: 0,
            ptr: ptr::null_mut(),
            payload: Payload::empty(),
        })
    }
}

impl fmt::Debug for IoqEnt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoqEnt")
            .field("op", &self.op)
            .field("ret", &self.ret)
            .field("error", &self.error)
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Error returned by a submission (`close`/`opendir`/`closedir`) that
/// could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The free pool is exhausted; retry after reaping completions.
    QueueFull,
    /// The queue has been cancelled and no longer accepts submissions.
    Cancelled,
    /// The supplied path contains an interior NUL byte.
    InvalidPath,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::QueueFull => write!(f, "I/O queue is full"),
            SubmitError::Cancelled => write!(f, "I/O queue has been cancelled"),
            SubmitError::InvalidPath => write!(f, "path contains an interior NUL byte"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// State shared between the `Ioq` handle and its worker threads.
struct Shared {
    pending: Mutex<VecDeque<Box<IoqEnt>>>,
    pending_cv: Condvar,
    ready: Mutex<VecDeque<Box<IoqEnt>>>,
    ready_cv: Condvar,
    free: Mutex<Vec<Box<IoqEnt>>>,
    /// Number of entries currently in pending, in flight, or ready
    /// (i.e. not yet popped by the consumer). Used so `pop` can tell
    /// "nothing left to reap" apart from "nothing ready yet".
    queued: AtomicUsize,
    /// Set by `cancel`: workers convert pending pops into cancelled
    /// completions instead of executing them.
    cancelled: AtomicBool,
    /// Set by `Drop`: workers exit their loop once pending is empty.
    closed: AtomicBool,
}

/// An asynchronous queue of directory-related I/O operations.
///
/// Create with [`Ioq::create`], submit with [`Ioq::close`] /
/// [`Ioq::opendir`] / [`Ioq::closedir`], reap with [`Ioq::pop`] /
/// [`Ioq::trypop`]. Dropping the queue cancels outstanding work, joins
/// every worker thread, and releases all internal storage.
pub struct Ioq {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

// SAFETY: every field is behind `Arc`/`Mutex`/atomics; `Ioq` has no
// interior state reachable without going through them.
unsafe impl Send for Ioq {}
unsafe impl Sync for Ioq {}

impl Ioq {
    /// Creates a queue with a free pool of `depth` entries and up to
    /// `nthreads` worker threads.
    ///
    /// Both parameters are raised to at least 1.
    #[must_use]
    pub fn create(depth: usize, nthreads: usize) -> Self {
        let depth = depth.max(1);
        let nthreads = nthreads.max(1);

        let free = (0..depth).map(|_| IoqEnt::empty()).collect();
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::with_capacity(depth)),
            pending_cv: Condvar::new(),
            ready: Mutex::new(VecDeque::with_capacity(depth)),
            ready_cv: Condvar::new(),
            free: Mutex::new(free),
            queued: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let workers = (0..nthreads)
            .map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("ioq-worker-{id}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn ioq worker thread")
            })
            .collect();

        oxidex_log::info!("ioq created: depth={depth}, nthreads={nthreads}");
        Ioq { shared, workers }
    }

    /// Returns the free pool's current fill level.
    ///
    /// Advisory only: another producer can claim a slot between this call
    /// returning and a subsequent submission.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }

    /// Submits an asynchronous `close(fd)`.
    ///
    /// # Errors
    ///
    /// [`SubmitError::QueueFull`] if the free pool is exhausted,
    /// [`SubmitError::Cancelled`] if the queue has been cancelled.
    pub fn close(&self, fd: libc::c_int, ptr: *mut c_void) -> Result<(), SubmitError> {
        self.submit(Op::Close, Payload::Close { fd }, ptr)
    }

    /// Submits an asynchronous directory open, relative to `dfd`.
    ///
    /// On success, the worker writes the opened platform directory handle
    /// into `*dir`. `dir` must point to valid, writable storage for the
    /// lifetime of the request.
    ///
    /// # Errors
    ///
    /// As [`Ioq::close`], plus [`SubmitError::InvalidPath`] if `path`
    /// contains an interior NUL byte.
    pub fn opendir(
        &self,
        dir: DirHandle,
        dfd: libc::c_int,
        path: impl AsRef<Path>,
        ptr: *mut c_void,
    ) -> Result<(), SubmitError> {
        let path =
            CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| SubmitError::InvalidPath)?;
        self.submit(Op::OpenDir, Payload::OpenDir { dir, dfd, path }, ptr)
    }

    /// Submits an asynchronous directory close.
    ///
    /// `dir` must point to a slot previously populated by a completed
    /// [`Ioq::opendir`] request.
    ///
    /// # Errors
    ///
    /// As [`Ioq::close`].
    pub fn closedir(&self, dir: DirHandle, ptr: *mut c_void) -> Result<(), SubmitError> {
        self.submit(Op::CloseDir, Payload::CloseDir { dir }, ptr)
    }

    fn submit(&self, op: Op, payload: Payload, ptr: *mut c_void) -> Result<(), SubmitError> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return Err(SubmitError::Cancelled);
        }

        let mut ent = {
            let mut free = self.shared.free.lock().unwrap();
            free.pop().ok_or(SubmitError::QueueFull)?
        };

        ent.op = op;
        ent.payload = payload;
        ent.ptr = ptr;
        ent.ret = 0;
        ent.error = 0;

        self.shared.pending.lock().unwrap().push_back(ent);
        self.shared.queued.fetch_add(1, Ordering::Release);
        self.shared.pending_cv.notify_one();
        Ok(())
    }

    /// Blocks until a completion is available and returns it, or returns
    /// `None` once the queue has been cancelled and every in-flight entry
    /// has drained (no more completions will ever arrive).
    pub fn pop(&self) -> Option<Box<IoqEnt>> {
        let mut ready = self.shared.ready.lock().unwrap();
        loop {
            if let Some(ent) = ready.pop_front() {
                self.shared.queued.fetch_sub(1, Ordering::Release);
                return Some(ent);
            }
            if self.shared.cancelled.load(Ordering::Acquire) && self.shared.queued.load(Ordering::Acquire) == 0
            {
                return None;
            }
            ready = self.shared.ready_cv.wait(ready).unwrap();
        }
    }

    /// Returns the head of the ready queue without blocking, or `None` if
    /// it is currently empty.
    pub fn trypop(&self) -> Option<Box<IoqEnt>> {
        let mut ready = self.shared.ready.lock().unwrap();
        let ent = ready.pop_front();
        if ent.is_some() {
            self.shared.queued.fetch_sub(1, Ordering::Release);
        }
        ent
    }

    /// Returns a reaped entry to the free pool, making that slot available
    /// for a future submission.
    pub fn free(&self, ent: Box<IoqEnt>) {
        self.shared.free.lock().unwrap().push(ent);
    }

    /// Signals every worker to stop executing queued operations. Requests
    /// still pending (or submitted in the same instant) complete with
    /// [`libc::ECANCELED`] instead of running; requests already executing
    /// run to completion. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        oxidex_log::info!("ioq cancelled");
        // Wake any `pop` blocked on an empty ready queue so it can
        // re-check the cancelled+drained condition.
        self.shared.ready_cv.notify_all();
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        self.cancel();
        self.shared.closed.store(true, Ordering::Release);
        self.shared.pending_cv.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        // Any completions the consumer never reaped are silently released.
        self.shared.ready.lock().unwrap().clear();
        oxidex_log::info!("ioq destroyed");
    }
}

/// Executes one request's syscall and fills in `ret`/`error`.
fn execute(ent: &mut IoqEnt) {
    match &ent.payload {
        Payload::Close { fd } => {
            let ret = unsafe { libc::close(*fd) };
            ent.ret = ret;
            ent.error = if ret < 0 { last_errno() } else { 0 };
        }
        Payload::OpenDir { dir, dfd, path } => {
            // SAFETY: `path` is a valid NUL-terminated C string owned by
            // this entry; `dfd` is the caller-supplied base descriptor.
            let fd = unsafe {
                libc::openat(
                    *dfd,
                    path.as_ptr(),
                    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                )
            };
            if fd < 0 {
                ent.ret = -1;
                ent.error = last_errno();
                return;
            }

            // SAFETY: fd is a freshly opened, valid directory descriptor;
            // fdopendir takes ownership of it on success.
            let dirp = unsafe { libc::fdopendir(fd) };
            if dirp.is_null() {
                ent.error = last_errno();
                ent.ret = -1;
                // SAFETY: fdopendir failed without taking ownership of fd.
                unsafe {
                    libc::close(fd);
                }
                return;
            }

            // SAFETY: caller guarantees `dir` points to valid, writable,
            // properly aligned storage for the duration of the request.
            unsafe {
                dir.write(dirp);
            }
            ent.ret = 0;
            ent.error = 0;
        }
        Payload::CloseDir { dir } => {
            // SAFETY: caller guarantees `dir` points at a slot populated
            // by a completed `opendir` on this same handle.
            let dirp = unsafe { dir.read() };
            let ret = unsafe { libc::closedir(dirp) };
            ent.ret = ret;
            ent.error = if ret < 0 { last_errno() } else { 0 };
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Body of every worker thread: pop a pending request, execute or
/// cancel it, push the completion, repeat until told to close.
fn worker_loop(shared: &Arc<Shared>) {
    loop {
        let next = {
            let mut pending = shared.pending.lock().unwrap();
            loop {
                if let Some(ent) = pending.pop_front() {
                    break Some(ent);
                }
                if shared.closed.load(Ordering::Acquire) {
                    break None;
                }
                pending = shared.pending_cv.wait(pending).unwrap();
            }
        };

        let Some(mut ent) = next else {
            return;
        };

        if shared.cancelled.load(Ordering::Acquire) {
            ent.ret = -1;
            ent.error = libc::ECANCELED;
        } else {
            execute(&mut ent);
        }

        shared.ready.lock().unwrap().push_back(ent);
        shared.ready_cv.notify_one();
    }
}
