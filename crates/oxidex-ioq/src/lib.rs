//! Asynchronous queue for offloading directory-related syscalls to a
//! worker thread pool.
//!
//! See [`Ioq`] for the queue itself, and [`ioq`] for the full module
//! documentation on backpressure and cancellation semantics.

pub mod ioq;

pub use ioq::{DirHandle, Ioq, IoqEnt, Op, SubmitError};
