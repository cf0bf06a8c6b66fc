//! Arena allocation substrate for the directory traversal engine.
//!
//! This crate provides the two pooled-allocation primitives the traversal
//! layer builds on:
//!
//! - [`arena::Arena`]: a free-list allocator for chunks of one fixed size,
//!   backed by geometrically growing slabs.
//! - [`arena::VArena`]: a dispatcher that routes variable-length flex-tail
//!   allocations to a power-of-two size class, each backed by its own
//!   `Arena`.
//!
//! # Design Goals
//!
//! 1. **Low churn**: amortize slab bookkeeping to O(1) per allocation.
//! 2. **No headers**: free-list links live inside dormant chunks; flex-tail
//!    size classes are a pure function of the caller-supplied count.
//! 3. **Single-threaded**: neither allocator does internal synchronization;
//!    callers serialize access to a given arena themselves.

pub mod arena;

pub use arena::{AllocError, Arena, VArena};
