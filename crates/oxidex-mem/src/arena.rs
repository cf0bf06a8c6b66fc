//! Free-list arena allocators for fixed- and flexibly-sized chunks.
//!
//! This module provides the two allocator primitives used by the directory
//! traversal layer to avoid per-entry heap churn:
//!
//! - [`Arena`]: a free-list allocator for chunks of one fixed size, backed by
//!   geometrically growing slabs.
//! - [`VArena`]: a dispatcher that routes variably-sized flex-tail
//!   allocations to a power-of-two size class, each backed by its own
//!   [`Arena`].
//!
//! # Single-threaded
//!
//! Neither [`Arena`] nor [`VArena`] do any internal synchronization. All
//! operations on one arena must be serialized by the caller; different
//! arenas may be driven from different threads concurrently.
//!
//! # Examples
//!
//! ```
//! use oxidex_mem::arena::Arena;
//!
//! let mut arena = Arena::new(8, 16).unwrap();
//! let a = arena.alloc().unwrap();
//! let b = arena.alloc().unwrap();
//! arena.free(a);
//! let c = arena.alloc().unwrap();
//! assert_eq!(a, c); // free-list reuse
//! assert_ne!(b, c);
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};

/// Error returned when an arena or varena allocation cannot be satisfied.
///
/// This is the single failure mode for both allocators: either the
/// underlying system allocator failed, or the requested size/alignment
/// math saturated past what can be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena allocation failed")
    }
}

impl std::error::Error for AllocError {}

/// Rounds `size` down to a multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
#[must_use]
pub const fn align_floor(align: usize, size: usize) -> usize {
    size & !(align - 1)
}

/// Rounds `size` up to a multiple of `align`.
///
/// `align` must be a power of two. Does not guard against overflow; callers
/// needing saturation should go through [`array_size`]/[`flex_size`].
#[inline]
#[must_use]
pub const fn align_ceil(align: usize, size: usize) -> usize {
    align_floor(align, size + align - 1)
}

/// The saturated "infinity" sentinel for a given alignment: the maximum
/// `usize` rounded down to a multiple of `align`.
#[inline]
const fn sentinel(align: usize) -> usize {
    !(align - 1)
}

/// Saturating array size: `size * count`, rounded to the max aligned value
/// of `align` if the product would overflow.
#[must_use]
pub const fn array_size(align: usize, size: usize, count: usize) -> usize {
    match size.checked_mul(count) {
        Some(n) => n,
        None => sentinel(align),
    }
}

/// `array_size`, but reports overflow instead of silently saturating.
const fn array_size_checked(size: usize, count: usize) -> Option<usize> {
    size.checked_mul(count)
}

/// The size of a flexible struct: a fixed-size header of `min` bytes
/// (aligned to `align`) followed by `count` elements of `size` bytes
/// starting at byte `offset`, saturating on overflow.
///
/// Guarantees `flex_size(align, min, offset, size, count) >=
/// align_ceil(align, min)` for every `count`, so a zero-length flex
/// allocation is never smaller than the struct's own footprint.
#[must_use]
pub const fn flex_size(align: usize, min: usize, offset: usize, size: usize, count: usize) -> usize {
    match flex_size_checked(align, min, offset, size, count) {
        Some(n) => n,
        None => sentinel(align),
    }
}

/// `flex_size`, but reports overflow instead of silently saturating.
const fn flex_size_checked(
    align: usize,
    min: usize,
    offset: usize,
    size: usize,
    count: usize,
) -> Option<usize> {
    let tail = match size.checked_mul(count) {
        Some(n) => n,
        None => return None,
    };
    let extra = match offset.checked_add(align - 1) {
        Some(n) => n,
        None => return None,
    };
    let total = match tail.checked_add(extra) {
        Some(n) => n,
        None => return None,
    };
    let mut ret = align_floor(align, total);

    // Make sure flex_size(.., 0) >= min, even if the struct has trailing
    // padding beyond where the flexible array starts.
    if min > align_ceil(align, offset) && ret < min {
        ret = min;
    }

    Some(ret)
}

/// Ceiling base-2 logarithm of a positive integer.
const fn ceil_log2(x: usize) -> u32 {
    debug_assert!(x > 0);
    usize::BITS - (x - 1).leading_zeros()
}

/// One slab of memory owned by an [`Arena`]: a contiguous run of chunks.
struct Slab {
    base: NonNull<u8>,
    layout: Layout,
}

/// A free-list allocator for chunks of one fixed size and alignment.
///
/// `Arena` hands out fixed-size, fixed-alignment chunks from a singly-linked
/// free list. When the free list is empty it grows by allocating a new
/// slab — a contiguous block of chunks — from the system allocator. Slabs
/// double in chunk count each time (the first slab holds one chunk), which
/// amortizes slab bookkeeping to O(1) per allocation and bounds the slab
/// count to roughly log2 of the number of chunks ever live at once.
///
/// Freed chunks are threaded onto the free list using their own first
/// pointer-width bytes as the link, so no auxiliary bookkeeping is needed
/// per chunk. This means chunk size and alignment must be at least that of
/// a pointer; [`Arena::new`] enforces this.
///
/// `Arena` is not thread-safe: all operations on a given arena must be
/// serialized by the caller.
pub struct Arena {
    align: usize,
    size: usize,
    free_list: *mut u8,
    slabs: Vec<Slab>,
}

// SAFETY: `Arena` owns all the memory it hands out (no thread keeps a
// reference into a borrowed arena); moving the whole arena to another
// thread is sound as long as the new owner doesn't alias with the old one,
// which the type system already enforces via ownership.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates an arena for chunks of the given alignment and size.
    ///
    /// `size` is rounded up to at least the size of a pointer (so a freed
    /// chunk can hold the free-list link) and then up to a multiple of
    /// `align`. No memory is allocated yet; the first slab is created on
    /// the first call to [`Arena::alloc`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `align` is not a power of two.
    pub fn new(align: usize, size: usize) -> Result<Self, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError);
        }

        let align = align.max(std::mem::align_of::<*mut u8>());
        let size = size.max(std::mem::size_of::<*mut u8>());
        let size = align_ceil(align, size);

        Ok(Arena {
            align,
            size,
            free_list: ptr::null_mut(),
            slabs: Vec::new(),
        })
    }

    /// Allocates one chunk from the arena.
    ///
    /// Pops the free list if non-empty; otherwise grows the arena by one
    /// slab (doubling the previous slab's chunk count) and retries.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if a new slab is needed and the system
    /// allocator fails, or if slab-size math saturates.
    #[inline(always)]
    pub fn alloc(&mut self) -> Result<NonNull<u8>, AllocError> {
        if self.free_list.is_null() {
            self.grow()?;
        }

        let chunk = self.free_list;
        debug_assert!(!chunk.is_null());

        // SAFETY: `chunk` was threaded onto the free list by `grow` or a
        // prior `free`, and its first pointer-width bytes hold the next
        // link, written with the same representation we read here.
        let next = unsafe { chunk.cast::<*mut u8>().read() };
        self.free_list = next;

        // SAFETY: chunk is non-null (checked above) and was carved out of
        // a live slab with the arena's alignment.
        Ok(unsafe { NonNull::new_unchecked(chunk) })
    }

    /// Returns a chunk to the arena's free list.
    ///
    /// `ptr` must have been returned by a prior call to [`Arena::alloc`] on
    /// this same arena and must not have already been freed. Using `ptr`
    /// after this call, or freeing a pointer this arena never allocated, is
    /// undefined behavior.
    #[inline(always)]
    pub fn free(&mut self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees `ptr` is a live chunk from this arena,
        // which is at least pointer-sized and pointer-aligned.
        unsafe {
            ptr.as_ptr().cast::<*mut u8>().write(self.free_list);
        }
        self.free_list = ptr.as_ptr();
    }

    /// Allocates a new slab, doubling the previous slab's chunk count, and
    /// threads every chunk in it onto the free list.
    ///
    /// Leaves the arena unchanged if allocation fails: either the slab is
    /// fully installed (pushed to `slabs`, all its chunks on the free
    /// list) or nothing happens at all.
    fn grow(&mut self) -> Result<(), AllocError> {
        let nslabs = self.slabs.len();
        let count = 1usize.checked_shl(nslabs as u32).ok_or(AllocError)?;
        let slab_size = array_size_checked(self.size, count).ok_or(AllocError)?;
        let layout = Layout::from_size_align(slab_size, self.align).map_err(|_| AllocError)?;

        // SAFETY: layout has non-zero size (size >= pointer size > 0).
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(AllocError)?;

        // Thread every chunk in the new slab onto the existing free list.
        let mut head = self.free_list;
        for i in (0..count).rev() {
            // SAFETY: i < count, each chunk lies within the freshly
            // allocated slab.
            let chunk = unsafe { base.as_ptr().add(i * self.size) };
            // SAFETY: chunk is within the slab and at least pointer-sized
            // and pointer-aligned.
            unsafe {
                chunk.cast::<*mut u8>().write(head);
            }
            head = chunk;
        }
        self.free_list = head;

        oxidex_log::debug!(
            "arena grew to {} slabs ({} chunks in the new slab)",
            self.slabs.len() + 1,
            count
        );
        self.slabs.push(Slab { base, layout });
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for slab in self.slabs.drain(..) {
            // SAFETY: slab.base/slab.layout were produced together by a
            // matching `alloc::alloc` call in `grow`, and are only freed
            // once (slabs is drained).
            unsafe {
                alloc::dealloc(slab.base.as_ptr(), slab.layout);
            }
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("align", &self.align)
            .field("size", &self.size)
            .field("nslabs", &self.slabs.len())
            .finish()
    }
}

/// Dispatches variable-length "flex-tail" allocations to a power-of-two
/// size class, each backed by its own [`Arena`].
///
/// A flex-tail struct is a fixed-size header followed by a trailing array
/// of `count` elements. `VArena` computes the struct's total size for a
/// given `count`, rounds it up to the next power of two, and delegates to
/// the [`Arena`] for that size class (creating it lazily on first use).
/// Because the class is a pure function of `count`, no per-chunk header is
/// needed — callers must remember the `count` they allocated with and pass
/// it back to [`VArena::free`] / [`VArena::realloc`].
///
/// `VArena` is not thread-safe, for the same reasons as [`Arena`].
pub struct VArena {
    align: usize,
    min: usize,
    offset: usize,
    elem_size: usize,
    /// log2 of the smallest flex allocation (class 0).
    shift: u32,
    arenas: Vec<Option<Arena>>,
}

// SAFETY: see Arena's Send impl; the same reasoning applies transitively.
unsafe impl Send for VArena {}

impl VArena {
    /// Creates a varena for a struct with the given layout.
    ///
    /// - `align`: alignment of the struct.
    /// - `min`: minimum (fixed-header) size of the struct.
    /// - `offset`: byte offset of the flexible tail array.
    /// - `elem_size`: size of one tail element.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `align` is not a power of two.
    pub fn new(align: usize, min: usize, offset: usize, elem_size: usize) -> Result<Self, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError);
        }

        let smallest = flex_size(align, min, offset, elem_size, 0).max(1);
        let smallest = smallest.next_power_of_two();
        let shift = smallest.trailing_zeros();

        Ok(VArena {
            align,
            min,
            offset,
            elem_size,
            shift,
            arenas: Vec::new(),
        })
    }

    /// Maps a computed flex size to its size class.
    fn class_of(&self, size: usize) -> usize {
        let size = size.max(1usize << self.shift);
        let log = ceil_log2(size);
        log.saturating_sub(self.shift) as usize
    }

    /// Ensures the sub-arena for `class` exists, creating it lazily.
    fn ensure_arena(&mut self, class: usize) -> Result<(), AllocError> {
        if class >= self.arenas.len() {
            self.arenas.resize_with(class + 1, || None);
        }
        if self.arenas[class].is_none() {
            let shift = (class as u32).checked_add(self.shift).ok_or(AllocError)?;
            let chunk_size = 1usize.checked_shl(shift).ok_or(AllocError)?;
            self.arenas[class] = Some(Arena::new(self.align, chunk_size)?);
        }
        Ok(())
    }

    /// Allocates a flex-tail struct with room for `count` tail elements.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the size computation saturates or the
    /// backing arena fails to allocate.
    pub fn alloc(&mut self, count: usize) -> Result<NonNull<u8>, AllocError> {
        let size = flex_size_checked(self.align, self.min, self.offset, self.elem_size, count)
            .ok_or(AllocError)?;
        let class = self.class_of(size);
        self.ensure_arena(class)?;
        self.arenas[class].as_mut().unwrap().alloc()
    }

    /// Resizes a flex-tail allocation from `old_count` to `new_count` tail
    /// elements.
    ///
    /// If the size class doesn't change, returns `ptr` unchanged. Otherwise
    /// allocates in the new class, copies the overlapping prefix, and frees
    /// the old chunk. If the new allocation fails, `ptr` remains valid and
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] under the same conditions as [`VArena::alloc`].
    pub fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        old_count: usize,
        new_count: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let old_size = flex_size_checked(self.align, self.min, self.offset, self.elem_size, old_count)
            .ok_or(AllocError)?;
        let new_size = flex_size_checked(self.align, self.min, self.offset, self.elem_size, new_count)
            .ok_or(AllocError)?;

        let old_class = self.class_of(old_size);
        let new_class = self.class_of(new_size);
        if old_class == new_class {
            return Ok(ptr);
        }

        self.ensure_arena(new_class)?;
        let new_ptr = self.arenas[new_class].as_mut().unwrap().alloc()?;

        let copy_len = old_size.min(new_size);
        // SAFETY: `ptr` is valid for `old_size` bytes (it was allocated at
        // the old class), `new_ptr` is valid for `new_size` bytes (just
        // allocated), and the two chunks come from distinct arenas so they
        // cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }

        self.arenas[old_class].as_mut().unwrap().free(ptr);
        Ok(new_ptr)
    }

    /// Frees a flex-tail allocation that was allocated with `count` tail
    /// elements.
    ///
    /// `count` must match the value passed to the [`VArena::alloc`] (or the
    /// most recent [`VArena::realloc`]) call that produced `ptr`.
    pub fn free(&mut self, ptr: NonNull<u8>, count: usize) {
        let size = flex_size(self.align, self.min, self.offset, self.elem_size, count);
        let class = self.class_of(size);
        if let Some(arena) = self.arenas.get_mut(class).and_then(Option::as_mut) {
            arena.free(ptr);
        }
    }
}

impl fmt::Debug for VArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VArena")
            .field("align", &self.align)
            .field("shift", &self.shift)
            .field("nclasses", &self.arenas.len())
            .finish()
    }
}
