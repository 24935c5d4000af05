//! Scalable, locality-conscious multithreaded memory allocation.
//!
//! Every thread allocates small objects from its own *page blocks*: slabs of
//! equal-size objects carved out of 4 MiB *super pages* by a buddy allocator.
//! A thread never locks to allocate or to free into a block it owns. Frees of
//! objects owned by another thread are queued on the block through a single
//! 64-bit atomic word and picked up by the owner when it runs out of space.
//! Blocks left behind by exiting threads become orphans and are adopted by the
//! next thread that allocates from the orphan pool or frees into them.
//!
//! ```no_run
//! use streamflow::{OsPages, Streamflow};
//!
//! let allocator = Streamflow::initialize(OsPages).expect("no memory");
//! let thread = allocator.thread_initialize().expect("no memory");
//! let heap = thread.default_heap();
//!
//! let ptr = heap.allocate(100).expect("out of memory");
//! unsafe { heap.free(ptr) };
//! ```

#![allow(clippy::missing_safety_doc)]

mod chunk;
mod context;
mod global;
mod heap;
mod list;
mod manager;
mod os;
mod page_block;
mod page_map;
pub mod size_class;
mod stack;
mod super_page;

pub use context::{Heap, InitError, Streamflow, ThreadContext};
pub use global::Allocator;
pub use os::{OsPages, PageSource, SpinLock, SpinLockGuard, TrackedPages};
pub use stack::{ConcurrentStack, Stack, StackLink};

// =============================================================================
// Constants
// =============================================================================

const PAGE_SHIFT: usize = 12;
/// OS page granularity used for large objects and address-map entries.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 4KB

const CACHE_LINE_SIZE: usize = 64;

/// Size of one OS-backed super page.
const SUPER_PAGE_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// Smallest page block, and the unit of the buddy system inside a super page.
const BUDDY_UNIT_SHIFT: usize = 14;
const MIN_PAGE_BLOCK_SIZE: usize = 1 << BUDDY_UNIT_SHIFT; // 16KB
const MAX_PAGE_BLOCK_SIZE: usize = 256 * 1024; // 256KB

/// Order of a block spanning the whole super page.
const BUDDY_MAX_ORDER: usize = (SUPER_PAGE_SIZE / MIN_PAGE_BLOCK_SIZE).trailing_zeros() as usize;

/// 16KB, 32KB, 64KB, 128KB, 256KB.
const PAGE_BLOCK_SIZE_CLASSES: usize =
  (MAX_PAGE_BLOCK_SIZE / MIN_PAGE_BLOCK_SIZE).trailing_zeros() as usize + 1;

/// Objects a page block is sized for before rounding to a power of two.
const OBJECTS_PER_PAGE_BLOCK: usize = 1024;

/// Requests of this size and above bypass size classes and map OS pages directly.
pub const LARGE_OBJECT_THRESHOLD: usize = 2048;

/// Independent internal heaps per context. Heap 0 is the default heap.
pub const HEAP_COUNT: usize = 8;

/// Empty page blocks a thread keeps per page-block size class.
const LOCAL_INACTIVE_BLOCKS: usize = 4;

/// Empty page blocks an internal heap keeps per page-block size class.
const GLOBAL_INACTIVE_BLOCKS: usize = 4;

/// Owner id of a page block whose thread has gone away.
const THREAD_ID_ORPHAN: u32 = u32::MAX;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SUPER_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_BLOCK_SIZE < SUPER_PAGE_SIZE);
const _: () = assert!(BUDDY_MAX_ORDER == 8);
const _: () = assert!(PAGE_BLOCK_SIZE_CLASSES == 5);
const _: () = assert!(LARGE_OBJECT_THRESHOLD % CACHE_LINE_SIZE == 0);
const _: () = assert!(PAGE_SIZE <= MIN_PAGE_BLOCK_SIZE);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Floor of the base-2 logarithm. `x` must be non-zero.
#[inline(always)]
const fn log2(x: usize) -> usize {
  (usize::BITS - 1 - x.leading_zeros()) as usize
}
