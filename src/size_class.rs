//! Size classes for objects below [`LARGE_OBJECT_THRESHOLD`](crate::LARGE_OBJECT_THRESHOLD).
//!
//! A request is binned by 64-byte cache line (`BASE`) and refined inside the
//! bin (`FACTOR`); `REVERSE` maps the class back to its object size. Classes
//! are 4 bytes apart up to 64 bytes, 8 bytes apart up to 128, then coarsen to
//! 256-byte steps.

use crate::{
  CACHE_LINE_SIZE, LARGE_OBJECT_THRESHOLD, MAX_PAGE_BLOCK_SIZE, MIN_PAGE_BLOCK_SIZE,
  OBJECTS_PER_PAGE_BLOCK, PAGE_SIZE, align_up, log2, page_block::PAGE_BLOCK_HEADER_SIZE,
};

/// First class of each 64-byte bin.
const BASE: [u8; 32] = [
  0, 16, 24, 28, 30, 31, 31, 32, 32, 32, //
  32, 33, 33, 33, 33, 34, 34, 34, 34, 35, //
  35, 35, 35, 36, 36, 36, 36, 37, 37, 37, //
  37, 38,
];

/// Bytes covered by one class inside each bin.
const FACTOR: [u16; 32] = [
  4, 8, 16, 32, 64, 128, 256, 256, 256, 256, //
  256, 256, 256, 256, 256, 256, 256, 256, 256, 256, //
  256, 256, 256, 256, 256, 256, 256, 256, 256, 256, //
  256, 256,
];

/// Object size of each class.
const REVERSE: [u16; SIZE_CLASSES] = [
  4, 8, 12, 16, 20, 24, 28, 32, 36, 40, //
  44, 48, 52, 56, 60, 64, 72, 80, 88, 96, //
  104, 112, 120, 128, 144, 160, 176, 192, 224, 256, //
  320, 448, 704, 960, 1216, 1472, 1728, 1984, 2240,
];

/// Number of size classes reachable below the large-object threshold.
pub const SIZE_CLASSES: usize = 39;

/// Smallest object handed out. A freed object stores a free-chain link in its first bytes.
const OBJECT_GRANULARITY: usize = size_of::<usize>();

/// Maps a request size to its size class.
///
/// `size` must be below [`LARGE_OBJECT_THRESHOLD`]; larger requests take the large-object path.
#[inline]
pub const fn compute_size_class(size: usize) -> usize {
  debug_assert!(size < LARGE_OBJECT_THRESHOLD);

  let size = if size < OBJECT_GRANULARITY {
    OBJECT_GRANULARITY
  } else {
    size
  };

  let (bin, position) = if size % CACHE_LINE_SIZE == 0 {
    ((size - 1) / CACHE_LINE_SIZE, (size - 2) % CACHE_LINE_SIZE)
  } else {
    (size / CACHE_LINE_SIZE, (size - 1) % CACHE_LINE_SIZE)
  };

  BASE[bin] as usize + position / FACTOR[bin] as usize
}

/// Object size of a size class (inverse of [`compute_size_class`]).
#[inline]
pub const fn compute_size(class: usize) -> usize {
  REVERSE[class] as usize
}

/// Bytes of the page blocks that serve `class`, header included.
///
/// Sized for roughly [`OBJECTS_PER_PAGE_BLOCK`] objects, rounded up to the next
/// power of two and clamped to 16KB..=256KB.
pub const fn compute_page_block_size(class: usize) -> usize {
  let bytes = align_up(compute_size(class) * OBJECTS_PER_PAGE_BLOCK, PAGE_SIZE);
  let size = 1 << (log2(bytes) + 1);

  if size > MAX_PAGE_BLOCK_SIZE {
    MAX_PAGE_BLOCK_SIZE
  } else if size < MIN_PAGE_BLOCK_SIZE {
    MIN_PAGE_BLOCK_SIZE
  } else {
    size
  }
}

/// Index of a page-block size: 16KB -> 0, 32KB -> 1, ... 256KB -> 4.
#[inline]
pub const fn compute_page_block_size_class(page_block_size: usize) -> usize {
  log2(page_block_size / MIN_PAGE_BLOCK_SIZE)
}

/// Objects that fit in one page block of `class`.
pub const fn page_block_capacity(class: usize) -> usize {
  (compute_page_block_size(class) - PAGE_BLOCK_HEADER_SIZE) / compute_size(class)
}

/// Every object index, biased by one, must fit the 16-bit free-chain links and remote counts.
const fn capacities_fit_u16() -> bool {
  let mut class = 0;
  while class < SIZE_CLASSES {
    if page_block_capacity(class) >= u16::MAX as usize {
      return false;
    }
    class += 1;
  }
  true
}

const _: () = assert!(capacities_fit_u16());
const _: () = assert!(compute_size(SIZE_CLASSES - 1) >= LARGE_OBJECT_THRESHOLD);
const _: () = assert!(compute_size_class(LARGE_OBJECT_THRESHOLD - 1) == SIZE_CLASSES - 1);
