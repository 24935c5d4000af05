//! Page blocks: slabs of equal-size objects carved from a super page.
//!
//! The owner thread allocates and frees through plain `Cell` fields. Every
//! other thread talks to the block through the 64-bit block-info word, which
//! holds the owner id and a remote-free queue threaded through the freed
//! objects themselves. Object links are 16-bit indices biased by one, so 0
//! terminates a chain.

use core::{
  cell::Cell,
  mem::offset_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use crate::{
  CACHE_LINE_SIZE, MIN_PAGE_BLOCK_SIZE,
  list::{Link, Linked},
  size_class::{compute_page_block_size, compute_size},
  stack::{NODE_ALIGN, StackLink},
  super_page::{BuddyHeader, SuperPage},
};

/// Bytes in front of the payload of every page block.
pub(crate) const PAGE_BLOCK_HEADER_SIZE: usize = size_of::<PageBlock>();

const NO_SIZE_CLASS: u8 = u8::MAX;

// =============================================================================
// Block Info
// =============================================================================

/// `owner << 32 | remote next << 16 | remote count`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockInfo(u64);

impl BlockInfo {
  #[inline]
  pub(crate) const fn new(owner: u32, next: u16, count: u16) -> Self {
    Self(((owner as u64) << 32) | ((next as u64) << 16) | count as u64)
  }

  #[inline]
  pub(crate) const fn owner(self) -> u32 {
    (self.0 >> 32) as u32
  }

  #[inline]
  pub(crate) const fn next(self) -> u16 {
    (self.0 >> 16) as u16
  }

  #[inline]
  pub(crate) const fn count(self) -> u16 {
    self.0 as u16
  }

  #[inline]
  const fn with_owner(self, owner: u32) -> Self {
    Self::new(owner, self.next(), self.count())
  }

  /// Queues object `link` (biased) in front of the current remote chain.
  #[inline]
  const fn push(self, link: u16) -> Self {
    Self::new(self.owner(), link, self.count() + 1)
  }
}

// =============================================================================
// Page Block
// =============================================================================

/// State other threads touch, kept off the owner's cache line.
#[repr(C, align(64))]
struct Shared {
  block_info: AtomicU64,
  stack_next: AtomicPtr<PageBlock>,
}

#[repr(C, align(128))]
pub(crate) struct PageBlock {
  link: Link<PageBlock>,
  /// Buddy order. Same offset as [`BuddyHeader`]'s order word, never tagged free.
  buddy_order: u32,
  object_size: Cell<u32>,
  capacity: Cell<u16>,
  /// Next never-used object index.
  bump: Cell<u16>,
  free_offset: Cell<u16>,
  free_objects: Cell<u16>,
  size_class: Cell<u8>,
  memory: *mut u8,
  block_size: usize,
  super_page: NonNull<SuperPage>,
  shared: Shared,
}

const _: () = assert!(PAGE_BLOCK_HEADER_SIZE == 128);
const _: () = assert!(align_of::<PageBlock>() >= NODE_ALIGN);
const _: () = assert!(offset_of!(PageBlock, shared) >= CACHE_LINE_SIZE);
const _: () = assert!(offset_of!(PageBlock, buddy_order) == BuddyHeader::ORDER_OFFSET);

unsafe impl Sync for PageBlock {}
unsafe impl Send for PageBlock {}

unsafe impl Linked for PageBlock {
  fn link(&self) -> &Link<Self> {
    &self.link
  }
}

unsafe impl StackLink for PageBlock {
  fn stack_link(&self) -> &AtomicPtr<Self> {
    &self.shared.stack_next
  }
}

impl PageBlock {
  /// Builds an unassigned block header at the start of a buddy region of `order`.
  ///
  /// # Safety
  /// `at` must point to `MIN_PAGE_BLOCK_SIZE << order` writable bytes aligned to
  /// [`NODE_ALIGN`], exclusively owned by the caller.
  pub(crate) unsafe fn construct(
    at: NonNull<u8>,
    order: usize,
    super_page: NonNull<SuperPage>,
  ) -> NonNull<PageBlock> {
    debug_assert!(at.as_ptr() as usize % NODE_ALIGN == 0);
    let block = at.cast::<PageBlock>();
    unsafe {
      block.write(PageBlock {
        link: Link::new(),
        buddy_order: order as u32,
        object_size: Cell::new(0),
        capacity: Cell::new(0),
        bump: Cell::new(0),
        free_offset: Cell::new(0),
        free_objects: Cell::new(0),
        size_class: Cell::new(NO_SIZE_CLASS),
        memory: at.as_ptr().add(PAGE_BLOCK_HEADER_SIZE),
        block_size: MIN_PAGE_BLOCK_SIZE << order,
        super_page,
        shared: Shared {
          block_info: AtomicU64::new(0),
          stack_next: AtomicPtr::new(null_mut()),
        },
      })
    };
    block
  }

  /// Re-stamps the block for `class`, owned by `owner`, with every object free.
  ///
  /// The block must hold no live objects and no queued remote frees.
  pub(crate) fn reset(&self, class: usize, owner: u32) {
    debug_assert_eq!(compute_page_block_size(class), self.block_size);

    let object_size = compute_size(class);
    let capacity = (self.block_size - PAGE_BLOCK_HEADER_SIZE) / object_size;

    self.size_class.set(class as u8);
    self.object_size.set(object_size as u32);
    self.capacity.set(capacity as u16);
    self.bump.set(0);
    self.free_offset.set(0);
    self.free_objects.set(capacity as u16);
    self
      .shared
      .block_info
      .store(BlockInfo::new(owner, 0, 0).0, Ordering::Release);
  }

  #[inline]
  pub(crate) fn size_class(&self) -> usize {
    self.size_class.get() as usize
  }

  #[inline]
  pub(crate) fn object_size(&self) -> usize {
    self.object_size.get() as usize
  }

  #[inline]
  pub(crate) fn capacity(&self) -> usize {
    self.capacity.get() as usize
  }

  #[inline]
  pub(crate) fn order(&self) -> usize {
    self.buddy_order as usize
  }

  #[cfg(test)]
  pub(crate) fn block_size(&self) -> usize {
    self.block_size
  }

  /// Objects the owner can hand out without collecting remote frees.
  #[cfg(test)]
  pub(crate) fn free_objects(&self) -> usize {
    self.free_objects.get() as usize
  }

  #[inline]
  pub(crate) fn super_page(&self) -> NonNull<SuperPage> {
    self.super_page
  }

  /// No object left to hand out without collecting remote frees.
  #[inline]
  pub(crate) fn full(&self) -> bool {
    self.free_objects.get() == 0
  }

  /// Every object is locally free.
  #[inline]
  pub(crate) fn empty(&self) -> bool {
    self.free_objects.get() == self.capacity.get()
  }

  #[inline]
  fn object(&self, index: usize) -> *mut u8 {
    unsafe { self.memory.add(index * self.object_size()) }
  }

  #[inline]
  fn object_index(&self, ptr: NonNull<u8>) -> usize {
    let offset = ptr.as_ptr() as usize - self.memory as usize;
    debug_assert!(offset % self.object_size() == 0, "{ptr:p} is not an object start");
    let index = offset / self.object_size();
    debug_assert!(index < self.capacity());
    index
  }

  /// Owner-only. Hands out the most recently freed object, else the next unused one.
  pub(crate) unsafe fn allocate(&self) -> NonNull<u8> {
    debug_assert!(!self.full());

    let head = self.free_offset.get();
    let index = if head != 0 {
      let index = (head - 1) as usize;
      self
        .free_offset
        .set(unsafe { self.object(index).cast::<u16>().read() });
      index
    } else {
      let index = self.bump.get();
      debug_assert!((index as usize) < self.capacity());
      self.bump.set(index + 1);
      index as usize
    };

    self.free_objects.set(self.free_objects.get() - 1);
    unsafe { NonNull::new_unchecked(self.object(index)) }
  }

  /// Owner-only. `ptr` must be a live object of this block.
  pub(crate) unsafe fn free(&self, ptr: NonNull<u8>) {
    let index = self.object_index(ptr);
    unsafe { ptr.cast::<u16>().write(self.free_offset.get()) };
    self.free_offset.set(index as u16 + 1);
    self.free_objects.set(self.free_objects.get() + 1);
    debug_assert!(self.free_objects.get() <= self.capacity.get());
  }

  #[inline]
  pub(crate) fn block_info(&self) -> BlockInfo {
    BlockInfo(self.shared.block_info.load(Ordering::Acquire))
  }

  /// Owner id as last published. Stable when it names the calling thread.
  #[inline]
  pub(crate) fn owner(&self) -> u32 {
    BlockInfo(self.shared.block_info.load(Ordering::Relaxed)).owner()
  }

  /// Queues `ptr` on the remote-free chain if the word still equals `expected`.
  /// Returns the current word on failure.
  pub(crate) unsafe fn push_remote(
    &self,
    expected: BlockInfo,
    ptr: NonNull<u8>,
  ) -> Result<(), BlockInfo> {
    let link = self.object_index(ptr) as u16 + 1;
    unsafe { ptr.cast::<u16>().write(expected.next()) };

    self
      .shared
      .block_info
      .compare_exchange(
        expected.0,
        expected.push(link).0,
        Ordering::Release,
        Ordering::Acquire,
      )
      .map(|_| ())
      .map_err(BlockInfo)
  }

  /// Hands the block from `expected` to `owner`, keeping queued remote frees.
  pub(crate) fn try_set_thread(&self, expected: u32, owner: u32) -> bool {
    let mut current = self.block_info();
    loop {
      if current.owner() != expected {
        return false;
      }
      match self.shared.block_info.compare_exchange_weak(
        current.0,
        current.with_owner(owner).0,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return true,
        Err(actual) => current = BlockInfo(actual),
      }
    }
  }

  /// Replaces the whole word if it still equals `expected`.
  pub(crate) fn try_set_block_info(&self, expected: BlockInfo, new: BlockInfo) -> bool {
    self
      .shared
      .block_info
      .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Relaxed)
      .is_ok()
  }

  /// Owner-only. Detaches the remote-free queue and splices it onto the local
  /// chain. Returns the number of objects collected.
  pub(crate) fn garbage_collect(&self) -> usize {
    let mut current = self.block_info();
    let drained = loop {
      if current.count() == 0 {
        return 0;
      }
      let cleared = BlockInfo::new(current.owner(), 0, 0);
      match self.shared.block_info.compare_exchange_weak(
        current.0,
        cleared.0,
        Ordering::Acquire,
        Ordering::Acquire,
      ) {
        Ok(_) => break current,
        Err(actual) => current = BlockInfo(actual),
      }
    };

    let (head, count) = (drained.next(), drained.count());
    debug_assert!(head != 0);

    let local = self.free_offset.get();
    if local != 0 {
      let mut tail = (head - 1) as usize;
      for _ in 1..count {
        tail = unsafe { self.object(tail).cast::<u16>().read() } as usize - 1;
      }
      unsafe { self.object(tail).cast::<u16>().write(local) };
    }

    self.free_offset.set(head);
    self.free_objects.set(self.free_objects.get() + count);
    debug_assert!(self.free_objects.get() <= self.capacity.get());
    count as usize
  }
}
