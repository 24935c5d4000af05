//! Thread-local heaps and the internal heaps they draw page blocks from.
//!
//! A thread allocates from the front block of its list for the size class
//! and frees into blocks it owns without synchronization. Blocks move between
//! threads only through the internal heap's concurrent pools:
//!
//! - `orphaned[class]`: partially used blocks left by exiting threads, adopted
//!   by the next thread that needs a block of that class;
//! - `free[page block size class]`: empty blocks, re-stamped for any class of
//!   that page-block size.

use core::ptr::{self, NonNull};

use crate::{
  GLOBAL_INACTIVE_BLOCKS, HEAP_COUNT, LARGE_OBJECT_THRESHOLD, LOCAL_INACTIVE_BLOCKS,
  PAGE_BLOCK_SIZE_CLASSES, PAGE_SIZE, THREAD_ID_ORPHAN, align_up,
  list::List,
  manager::SuperPageManager,
  os::PageSource,
  page_block::{BlockInfo, PAGE_BLOCK_HEADER_SIZE, PageBlock},
  page_map::MapEntry,
  size_class::{
    SIZE_CLASSES, compute_page_block_size, compute_page_block_size_class, compute_size,
    compute_size_class,
  },
  stack::{ConcurrentStack, Stack},
};

// =============================================================================
// Thread-Local State
// =============================================================================

/// One thread's view of one internal heap.
pub(crate) struct ThreadLocalInfo {
  thread_id: u32,
  /// Active blocks per size class. Blocks with room stay in front.
  heaps: [List<PageBlock>; SIZE_CLASSES],
  /// Empty blocks kept back per page-block size class.
  inactive: [Stack<PageBlock>; PAGE_BLOCK_SIZE_CLASSES],
}

impl ThreadLocalInfo {
  pub(crate) const fn new(thread_id: u32) -> Self {
    Self {
      thread_id,
      heaps: [const { List::new() }; SIZE_CLASSES],
      inactive: [const { Stack::new() }; PAGE_BLOCK_SIZE_CLASSES],
    }
  }

  #[inline]
  pub(crate) fn thread_id(&self) -> u32 {
    self.thread_id
  }
}

/// Everything a thread keeps for all internal heaps. Lives in memory mapped
/// from the page source for the lifetime of the thread context.
pub(crate) struct ThreadLocalHeapInfo {
  infos: [ThreadLocalInfo; HEAP_COUNT],
}

impl ThreadLocalHeapInfo {
  pub(crate) fn new(thread_id: u32) -> Self {
    Self {
      infos: core::array::from_fn(|_| ThreadLocalInfo::new(thread_id)),
    }
  }

  #[inline]
  pub(crate) fn info(&self, index: usize) -> &ThreadLocalInfo {
    &self.infos[index]
  }
}

// =============================================================================
// Placement
// =============================================================================

/// Where a request of a given size and alignment is served from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Placement {
  Small { class: usize },
  Large { size: usize },
}

impl Placement {
  /// `None` when the request cannot be mapped at all.
  pub(crate) fn of(size: usize, align: usize) -> Option<Self> {
    debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
    if size > isize::MAX as usize - PAGE_SIZE {
      return None;
    }

    let size = align_up(size.max(1), align);
    if size < LARGE_OBJECT_THRESHOLD {
      // Objects sit at header + index * object size inside a block aligned far beyond the header.
      let class = compute_size_class(size);
      if align <= PAGE_BLOCK_HEADER_SIZE && compute_size(class) % align == 0 {
        return Some(Placement::Small { class });
      }
    }
    Some(Placement::Large {
      size: align_up(size, PAGE_SIZE),
    })
  }

  /// Whether an existing allocation described by `entry` already has this placement.
  fn matches(self, entry: MapEntry) -> bool {
    match (self, entry) {
      (Placement::Small { class }, MapEntry::Block(block)) => {
        unsafe { block.as_ref() }.size_class() == class
      }
      (Placement::Large { size }, MapEntry::Large { size: mapped }) => size == mapped,
      _ => false,
    }
  }
}

#[inline]
fn page_block_size_class(class: usize) -> usize {
  compute_page_block_size_class(compute_page_block_size(class))
}

#[inline]
fn usable_size(entry: MapEntry) -> usize {
  match entry {
    MapEntry::Block(block) => unsafe { block.as_ref() }.object_size(),
    MapEntry::Large { size } => size,
  }
}

/// Collects remote frees if needed. `true` when the block can hand out an object.
#[inline]
fn has_room(block: NonNull<PageBlock>) -> bool {
  let block = unsafe { block.as_ref() };
  !block.full() || block.garbage_collect() > 0
}

// =============================================================================
// Internal Heap
// =============================================================================

pub(crate) struct InternalHeap<S: PageSource> {
  index: usize,
  manager: SuperPageManager<S>,
  orphaned: [ConcurrentStack<PageBlock>; SIZE_CLASSES],
  free: [ConcurrentStack<PageBlock>; PAGE_BLOCK_SIZE_CLASSES],
}

impl<S: PageSource> InternalHeap<S> {
  pub(crate) fn new(index: usize, pages: S) -> Option<Self> {
    Some(Self {
      index,
      manager: SuperPageManager::new(pages)?,
      orphaned: [const { ConcurrentStack::new() }; SIZE_CLASSES],
      free: [const { ConcurrentStack::new() }; PAGE_BLOCK_SIZE_CLASSES],
    })
  }

  #[inline]
  pub(crate) fn index(&self) -> usize {
    self.index
  }

  #[inline]
  pub(crate) fn lookup(&self, ptr: NonNull<u8>) -> Option<MapEntry> {
    self.manager.lookup(ptr)
  }

  pub(crate) fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
    self.lookup(ptr).map(usable_size)
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  #[inline]
  pub(crate) fn allocate(&self, local: &ThreadLocalInfo, size: usize) -> Option<NonNull<u8>> {
    self.allocate_aligned(local, size, 1)
  }

  pub(crate) fn allocate_aligned(
    &self,
    local: &ThreadLocalInfo,
    size: usize,
    align: usize,
  ) -> Option<NonNull<u8>> {
    match Placement::of(size, align)? {
      Placement::Small { class } => self.allocate_small(local, class),
      Placement::Large { size } => self.manager.allocate_large(size),
    }
  }

  fn allocate_small(&self, local: &ThreadLocalInfo, class: usize) -> Option<NonNull<u8>> {
    let list = &local.heaps[class];
    let block = self.front_block(local, class)?;
    let ptr = unsafe { block.as_ref().allocate() };

    if unsafe { block.as_ref() }.full() {
      list.rotate_back();
    }
    Some(ptr)
  }

  /// The block to allocate from, left at the front of the class list.
  fn front_block(&self, local: &ThreadLocalInfo, class: usize) -> Option<NonNull<PageBlock>> {
    let list = &local.heaps[class];

    if let Some(front) = list.front() {
      if has_room(front) {
        return Some(front);
      }
      list.rotate_back();
      if let Some(next) = list.front().filter(|&next| next != front && has_room(next)) {
        return Some(next);
      }
    }

    let block = self.acquire_block(local, class)?;
    unsafe { list.push_front(block) };
    Some(block)
  }

  /// A block with room for `class`, owned by the calling thread and on none of its lists.
  fn acquire_block(&self, local: &ThreadLocalInfo, class: usize) -> Option<NonNull<PageBlock>> {
    let size_class = page_block_size_class(class);
    if let Some(block) = local.inactive[size_class].pop() {
      unsafe { block.as_ref() }.reset(class, local.thread_id);
      return Some(block);
    }
    self.get_free_page_block(local, class)
  }

  fn get_free_page_block(
    &self,
    local: &ThreadLocalInfo,
    class: usize,
  ) -> Option<NonNull<PageBlock>> {
    while let Some(block) = self.orphaned[class].pop() {
      let b = unsafe { block.as_ref() };
      let adopted = b.try_set_thread(b.owner(), local.thread_id);
      debug_assert!(adopted, "pooled block changed owner");

      if has_room(block) {
        return Some(block);
      }
      unsafe { local.heaps[class].push_back(block) };
    }

    let size_class = page_block_size_class(class);
    let block = match self.free[size_class].pop() {
      Some(block) => block,
      None => self.manager.allocate_page_block(size_class)?,
    };
    unsafe { block.as_ref() }.reset(class, local.thread_id);
    Some(block)
  }

  /// Page-granular allocation that needs no thread-local state. Freed like any
  /// large object.
  pub(crate) fn allocate_detached(&self, size: usize) -> Option<NonNull<u8>> {
    if size > isize::MAX as usize - PAGE_SIZE {
      return None;
    }
    self.manager.allocate_large(align_up(size.max(1), PAGE_SIZE))
  }

  /// Whether `ptr` already has the placement a request of `size` and `align` would get.
  pub(crate) fn fits_in_place(&self, ptr: NonNull<u8>, size: usize, align: usize) -> bool {
    match (self.lookup(ptr), Placement::of(size, align)) {
      (Some(entry), Some(placement)) => placement.matches(entry),
      _ => false,
    }
  }

  // ---------------------------------------------------------------------------
  // Free
  // ---------------------------------------------------------------------------

  /// Frees `ptr`. `false` when the address is not one of this heap's allocations.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap, or an address the heap never handed out.
  pub(crate) unsafe fn free(&self, local: &ThreadLocalInfo, ptr: NonNull<u8>) -> bool {
    match self.lookup(ptr) {
      Some(entry) => {
        unsafe { self.free_entry(local, ptr, entry) };
        true
      }
      None => false,
    }
  }

  /// # Safety
  /// `entry` must be the address-map entry of the live allocation `ptr`.
  pub(crate) unsafe fn free_entry(&self, local: &ThreadLocalInfo, ptr: NonNull<u8>, entry: MapEntry) {
    match entry {
      MapEntry::Large { size } => unsafe { self.manager.free_large(ptr, size) },
      MapEntry::Block(block) => unsafe { self.free_small(local, block, ptr) },
    }
  }

  unsafe fn free_small(&self, local: &ThreadLocalInfo, block: NonNull<PageBlock>, ptr: NonNull<u8>) {
    let b = unsafe { block.as_ref() };
    let me = local.thread_id;
    let mut info = b.block_info();

    loop {
      let owner = info.owner();
      if owner == me {
        unsafe { self.local_free(local, block, ptr) };
        return;
      }

      if owner == THREAD_ID_ORPHAN {
        if b.try_set_thread(THREAD_ID_ORPHAN, me) {
          unsafe { local.heaps[b.size_class()].push_front(block) };
          unsafe { self.local_free(local, block, ptr) };
          return;
        }
        info = b.block_info();
        continue;
      }

      match unsafe { b.push_remote(info, ptr) } {
        Ok(()) => return,
        Err(current) => info = current,
      }
    }
  }

  /// Frees `ptr` for a thread that has no thread-local state left. Objects of
  /// orphaned blocks are leaked, since nobody is there to adopt the block.
  ///
  /// # Safety
  /// Same as [`InternalHeap::free_entry`].
  pub(crate) unsafe fn free_detached(&self, ptr: NonNull<u8>, entry: MapEntry) {
    let block = match entry {
      MapEntry::Large { size } => return unsafe { self.manager.free_large(ptr, size) },
      MapEntry::Block(block) => unsafe { block.as_ref() },
    };

    let mut info = block.block_info();
    while info.owner() != THREAD_ID_ORPHAN {
      match unsafe { block.push_remote(info, ptr) } {
        Ok(()) => return,
        Err(current) => info = current,
      }
    }
    log::trace!("streamflow: leaked {ptr:p} freed into an orphaned block without a thread context");
  }

  unsafe fn local_free(&self, local: &ThreadLocalInfo, block: NonNull<PageBlock>, ptr: NonNull<u8>) {
    let b = unsafe { block.as_ref() };
    unsafe { b.free(ptr) };

    let list = &local.heaps[b.size_class()];
    unsafe { list.remove(block) };

    if b.empty() {
      let size_class = b.order();
      if local.inactive[size_class].len() < LOCAL_INACTIVE_BLOCKS {
        unsafe { local.inactive[size_class].push(block) };
      } else {
        unsafe { self.release_block(block) };
      }
    } else {
      unsafe { list.push_front(block) };
    }
  }

  /// Parks an empty block in the shared free pool, or hands it back to its super page.
  unsafe fn release_block(&self, block: NonNull<PageBlock>) {
    let size_class = unsafe { block.as_ref() }.order();
    if !unsafe { self.free[size_class].push_bounded(block, GLOBAL_INACTIVE_BLOCKS) } {
      unsafe { self.manager.free_page_block(block) };
    }
  }

  // ---------------------------------------------------------------------------
  // Reallocate
  // ---------------------------------------------------------------------------

  /// Moves `ptr` to an allocation of `size` bytes aligned to `align`, keeping
  /// the leading bytes. Returns `ptr` itself when its placement already fits.
  /// On failure `ptr` is untouched.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap.
  pub(crate) unsafe fn reallocate(
    &self,
    local: &ThreadLocalInfo,
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
  ) -> Option<NonNull<u8>> {
    let entry = self.lookup(ptr)?;
    if Placement::of(size, align)?.matches(entry) {
      return Some(ptr);
    }

    let moved = self.allocate_aligned(local, size, align)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), usable_size(entry).min(size));
      self.free_entry(local, ptr, entry);
    }
    Some(moved)
  }

  // ---------------------------------------------------------------------------
  // Thread Teardown
  // ---------------------------------------------------------------------------

  /// Hands every block of an exiting thread to the shared pools.
  ///
  /// Empty blocks go to the free pool. Blocks with room or with queued
  /// remote frees go to the orphan pool under the dead thread's id. Full
  /// blocks with an empty queue are marked orphaned in place and wait for the
  /// first thread that frees into them; a remote free racing that transition
  /// sends the block to the orphan pool instead.
  pub(crate) fn thread_finalize(&self, local: &ThreadLocalInfo) {
    let me = local.thread_id;
    let (mut pooled, mut abandoned) = (0usize, 0usize);

    for (class, list) in local.heaps.iter().enumerate() {
      while let Some(block) = list.pop_front() {
        let b = unsafe { block.as_ref() };
        if b.empty() {
          unsafe { self.release_block(block) };
          continue;
        }

        let info = b.block_info();
        debug_assert_eq!(info.owner(), me);

        let marked = b.full()
          && info.count() == 0
          && b.try_set_block_info(BlockInfo::new(me, 0, 0), BlockInfo::new(THREAD_ID_ORPHAN, 0, 0));
        if marked {
          abandoned += 1;
        } else {
          unsafe { self.orphaned[class].push(block) };
          pooled += 1;
        }
      }
    }

    for stack in &local.inactive {
      while let Some(block) = stack.pop() {
        unsafe { self.release_block(block) };
      }
    }

    if pooled + abandoned > 0 {
      log::debug!(
        "streamflow: thread {me} left heap {}: {pooled} blocks pooled, {abandoned} orphaned",
        self.index
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{TrackedPages, size_class::page_block_capacity};
  use std::{collections::HashSet, sync::Barrier};

  fn heap() -> InternalHeap<TrackedPages> {
    InternalHeap::new(0, TrackedPages::new()).unwrap()
  }

  fn block_of(heap: &InternalHeap<TrackedPages>, ptr: NonNull<u8>) -> &PageBlock {
    match heap.lookup(ptr) {
      Some(MapEntry::Block(block)) => unsafe { &*block.as_ptr() },
      other => panic!("{ptr:p} is not a small object: {other:?}"),
    }
  }

  fn fill_block(heap: &InternalHeap<TrackedPages>, local: &ThreadLocalInfo, size: usize) -> Vec<NonNull<u8>> {
    let capacity = page_block_capacity(compute_size_class(size));
    (0..capacity).map(|_| heap.allocate(local, size).unwrap()).collect()
  }

  #[test]
  fn placement_follows_size_and_alignment() {
    assert_eq!(Placement::of(0, 1), Some(Placement::Small { class: compute_size_class(1) }));
    assert_eq!(Placement::of(2047, 1), Some(Placement::Small { class: SIZE_CLASSES - 1 }));
    assert_eq!(Placement::of(2048, 1), Some(Placement::Large { size: PAGE_SIZE }));
    assert_eq!(Placement::of(24, 64), Some(Placement::Small { class: compute_size_class(64) }));
    assert_eq!(Placement::of(100, 256), Some(Placement::Large { size: PAGE_SIZE }));
    assert_eq!(Placement::of(4097, 4096), Some(Placement::Large { size: 2 * PAGE_SIZE }));
    assert_eq!(Placement::of(usize::MAX, 1), None);
  }

  #[test]
  fn live_objects_never_alias() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);
    let mut seen = HashSet::new();
    let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();

    for round in 0..3u8 {
      for size in (1..LARGE_OBJECT_THRESHOLD).step_by(37) {
        let ptr = heap.allocate(&local, size).unwrap();
        assert!(heap.usable_size(ptr).unwrap() >= size);
        unsafe { ptr.as_ptr().write_bytes(round, size) };
        assert!(seen.insert(ptr.as_ptr() as usize), "address handed out twice");
        live.push((ptr, round));
      }

      let mut index = 0;
      live.retain(|&(ptr, _)| {
        index += 1;
        if index % 2 == 0 {
          return true;
        }
        seen.remove(&(ptr.as_ptr() as usize));
        assert!(unsafe { heap.free(&local, ptr) });
        false
      });
    }

    for &(ptr, round) in &live {
      assert_eq!(unsafe { ptr.as_ptr().read() }, round, "object {ptr:p} was overwritten");
    }

    let mut ranges: Vec<(usize, usize)> = live
      .iter()
      .map(|&(p, _)| (p.as_ptr() as usize, heap.usable_size(p).unwrap()))
      .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
      assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping objects");
    }
  }

  #[test]
  fn large_object_boundary() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);

    let small = heap.allocate(&local, 2047).unwrap();
    let large = heap.allocate(&local, 2048).unwrap();
    assert!(matches!(heap.lookup(small), Some(MapEntry::Block(_))));
    assert_eq!(heap.lookup(large), Some(MapEntry::Large { size: PAGE_SIZE }));
    assert_eq!(heap.usable_size(small), Some(2240));
    assert_eq!(heap.usable_size(large), Some(PAGE_SIZE));

    let block = block_of(&heap, small);
    unsafe {
      assert!(heap.free(&local, small));
      assert!(heap.free(&local, large));
    }
    assert!(block.empty());
    assert_eq!(heap.lookup(large), None);
  }

  #[test]
  fn remote_free_is_reused_after_garbage_collection() {
    let heap = heap();
    let (a, b) = (ThreadLocalInfo::new(1), ThreadLocalInfo::new(2));

    let objects = fill_block(&heap, &a, 2000);
    let block = block_of(&heap, objects[0]);
    assert!(block.full());

    unsafe { heap.free(&b, objects[7]) };
    assert_eq!(block.owner(), 1);
    assert_eq!(block.block_info().count(), 1);
    assert!(block.full(), "remote frees wait for the owner");

    assert_eq!(heap.allocate(&a, 2000), Some(objects[7]));
    assert_eq!(block.block_info(), BlockInfo::new(1, 0, 0));
  }

  #[test]
  fn orphaned_block_is_adopted_by_freeing_thread() {
    let heap = heap();
    let (a, b) = (ThreadLocalInfo::new(1), ThreadLocalInfo::new(2));

    let objects = fill_block(&heap, &a, 2000);
    let block = block_of(&heap, objects[0]);
    heap.thread_finalize(&a);
    assert_eq!(block.owner(), THREAD_ID_ORPHAN);
    assert!(heap.orphaned.iter().all(ConcurrentStack::is_empty));

    unsafe { heap.free(&b, objects[5]) };
    assert_eq!(block.owner(), 2);
    assert_eq!(heap.allocate(&b, 2000), Some(objects[5]));

    for &ptr in &objects {
      unsafe { heap.free(&b, ptr) };
    }
    assert!(block.empty());
    assert_eq!(b.inactive[block.order()].len(), 1);
  }

  #[test]
  fn concurrent_frees_into_an_orphan_agree_on_one_adopter() {
    const FREERS: u32 = 4;
    let heap = heap();

    for round in 0..50 {
      let owner = ThreadLocalInfo::new(1);
      let objects: Vec<usize> = fill_block(&heap, &owner, 64)
        .iter()
        .map(|ptr| ptr.as_ptr() as usize)
        .collect();
      let block = block_of(&heap, NonNull::new(objects[0] as *mut u8).unwrap());
      heap.thread_finalize(&owner);
      assert_eq!(block.owner(), THREAD_ID_ORPHAN);

      let barrier = Barrier::new(FREERS as usize);
      std::thread::scope(|s| {
        for t in 0..FREERS {
          let (heap, objects, barrier) = (&heap, &objects, &barrier);
          s.spawn(move || {
            let local = ThreadLocalInfo::new(10 + t);
            barrier.wait();
            for &addr in objects.iter().skip(t as usize).step_by(FREERS as usize) {
              unsafe { heap.free(&local, NonNull::new(addr as *mut u8).unwrap()) };
            }
          });
        }
      });

      let adopter = block.owner();
      assert!((10..10 + FREERS).contains(&adopter), "round {round}: owner {adopter}");
      assert_eq!(
        block.free_objects() + block.block_info().count() as usize,
        block.capacity(),
        "round {round}: objects lost between adopter and remote queue"
      );
      assert!(heap.orphaned[block.size_class()].is_empty());
    }
  }

  #[test]
  fn remote_free_racing_finalize_keeps_the_block_reachable() {
    let heap = heap();
    let (mut pooled, mut adopted) = (0, 0);

    for round in 0..50 {
      let owner = ThreadLocalInfo::new(1);
      let objects = fill_block(&heap, &owner, 64);
      let victim = objects[3].as_ptr() as usize;
      let block = block_of(&heap, objects[0]);
      let class = block.size_class();

      let barrier = Barrier::new(2);
      std::thread::scope(|s| {
        let (heap, barrier) = (&heap, &barrier);
        s.spawn(move || {
          let local = ThreadLocalInfo::new(2);
          barrier.wait();
          unsafe { heap.free(&local, NonNull::new(victim as *mut u8).unwrap()) };
        });
        barrier.wait();
        heap.thread_finalize(&owner);
      });

      match block.owner() {
        1 => {
          assert_eq!(block.block_info().count(), 1, "round {round}");
          assert_eq!(heap.orphaned[class].pop(), Some(NonNull::from(block)), "round {round}");
          pooled += 1;
        }
        2 => {
          assert_eq!(block.free_objects(), 1, "round {round}");
          assert!(heap.orphaned[class].is_empty(), "round {round}");
          adopted += 1;
        }
        other => panic!("round {round}: block owned by {other}"),
      }
    }
    assert_eq!(pooled + adopted, 50);
  }

  #[test]
  fn finalize_pools_partial_and_empty_blocks() {
    let heap = heap();
    let (a, b) = (ThreadLocalInfo::new(1), ThreadLocalInfo::new(2));
    let class = compute_size_class(100);

    let kept = heap.allocate(&a, 100).unwrap();
    let scratch = heap.allocate(&a, 600).unwrap();
    unsafe { heap.free(&a, scratch) };
    let scratch_order = block_of(&heap, scratch).order();
    assert_eq!(a.inactive[scratch_order].len(), 1);

    heap.thread_finalize(&a);
    assert_eq!(heap.orphaned[class].len(), 1);
    assert_eq!(heap.free[scratch_order].len(), 1);
    assert!(a.heaps.iter().all(List::is_empty));

    let fresh = heap.allocate(&b, 100).unwrap();
    assert_ne!(fresh, kept);
    assert_eq!(block_of(&heap, kept).owner(), 2);
    assert!(heap.orphaned[class].is_empty());

    unsafe {
      heap.free(&b, kept);
      heap.free(&b, fresh);
    }
  }

  #[test]
  fn empty_blocks_spill_from_thread_to_pool_to_super_page() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);
    let blocks = 10;

    let objects: Vec<NonNull<u8>> = (0..blocks).flat_map(|_| fill_block(&heap, &local, 2000)).collect();
    let order = block_of(&heap, objects[0]).order();
    for &ptr in &objects {
      unsafe { heap.free(&local, ptr) };
    }

    assert_eq!(local.inactive[order].len(), LOCAL_INACTIVE_BLOCKS);
    assert_eq!(heap.free[order].len(), GLOBAL_INACTIVE_BLOCKS);
    assert!(local.heaps.iter().all(List::is_empty));
  }

  #[test]
  fn reallocate_keeps_contents() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);

    let ptr = heap.allocate(&local, 50).unwrap();
    unsafe { ptr.as_ptr().copy_from_nonoverlapping(b"streamflow".as_ptr(), 10) };

    let same = unsafe { heap.reallocate(&local, ptr, 52, 1) }.unwrap();
    assert_eq!(same, ptr);

    let grown = unsafe { heap.reallocate(&local, ptr, 5000, 1) }.unwrap();
    assert_ne!(grown, ptr);
    assert_eq!(heap.usable_size(grown), Some(2 * PAGE_SIZE));
    assert_eq!(unsafe { core::slice::from_raw_parts(grown.as_ptr(), 10) }, b"streamflow");

    let shrunk = unsafe { heap.reallocate(&local, grown, 4, 1) }.unwrap();
    assert_eq!(unsafe { core::slice::from_raw_parts(shrunk.as_ptr(), 4) }, b"stre");
    assert_eq!(heap.lookup(grown), None);
    unsafe { heap.free(&local, shrunk) };
  }

  #[test]
  fn aligned_allocations() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);
    for (size, align) in [(24, 64), (8, 16), (100, 128), (100, 256), (3000, 4096)] {
      let ptr = heap.allocate_aligned(&local, size, align).unwrap();
      assert_eq!(ptr.as_ptr() as usize % align, 0, "size {size} align {align}");
      unsafe { heap.free(&local, ptr) };
    }
  }

  #[test]
  fn detached_allocations_are_large_objects() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);
    let ptr = heap.allocate_detached(24).unwrap();
    assert_eq!(heap.lookup(ptr), Some(MapEntry::Large { size: PAGE_SIZE }));
    assert!(heap.fits_in_place(ptr, 3000, 8));
    assert!(!heap.fits_in_place(ptr, 24, 8));

    unsafe { heap.free(&local, ptr) };
    assert_eq!(heap.lookup(ptr), None);
    assert!(heap.allocate_detached(usize::MAX).is_none());
  }

  #[test]
  fn detached_free_queues_remotely() {
    let heap = heap();
    let local = ThreadLocalInfo::new(1);
    let ptr = heap.allocate(&local, 64).unwrap();
    let entry = heap.lookup(ptr).unwrap();

    unsafe { heap.free_detached(ptr, entry) };
    assert_eq!(block_of(&heap, ptr).block_info().count(), 1);
  }
}
