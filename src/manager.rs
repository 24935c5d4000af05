use core::ptr::NonNull;

use crate::{
  MIN_PAGE_BLOCK_SIZE, SUPER_PAGE_SIZE,
  chunk::ChunkHeap,
  list::List,
  os::{PageSource, SpinLock, allocate_pages},
  page_block::PageBlock,
  page_map::{AddressMap, MapEntry, PageMap},
  super_page::SuperPage,
};

// =============================================================================
// Super Page Manager
// =============================================================================

struct ManagerState<S: PageSource> {
  super_pages: List<SuperPage>,
  headers: ChunkHeap<SuperPage, S>,
}

// Only reached through the manager's lock.
unsafe impl<S: PageSource> Send for ManagerState<S> {}

/// Owns the super pages of one internal heap, the address map covering
/// them, and the large objects mapped directly from the page source.
pub(crate) struct SuperPageManager<S: PageSource> {
  pages: S,
  map: PageMap<S>,
  state: SpinLock<ManagerState<S>>,
}

impl<S: PageSource> SuperPageManager<S> {
  pub(crate) fn new(pages: S) -> Option<Self> {
    let map = PageMap::new(pages.clone())?;
    Some(Self {
      state: SpinLock::new(ManagerState {
        super_pages: List::new(),
        headers: ChunkHeap::new(pages.clone()),
      }),
      pages,
      map,
    })
  }

  fn create_super_page(&self, state: &mut ManagerState<S>) -> Option<NonNull<SuperPage>> {
    let record = state.headers.allocate()?.cast::<SuperPage>();
    let Some((base, _)) = allocate_pages(&self.pages, SUPER_PAGE_SIZE) else {
      unsafe { state.headers.free(record) };
      return None;
    };

    unsafe {
      record.write(SuperPage::new(base));
      state.super_pages.push_front(record);
    }
    log::debug!("streamflow: mapped super page {base:p}");
    Some(record)
  }

  /// A fresh page block of `MIN_PAGE_BLOCK_SIZE << order` bytes, registered in the address map.
  pub(crate) fn allocate_page_block(&self, order: usize) -> Option<NonNull<PageBlock>> {
    let block = {
      let mut state = self.state.lock();
      let found = state
        .super_pages
        .iter()
        .find(|page| unsafe { page.as_ref() }.has_enough_free_space(order));
      let page = match found {
        Some(page) => page,
        None => self.create_super_page(&mut state)?,
      };
      unsafe { page.as_ref() }.allocate(order)?
    };

    if !self.map.register_block(block, MIN_PAGE_BLOCK_SIZE << order) {
      log::warn!("streamflow: no memory to map page block {block:p}");
      unsafe { self.free_page_block(block) };
      return None;
    }
    Some(block)
  }

  /// Returns `block` to its super page. An unused super page stays mapped
  /// while it is the manager's only idle one, and goes back to the page source
  /// once another is idle too.
  ///
  /// # Safety
  /// `block` must come from [`SuperPageManager::allocate_page_block`] and hold no live objects.
  pub(crate) unsafe fn free_page_block(&self, block: NonNull<PageBlock>) {
    let base = {
      let mut state = self.state.lock();
      let page = unsafe { block.as_ref() }.super_page();
      if !unsafe { page.as_ref().free(block) } {
        return;
      }

      // Popped pool nodes may still be read by a stalled stack popper.
      let other_idle = state
        .super_pages
        .iter()
        .any(|other| other != page && unsafe { other.as_ref() }.is_unused());
      if !other_idle {
        return;
      }

      let base = unsafe { page.as_ref() }.base();
      unsafe {
        state.super_pages.remove(page);
        state.headers.free(page);
      }
      base
    };

    self.map.unregister(base.as_ptr() as usize, SUPER_PAGE_SIZE);
    unsafe { self.pages.release(base.as_ptr(), SUPER_PAGE_SIZE) };
    log::debug!("streamflow: released super page {base:p}");
  }

  /// Maps `size` bytes rounded up to whole pages, tagged large in the address map.
  pub(crate) fn allocate_large(&self, size: usize) -> Option<NonNull<u8>> {
    let (ptr, size) = allocate_pages(&self.pages, size)?;
    if !self.map.register_large(ptr, size) {
      unsafe { self.pages.release(ptr.as_ptr(), size) };
      return None;
    }
    Some(ptr)
  }

  /// # Safety
  /// `ptr` must be a live large object of this manager and `size` its mapped size.
  pub(crate) unsafe fn free_large(&self, ptr: NonNull<u8>, size: usize) {
    self.map.unregister(ptr.as_ptr() as usize, size);
    unsafe { self.pages.release(ptr.as_ptr(), size) };
  }

  #[inline]
  pub(crate) fn lookup(&self, ptr: NonNull<u8>) -> Option<MapEntry> {
    self.map.lookup(ptr.as_ptr() as usize)
  }
}

impl<S: PageSource> Drop for SuperPageManager<S> {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    let mut released = 0usize;
    while let Some(page) = state.super_pages.pop_front() {
      let base = unsafe { page.as_ref() }.base();
      unsafe { self.pages.release(base.as_ptr(), SUPER_PAGE_SIZE) };
      released += 1;
    }
    if released > 0 {
      log::debug!("streamflow: released {released} super pages at teardown");
    }
  }
}
