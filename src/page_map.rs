//! Address -> owner lookup for every page the allocator hands out.
//!
//! 64-bit targets use a three-level radix tree installed lock-free; 32-bit
//! targets use one flat table covering the whole address space.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crate::{PAGE_SHIFT, PAGE_SIZE, os::PageSource, page_block::PageBlock};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MapEntry {
  /// A page of a small-object page block.
  Block(NonNull<PageBlock>),
  /// The first page of a large object of `size` mapped bytes.
  Large { size: usize },
}

pub(crate) trait AddressMap<S: PageSource>: Sized + Send + Sync {
  fn new(pages: S) -> Option<Self>;

  /// Maps every page of `block`. `false` when an interior node could not be allocated.
  fn register_block(&self, block: NonNull<PageBlock>, size: usize) -> bool;

  fn register_large(&self, base: NonNull<u8>, size: usize) -> bool;

  /// Clears entries for `[start, start + size)`.
  fn unregister(&self, start: usize, size: usize);

  fn lookup(&self, addr: usize) -> Option<MapEntry>;
}

#[cfg(target_pointer_width = "64")]
pub(crate) type PageMap<S> = RadixPageMap<S>;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) type PageMap<S> = BibopTable<S>;

// =============================================================================
// Radix Page Map
// =============================================================================

const LEVEL_BITS: usize = 12;
const FANOUT: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: usize = FANOUT - 1;
/// Pages addressable with 48-bit virtual addresses.
const PAGE_NUMBER_BITS: usize = 48 - PAGE_SHIFT;
const LARGE_TAG: usize = 1 << (usize::BITS - 1);

const _: () = assert!(PAGE_NUMBER_BITS == 3 * LEVEL_BITS);

type Leaf = [AtomicUsize; FANOUT];
type Interior = [AtomicPtr<Leaf>; FANOUT];
type Root = [AtomicPtr<Interior>; FANOUT];

/// Page number split 12/12/12. Nodes are zeroed pages, so a fresh node is all
/// null. Racing installers CAS the slot; the loser releases its node.
pub(crate) struct RadixPageMap<S: PageSource> {
  pages: S,
  root: NonNull<Root>,
}

unsafe impl<S: PageSource> Send for RadixPageMap<S> {}
unsafe impl<S: PageSource> Sync for RadixPageMap<S> {}

impl<S: PageSource> RadixPageMap<S> {
  fn allocate_node<T>(&self) -> *mut T {
    self.pages.allocate(size_of::<T>()).cast()
  }

  fn child<T>(&self, slot: &AtomicPtr<T>, create: bool) -> Option<&T> {
    let current = slot.load(Ordering::Acquire);
    if !current.is_null() || !create {
      return unsafe { current.as_ref() };
    }

    let fresh = self.allocate_node::<T>();
    if fresh.is_null() {
      return None;
    }
    match slot.compare_exchange(current, fresh, Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => unsafe { fresh.as_ref() },
      Err(winner) => {
        unsafe { self.pages.release(fresh.cast(), size_of::<T>()) };
        unsafe { winner.as_ref() }
      }
    }
  }

  fn slot(&self, page: usize, create: bool) -> Option<&AtomicUsize> {
    if (page as u64) >> PAGE_NUMBER_BITS != 0 {
      return None;
    }
    let root = unsafe { self.root.as_ref() };
    let interior = self.child(&root[page >> (2 * LEVEL_BITS)], create)?;
    let leaf = self.child(&interior[(page >> LEVEL_BITS) & LEVEL_MASK], create)?;
    Some(&leaf[page & LEVEL_MASK])
  }

  fn store_range(&self, start: usize, size: usize, value: usize) -> bool {
    let first = start >> PAGE_SHIFT;
    let last = (start + size - 1) >> PAGE_SHIFT;
    for page in first..=last {
      let Some(slot) = self.slot(page, true) else {
        return false;
      };
      slot.store(value, Ordering::Release);
    }
    true
  }
}

impl<S: PageSource> AddressMap<S> for RadixPageMap<S> {
  fn new(pages: S) -> Option<Self> {
    let root = NonNull::new(pages.allocate(size_of::<Root>()).cast::<Root>())?;
    Some(Self { pages, root })
  }

  fn register_block(&self, block: NonNull<PageBlock>, size: usize) -> bool {
    debug_assert!(block.as_ptr() as usize & LARGE_TAG == 0);
    self.store_range(block.as_ptr() as usize, size, block.as_ptr() as usize)
  }

  fn register_large(&self, base: NonNull<u8>, size: usize) -> bool {
    debug_assert!(size & LARGE_TAG == 0);
    self
      .slot(base.as_ptr() as usize >> PAGE_SHIFT, true)
      .map(|slot| slot.store(LARGE_TAG | size, Ordering::Release))
      .is_some()
  }

  fn unregister(&self, start: usize, size: usize) {
    let first = start >> PAGE_SHIFT;
    let last = (start + size - 1) >> PAGE_SHIFT;
    for page in first..=last {
      if let Some(slot) = self.slot(page, false) {
        slot.store(0, Ordering::Release);
      }
    }
  }

  fn lookup(&self, addr: usize) -> Option<MapEntry> {
    let value = self.slot(addr >> PAGE_SHIFT, false)?.load(Ordering::Acquire);
    if value == 0 {
      None
    } else if value & LARGE_TAG != 0 {
      Some(MapEntry::Large {
        size: value & !LARGE_TAG,
      })
    } else {
      NonNull::new(value as *mut PageBlock).map(MapEntry::Block)
    }
  }
}

impl<S: PageSource> Drop for RadixPageMap<S> {
  fn drop(&mut self) {
    let root = unsafe { self.root.as_ref() };
    for interior in root.iter().map(|slot| slot.load(Ordering::Acquire)) {
      let Some(nodes) = (unsafe { interior.as_ref() }) else {
        continue;
      };
      for leaf in nodes.iter().map(|slot| slot.load(Ordering::Acquire)) {
        if !leaf.is_null() {
          unsafe { self.pages.release(leaf.cast(), size_of::<Leaf>()) };
        }
      }
      unsafe { self.pages.release(interior.cast(), size_of::<Interior>()) };
    }
    unsafe { self.pages.release(self.root.as_ptr().cast(), size_of::<Root>()) };
  }
}

// =============================================================================
// Bibop Table
// =============================================================================

const BIBOP_ENTRIES: usize = 1 << 20;
const BIBOP_SPAN: u64 = (BIBOP_ENTRIES as u64) << PAGE_SHIFT;
const BIBOP_LARGE: u32 = 1 << 31;

/// One 32-bit entry per page of a 4 GiB window. Block pages store their page
/// distance to the block header plus one; a large object's first page stores
/// its page count tagged with the high bit.
#[cfg_attr(target_pointer_width = "64", allow(dead_code))]
pub(crate) struct BibopTable<S: PageSource> {
  pages: S,
  window: usize,
  entries: NonNull<AtomicU32>,
}

unsafe impl<S: PageSource> Send for BibopTable<S> {}
unsafe impl<S: PageSource> Sync for BibopTable<S> {}

#[cfg_attr(target_pointer_width = "64", allow(dead_code))]
impl<S: PageSource> BibopTable<S> {
  const TABLE_BYTES: usize = BIBOP_ENTRIES * size_of::<AtomicU32>();

  /// A table for the window starting at `window` (0 on 32-bit targets).
  pub(crate) fn with_window(pages: S, window: usize) -> Option<Self> {
    let entries = NonNull::new(pages.allocate(Self::TABLE_BYTES).cast::<AtomicU32>())?;
    Some(Self {
      pages,
      window,
      entries,
    })
  }

  fn index(&self, addr: usize) -> Option<usize> {
    let offset = addr.checked_sub(self.window)? as u64;
    (offset < BIBOP_SPAN).then_some((offset >> PAGE_SHIFT) as usize)
  }

  fn entry(&self, index: usize) -> &AtomicU32 {
    debug_assert!(index < BIBOP_ENTRIES);
    unsafe { &*self.entries.as_ptr().add(index) }
  }
}

impl<S: PageSource> AddressMap<S> for BibopTable<S> {
  fn new(pages: S) -> Option<Self> {
    Self::with_window(pages, 0)
  }

  fn register_block(&self, block: NonNull<PageBlock>, size: usize) -> bool {
    let addr = block.as_ptr() as usize;
    let (Some(first), Some(_)) = (self.index(addr), self.index(addr + size - 1)) else {
      return false;
    };
    for distance in 0..size >> PAGE_SHIFT {
      self
        .entry(first + distance)
        .store(distance as u32 + 1, Ordering::Release);
    }
    true
  }

  fn register_large(&self, base: NonNull<u8>, size: usize) -> bool {
    let Some(index) = self.index(base.as_ptr() as usize) else {
      return false;
    };
    let pages = size >> PAGE_SHIFT;
    debug_assert!(pages as u32 & BIBOP_LARGE == 0);
    self
      .entry(index)
      .store(BIBOP_LARGE | pages as u32, Ordering::Release);
    true
  }

  fn unregister(&self, start: usize, size: usize) {
    let Some(first) = self.index(start) else {
      return;
    };
    let count = (size >> PAGE_SHIFT).min(BIBOP_ENTRIES - first);
    for index in first..first + count {
      self.entry(index).store(0, Ordering::Release);
    }
  }

  fn lookup(&self, addr: usize) -> Option<MapEntry> {
    let value = self.entry(self.index(addr)?).load(Ordering::Acquire);
    if value == 0 {
      None
    } else if value & BIBOP_LARGE != 0 {
      Some(MapEntry::Large {
        size: ((value & !BIBOP_LARGE) as usize) << PAGE_SHIFT,
      })
    } else {
      let page = addr & !(PAGE_SIZE - 1);
      let header = page - ((value - 1) as usize) * PAGE_SIZE;
      NonNull::new(header as *mut PageBlock).map(MapEntry::Block)
    }
  }
}

impl<S: PageSource> Drop for BibopTable<S> {
  fn drop(&mut self) {
    unsafe {
      self
        .pages
        .release(self.entries.as_ptr().cast(), Self::TABLE_BYTES)
    };
  }
}
