//! Binary buddy allocator over one super page.
//!
//! Free regions carry a [`BuddyHeader`] in their first bytes; allocated
//! regions start with a [`PageBlock`]. Both keep their order at the same
//! offset, and free regions tag it with [`FREE_TAG`], so a merge can tell the
//! two apart from the buddy address alone.

use core::{
  cell::Cell,
  mem::offset_of,
  ptr::NonNull,
};

use crate::{
  BUDDY_MAX_ORDER, BUDDY_UNIT_SHIFT, SUPER_PAGE_SIZE,
  list::{Link, Linked, List},
  page_block::PageBlock,
};

const FREE_TAG: u32 = 1 << 31;
const ORDERS: usize = BUDDY_MAX_ORDER + 1;

#[repr(C)]
pub(crate) struct BuddyHeader {
  link: Link<BuddyHeader>,
  order: u32,
}

impl BuddyHeader {
  pub(crate) const ORDER_OFFSET: usize = offset_of!(BuddyHeader, order);
}

unsafe impl Linked for BuddyHeader {
  fn link(&self) -> &Link<Self> {
    &self.link
  }
}

#[inline(always)]
const fn order_size(order: usize) -> usize {
  1 << (BUDDY_UNIT_SHIFT + order)
}

const _: () = assert!(order_size(BUDDY_MAX_ORDER) == SUPER_PAGE_SIZE);

// =============================================================================
// Super Page
// =============================================================================

/// Header of one super page. Lives outside the region it describes and must
/// not move once blocks have been handed out, since they point back at it.
/// All methods are called under the manager lock.
pub(crate) struct SuperPage {
  link: Link<SuperPage>,
  base: NonNull<u8>,
  buddies: [List<BuddyHeader>; ORDERS],
  largest_free_order: Cell<Option<usize>>,
}

unsafe impl Linked for SuperPage {
  fn link(&self) -> &Link<Self> {
    &self.link
  }
}

impl SuperPage {
  /// Takes `base` as one free block of the largest order.
  ///
  /// # Safety
  /// `base` must point to [`SUPER_PAGE_SIZE`] writable, page-aligned bytes owned by the caller.
  pub(crate) unsafe fn new(base: NonNull<u8>) -> Self {
    let page = Self {
      link: Link::new(),
      base,
      buddies: [const { List::new() }; ORDERS],
      largest_free_order: Cell::new(None),
    };
    unsafe { page.insert_free(base.as_ptr() as usize, BUDDY_MAX_ORDER) };
    page.largest_free_order.set(Some(BUDDY_MAX_ORDER));
    page
  }

  #[inline]
  pub(crate) fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub(crate) fn has_enough_free_space(&self, order: usize) -> bool {
    self
      .largest_free_order
      .get()
      .is_some_and(|largest| largest >= order)
  }

  /// The whole super page is one free block.
  pub(crate) fn is_unused(&self) -> bool {
    !self.buddies[BUDDY_MAX_ORDER].is_empty()
  }

  unsafe fn insert_free(&self, addr: usize, order: usize) {
    let header = addr as *mut BuddyHeader;
    unsafe {
      header.write(BuddyHeader {
        link: Link::new(),
        order: order as u32 | FREE_TAG,
      });
      self.buddies[order].push_front(NonNull::new_unchecked(header));
    }
  }

  fn refresh_largest_free_order(&self) {
    let largest = (0..ORDERS).rev().find(|&order| !self.buddies[order].is_empty());
    self.largest_free_order.set(largest);
  }

  /// Carves a page block of `order` (16 KiB << order) and builds its header.
  pub(crate) fn allocate(&self, order: usize) -> Option<NonNull<PageBlock>> {
    debug_assert!(order <= BUDDY_MAX_ORDER);

    let mut current = (order..ORDERS).find(|&o| !self.buddies[o].is_empty())?;
    let block = self.buddies[current].pop_front()?.as_ptr() as usize;

    while current > order {
      current -= 1;
      unsafe { self.insert_free(block + order_size(current), current) };
    }
    self.refresh_largest_free_order();

    let at = unsafe { NonNull::new_unchecked(block as *mut u8) };
    Some(unsafe { PageBlock::construct(at, order, NonNull::from(self)) })
  }

  /// Returns a page block to the buddy lists, merging upward.
  /// `true` when the super page is entirely free again.
  ///
  /// # Safety
  /// `block` must come from [`SuperPage::allocate`] on this super page and not be used afterwards.
  pub(crate) unsafe fn free(&self, block: NonNull<PageBlock>) -> bool {
    let base = self.base.as_ptr() as usize;
    let mut addr = block.as_ptr() as usize;
    let mut order = unsafe { block.as_ref() }.order();
    debug_assert!(addr >= base && addr + order_size(order) <= base + SUPER_PAGE_SIZE);

    while order < BUDDY_MAX_ORDER {
      let buddy = base + ((addr - base) ^ order_size(order));
      let tag = unsafe { ((buddy + BuddyHeader::ORDER_OFFSET) as *const u32).read() };

      // Allocated blocks never carry the tag, so only then is the order a free order.
      if tag & FREE_TAG == 0 || (tag & !FREE_TAG) as usize != order {
        break;
      }

      unsafe {
        self.buddies[order].remove(NonNull::new_unchecked(buddy as *mut BuddyHeader))
      };
      addr = addr.min(buddy);
      order += 1;
    }

    unsafe { self.insert_free(addr, order) };
    self.refresh_largest_free_order();
    order == BUDDY_MAX_ORDER
  }

  /// Free regions as `(offset from base, order)`.
  #[cfg(test)]
  fn free_regions(&self) -> Vec<(usize, usize)> {
    let base = self.base.as_ptr() as usize;
    (0..ORDERS)
      .flat_map(|order| {
        self.buddies[order].iter().map(move |header| {
          let tag = unsafe { header.as_ref() }.order;
          assert_eq!(tag, order as u32 | FREE_TAG);
          (header.as_ptr() as usize - base, order)
        })
      })
      .collect()
  }
}
