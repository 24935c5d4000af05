use core::{
  cell::Cell,
  iter,
  ptr::{NonNull, null_mut},
};

/// Embedded prev/next pointers. The list never owns its elements; whoever
/// owns the memory a node lives in owns the node.
pub(crate) struct Link<T> {
  prev: Cell<*mut T>,
  next: Cell<*mut T>,
}

impl<T> Link<T> {
  pub(crate) const fn new() -> Self {
    Self {
      prev: Cell::new(null_mut()),
      next: Cell::new(null_mut()),
    }
  }
}

/// # Safety
/// `link` must always return the same embedded [`Link`].
pub(crate) unsafe trait Linked: Sized {
  fn link(&self) -> &Link<Self>;
}

#[inline(always)]
unsafe fn link<'a, T: Linked>(node: *mut T) -> &'a Link<T> {
  unsafe { (*node).link() }
}

/// Intrusive doubly-linked list. A node is on at most one list at a time,
/// and every caller must be the only thread touching the list and its nodes.
pub(crate) struct List<T: Linked> {
  head: Cell<*mut T>,
  tail: Cell<*mut T>,
}

impl<T: Linked> List<T> {
  pub(crate) const fn new() -> Self {
    Self {
      head: Cell::new(null_mut()),
      tail: Cell::new(null_mut()),
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.get().is_null()
  }

  #[inline]
  pub(crate) fn front(&self) -> Option<NonNull<T>> {
    NonNull::new(self.head.get())
  }

  pub(crate) unsafe fn push_front(&self, node: NonNull<T>) {
    let node = node.as_ptr();
    let head = self.head.get();
    let l = unsafe { link(node) };
    l.prev.set(null_mut());
    l.next.set(head);

    if head.is_null() {
      self.tail.set(node);
    } else {
      unsafe { link(head) }.prev.set(node);
    }
    self.head.set(node);
  }

  pub(crate) unsafe fn push_back(&self, node: NonNull<T>) {
    let node = node.as_ptr();
    let tail = self.tail.get();
    let l = unsafe { link(node) };
    l.prev.set(tail);
    l.next.set(null_mut());

    if tail.is_null() {
      self.head.set(node);
    } else {
      unsafe { link(tail) }.next.set(node);
    }
    self.tail.set(node);
  }

  /// # Safety
  /// `node` must be on this list.
  pub(crate) unsafe fn remove(&self, node: NonNull<T>) {
    let node = node.as_ptr();
    let l = unsafe { link(node) };
    let (prev, next) = (l.prev.get(), l.next.get());

    if prev.is_null() {
      debug_assert!(self.head.get() == node);
      self.head.set(next);
    } else {
      unsafe { link(prev) }.next.set(next);
    }

    if next.is_null() {
      debug_assert!(self.tail.get() == node);
      self.tail.set(prev);
    } else {
      unsafe { link(next) }.prev.set(prev);
    }

    l.prev.set(null_mut());
    l.next.set(null_mut());
  }

  pub(crate) fn pop_front(&self) -> Option<NonNull<T>> {
    let node = self.front()?;
    unsafe { self.remove(node) };
    Some(node)
  }

  /// Moves the front node to the back.
  pub(crate) fn rotate_back(&self) {
    let head = self.head.get();
    if head.is_null() || head == self.tail.get() {
      return;
    }
    if let Some(node) = self.pop_front() {
      unsafe { self.push_back(node) };
    }
  }

  /// Walks the list front to back. The list must not change while the iterator is live.
  pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<T>> + '_ {
    let mut cursor = self.head.get();
    iter::from_fn(move || {
      let node = NonNull::new(cursor)?;
      cursor = unsafe { link(cursor) }.next.get();
      Some(node)
    })
  }
}
