use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::sync::Arc;

#[cfg(not(unix))]
use std::alloc::{GlobalAlloc, Layout, System};

use crate::{PAGE_SIZE, align_up};

// =============================================================================
// Page Source
// =============================================================================

/// Source of OS virtual memory: reserve + commit, and release.
///
/// # Safety
/// `allocate` must return null or a pointer to `size` bytes of zeroed,
/// read-write memory aligned to [`PAGE_SIZE`], exclusively owned by the caller
/// until handed back to `release` with the same size.
pub unsafe trait PageSource: Clone + Send + Sync {
  /// Maps `size` bytes. `size` is a non-zero multiple of [`PAGE_SIZE`]. Returns null on failure.
  fn allocate(&self, size: usize) -> *mut u8;

  /// Unmaps memory returned by [`PageSource::allocate`].
  ///
  /// # Safety
  /// `ptr` must come from `allocate` on this source with the same `size`, and must not be used afterwards.
  unsafe fn release(&self, ptr: *mut u8, size: usize);
}

/// Anonymous private mappings straight from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsPages;

unsafe impl PageSource for OsPages {
  fn allocate(&self, size: usize) -> *mut u8 {
    debug_assert!(size > 0 && size % PAGE_SIZE == 0);
    unsafe { os_mmap(size) }
  }

  unsafe fn release(&self, ptr: *mut u8, size: usize) {
    unsafe { os_munmap(ptr, size) };
  }
}

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  let ret = unsafe { libc::munmap(ptr.cast(), size) };
  debug_assert!(ret == 0, "munmap({ptr:p}, {size}) failed");
}

#[cfg(not(unix))]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  match Layout::from_size_align(size, PAGE_SIZE) {
    Ok(layout) => unsafe { System.alloc_zeroed(layout) },
    Err(_) => null_mut(),
  }
}

#[cfg(not(unix))]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { System.dealloc(ptr, Layout::from_size_align_unchecked(size, PAGE_SIZE)) };
}

// =============================================================================
// Tracked Pages
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
  reservations: AtomicUsize,
  bytes: AtomicUsize,
  budget: Option<usize>,
}

/// A [`PageSource`] wrapper that counts outstanding reservations and can
/// refuse to map beyond a byte budget.
///
/// Clones share their counters, so every component of one allocator reports
/// into the same totals.
#[derive(Clone, Debug)]
pub struct TrackedPages<S: PageSource = OsPages> {
  inner: S,
  counters: Arc<Counters>,
}

impl TrackedPages<OsPages> {
  pub fn new() -> Self {
    Self::wrap(OsPages)
  }

  /// Fails every mapping that would take the outstanding total above `budget` bytes.
  pub fn with_budget(budget: usize) -> Self {
    Self {
      inner: OsPages,
      counters: Arc::new(Counters {
        budget: Some(budget),
        ..Counters::default()
      }),
    }
  }
}

impl Default for TrackedPages<OsPages> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S: PageSource> TrackedPages<S> {
  pub fn wrap(inner: S) -> Self {
    Self {
      inner,
      counters: Arc::new(Counters::default()),
    }
  }

  /// Mappings handed out and not yet released.
  pub fn outstanding_reservations(&self) -> usize {
    self.counters.reservations.load(Ordering::Acquire)
  }

  /// Bytes handed out and not yet released.
  pub fn outstanding_bytes(&self) -> usize {
    self.counters.bytes.load(Ordering::Acquire)
  }
}

unsafe impl<S: PageSource> PageSource for TrackedPages<S> {
  fn allocate(&self, size: usize) -> *mut u8 {
    let counters = &self.counters;
    let total = counters.bytes.fetch_add(size, Ordering::AcqRel) + size;

    if counters.budget.is_some_and(|budget| total > budget) {
      counters.bytes.fetch_sub(size, Ordering::AcqRel);
      return null_mut();
    }

    let ptr = self.inner.allocate(size);
    if ptr.is_null() {
      counters.bytes.fetch_sub(size, Ordering::AcqRel);
    } else {
      counters.reservations.fetch_add(1, Ordering::AcqRel);
    }
    ptr
  }

  unsafe fn release(&self, ptr: *mut u8, size: usize) {
    unsafe { self.inner.release(ptr, size) };
    self.counters.reservations.fetch_sub(1, Ordering::AcqRel);
    self.counters.bytes.fetch_sub(size, Ordering::AcqRel);
  }
}

/// Maps at least `size` bytes rounded up to whole pages. Returns the pointer and the mapped size.
pub(crate) fn allocate_pages<S: PageSource>(pages: &S, size: usize) -> Option<(NonNull<u8>, usize)> {
  let size = align_up(size, PAGE_SIZE);
  match NonNull::new(pages.allocate(size)) {
    Some(ptr) => Some((ptr, size)),
    None => {
      log::warn!("streamflow: page source refused {size} bytes");
      None
    }
  }
}

// =============================================================================
// Spin Lock
// =============================================================================

/// Test-and-test-and-set lock. Held only for short buddy-list updates.
pub struct SpinLock<T> {
  locked: AtomicBool,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
  pub const fn new(data: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinLockGuard<'_, T> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinLockGuard { lock: self }
  }

  /// Exclusive access without locking; the borrow checker proves there are no other users.
  pub fn get_mut(&mut self) -> &mut T {
    self.data.get_mut()
  }
}

pub struct SpinLockGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.lock.data.get() }
  }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.data.get() }
  }
}

impl<T> Drop for SpinLockGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}
