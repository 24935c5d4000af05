use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  ptr::{self, NonNull, null_mut},
};
use std::{alloc::System, sync::OnceLock};

use crate::{
  PAGE_SIZE,
  context::{Streamflow, ThreadContext},
  heap::InternalHeap,
  os::OsPages,
};

// =============================================================================
// Process Context
// =============================================================================

/// `None` once initialization has failed, in which case everything goes to [`System`].
static CONTEXT: OnceLock<Option<Streamflow<OsPages>>> = OnceLock::new();

fn context() -> Option<&'static Streamflow<OsPages>> {
  CONTEXT
    .get_or_init(|| {
      Streamflow::initialize(OsPages)
        .inspect_err(|err| log::error!("streamflow: {err}, falling back to the system allocator"))
        .ok()
    })
    .as_ref()
}

/// Heap 0 of the process context, if it is already up. Never initializes.
#[inline]
fn ready_heap() -> Option<&'static InternalHeap<OsPages>> {
  CONTEXT
    .get()
    .and_then(Option::as_ref)
    .map(|streamflow| streamflow.internal_heap(0))
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static THREAD: UnsafeCell<Option<ThreadContext<'static>>> = const { UnsafeCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` with the calling thread's context, registering the thread on first use.
///
/// `None` when called re-entrantly, while TLS is being torn down, or when the
/// context cannot be set up. Callers then take a path that needs no
/// thread-local state.
fn with_thread<R>(f: impl FnOnce(&ThreadContext<'static>) -> Option<R>) -> Option<R> {
  IN_ALLOC
    .try_with(|flag| {
      if flag.replace(true) {
        return None;
      }

      let result = THREAD
        .try_with(|slot| {
          let slot = unsafe { &mut *slot.get() };
          if slot.is_none() {
            *slot = context()?.thread_initialize().ok();
          }
          slot.as_ref().and_then(f)
        })
        .ok()
        .flatten();

      flag.set(false);
      result
    })
    .ok()
    .flatten()
}

// =============================================================================
// Allocation Paths
// =============================================================================

/// Serves `size` bytes at `align` (at most [`PAGE_SIZE`]) from heap 0.
fn allocate(size: usize, align: usize) -> Option<NonNull<u8>> {
  with_thread(|thread| thread.default_heap().allocate_aligned(size, align))
    .or_else(|| ready_heap()?.allocate_detached(size))
}

/// Frees `ptr` if heap 0 owns it. `false` for foreign pointers.
unsafe fn deallocate(ptr: NonNull<u8>) -> bool {
  let Some(heap) = ready_heap() else {
    return false;
  };
  let Some(entry) = heap.lookup(ptr) else {
    return false;
  };

  let freed = with_thread(|thread| {
    unsafe { thread.default_heap().free_entry(ptr, entry) };
    Some(())
  });
  if freed.is_none() {
    unsafe { heap.free_detached(ptr, entry) };
  }
  true
}

fn usable_size(ptr: NonNull<u8>) -> Option<usize> {
  ready_heap()?.usable_size(ptr)
}

fn fits_in_place(ptr: NonNull<u8>, size: usize, align: usize) -> bool {
  ready_heap().is_some_and(|heap| heap.fits_in_place(ptr, size, align))
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Process-wide allocator over a lazily created [`Streamflow`] context.
///
/// ```no_run
/// #[global_allocator]
/// static GLOBAL: streamflow::Allocator = streamflow::Allocator;
/// ```
///
/// Each thread registers on its first allocation and finalizes from its TLS
/// destructor. Allocations made while the allocator is already active on the
/// thread, or after TLS teardown, are served page-granular without touching
/// thread-local state. Alignments above [`PAGE_SIZE`] and pointers the
/// allocator does not own go to [`System`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Allocator;

impl Allocator {
  /// Bytes usable at `ptr`, or `None` if the allocator did not hand it out.
  pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    usable_size(NonNull::new(ptr.cast_mut())?)
  }
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > PAGE_SIZE {
      return unsafe { System.alloc(layout) };
    }

    match allocate(layout.size(), layout.align()) {
      Some(ptr) => ptr.as_ptr(),
      None if ready_heap().is_none() => unsafe { System.alloc(layout) },
      None => null_mut(),
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    let Some(nonnull) = NonNull::new(ptr) else {
      return;
    };
    if !unsafe { deallocate(nonnull) } {
      unsafe { System.dealloc(ptr, layout) };
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if let Some(current) = NonNull::new(ptr)
      && layout.align() <= PAGE_SIZE
      && fits_in_place(current, new_size, layout.align())
    {
      return ptr;
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// Alignment `malloc` guarantees.
#[cfg(feature = "c_api")]
const MALLOC_ALIGN: usize = 16;

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  allocate(size, MALLOC_ALIGN).map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  // Foreign pointers (e.g. from the loader's early allocator) are ignored.
  if let Some(ptr) = NonNull::new(ptr) {
    unsafe { deallocate(ptr) };
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let Some(ptr) = allocate(total, MALLOC_ALIGN) else {
    return null_mut();
  };
  unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
  ptr.as_ptr()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(current) = NonNull::new(ptr) else {
    return unsafe { malloc(size) };
  };
  if size == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }
  if fits_in_place(current, size, MALLOC_ALIGN) {
    return ptr;
  }

  let Some(old_size) = usable_size(current) else {
    return null_mut();
  };
  let Some(new_ptr) = allocate(size, MALLOC_ALIGN) else {
    return null_mut();
  };
  unsafe {
    ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size.min(size));
    deallocate(current);
  }
  new_ptr.as_ptr()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() || alignment > PAGE_SIZE {
    return libc::EINVAL;
  }
  match allocate(size, alignment) {
    Some(ptr) => {
      unsafe { *memptr = ptr.as_ptr() };
      0
    }
    None => libc::ENOMEM,
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr).and_then(usable_size).unwrap_or(0)
}
