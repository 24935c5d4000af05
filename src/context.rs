use core::{
  fmt,
  mem::MaybeUninit,
  ptr::NonNull,
  sync::atomic::{AtomicU32, Ordering},
};

use crate::{
  HEAP_COUNT, PAGE_SIZE, THREAD_ID_ORPHAN, align_up,
  heap::{InternalHeap, ThreadLocalHeapInfo, ThreadLocalInfo},
  os::{OsPages, PageSource, allocate_pages},
  page_map::MapEntry,
};

const THREAD_INFO_SIZE: usize = align_up(size_of::<ThreadLocalHeapInfo>(), PAGE_SIZE);

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InitError {
  /// The page source refused to map the allocator's bookkeeping.
  NoMemory,
}

impl fmt::Display for InitError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InitError::NoMemory => f.write_str("out of memory while initializing the allocator"),
    }
  }
}

impl std::error::Error for InitError {}

// =============================================================================
// Streamflow
// =============================================================================

/// An allocator instance: [`HEAP_COUNT`] independent internal heaps drawing
/// memory from one page source.
///
/// Threads register with [`Streamflow::thread_initialize`] and allocate
/// through the [`Heap`] handles of the returned [`ThreadContext`]. Dropping
/// the context (or calling [`Streamflow::finalize`]) releases every page the
/// heaps still hold, so all thread contexts must be gone first, which the
/// borrow checker enforces.
pub struct Streamflow<S: PageSource = OsPages> {
  heaps: [InternalHeap<S>; HEAP_COUNT],
  next_thread_id: AtomicU32,
  pages: S,
}

impl<S: PageSource> Streamflow<S> {
  pub fn initialize(pages: S) -> Result<Self, InitError> {
    let mut heaps: [MaybeUninit<InternalHeap<S>>; HEAP_COUNT] =
      core::array::from_fn(|_| MaybeUninit::uninit());
    let mut built = 0;
    for slot in heaps.iter_mut() {
      let Some(heap) = InternalHeap::new(built, pages.clone()) else {
        break;
      };
      slot.write(heap);
      built += 1;
    }

    if built < HEAP_COUNT {
      for heap in &mut heaps[..built] {
        unsafe { heap.assume_init_drop() };
      }
      log::warn!("streamflow: no memory for the address map of heap {built}");
      return Err(InitError::NoMemory);
    }

    log::debug!("streamflow: initialized {HEAP_COUNT} heaps");
    Ok(Self {
      // Every slot was written above.
      heaps: heaps.map(|heap| unsafe { heap.assume_init() }),
      next_thread_id: AtomicU32::new(1),
      pages,
    })
  }

  /// Releases everything. Same as dropping the context.
  pub fn finalize(self) {}

  /// Registers the calling thread. Its thread-local state lives until the
  /// returned context is finalized or dropped.
  pub fn thread_initialize(&self) -> Result<ThreadContext<'_, S>, InitError> {
    // Ids are never reused: blocks of a finished thread may still carry its id.
    let id = self
      .next_thread_id
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
        (id < THREAD_ID_ORPHAN - 1).then_some(id + 1)
      })
      .map_err(|_| InitError::NoMemory)?;

    let (memory, _) = allocate_pages(&self.pages, THREAD_INFO_SIZE).ok_or(InitError::NoMemory)?;
    let info = memory.cast::<ThreadLocalHeapInfo>();
    unsafe { info.write(ThreadLocalHeapInfo::new(id)) };

    log::debug!("streamflow: thread {id} initialized");
    Ok(ThreadContext {
      streamflow: self,
      info,
    })
  }

  #[inline]
  pub fn page_source(&self) -> &S {
    &self.pages
  }

  #[inline]
  pub(crate) fn internal_heap(&self, index: usize) -> &InternalHeap<S> {
    &self.heaps[index]
  }
}

impl<S: PageSource> Drop for Streamflow<S> {
  fn drop(&mut self) {
    log::debug!("streamflow: finalized");
  }
}

// =============================================================================
// Thread Context
// =============================================================================

/// One thread's registration with a [`Streamflow`] instance.
///
/// Dropping it hands the thread's page blocks to the shared pools, where
/// other threads adopt them.
pub struct ThreadContext<'a, S: PageSource = OsPages> {
  streamflow: &'a Streamflow<S>,
  info: NonNull<ThreadLocalHeapInfo>,
}

// Thread-local state is keyed by thread id, not by OS thread.
unsafe impl<S: PageSource> Send for ThreadContext<'_, S> {}

impl<'a, S: PageSource> ThreadContext<'a, S> {
  #[inline]
  pub fn id(&self) -> u32 {
    self.local(0).thread_id()
  }

  /// Handle to internal heap `index`, or `None` past [`HEAP_COUNT`].
  pub fn heap(&self, index: usize) -> Option<Heap<'_, S>> {
    (index < HEAP_COUNT).then(|| Heap {
      internal: self.streamflow.internal_heap(index),
      local: self.local(index),
    })
  }

  /// Handle to heap 0.
  #[inline]
  pub fn default_heap(&self) -> Heap<'_, S> {
    Heap {
      internal: self.streamflow.internal_heap(0),
      local: self.local(0),
    }
  }

  /// Same as dropping the context.
  pub fn finalize(self) {}

  #[inline]
  fn local(&self, index: usize) -> &ThreadLocalInfo {
    unsafe { self.info.as_ref() }.info(index)
  }
}

impl<S: PageSource> Drop for ThreadContext<'_, S> {
  fn drop(&mut self) {
    let id = self.id();
    for index in 0..HEAP_COUNT {
      self
        .streamflow
        .internal_heap(index)
        .thread_finalize(self.local(index));
    }
    unsafe {
      self
        .streamflow
        .pages
        .release(self.info.as_ptr().cast(), THREAD_INFO_SIZE)
    };
    log::debug!("streamflow: thread {id} finalized");
  }
}

// =============================================================================
// Heap
// =============================================================================

/// A thread's handle to one internal heap.
pub struct Heap<'t, S: PageSource = OsPages> {
  internal: &'t InternalHeap<S>,
  local: &'t ThreadLocalInfo,
}

impl<S: PageSource> Clone for Heap<'_, S> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<S: PageSource> Copy for Heap<'_, S> {}

impl<S: PageSource> Heap<'_, S> {
  #[inline]
  pub fn index(&self) -> usize {
    self.internal.index()
  }

  /// At least `size` bytes, aligned to 4. `None` when out of memory.
  ///
  /// Sizes below [`LARGE_OBJECT_THRESHOLD`](crate::LARGE_OBJECT_THRESHOLD) come
  /// from a size-class page block; larger requests map whole pages.
  #[inline]
  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    self.internal.allocate(self.local, size)
  }

  /// Like [`Heap::allocate`], aligned to `align`, a power of two up to [`PAGE_SIZE`].
  pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() || align > PAGE_SIZE {
      return None;
    }
    self.internal.allocate_aligned(self.local, size, align)
  }

  /// Frees an allocation of this heap, from any thread registered with the same context.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap and must not be used afterwards.
  pub unsafe fn free(&self, ptr: NonNull<u8>) {
    let freed = unsafe { self.internal.free(self.local, ptr) };
    debug_assert!(freed, "{ptr:p} was not allocated by heap {}", self.index());
  }

  /// Resizes `ptr` to `size` bytes, keeping its leading contents.
  ///
  /// `None` as input allocates; a zero `size` frees and returns `None`. The
  /// same pointer comes back when it already fits the new size. On failure
  /// `ptr` is left allocated and untouched.
  ///
  /// # Safety
  /// `ptr`, if given, must be a live allocation of this heap. It must not be
  /// used afterwards unless `None` is returned for a non-zero `size`.
  pub unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    let Some(ptr) = ptr else {
      return self.allocate(size);
    };
    if size == 0 {
      unsafe { self.free(ptr) };
      return None;
    }
    unsafe { self.internal.reallocate(self.local, ptr, size, 1) }
  }

  /// Bytes usable at `ptr`, or `None` if this heap did not allocate it.
  #[inline]
  pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
    self.internal.usable_size(ptr)
  }

  /// # Safety
  /// `entry` must be the map entry of the live allocation `ptr` of this heap.
  #[inline]
  pub(crate) unsafe fn free_entry(&self, ptr: NonNull<u8>, entry: MapEntry) {
    unsafe { self.internal.free_entry(self.local, ptr, entry) }
  }
}
