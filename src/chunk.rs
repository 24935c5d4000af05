use core::{
  marker::PhantomData,
  mem::MaybeUninit,
  ptr::{NonNull, null_mut},
};

use crate::{PAGE_SIZE, align_up, os::PageSource};

const CHUNK_SIZE: usize = PAGE_SIZE;

struct ChunkHeader {
  next: *mut ChunkHeader,
}

struct FreeRecord {
  next: *mut FreeRecord,
}

/// Fixed-size record allocator carving `T`-sized slots out of 4 KiB chunks.
///
/// Freed records are reused before a chunk is bumped further. Chunks go back
/// to the page source only when the heap is dropped.
pub(crate) struct ChunkHeap<T, S: PageSource> {
  pages: S,
  chunks: *mut ChunkHeader,
  free: *mut FreeRecord,
  /// Next unused slot in the newest chunk, `CHUNK_SIZE` when exhausted.
  bump: usize,
  _marker: PhantomData<T>,
}

unsafe impl<T, S: PageSource> Send for ChunkHeap<T, S> {}

impl<T, S: PageSource> ChunkHeap<T, S> {
  const RECORD_ALIGN: usize = max(align_of::<T>(), align_of::<FreeRecord>());
  const RECORD_SIZE: usize = align_up(max(size_of::<T>(), size_of::<FreeRecord>()), Self::RECORD_ALIGN);
  const FIRST_RECORD: usize = align_up(size_of::<ChunkHeader>(), Self::RECORD_ALIGN);

  pub(crate) fn new(pages: S) -> Self {
    Self {
      pages,
      chunks: null_mut(),
      free: null_mut(),
      bump: CHUNK_SIZE,
      _marker: PhantomData,
    }
  }

  /// An uninitialized record, or `None` when no chunk can be mapped.
  pub(crate) fn allocate(&mut self) -> Option<NonNull<MaybeUninit<T>>> {
    const { assert!(Self::FIRST_RECORD + Self::RECORD_SIZE <= CHUNK_SIZE) };

    if let Some(record) = NonNull::new(self.free) {
      self.free = unsafe { record.as_ref() }.next;
      return Some(record.cast());
    }

    if self.bump + Self::RECORD_SIZE > CHUNK_SIZE {
      let chunk = self.pages.allocate(CHUNK_SIZE) as *mut ChunkHeader;
      if chunk.is_null() {
        log::warn!("streamflow: no memory for a metadata chunk");
        return None;
      }
      unsafe { chunk.write(ChunkHeader { next: self.chunks }) };
      self.chunks = chunk;
      self.bump = Self::FIRST_RECORD;
    }

    let record = unsafe { (self.chunks as *mut u8).add(self.bump) };
    self.bump += Self::RECORD_SIZE;
    NonNull::new(record.cast())
  }

  /// # Safety
  /// `record` must come from this heap's `allocate`, and any value in it must already be dropped.
  pub(crate) unsafe fn free(&mut self, record: NonNull<T>) {
    let record = record.cast::<FreeRecord>();
    unsafe { record.write(FreeRecord { next: self.free }) };
    self.free = record.as_ptr();
  }
}

impl<T, S: PageSource> Drop for ChunkHeap<T, S> {
  fn drop(&mut self) {
    let mut chunk = self.chunks;
    while !chunk.is_null() {
      let next = unsafe { (*chunk).next };
      unsafe { self.pages.release(chunk as *mut u8, CHUNK_SIZE) };
      chunk = next;
    }
  }
}

const fn max(a: usize, b: usize) -> usize {
  if a > b { a } else { b }
}
