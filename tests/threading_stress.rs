use std::{
  ptr::NonNull,
  sync::{Barrier, Mutex},
  thread,
};

use streamflow::{Heap, Streamflow, TrackedPages};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 100_000;
const MAX_SIZE: usize = 4096;
const MAX_LIVE: usize = 2_000;

fn xorshift(state: &mut u64) -> u64 {
  *state ^= *state << 13;
  *state ^= *state >> 7;
  *state ^= *state << 17;
  *state
}

/// A live object with a canary byte at both ends.
#[derive(Clone, Copy)]
struct Object {
  addr: usize,
  size: usize,
  tag: u8,
}

impl Object {
  fn new(ptr: NonNull<u8>, size: usize, tag: u8) -> Self {
    unsafe {
      ptr.as_ptr().write(tag);
      ptr.as_ptr().add(size - 1).write(tag);
    }
    Self {
      addr: ptr.as_ptr() as usize,
      size,
      tag,
    }
  }

  fn ptr(&self) -> NonNull<u8> {
    NonNull::new(self.addr as *mut u8).unwrap()
  }

  fn check(&self) {
    let ptr = self.addr as *const u8;
    let (head, tail) = unsafe { (ptr.read(), ptr.add(self.size - 1).read()) };
    assert_eq!(head, self.tag, "head canary of {:#x} ({} bytes) overwritten", self.addr, self.size);
    assert_eq!(tail, self.tag, "tail canary of {:#x} ({} bytes) overwritten", self.addr, self.size);
  }

  fn free(self, heap: Heap<'_, TrackedPages>) {
    self.check();
    unsafe { heap.free(self.ptr()) };
  }
}

#[test]
fn concurrent_random_operations_with_remote_frees() {
  let pages = TrackedPages::new();
  let streamflow = Streamflow::initialize(pages.clone()).unwrap();
  let shared: Mutex<Vec<Object>> = Mutex::new(Vec::new());
  let barrier = Barrier::new(THREADS);

  thread::scope(|s| {
    for index in 0..THREADS {
      let (streamflow, shared, barrier) = (&streamflow, &shared, &barrier);
      s.spawn(move || {
        let context = streamflow.thread_initialize().unwrap();
        let heap = context.default_heap();
        let mut rng = 0x2545_F491_4F6C_DD1D ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut live: Vec<Object> = Vec::new();
        barrier.wait();

        for op in 0..OPS_PER_THREAD {
          let roll = xorshift(&mut rng);

          if roll % 16 == 0 {
            let foreign = shared.lock().unwrap().pop();
            if let Some(object) = foreign {
              object.free(heap);
              continue;
            }
          }

          if !live.is_empty() && (live.len() >= MAX_LIVE || roll % 2 == 0) {
            let object = live.swap_remove((roll >> 8) as usize % live.len());
            if (roll >> 32) % 10 == 0 {
              object.check();
              shared.lock().unwrap().push(object);
            } else {
              object.free(heap);
            }
            continue;
          }

          let size = (roll >> 16) as usize % MAX_SIZE + 1;
          let ptr = heap.allocate(size).expect("out of memory");
          assert!(heap.usable_size(ptr).unwrap() >= size);
          live.push(Object::new(ptr, size, (op as u8) ^ (index as u8) << 5));
        }

        for object in live {
          object.free(heap);
        }
      });
    }
  });

  // Whatever is still queued belongs to threads that have already finalized.
  let context = streamflow.thread_initialize().unwrap();
  for object in shared.into_inner().unwrap() {
    object.free(context.default_heap());
  }
  drop(context);

  streamflow.finalize();
  assert_eq!(pages.outstanding_reservations(), 0);
  assert_eq!(pages.outstanding_bytes(), 0);
}

#[test]
fn live_allocations_never_overlap_across_threads() {
  const PER_THREAD: usize = 5_000;

  let pages = TrackedPages::new();
  let streamflow = Streamflow::initialize(pages.clone()).unwrap();

  let mut ranges: Vec<(usize, usize)> = thread::scope(|s| {
    let workers: Vec<_> = (0..4)
      .map(|index| {
        let streamflow = &streamflow;
        s.spawn(move || {
          let context = streamflow.thread_initialize().unwrap();
          let heap = context.default_heap();
          let mut rng = 0xDEAD_BEEF_u64 + index;
          (0..PER_THREAD)
            .map(|_| {
              let size = xorshift(&mut rng) as usize % 3_000 + 1;
              let ptr = heap.allocate(size).unwrap();
              (ptr.as_ptr() as usize, heap.usable_size(ptr).unwrap())
            })
            .collect::<Vec<_>>()
        })
      })
      .collect();
    workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
  });

  ranges.sort_unstable();
  for pair in ranges.windows(2) {
    assert!(
      pair[0].0 + pair[0].1 <= pair[1].0,
      "{:#x}+{} overlaps {:#x}",
      pair[0].0,
      pair[0].1,
      pair[1].0
    );
  }

  // Every owner has finalized: these frees adopt orphaned blocks.
  let context = streamflow.thread_initialize().unwrap();
  let heap = context.default_heap();
  for &(addr, _) in &ranges {
    unsafe { heap.free(NonNull::new(addr as *mut u8).unwrap()) };
  }
  drop(context);

  streamflow.finalize();
  assert_eq!(pages.outstanding_bytes(), 0);
}
