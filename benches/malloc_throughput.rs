use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::{
  alloc::{GlobalAlloc, Layout},
  hint::black_box,
  ptr::NonNull,
  sync::mpsc,
  thread,
};
use streamflow::{Allocator, Heap, OsPages, Streamflow};

const OPS: u64 = 100_000;

/// Thread-local heap alloc/free throughput.
fn heap_malloc_free(heap: Heap<'_>, size: usize) {
  for _ in 0..OPS {
    let ptr = heap.allocate(size).expect("out of memory");
    black_box(ptr);
    unsafe { heap.free(ptr) };
  }
}

/// `GlobalAlloc` adapter throughput, thread registration included on first use.
fn global_malloc_free(size: usize) {
  let layout = Layout::from_size_align(size, 8).expect("layout");
  for _ in 0..OPS {
    unsafe {
      let ptr = Allocator.alloc(layout);
      black_box(ptr);
      Allocator.dealloc(ptr, layout);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let streamflow = Streamflow::initialize(OsPages).expect("initialize");
  let thread = streamflow.thread_initialize().expect("thread_initialize");
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("streamflow", size), &size, |b, &size| {
      b.iter(|| heap_malloc_free(thread.default_heap(), size))
    });

    group.bench_with_input(BenchmarkId::new("global_alloc", size), &size, |b, &size| {
      b.iter(|| global_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Producer allocates, consumer frees: every free takes the remote path.
fn benchmark_remote_free(c: &mut Criterion) {
  let streamflow = Streamflow::initialize(OsPages).expect("initialize");
  let mut group = c.benchmark_group("remote_free");
  group.throughput(Throughput::Elements(OPS));

  for size in [64, 512] {
    group.bench_with_input(BenchmarkId::new("streamflow", size), &size, |b, &size| {
      b.iter(|| {
        thread::scope(|s| {
          let (tx, rx) = mpsc::sync_channel::<usize>(1024);
          let streamflow = &streamflow;
          s.spawn(move || {
            let consumer = streamflow.thread_initialize().expect("thread_initialize");
            let heap = consumer.default_heap();
            for addr in rx {
              unsafe { heap.free(NonNull::new(addr as *mut u8).expect("non-null")) };
            }
          });

          let producer = streamflow.thread_initialize().expect("thread_initialize");
          let heap = producer.default_heap();
          for _ in 0..OPS {
            let ptr = heap.allocate(size).expect("out of memory");
            tx.send(ptr.as_ptr() as usize).expect("consumer alive");
          }
        })
      })
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_remote_free);
criterion_main!(benches);
