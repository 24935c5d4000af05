//! Intrusive LIFO stacks of page blocks.
//!
//! [`ConcurrentStack`] backs the orphan and free pools shared by all threads;
//! [`Stack`] is the single-threaded variant used for a thread's inactive blocks.

use core::{
  cell::Cell,
  hint,
  marker::PhantomData,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

/// A node that can be threaded onto a stack.
///
/// # Safety
/// Implementors must be aligned to at least [`NODE_ALIGN`] bytes, and
/// `stack_link` must always return the same slot, which nothing else writes
/// while the node is on a stack.
pub unsafe trait StackLink: Sized {
  fn stack_link(&self) -> &AtomicPtr<Self>;
}

/// Required node alignment. The low bits of a node address are dropped when packed into the top word.
pub const NODE_ALIGN: usize = 1 << NODE_SHIFT;

const NODE_SHIFT: u32 = 7;
const ADDRESS_BITS: u32 = 41; // 48-bit virtual addresses
const VERSION_BITS: u32 = 64 - ADDRESS_BITS;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;

const _: () = assert!(VERSION_BITS == 23);

#[inline(always)]
fn pack<T>(ptr: *mut T, version: u64) -> u64 {
  let addr = ptr as usize as u64;
  debug_assert!(addr & (NODE_ALIGN as u64 - 1) == 0, "misaligned stack node {ptr:p}");
  debug_assert!(addr >> (ADDRESS_BITS + NODE_SHIFT) == 0, "stack node {ptr:p} above 2^48");
  (addr >> NODE_SHIFT) | ((version & VERSION_MASK) << ADDRESS_BITS)
}

#[inline(always)]
fn unpack<T>(top: u64) -> *mut T {
  ((top & ADDRESS_MASK) << NODE_SHIFT) as usize as *mut T
}

#[inline(always)]
fn version(top: u64) -> u64 {
  top >> ADDRESS_BITS
}

/// Bounded exponential backoff between failed CAS attempts.
struct Backoff {
  step: u32,
}

impl Backoff {
  const LIMIT: u32 = 6;

  fn new() -> Self {
    Self { step: 0 }
  }

  fn spin(&mut self) {
    for _ in 0..(1u32 << self.step) {
      hint::spin_loop();
    }
    if self.step < Self::LIMIT {
      self.step += 1;
    }
  }
}

// =============================================================================
// Concurrent Stack
// =============================================================================

/// Lock-free Treiber stack with a versioned top word.
///
/// The top packs the node address (shifted right by 7) with a 23-bit version
/// bumped on every successful update, so a pop that raced a pop-push of the
/// same node fails its CAS. The element count lives in its own counter: it is
/// raised before a push becomes visible and lowered after a pop, so it never
/// under-reports.
#[repr(C, align(64))]
pub struct ConcurrentStack<T: StackLink> {
  top: AtomicU64,
  len: AtomicUsize,
  _marker: PhantomData<*mut T>,
}

unsafe impl<T: StackLink + Sync> Send for ConcurrentStack<T> {}
unsafe impl<T: StackLink + Sync> Sync for ConcurrentStack<T> {}

impl<T: StackLink> ConcurrentStack<T> {
  pub const fn new() -> Self {
    Self {
      top: AtomicU64::new(0),
      len: AtomicUsize::new(0),
      _marker: PhantomData,
    }
  }

  /// # Safety
  /// `node` must be valid, suitably aligned, and not on any stack.
  pub unsafe fn push(&self, node: NonNull<T>) {
    self.len.fetch_add(1, Ordering::Relaxed);

    let link = unsafe { node.as_ref() }.stack_link();
    let mut backoff = Backoff::new();
    let mut top = self.top.load(Ordering::Relaxed);
    loop {
      link.store(unpack(top), Ordering::Relaxed);
      let new_top = pack(node.as_ptr(), version(top) + 1);
      match self
        .top
        .compare_exchange_weak(top, new_top, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => return,
        Err(current) => {
          top = current;
          backoff.spin();
        }
      }
    }
  }

  /// Pushes unless the stack already holds `limit` nodes. The check is approximate under contention.
  ///
  /// # Safety
  /// Same as [`ConcurrentStack::push`].
  pub unsafe fn push_bounded(&self, node: NonNull<T>, limit: usize) -> bool {
    if self.len() >= limit {
      return false;
    }
    unsafe { self.push(node) };
    true
  }

  pub fn pop(&self) -> Option<NonNull<T>> {
    let mut backoff = Backoff::new();
    let mut top = self.top.load(Ordering::Acquire);
    loop {
      let node = NonNull::new(unpack::<T>(top))?;
      let next = unsafe { node.as_ref() }.stack_link().load(Ordering::Relaxed);
      let new_top = pack(next, version(top) + 1);
      match self
        .top
        .compare_exchange_weak(top, new_top, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => {
          self.len.fetch_sub(1, Ordering::Relaxed);
          return Some(node);
        }
        Err(current) => {
          top = current;
          backoff.spin();
        }
      }
    }
  }

  /// Number of nodes, possibly counting a push still in flight.
  pub fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  pub fn is_empty(&self) -> bool {
    unpack::<T>(self.top.load(Ordering::Acquire)).is_null()
  }
}

impl<T: StackLink> Default for ConcurrentStack<T> {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Stack
// =============================================================================

/// Single-threaded intrusive stack over the same link slot.
pub struct Stack<T: StackLink> {
  top: Cell<*mut T>,
  len: Cell<usize>,
}

impl<T: StackLink> Stack<T> {
  pub const fn new() -> Self {
    Self {
      top: Cell::new(null_mut()),
      len: Cell::new(0),
    }
  }

  /// # Safety
  /// `node` must be valid and not on any stack.
  pub unsafe fn push(&self, node: NonNull<T>) {
    unsafe { node.as_ref() }
      .stack_link()
      .store(self.top.get(), Ordering::Relaxed);
    self.top.set(node.as_ptr());
    self.len.set(self.len.get() + 1);
  }

  pub fn pop(&self) -> Option<NonNull<T>> {
    let node = NonNull::new(self.top.get())?;
    let next = unsafe { node.as_ref() }.stack_link().load(Ordering::Relaxed);
    self.top.set(next);
    self.len.set(self.len.get() - 1);
    Some(node)
  }

  pub fn len(&self) -> usize {
    self.len.get()
  }

  pub fn is_empty(&self) -> bool {
    self.top.get().is_null()
  }
}

impl<T: StackLink> Default for Stack<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{collections::HashSet, sync::Mutex, thread};

  #[repr(align(128))]
  struct Node {
    link: AtomicPtr<Node>,
    id: usize,
  }

  unsafe impl StackLink for Node {
    fn stack_link(&self) -> &AtomicPtr<Self> {
      &self.link
    }
  }

  fn nodes(n: usize) -> Vec<Node> {
    (0..n)
      .map(|id| Node {
        link: AtomicPtr::new(null_mut()),
        id,
      })
      .collect()
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn pack_round_trips_aligned_pointers() {
    let addr = 0x7fff_ffff_ff80usize as *mut Node;
    let top = pack(addr, VERSION_MASK);
    assert_eq!(unpack::<Node>(top), addr);
    assert_eq!(version(top), VERSION_MASK);
    assert_eq!(version(pack(addr, VERSION_MASK + 1)), 0);
  }

  #[test]
  fn concurrent_stack_is_lifo() {
    let mut nodes = nodes(3);
    let stack = ConcurrentStack::new();
    assert!(stack.is_empty());

    for node in nodes.iter_mut() {
      unsafe { stack.push(NonNull::from(node)) };
    }
    assert_eq!(stack.len(), 3);

    let order: Vec<usize> = core::iter::from_fn(|| stack.pop())
      .map(|node| unsafe { node.as_ref() }.id)
      .collect();
    assert_eq!(order, [2, 1, 0]);
    assert!(stack.is_empty());
    assert_eq!(stack.len(), 0);
  }

  #[test]
  fn bounded_push_respects_limit() {
    let mut nodes = nodes(3);
    let stack = ConcurrentStack::new();
    let [a, b, c] = nodes.as_mut_slice() else {
      unreachable!()
    };

    unsafe {
      assert!(stack.push_bounded(NonNull::from(a), 2));
      assert!(stack.push_bounded(NonNull::from(b), 2));
      assert!(!stack.push_bounded(NonNull::from(c), 2));
    }
    assert_eq!(stack.len(), 2);
  }

  #[test]
  fn concurrent_push_pop_loses_nothing() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1_000;
    const ROUNDS: usize = 20;

    struct SendPtr(NonNull<Node>);
    unsafe impl Send for SendPtr {}

    let mut nodes = nodes(THREADS * PER_THREAD);
    let stack = ConcurrentStack::<Node>::new();
    let chunks: Vec<Vec<SendPtr>> = nodes
      .chunks_mut(PER_THREAD)
      .map(|chunk| chunk.iter_mut().map(|n| SendPtr(NonNull::from(n))).collect())
      .collect();
    let popped = Mutex::new(Vec::new());

    thread::scope(|s| {
      for chunk in chunks {
        let (stack, popped) = (&stack, &popped);
        s.spawn(move || {
          let mut mine: Vec<NonNull<Node>> = chunk.into_iter().map(|p| p.0).collect();
          for _ in 0..ROUNDS {
            for node in mine.drain(..) {
              unsafe { stack.push(node) };
            }
            while mine.len() < PER_THREAD {
              match stack.pop() {
                Some(node) => mine.push(node),
                None => break,
              }
            }
          }
          popped
            .lock()
            .unwrap()
            .extend(mine.into_iter().map(|n| unsafe { n.as_ref() }.id));
        });
      }
    });

    let held = popped.into_inner().unwrap();
    let mut seen: HashSet<usize> = held.iter().copied().collect();
    assert_eq!(seen.len(), held.len(), "node held by two threads");
    while let Some(node) = stack.pop() {
      assert!(seen.insert(unsafe { node.as_ref() }.id), "node popped twice");
    }
    assert_eq!(seen.len(), THREADS * PER_THREAD);
    assert_eq!(stack.len(), 0);
  }

  #[test]
  fn local_stack_counts() {
    let mut nodes = nodes(2);
    let stack = Stack::new();
    for node in nodes.iter_mut() {
      unsafe { stack.push(NonNull::from(node)) };
    }
    assert_eq!(stack.len(), 2);
    assert_eq!(stack.pop().map(|n| unsafe { n.as_ref() }.id), Some(1));
    assert_eq!(stack.pop().map(|n| unsafe { n.as_ref() }.id), Some(0));
    assert!(stack.pop().is_none());
    assert!(stack.is_empty());
  }
}
