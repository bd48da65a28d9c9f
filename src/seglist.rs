//! # Segregated free-list engine
//!
//! The same boundary-tag heap as the implicit engine, with an index bolted
//! on: free blocks are threaded onto one of eleven size-class lists whose
//! heads live at the very base of the heap, before the padding word.
//!
//! ```text
//!   heap base
//!      │
//!      ▼
//!   ┌──────────────┬─────────┬──────────┬───────────────────────┬────┐
//!   │ bucket heads │ padding │ prologue │    regular blocks     │ ep │
//!   │  [0] ── ─ ─ ─│─ ─ ─ ─ ─│─ ─ ─ ─ ─ │─ ► free ─► free ─► ∅  │    │
//!   │  [1] ──► ∅   │         │          │                       │    │
//!   │  ...         │         │          │                       │    │
//!   │  [10] ─► ∅   │         │          │                       │    │
//!   └──────────────┴─────────┴──────────┴───────────────────────┴────┘
//! ```
//!
//! Bucket `i` holds free blocks whose payload falls in `(2^(i+2), 2^(i+3)]`;
//! bucket 0 absorbs everything up to 8 bytes and bucket 10 everything past
//! 4096. A free block stores its list links in its own payload:
//!
//! ```text
//!       ┌──────────┬────────────┬────────────┬───────────┬──────────┐
//!       │  header  │ next link  │ prev link  │  unused   │  footer  │
//!       └──────────┴────────────┴────────────┴───────────┴──────────┘
//!                  ▲
//!                  bp
//! ```
//!
//! The smallest class is the exception: its 8-byte payloads hold exactly
//! one pointer, so bucket 0 is singly linked and removal walks from the
//! head. Everywhere else the prev link of a first node points at the
//! bucket head slot itself, which makes unlinking a plain word store with
//! no head special-case.

use std::ptr;

use crate::align::{align, is_aligned};
use crate::block::{
  BASE_SIZE, MIN_BLK_SIZE, OVERHEAD, block_size, coalesce, is_allocated, is_epilogue, next_block,
  payload_size, place, prev_allocated, prev_block, prev_size, set_block, set_epilogue,
  valid_alloc_block, write_base_sentinels,
};
use crate::dump::{HeapStats, check_heap, dump_heap};
use crate::heap::{HeapError, HeapSegment, MAX_HEAP};

/// Number of size-class buckets.
pub const BUCKETS: usize = 11;

const LINK_SIZE: usize = size_of::<*mut u8>();
const TABLE_SIZE: usize = BUCKETS * LINK_SIZE;

/// Size class for a payload of `v` bytes: floor-log2, rounded up for
/// non-powers-of-two, rebased so that 8-byte payloads land in bucket 0,
/// and clamped to the table.
fn bucket_index(v: usize) -> usize {
  debug_assert!(v > 0);

  let v = v as u32;
  let round_up = u32::from(!v.is_power_of_two());
  ((v.ilog2() + round_up).saturating_sub(3) as usize).min(BUCKETS - 1)
}

#[inline]
unsafe fn next_free(p: *mut u8) -> *mut u8 {
  unsafe { p.cast::<*mut u8>().read() }
}

#[inline]
unsafe fn set_next_free(
  p: *mut u8,
  next: *mut u8,
) {
  unsafe { p.cast::<*mut u8>().write(next) };
}

#[inline]
unsafe fn prev_free(p: *mut u8) -> *mut u8 {
  unsafe { p.cast::<*mut u8>().add(1).read() }
}

#[inline]
unsafe fn set_prev_free(
  p: *mut u8,
  prev: *mut u8,
) {
  unsafe { p.cast::<*mut u8>().add(1).write(prev) };
}

/// Boundary-tag allocator indexed by segregated free lists.
pub struct SegregatedAllocator {
  heap: HeapSegment,

  /// The eleven bucket heads, at the base of the heap.
  table: *mut *mut u8,

  /// Prologue block pointer; heap walks start here.
  base: *mut u8,
}

impl SegregatedAllocator {
  /// Sets up a heap capped at [`MAX_HEAP`]: bucket table, sentinels.
  pub fn new() -> Result<Self, HeapError> {
    Self::with_capacity(MAX_HEAP)
  }

  /// Same as [`SegregatedAllocator::new`] with an explicit cap.
  pub fn with_capacity(cap: usize) -> Result<Self, HeapError> {
    let mut heap = HeapSegment::new(cap)?;
    let table_base = heap.sbrk(TABLE_SIZE + BASE_SIZE)?;

    unsafe { ptr::write_bytes(table_base, 0, TABLE_SIZE) };
    let listp = unsafe { write_base_sentinels(table_base.add(TABLE_SIZE)) };

    Ok(Self { heap, table: table_base.cast(), base: listp })
  }

  /// Allocates at least `size` bytes and returns an 8-aligned payload
  /// pointer, or null when `size` is zero or the heap is exhausted.
  ///
  /// # Safety
  ///
  /// The returned memory is uninitialised; the caller must write before
  /// reading and must not touch bytes past the requested size.
  pub unsafe fn malloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    if size == 0 || size > self.heap.capacity() {
      return ptr::null_mut();
    }

    let asize = align(size);

    for index in bucket_index(asize)..BUCKETS {
      if let Some(bp) = unsafe { self.take_from_bucket(index, asize) } {
        return bp;
      }
    }

    // every bucket missed: map a fresh block
    let total = asize + OVERHEAD;
    match self.extend(total) {
      Some(bp) => {
        unsafe { set_block(bp, total, true) };
        bp
      }
      None => ptr::null_mut(),
    }
  }

  /// Returns the block at `ptr` to its size class, merging it with free
  /// neighbours first. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this allocator's `malloc`/`realloc`
  /// and not freed since.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    if ptr.is_null() {
      return;
    }

    unsafe {
      set_block(ptr, block_size(ptr), false);
      self.insert(ptr);
    }
  }

  /// Resizes the allocation at `ptr` to at least `size` bytes, preserving
  /// the payload up to the smaller of the two sizes.
  ///
  /// Null `ptr` behaves as `malloc(size)`; zero `size` behaves as
  /// `free(ptr)` and returns null. Returns null when `ptr` fails the
  /// boundary-tag validation or the heap is exhausted; the old block is
  /// left untouched in the latter case.
  ///
  /// # Safety
  ///
  /// As for [`SegregatedAllocator::free`].
  pub unsafe fn realloc(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    if ptr.is_null() {
      return unsafe { self.malloc(size) };
    }
    if size == 0 {
      unsafe { self.free(ptr) };
      return ptr::null_mut();
    }
    if !unsafe { valid_alloc_block(ptr) } || size > self.heap.capacity() {
      return ptr::null_mut();
    }

    let old_size = unsafe { block_size(ptr) };
    let new_size = align(size) + OVERHEAD;

    if new_size == old_size {
      return ptr;
    }

    if new_size < old_size {
      unsafe { self.shrink(ptr, old_size, new_size) };
      return ptr;
    }

    unsafe { self.grow(ptr, old_size, new_size, size) }
  }

  /// Heap bytes currently mapped, bucket table included.
  pub fn heap_len(&self) -> usize {
    self.heap.len()
  }

  /// Walks the heap and the buckets, validating the block invariants and
  /// the index: every free block reachable from exactly one bucket, the
  /// one its payload size selects.
  ///
  /// # Panics
  ///
  /// Panics when an invariant does not hold.
  pub fn check(&self) -> HeapStats {
    let stats = unsafe { check_heap(self.base, self.heap.current_break()) };
    unsafe { self.check_buckets(stats.free_blocks) };
    stats
  }

  /// Logs the heap and every bucket chain at trace level.
  pub fn dump(
    &self,
    tag: &str,
  ) {
    unsafe {
      dump_heap(tag, self.base);
      self.dump_buckets(tag);
    }
  }

  /// Bucket head slot `index`, viewed as a degenerate list node whose
  /// next link is the slot word itself.
  #[inline]
  unsafe fn slot(
    &self,
    index: usize,
  ) -> *mut u8 {
    unsafe { self.table.add(index).cast() }
  }

  /// First-fit scan of one bucket. On a hit the block is unlinked, placed
  /// and any split remainder is filed back into its own class.
  unsafe fn take_from_bucket(
    &mut self,
    index: usize,
    asize: usize,
  ) -> Option<*mut u8> {
    unsafe {
      let mut bp = next_free(self.slot(index));

      while !bp.is_null() {
        if payload_size(bp) >= asize {
          self.unlink(bp);
          if let Some(split) = place(bp, asize) {
            self.insert(split);
          }
          return Some(bp);
        }
        bp = next_free(bp);
      }

      None
    }
  }

  /// Coalesces the free block at `bp`, detaching absorbed neighbours from
  /// their buckets, and files the merged block into its class. Returns
  /// the merged block pointer.
  unsafe fn insert(
    &mut self,
    bp: *mut u8,
  ) -> *mut u8 {
    let merged = unsafe { coalesce(bp, |neighbour| unsafe { self.unlink(neighbour) }) };
    unsafe { self.push(merged) };
    merged
  }

  /// Pushes the free block at `bp` onto the head of its bucket.
  unsafe fn push(
    &mut self,
    bp: *mut u8,
  ) {
    unsafe {
      let index = bucket_index(payload_size(bp));
      let slot = self.slot(index);
      let head = next_free(slot);

      set_next_free(bp, head);
      if index != 0 {
        set_prev_free(bp, slot);
        if !head.is_null() {
          set_prev_free(head, bp);
        }
      }
      set_next_free(slot, bp);
    }
  }

  /// Detaches the free block at `bp` from its bucket. O(1) for the
  /// doubly-linked classes; the smallest class walks from its head.
  unsafe fn unlink(
    &mut self,
    bp: *mut u8,
  ) {
    unsafe {
      let index = bucket_index(payload_size(bp));

      if index == 0 {
        let mut p = self.slot(0);
        loop {
          let n = next_free(p);
          debug_assert!(!n.is_null(), "free block missing from bucket 0");
          if n.is_null() {
            return;
          }
          if n == bp {
            set_next_free(p, next_free(bp));
            return;
          }
          p = n;
        }
      }

      let prevp = prev_free(bp);
      let nextp = next_free(bp);
      set_next_free(prevp, nextp);
      if !nextp.is_null() {
        set_prev_free(nextp, prevp);
      }
    }
  }

  fn extend(
    &mut self,
    size: usize,
  ) -> Option<*mut u8> {
    debug_assert!(is_aligned(size));

    match self.heap.sbrk(size) {
      Ok(old_brk) => {
        unsafe { set_epilogue(self.heap.current_break()) };
        log::trace!("extended heap by {size} bytes");
        Some(old_brk)
      }
      Err(err) => {
        log::debug!("heap extension failed: {err}");
        None
      }
    }
  }

  unsafe fn shrink(
    &mut self,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
  ) {
    let remainder = old_size - new_size;
    if remainder < MIN_BLK_SIZE {
      return;
    }

    unsafe {
      set_block(ptr, new_size, true);
      let split = next_block(ptr);
      set_block(split, remainder, false);
      self.insert(split);
    }
  }

  unsafe fn grow(
    &mut self,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let next = next_block(ptr);

      // absorb the right neighbour
      if !is_allocated(next) && old_size + block_size(next) >= new_size {
        self.unlink(next);
        let combined = old_size + block_size(next);
        self.split_absorbed(ptr, combined, new_size);
        return ptr;
      }

      // absorb the left neighbour, sliding the payload down; the links
      // are read and the payload copied before any tag write can land
      // inside the old payload
      if !prev_allocated(ptr) && old_size + prev_size(ptr) >= new_size {
        let prev = prev_block(ptr);
        let combined = old_size + prev_size(ptr);
        self.unlink(prev);
        ptr::copy(ptr, prev, old_size - OVERHEAD);
        self.split_absorbed(prev, combined, new_size);
        return prev;
      }

      // tail block: top the heap up by the deficit
      if is_epilogue(next) && self.extend(new_size - old_size).is_some() {
        set_block(ptr, new_size, true);
        return ptr;
      }

      // relocate
      let fresh = self.malloc(size);
      if fresh.is_null() {
        return ptr::null_mut();
      }
      ptr::copy_nonoverlapping(ptr, fresh, old_size - OVERHEAD);
      self.free(ptr);
      fresh
    }
  }

  /// Writes an absorbed neighbour pair as one allocated block of
  /// `new_size` bytes, filing the surplus back into its class when it can
  /// stand alone.
  unsafe fn split_absorbed(
    &mut self,
    bp: *mut u8,
    combined: usize,
    new_size: usize,
  ) {
    unsafe {
      let surplus = combined - new_size;
      if surplus >= MIN_BLK_SIZE {
        set_block(bp, new_size, true);
        let split = next_block(bp);
        set_block(split, surplus, false);
        self.insert(split);
      } else {
        set_block(bp, combined, true);
      }
    }
  }

  unsafe fn check_buckets(
    &self,
    expected_free: usize,
  ) {
    unsafe {
      let mut reachable = 0;

      for index in 0..BUCKETS {
        let mut bp = next_free(self.slot(index));
        while !bp.is_null() {
          assert!(
            !is_allocated(bp),
            "allocated block at {bp:p} reachable from bucket {index}"
          );
          assert_eq!(
            bucket_index(payload_size(bp)),
            index,
            "block at {bp:p} filed in the wrong bucket"
          );
          if index != 0 {
            assert_eq!(
              next_free(prev_free(bp)),
              bp,
              "broken prev link at {bp:p} in bucket {index}"
            );
          }

          reachable += 1;
          assert!(
            reachable <= expected_free,
            "bucket walk found more entries than free blocks exist"
          );
          bp = next_free(bp);
        }
      }

      assert_eq!(
        reachable, expected_free,
        "every free block must be reachable from exactly one bucket"
      );
    }
  }

  unsafe fn dump_buckets(
    &self,
    tag: &str,
  ) {
    if !log::log_enabled!(log::Level::Trace) {
      return;
    }

    unsafe {
      for index in 0..BUCKETS {
        let mut bp = next_free(self.slot(index));
        if bp.is_null() {
          continue;
        }

        let mut line = format!("[{tag}] bucket[{index}]:");
        while !bp.is_null() {
          line.push_str(&format!(" {bp:p}({})", payload_size(bp)));
          bp = next_free(bp);
        }
        log::trace!("{line}");
      }
    }
  }

  #[cfg(test)]
  fn bucket_len(
    &self,
    index: usize,
  ) -> usize {
    let mut count = 0;
    unsafe {
      let mut bp = next_free(self.slot(index));
      while !bp.is_null() {
        count += 1;
        bp = next_free(bp);
      }
    }
    count
  }
}
