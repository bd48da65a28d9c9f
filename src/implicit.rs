//! # Implicit-list engine
//!
//! The simpler of the two allocators: no index structure at all. Free
//! blocks are found by walking the heap block by block, header to header,
//! from the prologue to the epilogue.
//!
//! ```text
//!   prologue                                                  epilogue
//!      │                                                          │
//!      ▼                                                          ▼
//!   ┌──────┬────────────┬──────┬──────────────────┬────────────┬────┐
//!   │ 8, A │   48, A    │ 24,F │      96, A       │    32, F   │ 0,A│
//!   └──────┴────────────┴──────┴──────────────────┴────────────┴────┘
//!             walk ───────────────────────────────────────────►
//! ```
//!
//! Three fit policies share the walk:
//!
//! - **first-fit** takes the first free block that is large enough;
//! - **next-fit** resumes the walk where the previous one left off and
//!   wraps around, trading utilisation for shorter scans;
//! - **best-fit** scans the whole heap and keeps the tightest fit.
//!
//! When no block fits, the heap is extended. If the block just below the
//! break is free, only the shortfall is requested and the tail block grows
//! in place; otherwise a whole new block is mapped.

use std::ptr;

use crate::align::{align, is_aligned};
use crate::block::{
  BASE_SIZE, MIN_BLK_SIZE, OVERHEAD, block_size, coalesce, is_allocated, is_epilogue, next_block,
  payload_size, place, prev_allocated, prev_block, prev_size, set_block, set_epilogue,
  valid_alloc_block, write_base_sentinels,
};
use crate::dump::{HeapStats, check_heap, dump_heap};
use crate::heap::{HeapError, HeapSegment, MAX_HEAP};

/// Rule by which a free block is selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// First free block that fits, scanning from the heap base.
  FirstFit,
  /// First free block that fits, scanning from a roving cursor.
  NextFit,
  /// Smallest free block that fits; ties go to the first one found.
  BestFit,
}

/// Boundary-tag allocator over an implicit block list.
pub struct ImplicitAllocator {
  heap: HeapSegment,

  /// Prologue block pointer; every walk starts here.
  base: *mut u8,

  /// Next-fit cursor. Re-anchored after every successful allocation and
  /// every coalesce so it always addresses a live block.
  cursor: *mut u8,

  policy: Policy,
}

impl ImplicitAllocator {
  /// Sets up a heap capped at [`MAX_HEAP`] and writes the sentinels.
  pub fn new(policy: Policy) -> Result<Self, HeapError> {
    Self::with_capacity(policy, MAX_HEAP)
  }

  /// Same as [`ImplicitAllocator::new`] with an explicit cap.
  pub fn with_capacity(
    policy: Policy,
    cap: usize,
  ) -> Result<Self, HeapError> {
    let mut heap = HeapSegment::new(cap)?;
    let base = heap.sbrk(BASE_SIZE)?;
    let listp = unsafe { write_base_sentinels(base) };

    Ok(Self { heap, base: listp, cursor: listp, policy })
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

    if let Some(bp) = unsafe { self.find_fit(asize) } {
      unsafe { place(bp, asize) };
      self.cursor = bp;
      return bp;
    }

    unsafe { self.extend_and_alloc(asize) }
  }

  /// Returns the block at `ptr` to the heap and merges it with any free
  /// neighbour. Null is a no-op.
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
      self.cursor = coalesce(ptr, |_| {});
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
  /// As for [`ImplicitAllocator::free`].
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

  /// Heap bytes currently mapped.
  pub fn heap_len(&self) -> usize {
    self.heap.len()
  }

  /// Walks the heap, validates the block invariants and returns counters.
  ///
  /// # Panics
  ///
  /// Panics when an invariant does not hold.
  pub fn check(&self) -> HeapStats {
    unsafe { check_heap(self.base, self.heap.current_break()) }
  }

  /// Logs one line per block at trace level.
  pub fn dump(
    &self,
    tag: &str,
  ) {
    unsafe { dump_heap(tag, self.base) };
  }

  unsafe fn find_fit(
    &mut self,
    asize: usize,
  ) -> Option<*mut u8> {
    unsafe {
      match self.policy {
        Policy::FirstFit => self.first_fit(asize),
        Policy::NextFit => self.next_fit(asize),
        Policy::BestFit => self.best_fit(asize),
      }
    }
  }

  unsafe fn first_fit(
    &self,
    asize: usize,
  ) -> Option<*mut u8> {
    unsafe {
      let mut bp = self.base;
      while !is_epilogue(bp) {
        if !is_allocated(bp) && payload_size(bp) >= asize {
          return Some(bp);
        }
        bp = next_block(bp);
      }
      None
    }
  }

  unsafe fn next_fit(
    &self,
    asize: usize,
  ) -> Option<*mut u8> {
    unsafe {
      let start = self.cursor;
      let mut bp = start;

      loop {
        if is_epilogue(bp) {
          bp = self.base;
        } else {
          if !is_allocated(bp) && payload_size(bp) >= asize {
            return Some(bp);
          }
          bp = next_block(bp);
        }

        if bp == start {
          return None;
        }
      }
    }
  }

  unsafe fn best_fit(
    &self,
    asize: usize,
  ) -> Option<*mut u8> {
    unsafe {
      let mut best: Option<*mut u8> = None;
      let mut best_payload = usize::MAX;

      let mut bp = self.base;
      while !is_epilogue(bp) {
        if !is_allocated(bp) {
          let payload = payload_size(bp);
          if payload >= asize && payload < best_payload {
            best = Some(bp);
            best_payload = payload;
          }
        }
        bp = next_block(bp);
      }

      best
    }
  }

  /// No block fit: grow the heap. A free tail block is topped up with
  /// just the shortfall; otherwise a whole new block is mapped. Either
  /// way the fresh region is written as a single allocated block.
  unsafe fn extend_and_alloc(
    &mut self,
    asize: usize,
  ) -> *mut u8 {
    unsafe {
      let brk = self.heap.current_break();

      let bp = if !prev_allocated(brk) {
        let tail = prev_block(brk);
        let shortfall = asize - payload_size(tail);
        if self.extend(shortfall).is_none() {
          return ptr::null_mut();
        }
        tail
      } else {
        match self.extend(asize + OVERHEAD) {
          Some(fresh) => fresh,
          None => return ptr::null_mut(),
        }
      };

      set_block(bp, asize + OVERHEAD, true);
      self.cursor = bp;
      bp
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
      self.cursor = coalesce(split, |_| {});
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
        let combined = old_size + block_size(next);
        self.split_absorbed(ptr, combined, new_size);
        self.cursor = ptr;
        return ptr;
      }

      // absorb the left neighbour, sliding the payload down; the copy
      // must happen before any tag write lands inside the old payload
      if !prev_allocated(ptr) && old_size + prev_size(ptr) >= new_size {
        let prev = prev_block(ptr);
        let combined = old_size + prev_size(ptr);
        ptr::copy(ptr, prev, old_size - OVERHEAD);
        self.split_absorbed(prev, combined, new_size);
        self.cursor = prev;
        return prev;
      }

      // tail block: top the heap up by the deficit
      if is_epilogue(next) && self.extend(new_size - old_size).is_some() {
        set_block(ptr, new_size, true);
        self.cursor = ptr;
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
  /// `new_size` bytes, splitting off the surplus when it can stand alone.
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
        coalesce(split, |_| {});
      } else {
        set_block(bp, combined, true);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::align::ALIGNMENT;

  fn allocator(policy: Policy) -> ImplicitAllocator {
    ImplicitAllocator::with_capacity(policy, 64 * 1024).unwrap()
  }

  fn first_fit() -> ImplicitAllocator {
    allocator(Policy::FirstFit)
  }

  #[test]
  fn malloc_zero_returns_null() {
    let mut mm = first_fit();
    assert!(unsafe { mm.malloc(0) }.is_null());
    mm.check();
  }

  #[test]
  fn malloc_returns_aligned_disjoint_blocks() {
    let mut mm = first_fit();

    unsafe {
      let a = mm.malloc(1);
      let b = mm.malloc(13);
      let c = mm.malloc(200);

      for p in [a, b, c] {
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGNMENT, 0);
      }
      assert!((a as usize + 8) <= b as usize);
      assert!((b as usize + 16) <= c as usize);
    }
    mm.check();
  }

  #[test]
  fn freed_slot_is_reused_for_an_equal_request() {
    let mut mm = first_fit();

    unsafe {
      let a = mm.malloc(24);
      let _b = mm.malloc(24);
      mm.free(a);
      let c = mm.malloc(24);
      assert_eq!(c, a);
    }
    mm.check();
  }

  #[test]
  fn near_fit_reuses_slot_without_heap_growth() {
    let mut mm = first_fit();

    unsafe {
      let a = mm.malloc(2040);
      let _b = mm.malloc(8);
      mm.free(a);

      let watermark = mm.heap_len();
      let d = mm.malloc(2032);
      assert_eq!(d, a);
      assert_eq!(mm.heap_len(), watermark);
    }
    mm.check();
  }

  #[test]
  fn freeing_everything_leaves_one_block() {
    let mut mm = first_fit();

    unsafe {
      let a = mm.malloc(16);
      let b = mm.malloc(16);
      let c = mm.malloc(16);

      mm.free(a);
      mm.free(c);
      mm.free(b);
    }

    let stats = mm.check();
    assert_eq!(stats.free_blocks, 1);
    // three 24-byte blocks merged into one
    assert_eq!(stats.largest_free_payload, 3 * 24 - OVERHEAD);
  }

  #[test]
  fn free_then_refit_does_not_grow_the_heap() {
    let mut mm = first_fit();
    let sizes = [32, 8, 120, 64, 16];

    unsafe {
      let ptrs: Vec<_> = sizes.iter().map(|&s| mm.malloc(s)).collect();
      let watermark = mm.heap_len();

      for p in ptrs {
        mm.free(p);
      }
      for &s in &sizes {
        assert!(!mm.malloc(s).is_null());
      }
      assert_eq!(mm.heap_len(), watermark);
    }
    mm.check();
  }

  #[test]
  fn exhaustion_returns_null_and_leaves_the_heap_intact() {
    // cap 1024, sentinels take 16: at most 1000 payload bytes fit
    let mut mm = ImplicitAllocator::with_capacity(Policy::FirstFit, 1024).unwrap();
    unsafe {
      assert!(!mm.malloc(1000).is_null());
    }
    mm.check();

    let mut mm = ImplicitAllocator::with_capacity(Policy::FirstFit, 1024).unwrap();
    unsafe {
      assert!(mm.malloc(1001).is_null());
      // the failed request must not have corrupted anything
      assert!(!mm.malloc(1000).is_null());
    }
    mm.check();
  }

  #[test]
  fn tail_reuse_extends_only_by_the_shortfall() {
    let mut mm = first_fit();

    unsafe {
      let a = mm.malloc(64);
      mm.free(a);

      // tail block has 64 payload bytes; ask for 96 more than fits
      let before = mm.heap_len();
      let b = mm.malloc(160);
      assert_eq!(b, a);
      assert_eq!(mm.heap_len(), before + 96);
    }
    mm.check();
  }

  #[test]
  fn next_fit_resumes_from_the_cursor() {
    let mut mm = allocator(Policy::NextFit);

    unsafe {
      let a = mm.malloc(24);
      let _b = mm.malloc(24);
      let c = mm.malloc(24);

      mm.free(a);
      mm.free(c);

      // the cursor rests on c after its coalesce; first-fit would pick a
      let d = mm.malloc(24);
      assert_eq!(d, c);

      // wrap-around still finds a
      let e = mm.malloc(24);
      assert_eq!(e, a);
    }
    mm.check();
  }

  #[test]
  fn next_fit_misses_are_clean() {
    let mut mm = allocator(Policy::NextFit);

    unsafe {
      let a = mm.malloc(24);
      let _keep = mm.malloc(8);
      mm.free(a);
      // nothing free is big enough: the wrap must terminate and extend
      let b = mm.malloc(512);
      assert!(!b.is_null());
      assert_ne!(b, a);
    }
    mm.check();
  }

  #[test]
  fn best_fit_prefers_the_tightest_block() {
    let mut mm = allocator(Policy::BestFit);

    unsafe {
      let a = mm.malloc(48);
      let _gap1 = mm.malloc(8);
      let c = mm.malloc(24);
      let _gap2 = mm.malloc(8);

      mm.free(a);
      mm.free(c);

      // both fit; c is tighter
      let d = mm.malloc(24);
      assert_eq!(d, c);
    }
    mm.check();
  }

  #[test]
  fn realloc_of_null_allocates() {
    let mut mm = first_fit();
    unsafe {
      let p = mm.realloc(ptr::null_mut(), 40);
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);
    }
    let stats = mm.check();
    assert_eq!(stats.blocks, 1);
  }

  #[test]
  fn realloc_to_zero_frees() {
    let mut mm = first_fit();
    unsafe {
      let p = mm.malloc(40);
      assert!(mm.realloc(p, 0).is_null());
    }
    let stats = mm.check();
    assert_eq!(stats.free_blocks, 1);
  }

  #[test]
  fn realloc_to_the_same_size_is_identity() {
    let mut mm = first_fit();
    unsafe {
      let p = mm.malloc(24);
      assert_eq!(mm.realloc(p, 24), p);
      // anything that rounds to the same block size qualifies
      assert_eq!(mm.realloc(p, 17), p);
    }
    mm.check();
  }

  #[test]
  fn realloc_rejects_implausible_pointers() {
    let mut mm = first_fit();
    unsafe {
      let p = mm.malloc(24);
      mm.free(p);
      // freed block fails the allocated-flag check
      assert!(mm.realloc(p, 48).is_null());
    }
    mm.check();
  }

  #[test]
  fn realloc_shrink_splits_and_recycles_the_tail() {
    let mut mm = first_fit();
    unsafe {
      let a = mm.malloc(64);
      let _b = mm.malloc(8);

      assert_eq!(mm.realloc(a, 16), a);
    }
    let stats = mm.check();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free_payload, 40);
  }

  #[test]
  fn realloc_shrink_keeps_small_remainders_in_place() {
    let mut mm = first_fit();
    unsafe {
      let a = mm.malloc(24);
      let _b = mm.malloc(8);

      // remainder of 8 bytes cannot stand alone
      assert_eq!(mm.realloc(a, 16), a);
    }
    let stats = mm.check();
    assert_eq!(stats.free_blocks, 0);
  }

  #[test]
  fn realloc_grows_into_a_free_right_neighbour() {
    let mut mm = first_fit();
    unsafe {
      let a = mm.malloc(24);
      let b = mm.malloc(72);
      let _c = mm.malloc(8);
      mm.free(b);

      let grown = mm.realloc(a, 48);
      assert_eq!(grown, a);
    }
    mm.check();
  }

  #[test]
  fn realloc_grows_into_a_free_left_neighbour() {
    let mut mm = first_fit();
    unsafe {
      let a = mm.malloc(72);
      let b = mm.malloc(24);
      let _c = mm.malloc(8);
      mm.free(a);

      for (i, byte) in (0..24).enumerate() {
        b.add(i).write(byte as u8 ^ 0x5A);
      }

      let grown = mm.realloc(b, 48);
      assert_eq!(grown, a);
      for i in 0..24 {
        assert_eq!(grown.add(i).read(), (i as u8) ^ 0x5A);
      }
    }
    mm.check();
  }

  #[test]
  fn realloc_at_the_tail_extends_in_place() {
    let mut mm = first_fit();
    unsafe {
      let a = mm.malloc(100);
      for i in 0..100 {
        a.add(i).write(i as u8);
      }

      let b = mm.realloc(a, 400);
      assert_eq!(b, a);
      for i in 0..100 {
        assert_eq!(b.add(i).read(), i as u8);
      }
    }
    mm.check();
  }

  #[test]
  fn realloc_relocates_when_boxed_in() {
    let mut mm = first_fit();
    unsafe {
      let a = mm.malloc(100);
      let _b = mm.malloc(100);

      for i in 0..100 {
        a.add(i).write(i as u8 ^ 0xA5);
      }

      let c = mm.realloc(a, 200);
      assert_ne!(c, a);
      for i in 0..100 {
        assert_eq!(c.add(i).read(), (i as u8) ^ 0xA5);
      }

      // the old region is free again
      let d = mm.malloc(100);
      assert_eq!(d, a);
    }
    mm.check();
  }

  #[test]
  fn single_malloc_free_cycle_restores_the_heap() {
    let mut mm = first_fit();

    unsafe {
      let _keep = mm.malloc(48);
    }
    let before = mm.check();
    let len_before = mm.heap_len();

    unsafe {
      let p = mm.malloc(64);
      mm.free(p);
    }

    let after = mm.check();
    assert!(after.free_blocks <= before.free_blocks + 1);
    assert!(mm.heap_len() == len_before || mm.heap_len() == len_before + 64 + OVERHEAD);
  }
}
