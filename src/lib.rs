//! # rmalloc - A Boundary-Tag Memory Allocator Library
//!
//! This crate provides a classic C-style heap allocator (`malloc`, `free`,
//! `realloc`) over a single contiguous, grow-only heap region, in two
//! interchangeable flavours that share one block format.
//!
//! ## Overview
//!
//! Every block carries its size and an allocated bit in a header word and a
//! duplicate footer word, so both physical neighbours are reachable in O(1)
//! and freed blocks can be merged eagerly in all four neighbour
//! configurations:
//!
//! ```text
//!                            HEAP REGION (grows right via the break)
//!
//!   ┌─────────┬──────────┬─────────────┬──────────┬─────────────┬──────────┐
//!   │ padding │ prologue │ alloc block │ free blk │ alloc block │ epilogue │
//!   │  word   │  (8, A)  │   (40, A)   │  (24, F) │   (96, A)   │  (0, A)  │
//!   └─────────┴──────────┴─────────────┴──────────┴─────────────┴──────────┘
//!              ▲                                                 ▲
//!              │                                                 │
//!        backward walks                                   forward walks
//!        stop here                                        stop here
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rmalloc
//!   ├── align      - 8-byte alignment helpers
//!   ├── heap       - grow-only heap substrate (break + cap)
//!   ├── block      - boundary tags, sentinels, split and coalesce
//!   ├── implicit   - implicit-list engine (first/next/best fit)
//!   ├── seglist    - segregated free-list engine (11 size classes)
//!   └── dump       - heap dumper and invariant checker
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rmalloc::{Malloc, Policy, Variant};
//!
//! let mut mm = Malloc::new(Variant::Implicit(Policy::FirstFit)).unwrap();
//!
//! unsafe {
//!   let p = mm.malloc(64);
//!   assert!(!p.is_null());
//!
//!   p.write(42);
//!   assert_eq!(p.read(), 42);
//!
//!   let p = mm.realloc(p, 256);
//!   assert_eq!(p.read(), 42);
//!
//!   mm.free(p);
//! }
//! ```
//!
//! ## The Two Engines
//!
//! - [`ImplicitAllocator`] keeps no index at all: finding a free block
//!   walks the heap header by header. Placement policy is selectable:
//!   first-fit, next-fit (roving cursor) or best-fit.
//! - [`SegregatedAllocator`] keeps eleven size-class lists threaded through
//!   the payloads of the free blocks themselves, trading a little bookkeeping
//!   on `free` for much shorter searches on `malloc`.
//!
//! Both engines satisfy the same structural invariants (mirrored tags,
//! 8-byte alignment, perfect tiling, no adjacent free blocks) and both are
//! single-agent: no locks, no I/O, no hidden global state. All allocator
//! state lives in the value returned by the constructor, so independent
//! heaps can coexist freely.
//!
//! ## Safety
//!
//! This is manual memory management over raw bytes. `malloc` hands out
//! uninitialised memory; `free` and `realloc` trust the caller to pass
//! pointers that this allocator returned and that are still live. The
//! usual C rules apply: no double free, no use after free.

pub mod align;
mod block;
mod dump;
mod heap;
mod implicit;
mod seglist;

pub use dump::HeapStats;
pub use heap::{HeapError, HeapSegment, MAX_HEAP};
pub use implicit::{ImplicitAllocator, Policy};
pub use seglist::SegregatedAllocator;

/// Which engine a [`Malloc`] value runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
  /// Implicit block list with the given placement policy.
  Implicit(Policy),
  /// Segregated free lists over eleven size classes.
  Segregated,
}

enum Engine {
  Implicit(ImplicitAllocator),
  Segregated(SegregatedAllocator),
}

/// Engine-agnostic allocator façade.
///
/// Owns a private heap and dispatches the classic four operations to the
/// engine selected at construction time.
pub struct Malloc {
  engine: Engine,
}

impl Malloc {
  /// Sets up an allocator with the default [`MAX_HEAP`] cap.
  pub fn new(variant: Variant) -> Result<Self, HeapError> {
    Self::with_capacity(variant, MAX_HEAP)
  }

  /// Sets up an allocator over a heap capped at `cap` bytes.
  pub fn with_capacity(
    variant: Variant,
    cap: usize,
  ) -> Result<Self, HeapError> {
    let engine = match variant {
      Variant::Implicit(policy) => {
        Engine::Implicit(ImplicitAllocator::with_capacity(policy, cap)?)
      }
      Variant::Segregated => Engine::Segregated(SegregatedAllocator::with_capacity(cap)?),
    };

    Ok(Self { engine })
  }

  /// Allocates at least `size` bytes, 8-aligned; null when `size` is zero
  /// or the heap is exhausted.
  ///
  /// # Safety
  ///
  /// The returned memory is uninitialised; the caller must write before
  /// reading and must not touch bytes past the requested size.
  pub unsafe fn malloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      match &mut self.engine {
        Engine::Implicit(mm) => mm.malloc(size),
        Engine::Segregated(mm) => mm.malloc(size),
      }
    }
  }

  /// Releases an allocation. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this allocator and not freed since.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    unsafe {
      match &mut self.engine {
        Engine::Implicit(mm) => mm.free(ptr),
        Engine::Segregated(mm) => mm.free(ptr),
      }
    }
  }

  /// Resizes an allocation, preserving its payload up to the smaller of
  /// the old and new sizes.
  ///
  /// # Safety
  ///
  /// As for [`Malloc::free`].
  pub unsafe fn realloc(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      match &mut self.engine {
        Engine::Implicit(mm) => mm.realloc(ptr, size),
        Engine::Segregated(mm) => mm.realloc(ptr, size),
      }
    }
  }

  /// Heap bytes currently mapped.
  pub fn heap_len(&self) -> usize {
    match &self.engine {
      Engine::Implicit(mm) => mm.heap_len(),
      Engine::Segregated(mm) => mm.heap_len(),
    }
  }

  /// Validates the heap invariants and returns block counters.
  ///
  /// # Panics
  ///
  /// Panics when an invariant does not hold.
  pub fn check(&self) -> HeapStats {
    match &self.engine {
      Engine::Implicit(mm) => mm.check(),
      Engine::Segregated(mm) => mm.check(),
    }
  }

  /// Logs the heap (and, for the segregated engine, the buckets) at trace
  /// level.
  pub fn dump(
    &self,
    tag: &str,
  ) {
    match &self.engine {
      Engine::Implicit(mm) => mm.dump(tag),
      Engine::Segregated(mm) => mm.dump(tag),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn variants() -> Vec<Variant> {
    vec![
      Variant::Implicit(Policy::FirstFit),
      Variant::Implicit(Policy::NextFit),
      Variant::Implicit(Policy::BestFit),
      Variant::Segregated,
    ]
  }

  #[test]
  fn every_variant_serves_the_basic_cycle() {
    for variant in variants() {
      let mut mm = Malloc::with_capacity(variant, 64 * 1024).unwrap();

      unsafe {
        let p = mm.malloc(100) as *mut u64;
        assert!(!p.is_null(), "{variant:?}");
        assert_eq!(p as usize % 8, 0, "{variant:?}");

        p.write(0xDEAD_BEEF_DEAD_BEEF);
        assert_eq!(p.read(), 0xDEAD_BEEF_DEAD_BEEF, "{variant:?}");

        mm.free(p as *mut u8);
      }

      let stats = mm.check();
      assert_eq!(stats.free_blocks, 1, "{variant:?}");
    }
  }

  #[test]
  fn every_variant_preserves_payload_across_realloc() {
    for variant in variants() {
      let mut mm = Malloc::with_capacity(variant, 64 * 1024).unwrap();

      unsafe {
        let p = mm.malloc(100);
        for i in 0..100 {
          p.add(i).write(i as u8);
        }

        // force relocation by boxing the block in
        let _wall = mm.malloc(16);

        let q = mm.realloc(p, 400);
        assert!(!q.is_null(), "{variant:?}");
        for i in 0..100 {
          assert_eq!(q.add(i).read(), i as u8, "{variant:?} byte {i}");
        }

        mm.free(q);
      }
      mm.check();
    }
  }

  #[test]
  fn every_variant_handles_the_degenerate_requests() {
    for variant in variants() {
      let mut mm = Malloc::with_capacity(variant, 64 * 1024).unwrap();

      unsafe {
        assert!(mm.malloc(0).is_null(), "{variant:?}");

        // realloc(null, n) is malloc(n)
        let p = mm.realloc(std::ptr::null_mut(), 32);
        assert!(!p.is_null(), "{variant:?}");

        // realloc(p, 0) is free(p)
        assert!(mm.realloc(p, 0).is_null(), "{variant:?}");
        assert_eq!(mm.check().free_blocks, 1, "{variant:?}");

        // free(null) is a no-op
        mm.free(std::ptr::null_mut());
      }
      mm.check();
    }
  }

  #[test]
  fn a_malloc_free_pair_perturbs_the_heap_by_at_most_one_block() {
    for variant in variants() {
      let mut mm = Malloc::with_capacity(variant, 64 * 1024).unwrap();

      unsafe {
        let _anchor = mm.malloc(48);
      }
      let before = mm.check();
      let len_before = mm.heap_len();

      unsafe {
        let p = mm.malloc(256);
        mm.free(p);
      }

      let after = mm.check();
      assert!(
        after.free_blocks <= before.free_blocks + 1,
        "{variant:?}"
      );
      assert!(mm.heap_len() >= len_before, "{variant:?}");
    }
  }

  #[test]
  fn heaps_are_independent() {
    let mut a = Malloc::with_capacity(Variant::Segregated, 32 * 1024).unwrap();
    let mut b = Malloc::with_capacity(Variant::Implicit(Policy::FirstFit), 32 * 1024).unwrap();

    unsafe {
      let pa = a.malloc(64);
      let pb = b.malloc(64);

      pa.write(1);
      pb.write(2);
      assert_eq!(pa.read(), 1);
      assert_eq!(pb.read(), 2);

      a.free(pa);
      b.free(pb);
    }

    a.check();
    b.check();
  }
}
