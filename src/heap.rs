//! # Heap substrate
//!
//! A thin adapter over the host's memory, modelling a grow-only program
//! break inside a region reserved up front:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │                    reserved region (cap bytes)               │
//!   │                                                              │
//!   │   ┌──────────────────────────────┬───────────────────────┐   │
//!   │   │        mapped heap           │       unmapped        │   │
//!   │   └──────────────────────────────┴───────────────────────┘   │
//!   │   ▲                              ▲                           │
//!   │   │                              │                           │
//!   │ start                    break (grows right, never left)     │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The substrate knows nothing about blocks or tags; it only hands out
//! byte ranges. Reserving the whole region once keeps every allocator
//! instance on a private heap, so tests can create and drop as many as
//! they like without fighting over the process break.

use std::ptr;

use thiserror::Error;

/// Default cap on the mapped heap, in bytes.
pub const MAX_HEAP: usize = 20 * (1 << 20);

/// Largest representable block size: header words keep the size in the
/// upper 29 bits of a `u32`.
const MAX_CAP: usize = (u32::MAX & !0x7) as usize;

/// Failures surfaced by the heap substrate.
#[derive(Debug, Error)]
pub enum HeapError {
  /// The host refused to reserve the backing region.
  #[error("host refused to reserve {0} bytes")]
  Reserve(usize),

  /// The requested extension is zero or not a multiple of 8.
  #[error("break extension of {0} bytes is not a positive multiple of 8")]
  BadDelta(usize),

  /// The requested extension would push the break past the cap.
  #[error("break extension of {delta} bytes exceeds the {cap}-byte heap cap")]
  OutOfMemory { delta: usize, cap: usize },
}

/// A single contiguous, monotonically-growing heap region.
///
/// Created with a fixed capacity; [`HeapSegment::sbrk`] moves the break
/// forward within it. There is no shrink operation. The segment owns the
/// underlying bytes and releases them on drop.
pub struct HeapSegment {
  /// First byte of the reserved region.
  start: *mut u8,

  /// Current end of the mapped heap. Always within `start..start + cap`.
  brk: *mut u8,

  /// Reserved region size; the break never moves past `start + cap`.
  cap: usize,
}

impl HeapSegment {
  /// Reserves `cap` bytes from the host and places the break at the start.
  ///
  /// # Errors
  ///
  /// [`HeapError::Reserve`] if `cap` is zero, exceeds the tag format's
  /// 32-bit size field, or the host is out of memory.
  pub fn new(cap: usize) -> Result<Self, HeapError> {
    if cap == 0 || cap > MAX_CAP {
      return Err(HeapError::Reserve(cap));
    }

    let start = unsafe { libc::malloc(cap) } as *mut u8;
    if start.is_null() {
      return Err(HeapError::Reserve(cap));
    }

    Ok(Self { start, brk: start, cap })
  }

  /// Moves the break forward by `delta` bytes and returns the old break,
  /// which is the address of the first newly-mapped byte.
  ///
  /// The break is left untouched on any failure.
  ///
  /// # Errors
  ///
  /// [`HeapError::BadDelta`] if `delta` is zero or not a multiple of 8,
  /// [`HeapError::OutOfMemory`] if the extension would exceed the cap.
  pub fn sbrk(
    &mut self,
    delta: usize,
  ) -> Result<*mut u8, HeapError> {
    if delta == 0 || !crate::align::is_aligned(delta) {
      return Err(HeapError::BadDelta(delta));
    }

    if delta > self.cap - self.len() {
      return Err(HeapError::OutOfMemory { delta, cap: self.cap });
    }

    let old_brk = self.brk;
    self.brk = unsafe { self.brk.add(delta) };
    Ok(old_brk)
  }

  /// Current end of the mapped heap.
  pub fn current_break(&self) -> *mut u8 {
    self.brk
  }

  /// First byte of the heap.
  pub fn start(&self) -> *mut u8 {
    self.start
  }

  /// Mapped heap size in bytes.
  pub fn len(&self) -> usize {
    self.brk as usize - self.start as usize
  }

  /// Whether the break has ever been moved.
  pub fn is_empty(&self) -> bool {
    self.brk == self.start
  }

  /// Reserved region size in bytes.
  pub fn capacity(&self) -> usize {
    self.cap
  }
}

impl Drop for HeapSegment {
  fn drop(&mut self) {
    unsafe { libc::free(self.start as *mut libc::c_void) };
    self.start = ptr::null_mut();
    self.brk = ptr::null_mut();
  }
}
