//! # Heap dumper and invariant checker
//!
//! Debug-time companions to the engines. The dumper logs one line per
//! block at trace level; the checker walks the same blocks and asserts
//! the structural invariants that every public operation must restore:
//!
//! - header and footer of every block are identical;
//! - every size is a positive multiple of 8 and every block pointer is
//!   8-aligned;
//! - consecutive blocks tile the heap exactly, prologue to epilogue;
//! - no two adjacent blocks are both free;
//! - the sentinels are intact.
//!
//! Tests call the checker after every public operation; it is not wired
//! into the hot path.

use crate::align::{ALIGNMENT, is_aligned};
use crate::block::{
  MIN_BLK_SIZE, OVERHEAD, block_size, footer_tag, header_tag, is_allocated, is_epilogue,
  next_block, payload_size,
};

/// Counters gathered by a checker walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Regular blocks between the sentinels.
  pub blocks: usize,

  /// Free blocks among them.
  pub free_blocks: usize,

  /// Total free payload bytes.
  pub free_payload: usize,

  /// Payload capacity of the largest free block.
  pub largest_free_payload: usize,
}

/// Walks the heap from the prologue at `listp` to the break at `end`,
/// validating every block, and returns the gathered counters.
///
/// # Panics
///
/// Panics with a description of the first violated invariant.
pub(crate) unsafe fn check_heap(
  listp: *mut u8,
  end: *mut u8,
) -> HeapStats {
  let mut stats = HeapStats::default();

  unsafe {
    assert!(is_allocated(listp), "prologue must be allocated");
    assert_eq!(block_size(listp), OVERHEAD, "prologue must be {OVERHEAD} bytes");

    let mut prev_free = false;
    let mut bp = next_block(listp);

    while !is_epilogue(bp) {
      assert!(
        (bp as usize) < end as usize,
        "walk ran past the break at {end:p}"
      );
      assert!(
        is_aligned(bp as usize),
        "block pointer {bp:p} is not {ALIGNMENT}-aligned"
      );

      let size = block_size(bp);
      assert!(size >= MIN_BLK_SIZE, "block at {bp:p} is only {size} bytes");
      assert!(
        is_aligned(size),
        "block size {size} at {bp:p} is not a multiple of {ALIGNMENT}"
      );
      assert_eq!(
        header_tag(bp),
        footer_tag(bp),
        "header and footer disagree at {bp:p}"
      );

      let free = !is_allocated(bp);
      assert!(
        !(free && prev_free),
        "adjacent free blocks at {bp:p}"
      );

      stats.blocks += 1;
      if free {
        let payload = payload_size(bp);
        stats.free_blocks += 1;
        stats.free_payload += payload;
        stats.largest_free_payload = stats.largest_free_payload.max(payload);
      }

      prev_free = free;
      bp = next_block(bp);
    }

    assert_eq!(
      bp, end,
      "blocks do not tile the heap: epilogue at {bp:p}, break at {end:p}"
    );
  }

  stats
}

/// Logs every block between the sentinels at trace level, in the shape
///
/// ```text
/// [tag] alloc     48  0x55..a0 -- 0x55..cf  0x31/0x31
/// ```
pub(crate) unsafe fn dump_heap(
  tag: &str,
  listp: *mut u8,
) {
  if !log::log_enabled!(log::Level::Trace) {
    return;
  }

  log::trace!("[{tag}] heap dump:");
  unsafe {
    let mut bp = next_block(listp);
    while !is_epilogue(bp) {
      let size = block_size(bp);
      log::trace!(
        "[{tag}] {} {size:8} {bp:p} -- {:p}  {:#x}/{:#x}",
        if is_allocated(bp) { "alloc" } else { "free " },
        bp.add(size - 1),
        header_tag(bp),
        footer_tag(bp),
      );
      bp = next_block(bp);
    }
  }
}
