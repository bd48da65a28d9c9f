//! # Block layout and boundary tags
//!
//! Every block in the heap carries a one-word header and a one-word footer
//! encoding the same value: the total block size (always a multiple of 8)
//! with the allocated flag in bit 0.
//!
//! ```text
//!          ┌──────────┬─────────────────────────────────┬──────────┐
//!          │  header  │             payload             │  footer  │
//!          │ size | a │                                 │ size | a │
//!          └──────────┴─────────────────────────────────┴──────────┘
//!          ▲          ▲
//!          │          │
//!       bp − 4        bp  (block pointer, 8-aligned, returned to caller)
//! ```
//!
//! The duplicated footer makes both neighbours reachable in O(1): the next
//! block starts `size` bytes after `bp`, and the word just below the header
//! is the previous block's footer.
//!
//! Sentinels bracket the heap so neighbour queries never walk off it:
//!
//! ```text
//!   ┌─────────┬─────────────────┬──────────────────────┬──────────┐
//!   │ padding │ prologue (8, A) │    regular blocks    │ epilogue │
//!   │ word    │ header │ footer │         ...          │ (0, A)   │
//!   └─────────┴─────────────────┴──────────────────────┴──────────┘
//! ```
//!
//! The prologue is an 8-byte allocated block with no payload; its footer
//! stops every backward walk. The epilogue is a header-only block with
//! `size == 0` and the allocated flag set, re-placed at the break after
//! every heap extension.

use crate::align::ALIGNMENT;

/// Header and footer are each one 4-byte word.
pub const WORD: usize = 4;

/// Header size in bytes.
pub const HDR_SIZE: usize = WORD;

/// Footer size in bytes.
pub const FTR_SIZE: usize = WORD;

/// Per-block metadata overhead.
pub const OVERHEAD: usize = HDR_SIZE + FTR_SIZE;

/// Smallest block the allocator will create: header, footer and one
/// aligned payload unit. A free block of this size holds exactly one
/// pointer-sized link word on 64-bit hosts.
pub const MIN_BLK_SIZE: usize = OVERHEAD + ALIGNMENT;

/// Marker written into the padding word at the heap base. Not navigable.
pub const PADDING_WORD: u32 = 0xDEAD_BEEF;

/// Bytes consumed by the base sentinels: padding word, prologue block and
/// epilogue header.
pub const BASE_SIZE: usize = WORD + OVERHEAD + HDR_SIZE;

#[inline]
unsafe fn word(p: *mut u8) -> u32 {
  unsafe { p.cast::<u32>().read() }
}

#[inline]
unsafe fn set_word(
  p: *mut u8,
  value: u32,
) {
  unsafe { p.cast::<u32>().write(value) };
}

/// Packs a block size and its allocated flag into one tag word.
#[inline]
pub fn pack(
  size: usize,
  allocated: bool,
) -> u32 {
  debug_assert!(size <= (u32::MAX & !0x7) as usize);
  size as u32 | allocated as u32
}

#[inline]
fn unpack_size(tag: u32) -> usize {
  (tag & !0x7) as usize
}

#[inline]
fn unpack_allocated(tag: u32) -> bool {
  tag & 0x1 == 1
}

/// Header address of the block at `bp`.
#[inline]
pub unsafe fn header(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub(HDR_SIZE) }
}

/// Total size of the block at `bp`, header and footer included.
#[inline]
pub unsafe fn block_size(bp: *mut u8) -> usize {
  unsafe { unpack_size(word(header(bp))) }
}

/// Payload capacity of the block at `bp`.
#[inline]
pub unsafe fn payload_size(bp: *mut u8) -> usize {
  let size = unsafe { block_size(bp) };
  debug_assert!(size >= OVERHEAD);
  size - OVERHEAD
}

/// Whether the block at `bp` is allocated.
#[inline]
pub unsafe fn is_allocated(bp: *mut u8) -> bool {
  unsafe { unpack_allocated(word(header(bp))) }
}

/// Footer address of the block at `bp`.
#[inline]
pub unsafe fn footer(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(payload_size(bp)) }
}

/// Block pointer of the physically-next block.
#[inline]
pub unsafe fn next_block(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(block_size(bp)) }
}

/// Footer address of the physically-previous block.
#[inline]
pub unsafe fn prev_footer(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub(OVERHEAD) }
}

/// Total size of the physically-previous block.
#[inline]
pub unsafe fn prev_size(bp: *mut u8) -> usize {
  unsafe { unpack_size(word(prev_footer(bp))) }
}

/// Whether the physically-previous block is allocated.
#[inline]
pub unsafe fn prev_allocated(bp: *mut u8) -> bool {
  unsafe { unpack_allocated(word(prev_footer(bp))) }
}

/// Block pointer of the physically-previous block.
#[inline]
pub unsafe fn prev_block(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub(prev_size(bp)) }
}

/// Writes the header and footer of the block at `bp` in one go.
///
/// The header is written first; the footer address is derived from it.
#[inline]
pub unsafe fn set_block(
  bp: *mut u8,
  size: usize,
  allocated: bool,
) {
  unsafe {
    set_word(header(bp), pack(size, allocated));
    set_word(footer(bp), pack(size, allocated));
  }
}

/// Writes the epilogue header so that `brk` becomes the epilogue block
/// pointer. Called after every break move.
#[inline]
pub unsafe fn set_epilogue(brk: *mut u8) {
  unsafe { set_word(header(brk), pack(0, true)) };
}

/// Whether `bp` is the epilogue block: zero size, allocated.
#[inline]
pub unsafe fn is_epilogue(bp: *mut u8) -> bool {
  let tag = unsafe { word(header(bp)) };
  unpack_size(tag) == 0 && unpack_allocated(tag)
}

/// Lays the padding word, prologue block and epilogue header down at
/// `base` and returns the prologue block pointer, the anchor for every
/// heap walk. The caller must have mapped [`BASE_SIZE`] bytes at `base`.
pub unsafe fn write_base_sentinels(base: *mut u8) -> *mut u8 {
  unsafe {
    set_word(base, PADDING_WORD);
    set_word(base.add(WORD), pack(OVERHEAD, true));
    set_word(base.add(WORD + HDR_SIZE), pack(OVERHEAD, true));
    set_word(base.add(WORD + OVERHEAD), pack(0, true));

    base.add(WORD + HDR_SIZE)
  }
}

/// Marks the free block at `bp` allocated for an aligned payload of
/// `asize` bytes.
///
/// When the remainder could stand alone as a block, the tail is split off,
/// tagged free and returned; otherwise the whole block is handed out and
/// the slack becomes internal fragmentation.
///
/// The block at `bp` must be free, `asize` a multiple of 8 and no larger
/// than the block's payload.
pub unsafe fn place(
  bp: *mut u8,
  asize: usize,
) -> Option<*mut u8> {
  unsafe {
    debug_assert!(!is_allocated(bp));
    debug_assert!(asize <= payload_size(bp));

    let old_size = block_size(bp);
    let new_size = asize + OVERHEAD;
    let remainder = old_size - new_size;

    if remainder < MIN_BLK_SIZE {
      set_block(bp, old_size, true);
      return None;
    }

    set_block(bp, new_size, true);
    let split = next_block(bp);
    set_block(split, remainder, false);
    Some(split)
  }
}

/// Merges the free block at `bp` with its free physical neighbours and
/// returns the block pointer of the merged result.
///
/// `unlink` is invoked for each absorbed neighbour before its tags are
/// overwritten, so an index over free blocks can detach it first. Engines
/// without such an index pass a no-op.
pub unsafe fn coalesce(
  bp: *mut u8,
  mut unlink: impl FnMut(*mut u8),
) -> *mut u8 {
  unsafe {
    let mut size = block_size(bp);
    let mut merged = bp;

    let next = next_block(bp);
    if !is_allocated(next) {
      log::trace!("coalescing with next block at {next:p} ({} bytes)", block_size(next));
      unlink(next);
      size += block_size(next);
    }

    if !prev_allocated(bp) {
      let prev = prev_block(bp);
      log::trace!("coalescing with prev block at {prev:p} ({} bytes)", block_size(prev));
      unlink(prev);
      size += block_size(prev);
      merged = prev;
    }

    set_block(merged, size, false);
    merged
  }
}

/// Raw header word of the block at `bp`, for the dumper and the checker.
#[inline]
pub(crate) unsafe fn header_tag(bp: *mut u8) -> u32 {
  unsafe { word(header(bp)) }
}

/// Raw footer word of the block at `bp`.
#[inline]
pub(crate) unsafe fn footer_tag(bp: *mut u8) -> u32 {
  unsafe { word(footer(bp)) }
}

/// Best-effort validation that `bp` addresses a live allocated block:
/// plausible size, aligned size, allocated flag set, header mirrored in
/// the footer. Used by `realloc` before trusting a caller pointer.
pub unsafe fn valid_alloc_block(bp: *mut u8) -> bool {
  unsafe {
    let tag = word(header(bp));
    let size = unpack_size(tag);

    size >= MIN_BLK_SIZE
      && size % ALIGNMENT == 0
      && unpack_allocated(tag)
      && word(bp.add(size - OVERHEAD)) == tag
  }
}
