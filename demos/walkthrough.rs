use std::io::Read;

use rmalloc::{Malloc, Policy, Variant};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect the trace output of a step (run with
/// `RUST_LOG=trace` to see the heap dumps) before moving on.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the mapped heap size, the crate's stand-in for `sbrk(0)`.
fn print_watermark(
  label: &str,
  mm: &Malloc,
) {
  println!("[{}] mapped heap = {} bytes", label, mm.heap_len());
}

fn main() {
  env_logger::init();

  // --------------------------------------------------------------------
  // Implicit engine: watch a freed slot get reused and neighbours merge.
  // --------------------------------------------------------------------
  let mut mm = Malloc::new(Variant::Implicit(Policy::FirstFit)).expect("heap setup");

  println!("== implicit engine, first fit ==");
  print_watermark("start", &mm);
  block_until_enter_pressed();

  unsafe {
    // 1) Three allocations, each with a recognisable byte pattern.
    let a = mm.malloc(24);
    let b = mm.malloc(24);
    let c = mm.malloc(24);
    for (i, p) in [a, b, c].into_iter().enumerate() {
      std::ptr::write_bytes(p, 0xA0 + i as u8, 24);
    }
    println!("\n[1] a = {a:?}, b = {b:?}, c = {c:?}");
    print_watermark("after three mallocs", &mm);
    mm.dump("three live blocks");
    block_until_enter_pressed();

    // 2) Free the middle block, then ask for the same size again.
    mm.free(b);
    let d = mm.malloc(24);
    println!("\n[2] freed b, malloc(24) again = {d:?}");
    println!(
      "[2] d == b? {}",
      if d == b { "yes, the slot was reused" } else { "no" }
    );
    block_until_enter_pressed();

    // 3) Grow a well past its neighbours: the allocator relocates the
    //    payload into the free tail and releases the old block.
    mm.free(c);
    mm.free(d);
    let grown = mm.realloc(a, 200);
    println!("\n[3] realloc(a, 200) = {grown:?} (a was {a:?})");
    println!("[3] first payload byte survived: {:#x}", grown.read());
    print_watermark("after realloc", &mm);
    mm.dump("after realloc");
    block_until_enter_pressed();

    // 4) Free everything: coalescing leaves a single free block.
    mm.free(grown);
    mm.dump("everything freed");
    let stats = mm.check();
    println!("\n[4] free blocks after teardown: {}", stats.free_blocks);
    block_until_enter_pressed();
  }

  // --------------------------------------------------------------------
  // Segregated engine: the same API, bucket chatter in the trace log.
  // --------------------------------------------------------------------
  let mut mm = Malloc::new(Variant::Segregated).expect("heap setup");

  println!("\n== segregated engine ==");

  unsafe {
    // Pin a separator after each target so the frees cannot merge, then
    // release the targets into their size classes.
    let targets: Vec<_> = (1..12)
      .map(|i| {
        let target = mm.malloc(1 << (i + 2));
        let _separator = mm.malloc(8);
        target
      })
      .collect();

    for target in &targets {
      mm.free(*target);
    }

    mm.dump("one block per size class");
    let stats = mm.check();
    println!(
      "[5] {} free blocks spread over the buckets, largest payload {} bytes",
      stats.free_blocks, stats.largest_free_payload
    );

    // A small request is served from the smallest class that fits.
    let p = mm.malloc(48);
    println!("[6] malloc(48) = {p:?}, reused from a bucket");
    mm.free(p);
  }

  println!("\n[7] End of walkthrough. Both heaps are torn down on drop.");
}
