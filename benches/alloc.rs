use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use rmalloc::{Malloc, Policy, Variant};

const CAP: usize = 4 * 1024 * 1024;

/// Allocate a ladder of sizes, free every other block, then fill the gaps
/// again. Exercises search, split and coalesce on every engine.
fn churn(mm: &mut Malloc) {
  unsafe {
    let ptrs: Vec<_> = (0..128).map(|i| mm.malloc(16 + (i % 13) * 24)).collect();

    for p in ptrs.iter().step_by(2) {
      mm.free(*p);
    }
    let refill: Vec<_> = (0..64).map(|i| black_box(mm.malloc(16 + (i % 13) * 24))).collect();

    // tear everything down so the next iteration starts clean
    for p in ptrs.iter().skip(1).step_by(2) {
      mm.free(*p);
    }
    for p in refill {
      mm.free(p);
    }
  }
}

fn bench_churn(c: &mut Criterion) {
  let mut group = c.benchmark_group("churn");

  for (name, variant) in [
    ("implicit_first_fit", Variant::Implicit(Policy::FirstFit)),
    ("implicit_next_fit", Variant::Implicit(Policy::NextFit)),
    ("implicit_best_fit", Variant::Implicit(Policy::BestFit)),
    ("segregated", Variant::Segregated),
  ] {
    group.bench_function(name, |b| {
      let mut mm = Malloc::with_capacity(variant, CAP).unwrap();
      b.iter(|| churn(&mut mm));
    });
  }

  group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
  let mut group = c.benchmark_group("realloc_growth");

  for (name, variant) in [
    ("implicit_first_fit", Variant::Implicit(Policy::FirstFit)),
    ("segregated", Variant::Segregated),
  ] {
    group.bench_function(name, |b| {
      let mut mm = Malloc::with_capacity(variant, CAP).unwrap();
      b.iter(|| unsafe {
        let mut p = mm.malloc(8);
        for size in (64..=4096).step_by(64) {
          p = mm.realloc(p, size);
        }
        mm.free(black_box(p));
      });
    });
  }

  group.finish();
}

criterion_group!(benches, bench_churn, bench_realloc_growth);
criterion_main!(benches);
