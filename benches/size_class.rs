use blockheap::{CorruptionPolicy, Heap, PageSlab, bin, bin_size, good_size};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const SIZES: u64 = 4096;

fn bench_bin(c: &mut Criterion) {
  let mut group = c.benchmark_group("size_class");
  group.throughput(Throughput::Elements(SIZES));

  group.bench_function("bin", |b| {
    b.iter(|| {
      let mut sum = 0usize;
      for size in 1..=SIZES as usize {
        sum = sum.wrapping_add(bin(black_box(size * 7)) as usize);
      }
      black_box(sum)
    })
  });

  group.bench_function("good_size", |b| {
    b.iter(|| {
      let mut sum = 0usize;
      for size in 1..=SIZES as usize {
        sum = sum.wrapping_add(good_size(black_box(size * 7)));
      }
      black_box(sum)
    })
  });

  group.finish();
}

/// Direct-table lookups against a heap with one page in every small bin.
fn bench_direct_lookup(c: &mut Criterion) {
  let mut group = c.benchmark_group("direct_lookup");
  group.throughput(Throughput::Elements(SIZES));

  let slab = PageSlab::new(64, CorruptionPolicy::Report);
  let mut heap = Heap::new();
  for size in (8..=1024).step_by(8) {
    let b = bin(size);
    if heap.queue(b).is_empty() {
      if let Some(page) = slab.create(bin_size(b)) {
        heap.push(&slab, b, page);
      }
    }
  }

  group.bench_function("direct_page", |b| {
    b.iter(|| {
      let mut hits = 0usize;
      for size in 0..SIZES as usize {
        hits += heap.direct_page(black_box(size % 1024)).is_some() as usize;
      }
      black_box(hits)
    })
  });

  group.finish();
}

criterion_group!(benches, bench_bin, bench_direct_lookup);
criterion_main!(benches);
