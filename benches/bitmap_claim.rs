use blockheap::{
  atomic::{AtomicCell, MemOrder},
  bitmap::{self, BitmapIndex},
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::{hint::black_box, sync::Barrier, thread};

const OPS: u64 = 10_000;

/// Claim then release one run per iteration in an otherwise empty bitmap.
fn claim_release(fields: &[bitmap::Field], count: usize) {
  for _ in 0..OPS {
    let idx = bitmap::find_claim(fields, count);
    if let Some(idx) = black_box(idx) {
      bitmap::unclaim(fields, count, idx);
    }
  }
}

fn bench_claim_release(c: &mut Criterion) {
  let mut group = c.benchmark_group("bitmap_claim_release");
  group.throughput(Throughput::Elements(OPS));

  for count in [1, 4, 16, 64] {
    let fields = bitmap::new_bitmap(8);
    group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
      b.iter(|| claim_release(&fields, count))
    });
  }

  group.finish();
}

/// Searching past a fragmented prefix: every other bit of the first fields is taken.
fn bench_fragmented_search(c: &mut Criterion) {
  let mut group = c.benchmark_group("bitmap_fragmented");
  group.throughput(Throughput::Elements(OPS));

  let fields = bitmap::new_bitmap(8);
  for field in fields.iter().take(7) {
    field.set(0x5555_5555_5555_5555u64 as usize, MemOrder::Relaxed);
  }
  group.bench_function("find_claim_2", |b| b.iter(|| claim_release(&fields, 2)));
  group.bench_function("find_claim_from_last", |b| {
    b.iter(|| {
      for _ in 0..OPS {
        if let Some(idx) = black_box(bitmap::find_claim_from(&fields, 7, 2)) {
          bitmap::unclaim(&fields, 2, idx);
        }
      }
    })
  });

  group.finish();
}

fn bench_contended(c: &mut Criterion) {
  let mut group = c.benchmark_group("bitmap_contended");

  for threads in [2, 4] {
    group.throughput(Throughput::Elements(OPS * threads as u64));
    group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
      let fields = bitmap::new_bitmap(1);
      b.iter(|| {
        let barrier = Barrier::new(threads);
        thread::scope(|s| {
          for _ in 0..threads {
            s.spawn(|| {
              barrier.wait();
              claim_release(&fields, 1);
            });
          }
        });
      })
    });
  }

  group.finish();
}

fn bench_try_claim(c: &mut Criterion) {
  let mut group = c.benchmark_group("bitmap_try_claim");
  group.throughput(Throughput::Elements(OPS));

  let fields = bitmap::new_bitmap(1);
  group.bench_function("try_claim_field", |b| {
    b.iter(|| {
      for i in 0..OPS as usize {
        let bit = i % 60;
        if bitmap::try_claim_field(&fields, 0, 4, bit) {
          bitmap::unclaim(&fields, 4, BitmapIndex::new(0, bit));
        }
      }
    })
  });

  group.finish();
}

criterion_group!(
  benches,
  bench_claim_release,
  bench_fragmented_search,
  bench_contended,
  bench_try_claim
);
criterion_main!(benches);
