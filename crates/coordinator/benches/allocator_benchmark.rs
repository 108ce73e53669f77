//! Allocator hot-path benchmarks
//!
//! Run: cargo bench -p modelpool-coordinator -- allocator

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use modelpool_common::config::AllocatorConfig;
use modelpool_coordinator::{Allocator, Priority};

fn arena(total_gb: f64) -> Allocator {
    Allocator::new(&AllocatorConfig {
        total_memory_gb: total_gb,
        reserved_memory_gb: 0.0,
        max_utilization: 1.0,
        ..Default::default()
    })
}

/// Admit then release one allocation into an otherwise empty arena
fn bench_admit_release(c: &mut Criterion) {
    let allocator = arena(80.0);

    c.bench_function("allocator_admit_release", |b| {
        b.iter(|| {
            allocator.admit(black_box("w"), "u", black_box(14.0), Priority::Medium);
            allocator.release(black_box("w"));
        })
    });
}

/// First-fit admission into an arena fragmented by alternating holes
fn bench_admit_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocator_admit_fragmented");

    for &slots in &[16usize, 64, 256] {
        let allocator = arena(slots as f64);
        for i in 0..slots {
            allocator.admit(&format!("w{}", i), "u", 1.0, Priority::High);
        }
        for i in (0..slots).step_by(2) {
            allocator.release(&format!("w{}", i));
        }

        group.bench_with_input(BenchmarkId::from_parameter(slots), &slots, |b, _| {
            b.iter(|| {
                allocator.admit("probe", "u", black_box(1.0), Priority::High);
                allocator.release("probe");
            })
        });
    }
    group.finish();
}

/// Eviction ordering over many low-priority candidates
fn bench_evict_until(c: &mut Criterion) {
    c.bench_function("allocator_evict_until", |b| {
        b.iter_batched(
            || {
                let allocator = arena(64.0);
                for i in 0..64 {
                    let priority = if i % 3 == 0 { Priority::Medium } else { Priority::Low };
                    allocator.admit(&format!("w{}", i), "u", 1.0, priority);
                }
                allocator
            },
            |allocator| black_box(allocator.evict_until(black_box(16.0))),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_defragment(c: &mut Criterion) {
    c.bench_function("allocator_defragment", |b| {
        b.iter_batched(
            || {
                let allocator = arena(256.0);
                for i in 0..256 {
                    allocator.admit(&format!("w{}", i), "u", 1.0, Priority::High);
                }
                for i in 0..256 {
                    if i % 4 != 0 {
                        allocator.release(&format!("w{}", i));
                    }
                }
                allocator
            },
            |allocator| black_box(allocator.defragment()),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_admit_release,
    bench_admit_fragmented,
    bench_evict_until,
    bench_defragment
);
criterion_main!(benches);
