use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use io_scheduler::{elevator_sort, elevator_sweeps};
use std::hint::black_box;

fn random_extents(count: usize, overlap: bool) -> Vec<(u64, u64)> {
    let span = if overlap { count as u64 / 4 + 1 } else { count as u64 * 16 };
    (0..count).map(|_| (fastrand::u64(0..span) * 512, fastrand::u64(1..9) * 512)).collect()
}

fn bench_elevator_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("elevator_sort");
    for count in [16, 128, 1024] {
        for overlap in [false, true] {
            let name = if overlap { "overlapping" } else { "sparse" };
            let items = random_extents(count, overlap);
            group.bench_with_input(BenchmarkId::new(name, count), &items, |b, items| {
                b.iter_batched(
                    || items.clone(),
                    |mut batch| black_box(elevator_sort(&mut batch)),
                    BatchSize::SmallInput,
                );
            });
        }
    }
    group.finish();
}

fn bench_elevator_sweeps(c: &mut Criterion) {
    let items = random_extents(1024, true);
    c.bench_function("elevator_sweeps_1024", |b| {
        b.iter_batched(|| items.clone(), |batch| black_box(elevator_sweeps(batch)), BatchSize::SmallInput);
    });
}

criterion_group!(benches, bench_elevator_sort, bench_elevator_sweeps);
criterion_main!(benches);
