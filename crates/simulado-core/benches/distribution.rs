use criterion::{black_box, criterion_group, criterion_main, Criterion};

use simulado_core::generator::plan_distribution;
use simulado_core::model::Discipline;

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_distribution");

    let plentiful: Vec<(Discipline, u64)> = Discipline::ALL.iter().map(|&d| (d, 500)).collect();
    group.bench_function("all_disciplines,total=180", |b| {
        b.iter(|| plan_distribution(black_box(&plentiful), black_box(180)))
    });

    let scarce: Vec<(Discipline, u64)> = Discipline::ALL
        .iter()
        .enumerate()
        .map(|(i, &d)| (d, (i as u64 % 4) * 3 + 1))
        .collect();
    group.bench_function("scarce,total=180", |b| {
        b.iter(|| plan_distribution(black_box(&scarce), black_box(180)))
    });

    group.finish();
}

criterion_group!(benches, bench_plan);
criterion_main!(benches);
