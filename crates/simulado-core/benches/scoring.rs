use criterion::{black_box, criterion_group, criterion_main, Criterion};

use simulado_core::scorer::{count_inconsistencies, score_items, ScoredItem};

fn make_items(n: usize, every_nth_correct: usize) -> Vec<ScoredItem> {
    (0..n)
        .map(|i| ScoredItem {
            difficulty: (i % 11) as f64 / 10.0,
            correct: i % every_nth_correct == 0,
            answered: i % every_nth_correct == 0 || i % 7 != 0,
        })
        .collect()
}

fn bench_score_items(c: &mut Criterion) {
    let mut group = c.benchmark_group("score_items");

    for (label, n) in [("area=45", 45), ("enem=180", 180), ("bank=2000", 2000)] {
        let items = make_items(n, 3);
        group.bench_function(label, |b| b.iter(|| score_items(black_box(&items))));
    }

    group.finish();
}

fn bench_inconsistencies(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_inconsistencies");

    let items = make_items(180, 2);
    group.bench_function("n=180", |b| {
        b.iter(|| count_inconsistencies(black_box(&items)))
    });

    group.finish();
}

criterion_group!(benches, bench_score_items, bench_inconsistencies);
criterion_main!(benches);
