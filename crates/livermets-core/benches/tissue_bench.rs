//! Criterion benchmarks for the tissue tick pipeline.
//!
//! Population size and tick counts are tunable through environment variables
//! so the same harness covers quick local runs and longer profiling sessions:
//!
//! ```text
//! LIVERMETS_BENCH_CELLS=5000 LIVERMETS_BENCH_TICKS=50 cargo bench -p livermets-core
//! ```

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use livermets_core::{CullingPolicy, Position, ResistanceModulation, TissueConfig, TissueState};
use livermets_hull::convex_hull_indices;
use std::hint::black_box;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn seeded_tissue(cells: usize) -> TissueState {
    let config = TissueConfig {
        rng_seed: Some(0xBEEF),
        cell_limit: usize::MAX,
        sampling_multiple: 0,
        ..TissueConfig::default()
    };
    let mut tissue = TissueState::new(config).expect("tissue");
    tissue.add_policy(CullingPolicy::background(0.005).expect("background"));
    tissue.add_policy(CullingPolicy::boundary(0.05).expect("boundary"));
    tissue.add_policy(
        CullingPolicy::chemotherapy(0.02, ResistanceModulation::default()).expect("chemo"),
    );
    // Deterministic spiral keeps the hull non-trivial at every size.
    for i in 0..cells {
        let angle = i as f64 * 0.37;
        let radius = (i as f64).sqrt() * 0.05;
        tissue.seed_cell(Position::new(radius * angle.cos(), radius * angle.sin()));
    }
    tissue
}

fn bench_step(c: &mut Criterion) {
    let cells = env_usize("LIVERMETS_BENCH_CELLS", 1000);
    let ticks = env_usize("LIVERMETS_BENCH_TICKS", 10);

    let mut group = c.benchmark_group("tissue_step");
    group.bench_function(format!("cells_{cells}_ticks_{ticks}"), |b| {
        b.iter_batched(
            || seeded_tissue(cells),
            |mut tissue| {
                for _ in 0..ticks {
                    black_box(tissue.step());
                }
                tissue
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_hull(c: &mut Criterion) {
    let cells = env_usize("LIVERMETS_BENCH_CELLS", 1000);
    let points: Vec<(f64, f64)> = (0..cells)
        .map(|i| {
            let angle = i as f64 * 0.37;
            let radius = (i as f64).sqrt() * 0.05;
            (radius * angle.cos(), radius * angle.sin())
        })
        .collect();

    let mut group = c.benchmark_group("boundary");
    group.bench_function(format!("monotone_chain_{cells}"), |b| {
        b.iter(|| black_box(convex_hull_indices(black_box(&points))));
    });
    group.finish();
}

criterion_group!(benches, bench_step, bench_hull);
criterion_main!(benches);
