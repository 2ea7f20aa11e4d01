//! Criterion benchmarks for the benchmark executor itself.
//!
//! Measures the executor's per-candidate overhead across kernel families on
//! CPU, so regressions in the measurement harness (allocation, epilogue,
//! finiteness check) show up independently of any device.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::Device;
use gradtune_core::{
    BenchmarkExecutor, CandidateCatalog, DtypeKind, Measurer, ProblemShape,
};

fn bench_measure(c: &mut Criterion) {
    let catalog = CandidateCatalog::new();
    let shape = ProblemShape::new(64, 32, 128, DtypeKind::F32).expect("valid shape");
    let candidates = catalog.candidates_for(&shape);

    let mut group = c.benchmark_group("executor_measure");
    for candidate in &candidates {
        group.bench_with_input(
            BenchmarkId::from_parameter(&candidate.id),
            candidate,
            |b, candidate| {
                let mut executor = BenchmarkExecutor::new(Device::Cpu).with_iters(1, 1);
                b.iter(|| executor.measure(&shape, candidate));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_measure);
criterion_main!(benches);
