//! Criterion benchmarks for the NLM filters.
//!
//! Run with: cargo bench -p nlmeans_core
//! Run specific: cargo bench -p nlmeans_core -- voxelwise

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array3, Array4};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use nlmeans_core::patch::DenseVolume;
use nlmeans_core::{
    denoise_4d, BlockwiseFilter, ChannelSigma, LocalDifferenceEstimator, NlmeansConfig,
    NoiseEstimator, Sigma, VoxelwiseFilter,
};

// =============================================================================
// Helper Functions for Test Data Generation
// =============================================================================

fn noisy_volume(size: usize, sigma: f64, seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    Array3::from_shape_fn((size, size, size), |(x, y, z)| {
        let inside = x > size / 4 && x < 3 * size / 4 && y > size / 4 && y < 3 * size / 4;
        let base = if inside { 200.0 } else { 80.0 } + z as f64;
        base + normal.sample(&mut rng)
    })
}

// =============================================================================
// Patch Distance
// =============================================================================

fn bench_patch_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch_distance");
    let vol = noisy_volume(32, 5.0, 1);
    let dense = DenseVolume::from_view(vol.view());

    for radius in [1usize, 2, 3] {
        let side = 2 * radius + 1;
        group.throughput(Throughput::Elements((side * side * side) as u64));
        group.bench_with_input(BenchmarkId::new("interior", radius), &radius, |b, &r| {
            b.iter(|| dense.patch_distance(black_box([16, 16, 16]), black_box([17, 15, 18]), r))
        });
    }

    group.finish();
}

// =============================================================================
// Filters
// =============================================================================

fn bench_voxelwise(c: &mut Criterion) {
    let mut group = c.benchmark_group("voxelwise");
    group.sample_size(10);

    for size in [16, 32] {
        let vol = noisy_volume(size, 5.0, 42);
        group.throughput(Throughput::Elements((size * size * size) as u64));

        for (p, b) in [(1, 2), (1, 3)] {
            let filter = VoxelwiseFilter::new(p, b);
            group.bench_with_input(
                BenchmarkId::new(format!("p{p}_b{b}"), size),
                &size,
                |bench, _| {
                    bench.iter(|| {
                        filter.filter(black_box(vol.view()), None, ChannelSigma::Uniform(5.0), true)
                    })
                },
            );
        }
    }

    group.finish();
}

fn bench_blockwise(c: &mut Criterion) {
    let mut group = c.benchmark_group("blockwise");
    group.sample_size(10);

    for size in [16, 32, 48] {
        let vol = noisy_volume(size, 5.0, 7);
        group.throughput(Throughput::Elements((size * size * size) as u64));

        for (p, b) in [(1, 1), (1, 2)] {
            let filter = BlockwiseFilter::new(p, b);
            group.bench_with_input(
                BenchmarkId::new(format!("p{p}_b{b}"), size),
                &size,
                |bench, _| bench.iter(|| filter.filter(black_box(vol.view()), 5.0, true)),
            );
        }
    }

    group.finish();
}

// =============================================================================
// Noise Estimation
// =============================================================================

fn bench_noise_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("noise_estimation");
    let estimator = LocalDifferenceEstimator::new();

    for size in [32, 64, 96] {
        let vol = noisy_volume(size, 5.0, 3);
        group.throughput(Throughput::Elements((size * size * size) as u64));
        group.bench_with_input(BenchmarkId::new("local_difference", size), &size, |b, _| {
            b.iter(|| estimator.estimate(black_box(vol.view()), 4))
        });
    }

    group.finish();
}

// =============================================================================
// End-to-end 4D
// =============================================================================

fn bench_denoise_4d(c: &mut Criterion) {
    let mut group = c.benchmark_group("denoise_4d");
    group.sample_size(10);

    let channels = 4;
    let size = 16;
    let vol = noisy_volume(size, 5.0, 11);
    let vol4 = Array4::from_shape_fn((size, size, size, channels), |(x, y, z, _)| vol[[x, y, z]]);
    let config = NlmeansConfig::default().with_radii(1, 2);

    group.throughput(Throughput::Elements((size * size * size * channels) as u64));
    for workers in [1usize, 2, 4] {
        let config = config.with_worker_count(workers);
        group.bench_with_input(BenchmarkId::new("voxelwise_workers", workers), &workers, |b, _| {
            b.iter(|| denoise_4d(black_box(vol4.view()), &Sigma::Scalar(5.0), None, &config))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_patch_distance,
    bench_voxelwise,
    bench_blockwise,
    bench_noise_estimation,
    bench_denoise_4d,
);
criterion_main!(benches);
