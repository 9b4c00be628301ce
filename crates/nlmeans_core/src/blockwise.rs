//! Blockwise non-local means.
//!
//! Weights are computed between overlapping blocks instead of single voxels,
//! and every weighted block is spread over the footprint of the reference
//! block. One weight per block pair amortizes the patch comparison over the
//! whole block, at the price of block-granular locality.
//!
//! Aggregation is accumulate-then-normalize:
//! 1. Reference planes are split into slabs, one rayon task per slab. Each task
//!    owns a private accumulator arena covering its planes plus the footprint
//!    halo, so no two workers ever write the same memory.
//! 2. Collecting the slabs is the barrier. Slabs are merged into one arena in
//!    slab order, which keeps the result independent of scheduling.
//! 3. A parallel pass normalizes every voxel (weighted sum / weight sum).

use ndarray::{Array3, ArrayView3, Zip};
use rayon::prelude::*;
use tracing::{debug, instrument, warn};

use crate::error::{NlmeansError, Result};
use crate::filtering::{nlm_weight, rician_correct, ChannelFilter, WeightAccumulator};
use crate::noise_estimation::{
    correction_factor, LocalDifferenceEstimator, NoiseEstimator, DEFAULT_NOISE_CHANNELS,
};
use crate::patch::{search_range, DenseVolume, PatchWindow};
use crate::sigma::{check_sigma_value, ChannelSigma};
use crate::voxel::VoxelValue;

/// Default search radius for candidate blocks (displacements within +-1).
pub const DEFAULT_BLOCKWISE_PATCH_RADIUS: usize = 1;

/// Default block half side (11x11x11 blocks).
pub const DEFAULT_BLOCKWISE_BLOCK_RADIUS: usize = 5;

/// Rician correction used when a caller does not pass the flag through
/// (per-channel 4D dispatch).
pub const DEFAULT_BLOCKWISE_RICIAN: bool = true;

/// Distance between neighbouring reference block centers.
const BLOCK_STRIDE: usize = 2;

/// Local mean or variance at or below this marks a flat/background region.
const MOMENT_EPSILON: f64 = 1e-5;

/// Candidate preselection: local mean ratio must lie in (0.95, 1/0.95).
const MEAN_RATIO_MIN: f64 = 0.95;

/// Candidate preselection: local variance ratio must lie in (0.5, 2).
const VARIANCE_RATIO_MIN: f64 = 0.5;

/// Minimum chunk length for Rayon parallel iteration.
const RAYON_MIN_CHUNK_LEN: usize = 64;

/// Blockwise NLM parameters.
///
/// Naming follows the blockwise formulation: `block_radius` sizes the block
/// (both the similarity descriptor and the footprint receiving contributions),
/// `patch_radius` bounds how far candidate block centers may be displaced from
/// the reference center.
#[derive(Debug, Clone, Copy)]
pub struct BlockwiseFilter<E: NoiseEstimator = LocalDifferenceEstimator> {
    pub patch_radius: usize,
    pub block_radius: usize,
    /// Receiver channel count handed to the estimator.
    pub noise_channels: usize,
    pub estimator: E,
}

impl Default for BlockwiseFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKWISE_PATCH_RADIUS, DEFAULT_BLOCKWISE_BLOCK_RADIUS)
    }
}

impl BlockwiseFilter {
    /// The estimator skips zero-intensity background voxels.
    pub fn new(patch_radius: usize, block_radius: usize) -> Self {
        Self {
            patch_radius,
            block_radius,
            noise_channels: DEFAULT_NOISE_CHANNELS,
            estimator: LocalDifferenceEstimator::new().with_exclude_background(true),
        }
    }
}

impl<E: NoiseEstimator> BlockwiseFilter<E> {
    /// Replace the noise estimator.
    pub fn with_estimator<E2: NoiseEstimator>(self, estimator: E2) -> BlockwiseFilter<E2> {
        BlockwiseFilter {
            patch_radius: self.patch_radius,
            block_radius: self.block_radius,
            noise_channels: self.noise_channels,
            estimator,
        }
    }

    pub fn with_noise_channels(mut self, noise_channels: usize) -> Self {
        self.noise_channels = noise_channels;
        self
    }

    pub fn validate(&self) -> Result<()> {
        correction_factor(self.noise_channels).map(|_| ())
    }

    /// Reference block center spacing; never larger than a block so every
    /// voxel is covered.
    #[inline]
    pub fn stride(&self) -> usize {
        BLOCK_STRIDE.min(2 * self.block_radius + 1)
    }

    /// Estimate sigma for `volume`, falling back to the caller's sigma when the
    /// estimate is unusable (e.g. a constant volume yields 0).
    pub fn estimate_sigma<T: VoxelValue>(
        &self,
        volume: ArrayView3<T>,
        fallback: ChannelSigma<'_>,
    ) -> Result<f64> {
        let estimated = self.estimator.estimate(volume, self.noise_channels)?;
        if estimated.is_finite() && estimated > 0.0 {
            return Ok(estimated);
        }

        let fallback = fallback.representative();
        warn!(
            estimated,
            fallback, "noise estimate is degenerate, using the supplied sigma"
        );
        check_sigma_value(fallback)?;
        Ok(fallback)
    }

    /// Denoise one 3D volume with an explicit scalar `sigma`.
    #[instrument(
        level = "debug",
        skip(self, volume),
        fields(dims = ?volume.dim(), patch_radius = self.patch_radius, block_radius = self.block_radius)
    )]
    pub fn filter<T: VoxelValue>(
        &self,
        volume: ArrayView3<T>,
        sigma: f64,
        rician: bool,
    ) -> Result<Array3<T>> {
        check_sigma_value(sigma)?;
        let dense = DenseVolume::from_view(volume);
        if dense.is_empty() {
            return Err(NlmeansError::InvalidShape {
                shape: volume.shape().to_vec(),
            });
        }

        let slab_count = rayon::current_num_threads().max(1);
        let arena = self.accumulate(&dense, sigma, slab_count);

        let mut output = Array3::<T>::zeros(volume.raw_dim());
        Zip::indexed(&mut output)
            .and(&volume)
            .par_for_each(|(x, y, z), out, &original| {
                let acc = &arena[dense.index([x, y, z])];
                *out = match acc.estimate() {
                    Some(est) if rician => T::store(rician_correct(est, sigma)),
                    Some(est) => T::store(est),
                    None => original,
                };
            });

        Ok(output)
    }

    /// Phase 1 and 2: accumulate all block contributions into one arena
    /// indexed like `dense`.
    fn accumulate(&self, dense: &DenseVolume, sigma: f64, slab_count: usize) -> Vec<WeightAccumulator> {
        let [d0, d1, d2] = dense.dims();
        let stride = self.stride();
        let moments = LocalMoments::compute(dense);

        let ref_x: Vec<usize> = (0..d0).step_by(stride).collect();
        let ref_y: Vec<usize> = (0..d1).step_by(stride).collect();
        let ref_z: Vec<usize> = (0..d2).step_by(stride).collect();

        let slab_count = slab_count.clamp(1, ref_x.len());
        let chunk_len = ref_x.len().div_ceil(slab_count);

        let slabs: Vec<SlabAccumulator> = ref_x
            .par_chunks(chunk_len)
            .map(|planes| {
                let x_lo = planes[0].saturating_sub(self.block_radius);
                let x_hi = (planes[planes.len() - 1] + self.block_radius).min(d0 - 1);
                let mut slab = SlabAccumulator::new(x_lo, x_hi, [d0, d1, d2]);
                let mut candidates = Vec::new();

                for &x in planes {
                    for &y in &ref_y {
                        for &z in &ref_z {
                            self.accumulate_block(
                                dense,
                                &moments,
                                [x, y, z],
                                sigma,
                                &mut candidates,
                                &mut slab,
                            );
                        }
                    }
                }
                slab
            })
            .collect();

        let mut arena = vec![WeightAccumulator::default(); dense.len()];
        let plane = d1 * d2;
        let block_passes: usize = slabs.iter().map(|s| s.blocks).sum();
        for slab in &slabs {
            let start = slab.x_lo * plane;
            for (dst, src) in arena[start..start + slab.cells.len()]
                .iter_mut()
                .zip(slab.cells.iter())
            {
                dst.merge(src);
            }
        }

        debug!(
            slabs = slabs.len(),
            block_passes, stride, "blockwise accumulation done"
        );
        arena
    }

    /// Weigh the candidates around reference center `v` and spread every
    /// contributing block over the footprint of `v`.
    fn accumulate_block(
        &self,
        dense: &DenseVolume,
        moments: &LocalMoments,
        v: [usize; 3],
        sigma: f64,
        candidates: &mut Vec<([usize; 3], f64)>,
        slab: &mut SlabAccumulator,
    ) {
        let dims = dense.dims();
        let (mean_v, var_v) = moments.at(dense.index(v));
        candidates.clear();

        let self_weight = if mean_v <= MOMENT_EPSILON || var_v <= MOMENT_EPSILON {
            1.0
        } else {
            let mut w_max = 0.0f64;
            for x in search_range(v[0], self.patch_radius, dims[0]) {
                for y in search_range(v[1], self.patch_radius, dims[1]) {
                    for z in search_range(v[2], self.patch_radius, dims[2]) {
                        let n = [x, y, z];
                        if n == v {
                            continue;
                        }
                        let (mean_n, var_n) = moments.at(dense.index(n));
                        if mean_n <= MOMENT_EPSILON || var_n <= MOMENT_EPSILON {
                            continue;
                        }
                        if !similar_ratio(mean_v / mean_n, MEAN_RATIO_MIN)
                            || !similar_ratio(var_v / var_n, VARIANCE_RATIO_MIN)
                        {
                            continue;
                        }
                        let distance = dense.patch_distance(v, n, self.block_radius);
                        let w = nlm_weight(distance, sigma);
                        w_max = w_max.max(w);
                        candidates.push((n, w));
                    }
                }
            }
            if w_max > 0.0 {
                w_max
            } else {
                1.0
            }
        };
        candidates.push((v, self_weight));

        for &(n, w) in candidates.iter() {
            slab.add_block(dense, v, n, self.block_radius, w);
        }
        slab.blocks += 1;
    }
}

impl<E: NoiseEstimator> ChannelFilter for BlockwiseFilter<E> {
    /// Sigma is always re-estimated from the channel; the supplied sigma is
    /// only a fallback for degenerate estimates. The mask is not consulted.
    fn filter_channel<T: VoxelValue>(
        &self,
        volume: ArrayView3<T>,
        mask: Option<ArrayView3<bool>>,
        sigma: ChannelSigma<'_>,
        rician: bool,
    ) -> Result<Array3<T>> {
        if mask.is_some() {
            debug!("blockwise filtering ignores the mask");
        }
        let sigma = self.estimate_sigma(volume, sigma)?;
        debug!(sigma, rician, "blockwise sigma resolved");
        self.filter(volume, sigma, rician)
    }
}

#[inline]
fn similar_ratio(ratio: f64, min: f64) -> bool {
    ratio > min && ratio < 1.0 / min
}

/// Per-voxel mean and sample variance over the in-bounds 3x3x3 neighbourhood.
struct LocalMoments {
    values: Vec<(f64, f64)>,
}

impl LocalMoments {
    fn compute(dense: &DenseVolume) -> Self {
        let [d0, d1, d2] = dense.dims();
        let values = (0..dense.len())
            .into_par_iter()
            .with_min_len(RAYON_MIN_CHUNK_LEN)
            .map(|idx| {
                let [x, y, z] = dense.coords(idx);
                let xs = search_range(x, 1, d0);
                let ys = search_range(y, 1, d1);
                let zs = search_range(z, 1, d2);

                let mut sum = 0.0;
                let mut count = 0usize;
                for i in xs.clone() {
                    for j in ys.clone() {
                        for k in zs.clone() {
                            sum += dense.get([i, j, k]);
                            count += 1;
                        }
                    }
                }
                let mean = sum / count as f64;

                let mut sq = 0.0;
                for i in xs {
                    for j in ys.clone() {
                        for k in zs.clone() {
                            let d = dense.get([i, j, k]) - mean;
                            sq += d * d;
                        }
                    }
                }
                let variance = if count > 1 {
                    sq / (count - 1) as f64
                } else {
                    0.0
                };
                (mean, variance)
            })
            .collect();
        Self { values }
    }

    #[inline(always)]
    fn at(&self, idx: usize) -> (f64, f64) {
        self.values[idx]
    }
}

/// Private accumulator arena for the x-planes `x_lo..=x_hi`.
struct SlabAccumulator {
    x_lo: usize,
    dims: [usize; 3],
    cells: Vec<WeightAccumulator>,
    blocks: usize,
}

impl SlabAccumulator {
    fn new(x_lo: usize, x_hi: usize, dims: [usize; 3]) -> Self {
        let planes = x_hi - x_lo + 1;
        Self {
            x_lo,
            dims,
            cells: vec![WeightAccumulator::default(); planes * dims[1] * dims[2]],
            blocks: 0,
        }
    }

    #[inline(always)]
    fn local_index(&self, p: [usize; 3]) -> usize {
        ((p[0] - self.x_lo) * self.dims[1] + p[1]) * self.dims[2] + p[2]
    }

    /// Add `weight * I(n + o)` to voxel `v + o` for every footprint offset `o`
    /// with both positions in bounds.
    fn add_block(&mut self, dense: &DenseVolume, v: [usize; 3], n: [usize; 3], radius: usize, weight: f64) {
        let window = PatchWindow::new(v, n, radius, self.dims);
        let row_len = window.extent(2);
        let src = dense.as_slice();

        for o0 in window.lo[0]..=window.hi[0] {
            for o1 in window.lo[1]..=window.hi[1] {
                let target = self.local_index([
                    shift(v[0], o0),
                    shift(v[1], o1),
                    shift(v[2], window.lo[2]),
                ]);
                let source = dense.index([
                    shift(n[0], o0),
                    shift(n[1], o1),
                    shift(n[2], window.lo[2]),
                ]);
                for (cell, &value) in self.cells[target..target + row_len]
                    .iter_mut()
                    .zip(src[source..source + row_len].iter())
                {
                    cell.add(weight, value);
                }
            }
        }
    }
}

#[inline(always)]
fn shift(base: usize, off: isize) -> usize {
    (base as isize + off) as usize
}
