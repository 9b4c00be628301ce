//! Voxelwise non-local means.
//!
//! Every processed voxel is replaced by the similarity-weighted mean of the
//! voxels in its search block. Voxels are independent: each rayon task reads
//! the shared input and writes only its own output element.

use ndarray::{Array3, ArrayView3, Zip};
use tracing::{debug, instrument};

use crate::error::{NlmeansError, Result};
use crate::filtering::{nlm_weight, rician_correct, ChannelFilter, WeightAccumulator};
use crate::patch::{search_range, DenseVolume};
use crate::sigma::ChannelSigma;
use crate::voxel::VoxelValue;

/// Default patch radius (3x3x3 patches).
pub const DEFAULT_PATCH_RADIUS: usize = 1;

/// Default search radius (11x11x11 search blocks).
pub const DEFAULT_BLOCK_RADIUS: usize = 5;

/// Voxelwise NLM parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelwiseFilter {
    /// Patch side is `2 * patch_radius + 1`.
    pub patch_radius: usize,
    /// Search block side is `2 * block_radius + 1`.
    pub block_radius: usize,
}

impl Default for VoxelwiseFilter {
    fn default() -> Self {
        Self {
            patch_radius: DEFAULT_PATCH_RADIUS,
            block_radius: DEFAULT_BLOCK_RADIUS,
        }
    }
}

impl VoxelwiseFilter {
    pub fn new(patch_radius: usize, block_radius: usize) -> Self {
        Self {
            patch_radius,
            block_radius,
        }
    }

    /// The search block must be larger than the patch.
    pub fn validate(&self) -> Result<()> {
        if self.block_radius <= self.patch_radius {
            return Err(NlmeansError::invalid_parameter(
                "block_radius",
                format!(
                    "must exceed patch_radius ({} <= {})",
                    self.block_radius, self.patch_radius
                ),
            ));
        }
        Ok(())
    }

    /// Denoise one 3D volume.
    ///
    /// Voxels where `mask` is false are copied through unchanged. `sigma` must
    /// already be validated (> 0 everywhere).
    #[instrument(
        level = "debug",
        skip(self, volume, mask, sigma),
        fields(dims = ?volume.dim(), patch_radius = self.patch_radius, block_radius = self.block_radius)
    )]
    pub fn filter<T: VoxelValue>(
        &self,
        volume: ArrayView3<T>,
        mask: Option<ArrayView3<bool>>,
        sigma: ChannelSigma<'_>,
        rician: bool,
    ) -> Array3<T> {
        let dense = DenseVolume::from_view(volume);
        let mut output = Array3::<T>::zeros(volume.raw_dim());

        Zip::indexed(&mut output)
            .and(&volume)
            .par_for_each(|(x, y, z), out, &original| {
                let p = [x, y, z];
                *out = match mask {
                    Some(m) if !m[p] => original,
                    _ => T::store(self.denoise_voxel(&dense, p, sigma.at(p), rician)),
                };
            });

        debug!(
            processed = mask.map_or(dense.len(), |m| m.iter().filter(|&&b| b).count()),
            "voxelwise pass done"
        );
        output
    }

    /// NLM estimate at voxel `v` with local noise level `sigma`.
    pub fn denoise_voxel(&self, vol: &DenseVolume, v: [usize; 3], sigma: f64, rician: bool) -> f64 {
        let [d0, d1, d2] = vol.dims();
        let mut acc = WeightAccumulator::default();

        for x in search_range(v[0], self.block_radius, d0) {
            for y in search_range(v[1], self.block_radius, d1) {
                for z in search_range(v[2], self.block_radius, d2) {
                    let w = [x, y, z];
                    let distance = vol.patch_distance(v, w, self.patch_radius);
                    acc.add(nlm_weight(distance, sigma), vol.get(w));
                }
            }
        }

        let estimate = acc.estimate_or(vol.get(v));
        if rician {
            rician_correct(estimate, sigma)
        } else {
            estimate
        }
    }
}

impl ChannelFilter for VoxelwiseFilter {
    fn filter_channel<T: VoxelValue>(
        &self,
        volume: ArrayView3<T>,
        mask: Option<ArrayView3<bool>>,
        sigma: ChannelSigma<'_>,
        rician: bool,
    ) -> Result<Array3<T>> {
        Ok(self.filter(volume, mask, sigma, rician))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::prelude::*;
    use rand_distr::{Distribution, Normal};

    fn noisy_constant(dims: (usize, usize, usize), value: f64, sigma: f64, seed: u64) -> Array3<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(value, sigma).unwrap();
        Array3::from_shape_fn(dims, |_| normal.sample(&mut rng))
    }

    fn mean_and_variance(values: &Array3<f64>) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.sum() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    #[test]
    fn test_validate_radii() {
        assert!(VoxelwiseFilter::default().validate().is_ok());
        assert!(VoxelwiseFilter::new(2, 2).validate().is_err());
        assert!(VoxelwiseFilter::new(3, 1).validate().is_err());
        assert!(VoxelwiseFilter::new(0, 1).validate().is_ok());
    }

    #[test]
    fn test_uniform_volume_is_identity() {
        let vol = Array3::<f32>::from_elem((6, 7, 5), 42.0);
        for (p, b) in [(0, 1), (1, 2), (1, 5)] {
            let out = VoxelwiseFilter::new(p, b).filter(
                vol.view(),
                None,
                ChannelSigma::Uniform(3.0),
                false,
            );
            assert!(out.iter().all(|&v| v == 42.0), "p={p} b={b}");
        }
    }

    #[test]
    fn test_single_voxel_volume() {
        let vol = Array3::<f64>::from_elem((1, 1, 1), 7.0);
        let out = VoxelwiseFilter::new(1, 2).filter(vol.view(), None, ChannelSigma::Uniform(1.0), false);
        assert_eq!(out[[0, 0, 0]], 7.0);
    }

    #[test]
    fn test_noise_reduction() {
        let vol = noisy_constant((10, 10, 10), 100.0, 5.0, 1234);
        let out = VoxelwiseFilter::new(1, 2).filter(
            vol.view(),
            None,
            ChannelSigma::Uniform(5.0),
            false,
        );

        let (in_mean, in_var) = mean_and_variance(&vol);
        let (out_mean, out_var) = mean_and_variance(&out);
        assert!(out_var < in_var, "variance {out_var} not below {in_var}");
        assert!((out_mean - 100.0).abs() < 1.0, "mean drifted to {out_mean}");
        assert!((out_mean - in_mean).abs() < 1.0);
    }

    #[test]
    fn test_mask_pass_through() {
        let vol = noisy_constant((8, 8, 8), 50.0, 4.0, 9);
        let mask = Array3::from_shape_fn((8, 8, 8), |(x, _, _)| x < 4);
        let out = VoxelwiseFilter::new(1, 2).filter(
            vol.view(),
            Some(mask.view()),
            ChannelSigma::Uniform(4.0),
            false,
        );

        for ((idx, &o), &i) in out.indexed_iter().zip(vol.iter()) {
            if !mask[idx] {
                assert_eq!(o, i);
            }
        }
        // Processed voxels actually change
        let changed = out
            .indexed_iter()
            .filter(|(idx, o)| mask[*idx] && **o != vol[*idx])
            .count();
        assert!(changed > 0);
    }

    #[test]
    fn test_rician_never_increases_estimate() {
        let vol = noisy_constant((7, 7, 7), 20.0, 3.0, 77);
        let filter = VoxelwiseFilter::new(1, 2);
        let plain = filter.filter(vol.view(), None, ChannelSigma::Uniform(3.0), false);
        let corrected = filter.filter(vol.view(), None, ChannelSigma::Uniform(3.0), true);

        for (c, p) in corrected.iter().zip(plain.iter()) {
            assert!(c <= p);
            assert!(*c >= 0.0);
        }
    }

    #[test]
    fn test_per_voxel_sigma_controls_smoothing() {
        // With a tiny sigma, dissimilar neighbours get ~zero weight
        let vol = noisy_constant((6, 6, 6), 10.0, 2.0, 5);
        let mut sigma = Array3::from_elem((6, 6, 6), 50.0);
        sigma[[3, 3, 3]] = 1e-6;

        let out = VoxelwiseFilter::new(1, 2).filter(
            vol.view(),
            None,
            ChannelSigma::PerVoxel(sigma.view()),
            false,
        );
        assert!((out[[3, 3, 3]] - vol[[3, 3, 3]]).abs() < 1e-9);
        assert!((out[[2, 2, 2]] - vol[[2, 2, 2]]).abs() > 1e-6);
    }

    #[test]
    fn test_integer_storage_preserved() {
        let vol = Array3::<u16>::from_shape_fn((5, 5, 5), |(x, y, z)| (100 + x + y + z) as u16);
        let out = VoxelwiseFilter::new(1, 2).filter(vol.view(), None, ChannelSigma::Uniform(2.0), false);
        assert_eq!(out.dim(), vol.dim());
        // A smooth ramp stays within its own range
        assert!(out.iter().all(|&v| (100..=112).contains(&v)));
    }

    #[test]
    fn test_matches_serial_reference() {
        let vol = noisy_constant((5, 6, 4), 30.0, 2.0, 21);
        let filter = VoxelwiseFilter::new(1, 2);
        let out = filter.filter(vol.view(), None, ChannelSigma::Uniform(2.0), true);

        let dense = DenseVolume::from_view(vol.view());
        for ((x, y, z), &o) in out.indexed_iter() {
            let expected = filter.denoise_voxel(&dense, [x, y, z], 2.0, true);
            assert_eq!(o, expected);
        }
    }
}
