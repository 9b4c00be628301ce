//! Weighting, accumulation and Rician bias correction shared by the
//! voxelwise and blockwise filters.

use ndarray::{Array3, ArrayView3};

use crate::error::Result;
use crate::sigma::ChannelSigma;
use crate::voxel::VoxelValue;

/// Smallest weight sum treated as non-degenerate.
const WEIGHT_SUM_EPSILON: f64 = f64::MIN_POSITIVE;

/// A denoising strategy applied to one 3D channel.
///
/// Implementors are narrow parameter structs with no retained state, so one
/// instance can serve every channel of a 4D volume concurrently.
pub trait ChannelFilter: Send + Sync {
    fn filter_channel<T: VoxelValue>(
        &self,
        volume: ArrayView3<T>,
        mask: Option<ArrayView3<bool>>,
        sigma: ChannelSigma<'_>,
        rician: bool,
    ) -> Result<Array3<T>>;
}

/// Similarity weight for a mean squared patch distance.
///
/// `exp(-d / (2 sigma^2))`; equals 1 for identical patches.
#[inline(always)]
pub fn nlm_weight(distance: f64, sigma: f64) -> f64 {
    (-distance / (2.0 * sigma * sigma)).exp()
}

/// Remove the positive bias NLM averaging introduces on Rician magnitude data,
/// clamping at zero.
#[inline]
pub fn rician_correct(estimate: f64, sigma: f64) -> f64 {
    (estimate - 2.0 * sigma * sigma).max(0.0)
}

/// Running (weighted intensity sum, weight sum) pair for one voxel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightAccumulator {
    pub weighted_sum: f64,
    pub weight_sum: f64,
}

impl WeightAccumulator {
    #[inline(always)]
    pub fn add(&mut self, weight: f64, value: f64) {
        self.weighted_sum += weight * value;
        self.weight_sum += weight;
    }

    #[inline]
    pub fn merge(&mut self, other: &WeightAccumulator) {
        self.weighted_sum += other.weighted_sum;
        self.weight_sum += other.weight_sum;
    }

    /// Weighted mean, or `None` if the weight sum underflowed.
    #[inline]
    pub fn estimate(&self) -> Option<f64> {
        if self.weight_sum >= WEIGHT_SUM_EPSILON && self.weight_sum.is_finite() {
            Some(self.weighted_sum / self.weight_sum)
        } else {
            None
        }
    }

    /// Weighted mean, falling back to `fallback` when degenerate.
    #[inline]
    pub fn estimate_or(&self, fallback: f64) -> f64 {
        self.estimate().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_identical_patches() {
        assert_eq!(nlm_weight(0.0, 3.0), 1.0);
    }

    #[test]
    fn test_weight_decreases_with_distance() {
        let sigma = 2.0;
        let mut prev = nlm_weight(0.0, sigma);
        for d in [0.5, 1.0, 4.0, 16.0, 64.0] {
            let w = nlm_weight(d, sigma);
            assert!(w < prev && w > 0.0);
            prev = w;
        }
        // exp(-8 / 8) at d = 8, sigma = 2
        assert!((nlm_weight(8.0, 2.0) - (-1.0f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn test_weight_underflows_without_nan() {
        let w = nlm_weight(1e12, 1e-3);
        assert_eq!(w, 0.0);
    }

    #[test]
    fn test_accumulator_weighted_mean() {
        let mut acc = WeightAccumulator::default();
        acc.add(1.0, 10.0);
        acc.add(3.0, 20.0);
        assert_eq!(acc.estimate(), Some(17.5));

        let mut other = WeightAccumulator::default();
        other.add(4.0, 0.0);
        acc.merge(&other);
        assert_eq!(acc.estimate(), Some(70.0 / 8.0));
    }

    #[test]
    fn test_accumulator_degenerate_falls_back() {
        let mut acc = WeightAccumulator::default();
        assert_eq!(acc.estimate(), None);
        acc.add(0.0, 5.0);
        assert_eq!(acc.estimate_or(42.0), 42.0);
    }

    #[test]
    fn test_rician_correction_clamps() {
        assert_eq!(rician_correct(100.0, 1.0), 98.0);
        assert_eq!(rician_correct(1.0, 5.0), 0.0);
        assert!(rician_correct(37.0, 2.0) <= 37.0);
    }
}
