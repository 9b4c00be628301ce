use ndarray::{ArrayView3, ArrayView4, ArrayViewD, Axis, Ix3, Ix4};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{NlmeansError, Result};
use crate::patch::DenseVolume;
use crate::voxel::VoxelValue;

/// Default number of receiver channels assumed by the estimator.
pub const DEFAULT_NOISE_CHANNELS: usize = 4;

/// Koay correction factors for the bias of magnitude data acquired with `N`
/// receiver channels. `N = 0` disables the correction.
const CORRECTION_FACTORS: [(usize, f64); 11] = [
    (0, 1.0),
    (1, 0.429_203_673_205_103_66),
    (4, 0.483_494_139_360_360_9),
    (6, 0.489_175_946_854_826_9),
    (8, 0.491_954_201_358_941_75),
    (12, 0.494_686_248_254_126_3),
    (16, 0.496_033_990_812_236_4),
    (20, 0.496_836_582_371_855_7),
    (24, 0.497_369_076_508_256_57),
    (32, 0.498_031_770_525_301_45),
    (64, 0.499_019_641_762_359_36),
];

/// Normalizes the 6-neighbour residual to unit gain for white noise:
/// Var(I - mean6) = sigma^2 * (1 + 1/6) = sigma^2 * 7/6.
const RESIDUAL_SCALE: f64 = 0.925_820_099_772_551_5; // sqrt(6/7)

/// Source of the noise level used to parameterize the filters.
///
/// Implementations must be deterministic for a fixed input. A degenerate
/// volume (e.g. constant intensity) may yield 0; callers treat a
/// non-positive result as unusable.
pub trait NoiseEstimator: Send + Sync {
    /// Estimate sigma of a single 3D volume acquired with `channel_count`
    /// receiver channels.
    fn estimate<T: VoxelValue>(&self, volume: ArrayView3<T>, channel_count: usize) -> Result<f64>;

    /// One estimate per trailing-axis channel of a 4D volume.
    fn estimate_channels<T: VoxelValue>(
        &self,
        volume: ArrayView4<T>,
        channel_count: usize,
    ) -> Result<Vec<f64>> {
        volume
            .axis_iter(Axis(3))
            .map(|channel| self.estimate(channel, channel_count))
            .collect()
    }
}

/// Local-difference noise estimator.
///
/// Each voxel is compared against the mean of its six face neighbours; the RMS
/// of that residual, corrected for the magnitude-data bias of `N` receiver
/// channels, estimates the noise standard deviation. Borders reflect, which
/// for unit offsets is edge replication.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDifferenceEstimator {
    /// Only average the residual over voxels with non-zero intensity.
    pub exclude_background: bool,
}

impl LocalDifferenceEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exclude_background(mut self, exclude_background: bool) -> Self {
        self.exclude_background = exclude_background;
        self
    }
}

impl NoiseEstimator for LocalDifferenceEstimator {
    fn estimate<T: VoxelValue>(&self, volume: ArrayView3<T>, channel_count: usize) -> Result<f64> {
        let factor = correction_factor(channel_count)?;
        let dense = DenseVolume::from_view(volume);
        if dense.is_empty() {
            return Err(NlmeansError::InvalidShape {
                shape: volume.shape().to_vec(),
            });
        }

        let (energy, count) = residual_energy(&dense, self.exclude_background);
        if count == 0 {
            return Ok(0.0);
        }
        let sigma = (energy / count as f64 / factor).sqrt();
        debug!(
            "estimated sigma {:.6} from {} voxels (N = {})",
            sigma, count, channel_count
        );
        Ok(sigma)
    }
}

/// Look up the Koay correction factor for `channel_count` receiver channels.
pub fn correction_factor(channel_count: usize) -> Result<f64> {
    CORRECTION_FACTORS
        .iter()
        .find(|(n, _)| *n == channel_count)
        .map(|&(_, f)| f)
        .ok_or_else(|| {
            let supported: Vec<usize> = CORRECTION_FACTORS.iter().map(|(n, _)| *n).collect();
            NlmeansError::invalid_parameter(
                "channel_count",
                format!("N = {channel_count} is not supported, choose one of {supported:?}"),
            )
        })
}

/// Estimate sigma for a 3D volume (one value) or a 4D volume (one value per
/// channel) with the local-difference estimator, skipping zero background.
pub fn estimate_sigma<T: VoxelValue>(volume: ArrayViewD<T>, channel_count: usize) -> Result<Vec<f64>> {
    let estimator = LocalDifferenceEstimator::new().with_exclude_background(true);
    match volume.ndim() {
        3 => {
            let vol = volume
                .into_dimensionality::<Ix3>()
                .map_err(|e| NlmeansError::invalid_parameter("volume", e.to_string()))?;
            Ok(vec![estimator.estimate(vol, channel_count)?])
        }
        4 => {
            let vol = volume
                .into_dimensionality::<Ix4>()
                .map_err(|e| NlmeansError::invalid_parameter("volume", e.to_string()))?;
            estimator.estimate_channels(vol, channel_count)
        }
        _ => Err(NlmeansError::InvalidShape {
            shape: volume.shape().to_vec(),
        }),
    }
}

/// Sum of squared residuals and number of contributing voxels.
///
/// Per-plane partial sums are combined in plane order so the result does not
/// depend on how rayon splits the work.
fn residual_energy(vol: &DenseVolume, exclude_background: bool) -> (f64, usize) {
    let [d0, d1, d2] = vol.dims();

    let planes: Vec<(f64, usize)> = (0..d0)
        .into_par_iter()
        .map(|x| {
            let xm = x.saturating_sub(1);
            let xp = (x + 1).min(d0 - 1);
            let mut sum = 0.0;
            let mut count = 0usize;

            for y in 0..d1 {
                let ym = y.saturating_sub(1);
                let yp = (y + 1).min(d1 - 1);
                for z in 0..d2 {
                    let center = vol.get([x, y, z]);
                    if exclude_background && center == 0.0 {
                        continue;
                    }
                    let zm = z.saturating_sub(1);
                    let zp = (z + 1).min(d2 - 1);
                    let neighbours = vol.get([xm, y, z])
                        + vol.get([xp, y, z])
                        + vol.get([x, ym, z])
                        + vol.get([x, yp, z])
                        + vol.get([x, y, zm])
                        + vol.get([x, y, zp]);
                    let r = RESIDUAL_SCALE * (center - neighbours / 6.0);
                    sum += r * r;
                    count += 1;
                }
            }
            (sum, count)
        })
        .collect();

    planes
        .into_iter()
        .fold((0.0, 0), |acc, (sum, count)| (acc.0 + sum, acc.1 + count))
}
