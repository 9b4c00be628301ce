//! Noise level inputs and their explicit expansion to per-channel views.
//!
//! Callers pass sigma as a scalar, one scalar per channel, a 3D map matching
//! the spatial shape, or (for 4D volumes) a 4D map matching the full shape.
//! Nothing else is accepted: in
//! particular no size-1 axis stretching, so a mis-shaped map is reported
//! instead of being silently broadcast.

use ndarray::{ArrayView3, ArrayView4, ArrayViewD, Axis, Ix3, Ix4};

use crate::error::{NlmeansError, Result};

/// Noise standard deviation supplied by the caller.
#[derive(Debug, Clone)]
pub enum Sigma<'a> {
    /// One value for every voxel of every channel.
    Scalar(f64),
    /// One value per channel (length 1 for a 3D volume), e.g. the output of
    /// `estimate_sigma`.
    PerChannel(&'a [f64]),
    /// Per-voxel map, 3D (shared by all channels) or 4D (one map per channel).
    Map(ArrayViewD<'a, f64>),
}

impl From<f64> for Sigma<'static> {
    fn from(value: f64) -> Self {
        Sigma::Scalar(value)
    }
}

impl<'a> From<&'a [f64]> for Sigma<'a> {
    fn from(values: &'a [f64]) -> Self {
        Sigma::PerChannel(values)
    }
}

impl<'a> From<ArrayView3<'a, f64>> for Sigma<'a> {
    fn from(map: ArrayView3<'a, f64>) -> Self {
        Sigma::Map(map.into_dyn())
    }
}

impl<'a> From<ArrayView4<'a, f64>> for Sigma<'a> {
    fn from(map: ArrayView4<'a, f64>) -> Self {
        Sigma::Map(map.into_dyn())
    }
}

/// Sigma for a single 3D channel.
#[derive(Debug, Clone, Copy)]
pub enum ChannelSigma<'a> {
    Uniform(f64),
    PerVoxel(ArrayView3<'a, f64>),
}

impl ChannelSigma<'_> {
    /// Local noise level at `p`.
    #[inline(always)]
    pub fn at(&self, p: [usize; 3]) -> f64 {
        match self {
            ChannelSigma::Uniform(s) => *s,
            ChannelSigma::PerVoxel(map) => map[p],
        }
    }

    /// A single value standing for the whole channel: the scalar itself or the
    /// mean of the map.
    pub fn representative(&self) -> f64 {
        match self {
            ChannelSigma::Uniform(s) => *s,
            ChannelSigma::PerVoxel(map) => map.mean().unwrap_or(0.0),
        }
    }
}

/// Validated sigma for all channels of one call.
#[derive(Debug, Clone, Copy)]
pub enum SigmaPlan<'a> {
    Uniform(f64),
    PerChannelUniform(&'a [f64]),
    Shared(ArrayView3<'a, f64>),
    PerChannel(ArrayView4<'a, f64>),
}

impl<'a> SigmaPlan<'a> {
    /// Sigma of channel `c` (channel 0 for 3D volumes).
    pub fn channel(&self, c: usize) -> ChannelSigma<'a> {
        match *self {
            SigmaPlan::Uniform(s) => ChannelSigma::Uniform(s),
            SigmaPlan::PerChannelUniform(values) => ChannelSigma::Uniform(values[c]),
            SigmaPlan::Shared(map) => ChannelSigma::PerVoxel(map),
            SigmaPlan::PerChannel(maps) => ChannelSigma::PerVoxel(maps.index_axis_move(Axis(3), c)),
        }
    }
}

/// Check sigma values and expand sigma against `volume_shape` (rank 3 or 4).
pub fn resolve_sigma<'a>(sigma: &Sigma<'a>, volume_shape: &[usize]) -> Result<SigmaPlan<'a>> {
    match sigma {
        Sigma::Scalar(s) => {
            check_sigma_value(*s)?;
            Ok(SigmaPlan::Uniform(*s))
        }
        Sigma::PerChannel(values) => {
            let channel_count = if volume_shape.len() == 4 {
                volume_shape[3]
            } else {
                1
            };
            if values.len() != channel_count {
                return Err(NlmeansError::ShapeMismatch {
                    what: "sigma",
                    expected: format!("{channel_count} per-channel values"),
                    actual: vec![values.len()],
                });
            }
            for &s in values.iter() {
                check_sigma_value(s)?;
            }
            Ok(SigmaPlan::PerChannelUniform(*values))
        }
        Sigma::Map(map) => {
            let spatial = &volume_shape[..3];
            let plan = if map.shape() == spatial {
                map.clone()
                    .into_dimensionality::<Ix3>()
                    .map(SigmaPlan::Shared)
                    .ok()
            } else if volume_shape.len() == 4 && map.shape() == volume_shape {
                map.clone()
                    .into_dimensionality::<Ix4>()
                    .map(SigmaPlan::PerChannel)
                    .ok()
            } else {
                None
            };

            let plan = plan.ok_or_else(|| NlmeansError::ShapeMismatch {
                what: "sigma",
                expected: expected_sigma_shapes(volume_shape),
                actual: map.shape().to_vec(),
            })?;

            if let Some(bad) = map.iter().copied().find(|&s| !(s.is_finite() && s > 0.0)) {
                return Err(NlmeansError::invalid_parameter(
                    "sigma",
                    format!("every sigma value must be finite and > 0 (found {bad})"),
                ));
            }
            Ok(plan)
        }
    }
}

pub(crate) fn check_sigma_value(s: f64) -> Result<()> {
    if s.is_finite() && s > 0.0 {
        Ok(())
    } else {
        Err(NlmeansError::invalid_parameter(
            "sigma",
            format!("must be finite and > 0 (got {s})"),
        ))
    }
}

fn expected_sigma_shapes(volume_shape: &[usize]) -> String {
    if volume_shape.len() == 4 {
        format!(
            "a scalar, {} per-channel values, {:?} or {:?}",
            volume_shape[3],
            &volume_shape[..3],
            volume_shape
        )
    } else {
        format!("a scalar or {:?}", volume_shape)
    }
}
