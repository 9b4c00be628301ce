//! `denoise` entry points: validation, variant selection and per-channel
//! dispatch.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4, ArrayD, ArrayView3, ArrayView4, ArrayViewD, Axis, Ix3, Ix4};
use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::blockwise::{BlockwiseFilter, DEFAULT_BLOCKWISE_RICIAN};
use crate::error::{NlmeansError, Result};
use crate::filtering::ChannelFilter;
use crate::noise_estimation::DEFAULT_NOISE_CHANNELS;
use crate::sigma::{resolve_sigma, Sigma, SigmaPlan};
use crate::voxel::VoxelValue;
use crate::voxelwise::{VoxelwiseFilter, DEFAULT_BLOCK_RADIUS, DEFAULT_PATCH_RADIUS};

/// Default for Rician bias correction.
pub const DEFAULT_RICIAN: bool = true;

/// Filtering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NlmeansVariant {
    /// One weighted average per voxel, caller-supplied sigma, mask honoured.
    #[default]
    Voxelwise,
    /// Block-aggregated weights, sigma re-estimated from the data.
    Blockwise,
}

impl FromStr for NlmeansVariant {
    type Err = NlmeansError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voxelwise" => Ok(NlmeansVariant::Voxelwise),
            "blockwise" => Ok(NlmeansVariant::Blockwise),
            other => Err(NlmeansError::invalid_parameter(
                "variant",
                format!("unknown variant '{other}', expected 'voxelwise' or 'blockwise'"),
            )),
        }
    }
}

impl fmt::Display for NlmeansVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NlmeansVariant::Voxelwise => f.write_str("voxelwise"),
            NlmeansVariant::Blockwise => f.write_str("blockwise"),
        }
    }
}

/// Parameters of one `denoise` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlmeansConfig {
    /// Voxelwise: patch radius. Blockwise: candidate displacement radius.
    pub patch_radius: usize,
    /// Voxelwise: search radius. Blockwise: block half side.
    pub block_radius: usize,
    pub rician: bool,
    /// Worker threads for this call; `None` uses the global rayon pool.
    pub worker_count: Option<usize>,
    pub variant: NlmeansVariant,
    /// Receiver channel count for the blockwise noise estimate.
    pub noise_channels: usize,
}

impl Default for NlmeansConfig {
    fn default() -> Self {
        Self {
            patch_radius: DEFAULT_PATCH_RADIUS,
            block_radius: DEFAULT_BLOCK_RADIUS,
            rician: DEFAULT_RICIAN,
            worker_count: None,
            variant: NlmeansVariant::default(),
            noise_channels: DEFAULT_NOISE_CHANNELS,
        }
    }
}

impl NlmeansConfig {
    pub fn with_variant(mut self, variant: NlmeansVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_radii(mut self, patch_radius: usize, block_radius: usize) -> Self {
        self.patch_radius = patch_radius;
        self.block_radius = block_radius;
        self
    }

    pub fn with_rician(mut self, rician: bool) -> Self {
        self.rician = rician;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = Some(worker_count);
        self
    }

    pub fn with_noise_channels(mut self, noise_channels: usize) -> Self {
        self.noise_channels = noise_channels;
        self
    }

    pub fn voxelwise_filter(&self) -> VoxelwiseFilter {
        VoxelwiseFilter::new(self.patch_radius, self.block_radius)
    }

    pub fn blockwise_filter(&self) -> BlockwiseFilter {
        BlockwiseFilter::new(self.patch_radius, self.block_radius)
            .with_noise_channels(self.noise_channels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == Some(0) {
            return Err(NlmeansError::invalid_parameter(
                "worker_count",
                "must be at least 1",
            ));
        }
        match self.variant {
            NlmeansVariant::Voxelwise => self.voxelwise_filter().validate(),
            NlmeansVariant::Blockwise => self.blockwise_filter().validate(),
        }
    }
}

/// Denoise a 3D volume or every channel of a 4D volume (channels on the last
/// axis). The output has the input's shape and storage type.
///
/// The mask always covers the first three axes and only affects the voxelwise
/// variant.
#[instrument(
    skip_all,
    fields(shape = ?volume.shape(), variant = %config.variant)
)]
pub fn denoise<T: VoxelValue>(
    volume: ArrayViewD<T>,
    sigma: &Sigma<'_>,
    mask: Option<ArrayView3<bool>>,
    config: &NlmeansConfig,
) -> Result<ArrayD<T>> {
    check_volume_shape(volume.shape())?;
    let shape = volume.shape().to_vec();
    let invalid = |_| NlmeansError::InvalidShape {
        shape: shape.clone(),
    };

    match volume.ndim() {
        3 => {
            let vol = volume.into_dimensionality::<Ix3>().map_err(invalid)?;
            denoise_3d(vol, sigma, mask, config).map(Array3::into_dyn)
        }
        _ => {
            let vol = volume.into_dimensionality::<Ix4>().map_err(invalid)?;
            denoise_4d(vol, sigma, mask, config).map(Array4::into_dyn)
        }
    }
}

/// Typed 3D entry point.
pub fn denoise_3d<T: VoxelValue>(
    volume: ArrayView3<T>,
    sigma: &Sigma<'_>,
    mask: Option<ArrayView3<bool>>,
    config: &NlmeansConfig,
) -> Result<Array3<T>> {
    let plan = validate_call(volume.shape(), sigma, mask, config)?;

    install(config.worker_count, || match config.variant {
        NlmeansVariant::Voxelwise => {
            config
                .voxelwise_filter()
                .filter_channel(volume, mask, plan.channel(0), config.rician)
        }
        NlmeansVariant::Blockwise => {
            config
                .blockwise_filter()
                .filter_channel(volume, mask, plan.channel(0), config.rician)
        }
    })?
}

/// Typed 4D entry point. Channels run concurrently in the same worker pool as
/// the per-voxel work.
pub fn denoise_4d<T: VoxelValue>(
    volume: ArrayView4<T>,
    sigma: &Sigma<'_>,
    mask: Option<ArrayView3<bool>>,
    config: &NlmeansConfig,
) -> Result<Array4<T>> {
    let plan = validate_call(volume.shape(), sigma, mask, config)?;

    install(config.worker_count, || match config.variant {
        NlmeansVariant::Voxelwise => {
            filter_channels(&config.voxelwise_filter(), volume, mask, plan, config.rician)
        }
        // Channels of a 4D blockwise call always use the blockwise default
        NlmeansVariant::Blockwise => filter_channels(
            &config.blockwise_filter(),
            volume,
            mask,
            plan,
            DEFAULT_BLOCKWISE_RICIAN,
        ),
    })?
}

fn filter_channels<F: ChannelFilter, T: VoxelValue>(
    filter: &F,
    volume: ArrayView4<T>,
    mask: Option<ArrayView3<bool>>,
    plan: SigmaPlan<'_>,
    rician: bool,
) -> Result<Array4<T>> {
    let channel_count = volume.len_of(Axis(3));
    let channels: Vec<Array3<T>> = (0..channel_count)
        .into_par_iter()
        .map(|c| filter.filter_channel(volume.index_axis(Axis(3), c), mask, plan.channel(c), rician))
        .collect::<Result<_>>()?;

    let mut output = Array4::<T>::zeros(volume.raw_dim());
    for (c, channel) in channels.iter().enumerate() {
        output.index_axis_mut(Axis(3), c).assign(channel);
    }
    debug!(channel_count, "4D volume reassembled");
    Ok(output)
}

/// Shape, then mask, then sigma, then parameters.
fn validate_call<'a>(
    shape: &[usize],
    sigma: &Sigma<'a>,
    mask: Option<ArrayView3<bool>>,
    config: &NlmeansConfig,
) -> Result<SigmaPlan<'a>> {
    check_volume_shape(shape)?;

    if let Some(m) = mask {
        if m.shape() != &shape[..3] {
            return Err(NlmeansError::ShapeMismatch {
                what: "mask",
                expected: format!("{:?}", &shape[..3]),
                actual: m.shape().to_vec(),
            });
        }
    }

    let plan = resolve_sigma(sigma, shape)?;
    config.validate()?;

    debug!(
        patch_radius = config.patch_radius,
        block_radius = config.block_radius,
        rician = config.rician,
        worker_count = ?config.worker_count,
        masked = mask.is_some(),
        "denoise call validated"
    );
    Ok(plan)
}

fn check_volume_shape(shape: &[usize]) -> Result<()> {
    if !(shape.len() == 3 || shape.len() == 4) || shape.contains(&0) {
        return Err(NlmeansError::InvalidShape {
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// Run `op` on a dedicated pool of `worker_count` threads, or on the current
/// pool when no count is given.
fn install<R, F>(worker_count: Option<usize>, op: F) -> Result<R>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match worker_count {
        None => Ok(op()),
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| NlmeansError::ThreadPool(e.to_string()))?;
            Ok(pool.install(op))
        }
    }
}
