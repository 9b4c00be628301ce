//! NLM Core Volume Denoising Library
//!
//! Pure Rust implementation of Non-Local Means denoising for 3D and 4D
//! volumes, in a voxelwise and a blockwise variant, with optional Rician bias
//! correction and a local-difference noise estimator.

pub mod blockwise;
pub mod denoise;
pub mod error;
pub mod filtering;
pub mod noise_estimation;
pub mod patch;
pub mod sigma;
pub mod voxel;
pub mod voxelwise;

// Re-export commonly used types at the crate root
pub use blockwise::BlockwiseFilter;
pub use denoise::{denoise, denoise_3d, denoise_4d, NlmeansConfig, NlmeansVariant};
pub use error::{NlmeansError, Result};
pub use filtering::ChannelFilter;
pub use noise_estimation::{estimate_sigma, LocalDifferenceEstimator, NoiseEstimator};
pub use sigma::{ChannelSigma, Sigma};
pub use voxel::VoxelValue;
pub use voxelwise::VoxelwiseFilter;
