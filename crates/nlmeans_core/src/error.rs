use thiserror::Error;

/// Errors raised while validating a denoising call.
///
/// All of them are detected before any filtering starts, so a failed call never
/// produces partial output. Per-voxel numeric degeneracies (a weight sum that
/// underflows) are not errors: the kernels fall back to the input intensity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NlmeansError {
    #[error("only 3D or 4D volumes with non-empty axes are supported (got shape {shape:?})")]
    InvalidShape { shape: Vec<usize> },
    #[error("{what} shape {actual:?} does not match the volume (expected {expected})")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: Vec<usize>,
    },
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),
}

impl NlmeansError {
    pub(crate) fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        NlmeansError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NlmeansError>;
