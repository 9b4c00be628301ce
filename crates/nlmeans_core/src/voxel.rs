//! Storage precision abstraction for volume intensities.
//!
//! Volumes arrive as floats or integers (scanner data is frequently `u16` or
//! `i16`). Every kernel reads voxels as `f64` and converts back to the storage
//! type only when writing the final estimate, so the output keeps the input
//! precision while weights never underflow in single precision.

use num_traits::{ToPrimitive, Zero};
use std::fmt::Debug;

/// Storage types accepted for volume intensities.
///
/// This trait combines the bounds needed by the filters:
/// - Lossless-enough widening to `f64` for all arithmetic
/// - A saturating conversion back for the final write
/// - `Zero` so output arrays can be allocated before channels are filled
/// - `Send + Sync` so views can be shared across rayon workers
pub trait VoxelValue: Copy + Zero + ToPrimitive + Debug + Send + Sync + 'static {
    /// Widen a stored intensity to `f64`.
    #[inline]
    fn load(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }

    /// Narrow an `f64` estimate to the storage type.
    ///
    /// Integer types round to nearest and saturate at their bounds; NaN maps
    /// to zero.
    fn store(val: f64) -> Self;
}

impl VoxelValue for f32 {
    #[inline]
    fn store(val: f64) -> Self {
        val as f32
    }
}

impl VoxelValue for f64 {
    #[inline]
    fn load(self) -> f64 {
        self
    }

    #[inline]
    fn store(val: f64) -> Self {
        val
    }
}

macro_rules! impl_integral_voxel {
    ($($t:ty),* $(,)?) => {
        $(
            impl VoxelValue for $t {
                #[inline]
                fn load(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn store(val: f64) -> Self {
                    // float -> int `as` saturates and sends NaN to 0
                    val.round() as $t
                }
            }
        )*
    };
}

impl_integral_voxel!(u8, u16, i16, u32, i32);
