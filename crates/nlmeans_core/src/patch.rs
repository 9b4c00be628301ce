//! Patch geometry and patch distances shared by both filters.
//!
//! Patches are never materialized. A distance is computed directly on a dense
//! `f64` copy of the volume, over the box of offsets for which both patches are
//! inside the volume (the "in-bounds portion" boundary policy). Along each axis
//! that set is an interval, so the compared region is always a box and rows of
//! the innermost axis are contiguous slices.

use std::ops::RangeInclusive;

use ndarray::ArrayView3;

use crate::voxel::VoxelValue;

/// Dense `f64` copy of a 3D volume in standard (row-major) layout.
#[derive(Debug, Clone)]
pub struct DenseVolume {
    data: Vec<f64>,
    dims: [usize; 3],
}

impl DenseVolume {
    /// Widen a volume of any storage type. Iteration follows logical order, so
    /// non-standard input layouts (e.g. a channel slice of a 4D array) are fine.
    pub fn from_view<T: VoxelValue>(volume: ArrayView3<T>) -> Self {
        let (d0, d1, d2) = volume.dim();
        let data = volume.iter().map(|&v| v.load()).collect();
        Self {
            data,
            dims: [d0, d1, d2],
        }
    }

    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline(always)]
    pub fn index(&self, p: [usize; 3]) -> usize {
        (p[0] * self.dims[1] + p[1]) * self.dims[2] + p[2]
    }

    #[inline(always)]
    pub fn coords(&self, idx: usize) -> [usize; 3] {
        let plane = self.dims[1] * self.dims[2];
        let x = idx / plane;
        let rem = idx % plane;
        [x, rem / self.dims[2], rem % self.dims[2]]
    }

    #[inline(always)]
    pub fn get(&self, p: [usize; 3]) -> f64 {
        self.data[self.index(p)]
    }

    /// Mean squared difference between the patches of radius `radius`
    /// centered at `a` and `b`, over their common in-bounds offsets.
    ///
    /// The window always contains the zero offset, so the normalizer is >= 1.
    pub fn patch_distance(&self, a: [usize; 3], b: [usize; 3], radius: usize) -> f64 {
        let window = PatchWindow::new(a, b, radius, self.dims);
        let row_len = window.extent(2);
        let mut sum_sq = 0.0;

        for o0 in window.lo[0]..=window.hi[0] {
            for o1 in window.lo[1]..=window.hi[1] {
                let start_a = self.index([
                    offset(a[0], o0),
                    offset(a[1], o1),
                    offset(a[2], window.lo[2]),
                ]);
                let start_b = self.index([
                    offset(b[0], o0),
                    offset(b[1], o1),
                    offset(b[2], window.lo[2]),
                ]);
                let row_a = &self.data[start_a..start_a + row_len];
                let row_b = &self.data[start_b..start_b + row_len];
                for (x, y) in row_a.iter().zip(row_b.iter()) {
                    let diff = x - y;
                    sum_sq += diff * diff;
                }
            }
        }

        sum_sq / window.count() as f64
    }
}

/// Box of patch offsets valid for a pair of centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchWindow {
    pub lo: [isize; 3],
    pub hi: [isize; 3],
}

impl PatchWindow {
    pub fn new(a: [usize; 3], b: [usize; 3], radius: usize, dims: [usize; 3]) -> Self {
        let mut lo = [0isize; 3];
        let mut hi = [0isize; 3];
        for axis in 0..3 {
            let (l, h) = overlap_axis(a[axis], b[axis], radius, dims[axis]);
            lo[axis] = l;
            hi[axis] = h;
        }
        Self { lo, hi }
    }

    #[inline]
    pub fn extent(&self, axis: usize) -> usize {
        (self.hi[axis] - self.lo[axis] + 1) as usize
    }

    /// Number of offsets in the window.
    #[inline]
    pub fn count(&self) -> usize {
        self.extent(0) * self.extent(1) * self.extent(2)
    }
}

/// Inclusive offset interval along one axis keeping both `a + o` and `b + o`
/// inside `[0, len)`, clipped to `[-radius, radius]`.
#[inline(always)]
pub fn overlap_axis(a: usize, b: usize, radius: usize, len: usize) -> (isize, isize) {
    debug_assert!(a < len && b < len);
    let lo = radius.min(a).min(b) as isize;
    let hi = radius.min(len - 1 - a).min(len - 1 - b) as isize;
    (-lo, hi)
}

/// Coordinates within `radius` of `center`, clipped to `[0, len)`.
#[inline]
pub fn search_range(center: usize, radius: usize, len: usize) -> RangeInclusive<usize> {
    center.saturating_sub(radius)..=(center + radius).min(len - 1)
}

#[inline(always)]
fn offset(base: usize, off: isize) -> usize {
    (base as isize + off) as usize
}
