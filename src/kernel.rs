//! Separable convolution kernel used for continuous downsampling

use crate::error::{Result, VolsegError};
use crate::grid::VoxelValue;
use ndarray::{s, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Default 5-tap binomial kernel
pub const DEFAULT_KERNEL_WEIGHTS: [f64; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

/// Normalized 1D kernel applied along each axis in turn.
///
/// Downsampling convolves with mirror boundary handling (`d c b | a b c d |
/// c b a`) and keeps every second sample starting at index 0. Convolution
/// runs in `f64` and is converted back to the storage type at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct SeparableKernel {
    taps: Vec<f64>,
}

impl SeparableKernel {
    /// Create a kernel from raw weights; they are normalized to sum to 1
    pub fn new(weights: &[f64]) -> Result<Self> {
        if weights.is_empty() || weights.len() % 2 == 0 {
            return Err(VolsegError::Configuration(format!(
                "Kernel must have an odd number of taps, got {}",
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(VolsegError::Configuration(
                "Kernel weights must be finite".to_string(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Err(VolsegError::Configuration(
                "Kernel weights must have a positive sum".to_string(),
            ));
        }
        Ok(Self {
            taps: weights.iter().map(|w| w / sum).collect(),
        })
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    /// Half the support, i.e. the halo needed on each side of a chunk
    pub fn radius(&self) -> usize {
        self.taps.len() / 2
    }

    /// Convolve and stride by 2 along every axis
    pub fn downsample<T: VoxelValue>(&self, data: &ArrayView3<T>) -> Array3<T> {
        self.downsample_chunked(data, usize::MAX)
    }

    /// Same as [`SeparableKernel::downsample`], processing at most
    /// `chunk_rows` output rows of the first axis at a time.
    ///
    /// Each chunk reads a halo of `radius` input rows from its neighbours;
    /// mirror reflection only happens at the true grid edges, so the result is
    /// bit-identical to the unchunked output.
    pub fn downsample_chunked<T: VoxelValue>(
        &self,
        data: &ArrayView3<T>,
        chunk_rows: usize,
    ) -> Array3<T> {
        let (n0, n1, n2) = data.dim();
        let out_rows = n0.div_ceil(2);
        if out_rows == 0 || n1 == 0 || n2 == 0 {
            return Array3::from_shape_fn((out_rows, n1.div_ceil(2), n2.div_ceil(2)), |_| {
                T::from_f64(0.0)
            });
        }

        let chunk_rows = chunk_rows.max(1);
        let mut out = Array3::<f64>::zeros((out_rows, n1.div_ceil(2), n2.div_ceil(2)));
        let mut start = 0;
        while start < out_rows {
            let end = start.saturating_add(chunk_rows).min(out_rows);
            let chunk = self.downsample_rows(data, start..end);
            out.slice_mut(s![start..end, .., ..]).assign(&chunk);
            start = end;
        }
        out.mapv(T::from_f64)
    }

    /// Downsample the output rows `rows` of axis 0 in f64
    fn downsample_rows<T: VoxelValue>(&self, data: &ArrayView3<T>, rows: Range<usize>) -> Array3<f64> {
        let n0 = data.len_of(Axis(0));
        let r = self.radius() as isize;

        let mut lo = usize::MAX;
        let mut hi = 0;
        for o in rows.clone() {
            let center = 2 * o as isize;
            for t in -r..=r {
                let g = reflect(center + t, n0);
                lo = lo.min(g);
                hi = hi.max(g);
            }
        }

        let window = data.slice(s![lo..=hi, .., ..]).mapv(|v| v.to_f64());
        let pass0 = convolve_stride_axis(&window.view(), 0, &self.taps, n0, lo, rows);

        let n1 = pass0.len_of(Axis(1));
        let pass1 = convolve_stride_axis(&pass0.view(), 1, &self.taps, n1, 0, 0..n1.div_ceil(2));

        let n2 = pass1.len_of(Axis(2));
        convolve_stride_axis(&pass1.view(), 2, &self.taps, n2, 0, 0..n2.div_ceil(2))
    }
}

impl Default for SeparableKernel {
    fn default() -> Self {
        let sum: f64 = DEFAULT_KERNEL_WEIGHTS.iter().sum();
        Self {
            taps: DEFAULT_KERNEL_WEIGHTS.iter().map(|w| w / sum).collect(),
        }
    }
}

impl TryFrom<Vec<f64>> for SeparableKernel {
    type Error = VolsegError;

    fn try_from(weights: Vec<f64>) -> Result<Self> {
        Self::new(&weights)
    }
}

impl From<SeparableKernel> for Vec<f64> {
    fn from(kernel: SeparableKernel) -> Self {
        kernel.taps
    }
}

/// Mirror an index into `[0, n)` without repeating the edge sample
pub(crate) fn reflect(index: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = index.rem_euclid(period);
    if m >= n as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

/// Convolve along `axis` and keep the even global positions listed in `out`.
///
/// `src` holds global indices `offset..offset + src.len_of(axis)` of an axis
/// whose full length is `global_len`.
fn convolve_stride_axis(
    src: &ArrayView3<f64>,
    axis: usize,
    taps: &[f64],
    global_len: usize,
    offset: usize,
    out: Range<usize>,
) -> Array3<f64> {
    let r = (taps.len() / 2) as isize;
    let (d0, d1, d2) = src.dim();
    let mut shape = [d0, d1, d2];
    shape[axis] = out.len();

    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let mut idx = [i, j, k];
        let center = 2 * (out.start + idx[axis]) as isize;
        let mut acc = 0.0;
        for (t, w) in taps.iter().enumerate() {
            idx[axis] = reflect(center + t as isize - r, global_len) - offset;
            acc += w * src[idx];
        }
        acc
    })
}
