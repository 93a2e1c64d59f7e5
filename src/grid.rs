//! Typed scalar grids for continuous (density/intensity) data

use crate::error::{Result, VolsegError};
use crate::kernel::SeparableKernel;
use crate::types::{DataType, DescriptiveStatistics};
use ndarray::{s, Array3, ArrayView3};
use num_traits::{Bounded, NumCast};
use serde::{Deserialize, Serialize};

/// Scalar element of a continuous grid.
///
/// Arithmetic happens in `f64`; `from_f64` converts back to the storage type,
/// rounding and saturating for integer types.
pub trait VoxelValue: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_integer_voxel {
    ($($t:ty => $dt:ident),* $(,)?) => {
        $(
            impl VoxelValue for $t {
                const DATA_TYPE: DataType = DataType::$dt;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    let lo = <$t as Bounded>::min_value() as f64;
                    let hi = <$t as Bounded>::max_value() as f64;
                    <$t as NumCast>::from(value.round().clamp(lo, hi)).unwrap_or_default()
                }
            }
        )*
    };
}

impl_integer_voxel!(u8 => U8, u16 => U16, u32 => U32, i8 => I8, i16 => I16, i32 => I32);

impl VoxelValue for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl VoxelValue for f64 {
    const DATA_TYPE: DataType = DataType::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

/// A 3D continuous grid at one (level, time, channel), tagged with its storage type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarGrid {
    U8(Array3<u8>),
    U16(Array3<u16>),
    U32(Array3<u32>),
    I8(Array3<i8>),
    I16(Array3<i16>),
    I32(Array3<i32>),
    F32(Array3<f32>),
    F64(Array3<f64>),
}

/// Applies `$body` to the inner array of any `ScalarGrid` variant, rewrapping
/// the result in the same variant.
macro_rules! map_grid {
    ($grid:expr, $arr:ident => $body:expr) => {
        match $grid {
            ScalarGrid::U8($arr) => ScalarGrid::U8($body),
            ScalarGrid::U16($arr) => ScalarGrid::U16($body),
            ScalarGrid::U32($arr) => ScalarGrid::U32($body),
            ScalarGrid::I8($arr) => ScalarGrid::I8($body),
            ScalarGrid::I16($arr) => ScalarGrid::I16($body),
            ScalarGrid::I32($arr) => ScalarGrid::I32($body),
            ScalarGrid::F32($arr) => ScalarGrid::F32($body),
            ScalarGrid::F64($arr) => ScalarGrid::F64($body),
        }
    };
}

/// Applies `$body` to the inner array of any `ScalarGrid` variant.
macro_rules! with_grid {
    ($grid:expr, $arr:ident => $body:expr) => {
        match $grid {
            ScalarGrid::U8($arr) => $body,
            ScalarGrid::U16($arr) => $body,
            ScalarGrid::U32($arr) => $body,
            ScalarGrid::I8($arr) => $body,
            ScalarGrid::I16($arr) => $body,
            ScalarGrid::I32($arr) => $body,
            ScalarGrid::F32($arr) => $body,
            ScalarGrid::F64($arr) => $body,
        }
    };
}

impl ScalarGrid {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarGrid::U8(_) => DataType::U8,
            ScalarGrid::U16(_) => DataType::U16,
            ScalarGrid::U32(_) => DataType::U32,
            ScalarGrid::I8(_) => DataType::I8,
            ScalarGrid::I16(_) => DataType::I16,
            ScalarGrid::I32(_) => DataType::I32,
            ScalarGrid::F32(_) => DataType::F32,
            ScalarGrid::F64(_) => DataType::F64,
        }
    }

    pub fn dim(&self) -> [usize; 3] {
        with_grid!(self, a => {
            let (x, y, z) = a.dim();
            [x, y, z]
        })
    }

    pub fn len(&self) -> usize {
        with_grid!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uncompressed size in bytes
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.data_type().size_in_bytes()
    }

    /// Convolve with `kernel` (mirror boundary) and stride by 2 along every axis
    pub fn downsample(&self, kernel: &SeparableKernel) -> ScalarGrid {
        map_grid!(self, a => kernel.downsample(&a.view()))
    }

    /// Chunked variant of [`ScalarGrid::downsample`]; output is identical
    pub fn downsample_chunked(&self, kernel: &SeparableKernel, chunk_rows: usize) -> ScalarGrid {
        map_grid!(self, a => kernel.downsample_chunked(&a.view(), chunk_rows))
    }

    /// Mean, population standard deviation, min and max in floating point
    pub fn statistics(&self) -> Result<DescriptiveStatistics> {
        with_grid!(self, a => compute_statistics(&a.view()))
    }

    /// Copy out an inclusive index box
    pub fn slice(&self, min: [usize; 3], max: [usize; 3]) -> Result<ScalarGrid> {
        let dims = self.dim();
        for axis in 0..3 {
            if min[axis] > max[axis] || max[axis] >= dims[axis] {
                return Err(VolsegError::InvalidInput(format!(
                    "Slice {:?}..={:?} outside grid {:?}",
                    min, max, dims
                )));
            }
        }
        Ok(map_grid!(self, a => a
            .slice(s![min[0]..=max[0], min[1]..=max[1], min[2]..=max[2]])
            .to_owned()))
    }

    /// Values converted to f64 in logical (C) order
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_grid!(self, a => a.iter().map(|v| v.to_f64()).collect())
    }
}

macro_rules! impl_from_array {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Array3<$t>> for ScalarGrid {
                fn from(arr: Array3<$t>) -> Self {
                    ScalarGrid::$variant(arr)
                }
            }
        )*
    };
}

impl_from_array!(
    u8 => U8, u16 => U16, u32 => U32, i8 => I8, i16 => I16, i32 => I32, f32 => F32, f64 => F64,
);

/// Descriptive statistics accumulated in f64 regardless of storage type
pub fn compute_statistics<T: VoxelValue>(data: &ArrayView3<T>) -> Result<DescriptiveStatistics> {
    if data.is_empty() {
        return Err(VolsegError::DataShape(
            "Cannot compute statistics of an empty grid".to_string(),
        ));
    }

    let n = data.len() as f64;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in data.iter() {
        let v = v.to_f64();
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }
    let mean = sum / n;
    let var = data
        .iter()
        .map(|v| {
            let d = v.to_f64() - mean;
            d * d
        })
        .sum::<f64>()
        / n;

    Ok(DescriptiveStatistics {
        mean,
        std: var.sqrt(),
        min,
        max,
    })
}
