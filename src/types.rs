//! Core data types for volseg

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a continuous grid, named as numpy names it in metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        use DataType::*;
        match self {
            U8 | I8 => 1,
            U16 | I16 => 2,
            U32 | I32 | F32 => 4,
            F64 => 8,
        }
    }

    pub fn is_floating_point(self) -> bool {
        self == DataType::F32 || self == DataType::F64
    }

    pub fn name(self) -> &'static str {
        use DataType::*;
        match self {
            U8 => "uint8",
            U16 => "uint16",
            U32 => "uint32",
            I8 => "int8",
            I16 => "int16",
            I32 => "int32",
            F32 => "float32",
            F64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Downsampling factor relative to native resolution (1 = native)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Level(u32);

impl Level {
    pub const NATIVE: Level = Level(1);

    /// Level reached after `steps` halvings
    pub fn from_steps(steps: u32) -> Self {
        Level(1 << steps)
    }

    /// Create a level from a raw factor; factors must be powers of two
    pub fn new(factor: u32) -> Option<Self> {
        if factor.is_power_of_two() {
            Some(Level(factor))
        } else {
            None
        }
    }

    pub fn factor(&self) -> u32 {
        self.0
    }

    /// Number of halvings separating this level from native
    pub fn steps(&self) -> u32 {
        self.0.trailing_zeros()
    }

    pub fn is_native(&self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry identifier: (namespace, id), e.g. ("emdb", "emd-1832")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId {
    pub namespace: String,
    pub id: String,
}

impl EntryId {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Kind of gridded data a query addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Volume,
    Segmentation,
}

/// Spatial frame of a grid at one level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelBox {
    /// Physical coordinate of voxel (0, 0, 0)
    pub origin: [f64; 3],
    /// Physical extent of a single voxel along each axis
    pub voxel_size: [f64; 3],
    /// Number of voxels along each axis
    pub grid_dimensions: [usize; 3],
}

impl LevelBox {
    pub fn new(origin: [f64; 3], voxel_size: [f64; 3], grid_dimensions: [usize; 3]) -> Self {
        Self {
            origin,
            voxel_size,
            grid_dimensions,
        }
    }

    pub fn total_voxels(&self) -> usize {
        self.grid_dimensions.iter().product()
    }

    /// Box of the same data downsampled to `level`
    pub fn at_level(&self, level: Level) -> Self {
        let factor = level.factor() as f64;
        Self {
            origin: self.origin,
            voxel_size: [
                self.voxel_size[0] * factor,
                self.voxel_size[1] * factor,
                self.voxel_size[2] * factor,
            ],
            grid_dimensions: dimensions_at_level(self.grid_dimensions, level),
        }
    }

    /// Index box spanning the whole grid
    pub fn full_index_box(&self) -> IndexBox {
        IndexBox::new(
            [0, 0, 0],
            [
                self.grid_dimensions[0].saturating_sub(1),
                self.grid_dimensions[1].saturating_sub(1),
                self.grid_dimensions[2].saturating_sub(1),
            ],
        )
    }
}

/// Grid dimensions after downsampling native dimensions to `level`.
///
/// Every halving step keeps every other sample starting at index 0, so a
/// dimension `n` becomes `ceil(n / 2)`.
pub fn dimensions_at_level(native: [usize; 3], level: Level) -> [usize; 3] {
    let mut dims = native;
    for _ in 0..level.steps() {
        for d in dims.iter_mut() {
            *d = d.div_ceil(2);
        }
    }
    dims
}

/// Inclusive voxel-index box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl IndexBox {
    /// Build a box from two arbitrary corners
    pub fn new(a: [usize; 3], b: [usize; 3]) -> Self {
        Self {
            min: [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])],
            max: [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])],
        }
    }

    /// Number of voxels along each axis
    pub fn shape(&self) -> [usize; 3] {
        [
            self.max[0] - self.min[0] + 1,
            self.max[1] - self.min[1] + 1,
            self.max[2] - self.min[2] + 1,
        ]
    }

    pub fn volume(&self) -> u64 {
        self.shape().iter().map(|&s| s as u64).product()
    }

    /// Whether the box lies entirely inside a grid of the given dimensions
    pub fn fits(&self, grid_dimensions: [usize; 3]) -> bool {
        self.max
            .iter()
            .zip(grid_dimensions.iter())
            .all(|(&m, &d)| m < d)
    }
}

/// Physical axis-aligned box given by two corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl PhysicalBox {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }
}

/// Descriptive statistics of one (level, time, channel) grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DescriptiveStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl DescriptiveStatistics {
    pub fn is_valid(&self) -> bool {
        self.mean.is_finite()
            && self.std.is_finite()
            && self.min.is_finite()
            && self.max.is_finite()
            && self.min <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::I16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert!(DataType::F32.is_floating_point());
        assert!(!DataType::I32.is_floating_point());
        assert_eq!(serde_json::to_string(&DataType::U16).unwrap(), "\"uint16\"");
        assert_eq!(DataType::F64.to_string(), "float64");
    }

    #[test]
    fn test_level_conversion() {
        assert_eq!(Level::from_steps(0), Level::NATIVE);
        assert_eq!(Level::from_steps(3).factor(), 8);
        assert_eq!(Level::new(16).unwrap().steps(), 4);
        assert!(Level::new(6).is_none());
    }

    #[test]
    fn test_dimensions_at_level() {
        assert_eq!(dimensions_at_level([64, 64, 64], Level::new(4).unwrap()), [16, 16, 16]);
        assert_eq!(dimensions_at_level([5, 3, 1], Level::new(2).unwrap()), [3, 2, 1]);
        assert_eq!(dimensions_at_level([5, 3, 1], Level::new(8).unwrap()), [1, 1, 1]);
    }

    #[test]
    fn test_level_box_scaling() {
        let native = LevelBox::new([10.0, 0.0, -5.0], [1.5, 1.5, 2.0], [64, 33, 10]);
        let lvl = native.at_level(Level::new(2).unwrap());
        assert_eq!(lvl.origin, native.origin);
        assert_eq!(lvl.voxel_size, [3.0, 3.0, 4.0]);
        assert_eq!(lvl.grid_dimensions, [32, 17, 5]);
    }

    #[test]
    fn test_index_box_normalizes_corners() {
        let b = IndexBox::new([5, 0, 9], [1, 3, 2]);
        assert_eq!(b.min, [1, 0, 2]);
        assert_eq!(b.max, [5, 3, 9]);
        assert_eq!(b.shape(), [5, 4, 8]);
        assert_eq!(b.volume(), 160);
        assert!(b.fits([6, 4, 10]));
        assert!(!b.fits([5, 4, 10]));
    }

    #[test]
    fn test_level_serializes_as_integer() {
        let json = serde_json::to_string(&Level::new(4).unwrap()).unwrap();
        assert_eq!(json, "4");
    }
}
