//! Pyramid construction: repeated downsampling plus persistence pruning
//!
//! Volume and lattice pyramids run through the same step planning and the
//! same pruning policy, but their persisted level sets are computed
//! independently and may differ.

use crate::categorical::{CategoricalDownsampler, CategoricalLevel, CategoryId, Footprint};
use crate::error::{Result, VolsegError};
use crate::grid::ScalarGrid;
use crate::kernel::SeparableKernel;
use crate::types::{dimensions_at_level, DataType, DescriptiveStatistics, Level};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Default lower bound on the voxel count of the coarsest produced level
pub const DEFAULT_MIN_GRID_SIZE: usize = 100 * 100 * 100;

/// Which produced levels are written to storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistencePolicy {
    /// Levels larger than this (uncompressed bytes) are not stored
    pub max_size_per_level_bytes: Option<usize>,
    /// Levels smaller than this (uncompressed bytes) are not stored
    pub min_size_per_level_bytes: Option<usize>,
    /// Finest downsampled level to store
    pub min_level: Option<u32>,
    /// Coarsest level to store; also fixes the number of halving steps
    pub max_level: Option<u32>,
    /// Drop native level 1 from storage
    pub remove_original_resolution: bool,
}

impl PersistencePolicy {
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_size_per_level_bytes, self.max_size_per_level_bytes) {
            if min > max {
                return Err(VolsegError::Configuration(format!(
                    "min_size_per_level_bytes ({}) exceeds max_size_per_level_bytes ({})",
                    min, max
                )));
            }
        }
        for (name, bound) in [("min_level", self.min_level), ("max_level", self.max_level)] {
            if let Some(level) = bound {
                if Level::new(level).is_none() {
                    return Err(VolsegError::Configuration(format!(
                        "{} must be a power of two, got {}",
                        name, level
                    )));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_level, self.max_level) {
            if min > max {
                return Err(VolsegError::Configuration(format!(
                    "min_level ({}) exceeds max_level ({})",
                    min, max
                )));
            }
        }
        Ok(())
    }

    /// Pick the levels to store out of `2^1 ..= 2^steps` plus native.
    ///
    /// `level_bytes` gives the uncompressed size of one grid at a level.
    /// When no downsampled level satisfies the bounds the coarsest one is
    /// kept; native is kept unless `remove_original_resolution` is set.
    pub fn select(&self, steps: u32, level_bytes: impl Fn(Level) -> usize) -> BTreeSet<Level> {
        let mut keep: BTreeSet<Level> = (1..=steps)
            .map(Level::from_steps)
            .filter(|&level| {
                let bytes = level_bytes(level);
                self.max_size_per_level_bytes.map_or(true, |max| bytes <= max)
                    && self.min_size_per_level_bytes.map_or(true, |min| bytes >= min)
                    && self.min_level.map_or(true, |min| level.factor() >= min)
                    && self.max_level.map_or(true, |max| level.factor() <= max)
            })
            .collect();

        if keep.is_empty() && steps > 0 {
            keep.insert(Level::from_steps(steps));
        }
        if !self.remove_original_resolution || keep.is_empty() {
            keep.insert(Level::NATIVE);
        }
        keep
    }
}

/// Settings shared by volume and lattice pyramids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    /// Halving stops once a level holds fewer voxels than this
    pub min_grid_size: usize,
    /// Kernel for continuous data
    pub kernel: SeparableKernel,
    /// Footprint for categorical data; defaults to the kernel's support
    pub footprint: Option<Footprint>,
    /// Process continuous grids in chunks of this many output rows
    pub chunk_rows: Option<usize>,
    pub persistence: PersistencePolicy,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            min_grid_size: DEFAULT_MIN_GRID_SIZE,
            kernel: SeparableKernel::default(),
            footprint: None,
            chunk_rows: None,
            persistence: PersistencePolicy::default(),
        }
    }
}

impl PyramidConfig {
    pub fn with_min_grid_size(mut self, min_grid_size: usize) -> Self {
        self.min_grid_size = min_grid_size;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistencePolicy) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = Some(chunk_rows);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_grid_size == 0 {
            return Err(VolsegError::Configuration(
                "min_grid_size must be positive".to_string(),
            ));
        }
        if let Some(footprint) = self.footprint {
            Footprint::new(footprint.radius())?;
        }
        if self.chunk_rows == Some(0) {
            return Err(VolsegError::Configuration(
                "chunk_rows must be positive".to_string(),
            ));
        }
        self.persistence.validate()
    }

    pub fn footprint(&self) -> Footprint {
        self.footprint
            .unwrap_or_else(|| Footprint::from_kernel(&self.kernel))
    }

    /// Number of halving steps for a grid with the given native dimensions.
    ///
    /// An explicit `max_level` fixes the count; otherwise halving continues
    /// until the voxel count drops below `min_grid_size` or every axis is 1.
    /// At least one step is always taken in the size-driven case.
    pub fn plan_steps(&self, native_dims: [usize; 3]) -> u32 {
        if let Some(max_level) = self.persistence.max_level.and_then(Level::new) {
            return max_level.steps();
        }

        let mut steps = 0;
        loop {
            steps += 1;
            let dims = dimensions_at_level(native_dims, Level::from_steps(steps));
            let voxels: usize = dims.iter().product();
            if voxels < self.min_grid_size || dims.iter().all(|&d| d <= 1) || steps >= 31 {
                return steps;
            }
        }
    }
}

/// One (time, channel) continuous grid at native resolution
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeFrame {
    pub time: u32,
    pub channel: u32,
    pub grid: ScalarGrid,
}

/// A persisted continuous grid with its statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidFrame {
    pub time: u32,
    pub channel: u32,
    pub grid: ScalarGrid,
    pub statistics: DescriptiveStatistics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeLevel {
    pub level: Level,
    pub frames: Vec<PyramidFrame>,
}

/// Persisted levels of a volume, finest first
#[derive(Debug, Clone, PartialEq)]
pub struct VolumePyramid {
    pub native_dims: [usize; 3],
    pub data_type: DataType,
    pub levels: Vec<VolumeLevel>,
}

impl VolumePyramid {
    pub fn persisted_levels(&self) -> BTreeSet<Level> {
        self.levels.iter().map(|l| l.level).collect()
    }
}

/// One (time, channel) label grid at native resolution
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeFrame {
    pub time: u32,
    pub channel: u32,
    pub grid: Array3<CategoryId>,
}

/// A lattice segmentation to downsample
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeInput {
    pub lattice_id: u32,
    /// Label value -> segment id of the external annotation
    pub value_to_segment_id: BTreeMap<CategoryId, u32>,
    pub frames: Vec<LatticeFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticeLevelFrame {
    pub time: u32,
    pub channel: u32,
    pub data: CategoricalLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticeLevel {
    pub level: Level,
    pub frames: Vec<LatticeLevelFrame>,
}

/// Persisted levels of one lattice segmentation, finest first
#[derive(Debug, Clone, PartialEq)]
pub struct LatticePyramid {
    pub lattice_id: u32,
    pub native_dims: [usize; 3],
    pub value_to_segment_id: BTreeMap<CategoryId, u32>,
    pub levels: Vec<LatticeLevel>,
}

impl LatticePyramid {
    pub fn persisted_levels(&self) -> BTreeSet<Level> {
        self.levels.iter().map(|l| l.level).collect()
    }
}

/// Drives the continuous and categorical downsamplers
#[derive(Debug, Clone, Default)]
pub struct PyramidBuilder {
    config: PyramidConfig,
}

impl PyramidBuilder {
    pub fn new(config: PyramidConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Downsample every (time, channel) frame and keep the persisted levels
    pub fn build_volume(&self, mut frames: Vec<VolumeFrame>) -> Result<VolumePyramid> {
        frames.sort_by_key(|f| (f.time, f.channel));
        let (native_dims, data_type) = check_volume_frames(&frames)?;

        let steps = self.config.plan_steps(native_dims);
        let item = data_type.size_in_bytes();
        let persisted = self.config.persistence.select(steps, |level| {
            dimensions_at_level(native_dims, level).iter().product::<usize>() * item
        });
        debug!(?native_dims, steps, ?persisted, "volume pyramid plan");

        let mut levels: Vec<VolumeLevel> = Vec::new();
        let mut current: Vec<VolumeFrame> = frames;
        for step in 0..=steps {
            let level = Level::from_steps(step);
            if step > 0 {
                current = current
                    .iter()
                    .map(|f| VolumeFrame {
                        time: f.time,
                        channel: f.channel,
                        grid: match self.config.chunk_rows {
                            Some(rows) => f.grid.downsample_chunked(&self.config.kernel, rows),
                            None => f.grid.downsample(&self.config.kernel),
                        },
                    })
                    .collect();
            }
            if persisted.contains(&level) {
                let frames = current
                    .iter()
                    .map(|f| {
                        Ok(PyramidFrame {
                            time: f.time,
                            channel: f.channel,
                            statistics: f.grid.statistics()?,
                            grid: f.grid.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                levels.push(VolumeLevel { level, frames });
            }
        }

        Ok(VolumePyramid {
            native_dims,
            data_type,
            levels,
        })
    }

    /// Build the set-tagged pyramid of one lattice segmentation
    pub fn build_lattice(&self, input: LatticeInput) -> Result<LatticePyramid> {
        let LatticeInput {
            lattice_id,
            value_to_segment_id,
            mut frames,
        } = input;
        frames.sort_by_key(|f| (f.time, f.channel));
        let native_dims = check_lattice_frames(lattice_id, &frames)?;

        for frame in &frames {
            let values: BTreeSet<CategoryId> = frame.grid.iter().copied().collect();
            if let Some(missing) = values.iter().find(|v| !value_to_segment_id.contains_key(v)) {
                return Err(VolsegError::InvalidInput(format!(
                    "Lattice {} value {} has no segment id mapping",
                    lattice_id, missing
                )));
            }
        }

        let steps = self.config.plan_steps(native_dims);
        // set-ids are stored as u32
        let persisted = self.config.persistence.select(steps, |level| {
            dimensions_at_level(native_dims, level).iter().product::<usize>() * 4
        });
        debug!(lattice_id, ?native_dims, steps, ?persisted, "lattice pyramid plan");

        let downsampler = CategoricalDownsampler::new(self.config.footprint());
        let mut by_level: BTreeMap<Level, Vec<LatticeLevelFrame>> = BTreeMap::new();
        for frame in frames {
            let mut current = CategoricalLevel::native(frame.grid);
            for step in 0..=steps {
                if step > 0 {
                    current = downsampler.downsample(&current)?;
                }
                if persisted.contains(&current.level) {
                    by_level.entry(current.level).or_default().push(LatticeLevelFrame {
                        time: frame.time,
                        channel: frame.channel,
                        data: current.clone(),
                    });
                }
            }
        }

        Ok(LatticePyramid {
            lattice_id,
            native_dims,
            value_to_segment_id,
            levels: by_level
                .into_iter()
                .map(|(level, frames)| LatticeLevel { level, frames })
                .collect(),
        })
    }
}

fn check_volume_frames(frames: &[VolumeFrame]) -> Result<([usize; 3], DataType)> {
    let first = frames.first().ok_or_else(|| {
        VolsegError::InvalidInput("Volume has no (time, channel) frames".to_string())
    })?;
    let dims = first.grid.dim();
    let data_type = first.grid.data_type();
    if first.grid.is_empty() {
        return Err(VolsegError::DataShape("Volume grid is empty".to_string()));
    }

    let mut seen = BTreeSet::new();
    for frame in frames {
        if frame.grid.dim() != dims {
            return Err(VolsegError::DataShape(format!(
                "Volume frame (time {}, channel {}) has shape {:?}, expected {:?}",
                frame.time,
                frame.channel,
                frame.grid.dim(),
                dims
            )));
        }
        if frame.grid.data_type() != data_type {
            return Err(VolsegError::DataShape(format!(
                "Volume frame (time {}, channel {}) has type {}, expected {}",
                frame.time,
                frame.channel,
                frame.grid.data_type(),
                data_type
            )));
        }
        if !seen.insert((frame.time, frame.channel)) {
            return Err(VolsegError::InvalidInput(format!(
                "Duplicate volume frame (time {}, channel {})",
                frame.time, frame.channel
            )));
        }
    }
    Ok((dims, data_type))
}

fn check_lattice_frames(lattice_id: u32, frames: &[LatticeFrame]) -> Result<[usize; 3]> {
    let first = frames.first().ok_or_else(|| {
        VolsegError::InvalidInput(format!("Lattice {} has no (time, channel) frames", lattice_id))
    })?;
    let (x, y, z) = first.grid.dim();
    let dims = [x, y, z];
    if first.grid.is_empty() {
        return Err(VolsegError::DataShape(format!("Lattice {} grid is empty", lattice_id)));
    }

    let mut seen = BTreeSet::new();
    for frame in frames {
        let (fx, fy, fz) = frame.grid.dim();
        if [fx, fy, fz] != dims {
            return Err(VolsegError::DataShape(format!(
                "Lattice {} frame (time {}, channel {}) has shape {:?}, expected {:?}",
                lattice_id,
                frame.time,
                frame.channel,
                [fx, fy, fz],
                dims
            )));
        }
        if !seen.insert((frame.time, frame.channel)) {
            return Err(VolsegError::InvalidInput(format!(
                "Duplicate lattice {} frame (time {}, channel {})",
                lattice_id, frame.time, frame.channel
            )));
        }
    }
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(f: u32) -> Level {
        Level::new(f).unwrap()
    }

    fn volume_frame(time: u32, channel: u32, dims: (usize, usize, usize)) -> VolumeFrame {
        VolumeFrame {
            time,
            channel,
            grid: ScalarGrid::from(Array3::from_shape_fn(dims, |(x, y, z)| {
                (x + 2 * y + 3 * z) as f32
            })),
        }
    }

    #[test]
    fn test_plan_steps_by_size() {
        let config = PyramidConfig::default().with_min_grid_size(1000);
        // 64^3 -> 32^3 -> 16^3 (4096) -> 8^3 (512 < 1000)
        assert_eq!(config.plan_steps([64, 64, 64]), 3);
        // already small: still one step
        assert_eq!(config.plan_steps([4, 4, 4]), 1);
    }

    #[test]
    fn test_plan_steps_by_max_level() {
        let config = PyramidConfig::default().with_persistence(PersistencePolicy {
            max_level: Some(8),
            ..Default::default()
        });
        assert_eq!(config.plan_steps([1000, 1000, 1000]), 3);
    }

    #[test]
    fn test_contradictory_bounds_rejected() {
        let policy = PersistencePolicy {
            min_size_per_level_bytes: Some(10),
            max_size_per_level_bytes: Some(5),
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(VolsegError::Configuration(_))));

        let policy = PersistencePolicy {
            min_level: Some(8),
            max_level: Some(4),
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(VolsegError::Configuration(_))));

        let policy = PersistencePolicy {
            max_level: Some(6),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_select_by_size_bounds() {
        // bytes per level: 2 -> 800, 4 -> 100, 8 -> 12
        let sizes = |l: Level| 6400 / (l.factor() as usize).pow(3);
        let policy = PersistencePolicy {
            max_size_per_level_bytes: Some(200),
            ..Default::default()
        };
        assert_eq!(
            policy.select(3, sizes),
            BTreeSet::from([Level::NATIVE, level(4), level(8)])
        );

        let policy = PersistencePolicy {
            max_size_per_level_bytes: Some(200),
            min_size_per_level_bytes: Some(50),
            remove_original_resolution: true,
            ..Default::default()
        };
        assert_eq!(policy.select(3, sizes), BTreeSet::from([level(4)]));
    }

    #[test]
    fn test_select_falls_back_to_coarsest() {
        let policy = PersistencePolicy {
            max_size_per_level_bytes: Some(1),
            remove_original_resolution: true,
            ..Default::default()
        };
        assert_eq!(policy.select(3, |_| 100), BTreeSet::from([level(8)]));
    }

    #[test]
    fn test_select_level_bounds() {
        let policy = PersistencePolicy {
            min_level: Some(4),
            max_level: Some(8),
            ..Default::default()
        };
        assert_eq!(
            policy.select(4, |_| 0),
            BTreeSet::from([Level::NATIVE, level(4), level(8)])
        );
    }

    #[test]
    fn test_build_volume_levels_and_statistics() {
        let builder = PyramidBuilder::new(PyramidConfig::default().with_min_grid_size(100)).unwrap();
        let pyramid = builder
            .build_volume(vec![volume_frame(0, 1, (16, 16, 16)), volume_frame(0, 0, (16, 16, 16))])
            .unwrap();

        // 16^3 -> 8^3 -> 4^3 (64 < 100)
        assert_eq!(pyramid.persisted_levels(), BTreeSet::from([Level::NATIVE, level(2), level(4)]));
        assert_eq!(pyramid.data_type, DataType::F32);
        let coarsest = pyramid.levels.last().unwrap();
        assert_eq!(coarsest.frames.len(), 2);
        assert_eq!(coarsest.frames[0].channel, 0);
        assert_eq!(coarsest.frames[0].grid.dim(), [4, 4, 4]);
        let stats = coarsest.frames[0].statistics;
        assert!(stats.is_valid());
        assert!(stats.min >= 0.0 && stats.max <= 90.0);
    }

    #[test]
    fn test_build_volume_rejects_mismatched_shapes() {
        let builder = PyramidBuilder::default();
        let err = builder
            .build_volume(vec![volume_frame(0, 0, (8, 8, 8)), volume_frame(1, 0, (8, 8, 4))])
            .unwrap_err();
        assert!(matches!(err, VolsegError::DataShape(_)));
    }

    #[test]
    fn test_chunked_pyramid_matches_unchunked() {
        let base = PyramidConfig::default().with_min_grid_size(10);
        let whole = PyramidBuilder::new(base.clone())
            .unwrap()
            .build_volume(vec![volume_frame(0, 0, (21, 10, 6))])
            .unwrap();
        let chunked = PyramidBuilder::new(base.with_chunk_rows(3))
            .unwrap()
            .build_volume(vec![volume_frame(0, 0, (21, 10, 6))])
            .unwrap();
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_build_lattice_requires_mapping() {
        let input = LatticeInput {
            lattice_id: 0,
            value_to_segment_id: BTreeMap::from([(0, 0)]),
            frames: vec![LatticeFrame {
                time: 0,
                channel: 0,
                grid: Array3::from_elem((4, 4, 4), 7u32),
            }],
        };
        let err = PyramidBuilder::default().build_lattice(input).unwrap_err();
        assert!(matches!(err, VolsegError::InvalidInput(_)));
    }

    #[test]
    fn test_build_lattice_rejects_mismatched_shapes() {
        let frame = |time: u32, channel: u32, dims: (usize, usize, usize)| LatticeFrame {
            time,
            channel,
            grid: Array3::zeros(dims),
        };
        let input = LatticeInput {
            lattice_id: 5,
            value_to_segment_id: BTreeMap::from([(0, 1)]),
            frames: vec![frame(0, 0, (8, 8, 8)), frame(0, 1, (8, 6, 8))],
        };
        let err = PyramidBuilder::default().build_lattice(input).unwrap_err();
        assert!(matches!(err, VolsegError::DataShape(ref msg) if msg.contains("Lattice 5")));

        let duplicate = LatticeInput {
            lattice_id: 5,
            value_to_segment_id: BTreeMap::from([(0, 1)]),
            frames: vec![frame(2, 0, (4, 4, 4)), frame(2, 0, (4, 4, 4))],
        };
        let err = PyramidBuilder::default().build_lattice(duplicate).unwrap_err();
        assert!(matches!(err, VolsegError::InvalidInput(_)));
    }

    #[test]
    fn test_build_lattice_levels() {
        let grid = Array3::from_shape_fn((16, 16, 16), |(x, _, _)| (x / 4) as u32);
        let input = LatticeInput {
            lattice_id: 3,
            value_to_segment_id: (0..4).map(|v| (v, v + 100)).collect(),
            frames: vec![LatticeFrame {
                time: 0,
                channel: 0,
                grid,
            }],
        };
        let builder = PyramidBuilder::new(PyramidConfig::default().with_min_grid_size(100)).unwrap();
        let pyramid = builder.build_lattice(input).unwrap();
        assert_eq!(pyramid.persisted_levels(), BTreeSet::from([Level::NATIVE, level(2), level(4)]));
        let coarsest = &pyramid.levels[2].frames[0].data;
        assert_eq!(coarsest.dim(), [4, 4, 4]);
        assert_eq!(coarsest.set_table.categories(), BTreeSet::from([0, 1, 2, 3]));
    }
}
