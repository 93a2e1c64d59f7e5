//! Typed entry metadata
//!
//! Everything the query path needs to plan a read (persisted levels, boxes,
//! statistics, lattice ids, mesh detail levels) lives here. Metadata is
//! checked once when it is parsed or built, so lookups afterwards only fail
//! for ids the caller made up.

use crate::error::{Result, VolsegError};
use crate::mesh::MeshComponentCounts;
use crate::types::{dimensions_at_level, DataKind, DataType, DescriptiveStatistics, EntryId, Level, LevelBox};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Archive format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Time frame -> channel -> statistics
pub type StatisticsTable = BTreeMap<u32, BTreeMap<u32, DescriptiveStatistics>>;

/// One persisted volume level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeLevelInfo {
    pub level_box: LevelBox,
    pub statistics: StatisticsTable,
}

/// Continuous volume of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSamplingInfo {
    /// Storage type of the grids
    pub data_type: DataType,

    /// Box of level 1, whether or not level 1 is persisted
    pub native_box: LevelBox,

    pub time_frames: Vec<u32>,

    pub channel_ids: Vec<u32>,

    /// Persisted levels only
    pub levels: BTreeMap<Level, VolumeLevelInfo>,
}

/// One lattice segmentation of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeInfo {
    pub native_box: LevelBox,

    pub time_frames: Vec<u32>,

    pub channel_ids: Vec<u32>,

    /// Persisted levels only; independent of the volume's levels
    pub levels: BTreeMap<Level, LevelBox>,

    /// Label value -> segment id of the external annotation
    pub value_to_segment_id: BTreeMap<u32, u32>,
}

/// Mesh segmentation of an entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshSegmentationInfo {
    /// Curve the ladders were built with
    pub detail_lvl_to_fraction: BTreeMap<u32, f64>,

    /// Segment -> detail level -> mesh id -> array sizes
    pub segments: BTreeMap<u32, BTreeMap<u32, BTreeMap<u32, MeshComponentCounts>>>,
}

impl MeshSegmentationInfo {
    /// Segment id -> sorted detail levels
    pub fn available(&self) -> BTreeMap<u32, Vec<u32>> {
        self.segments
            .iter()
            .map(|(&segment, levels)| (segment, levels.keys().copied().collect()))
            .collect()
    }

    pub fn mesh_ids(&self, segment_id: u32, detail_level: u32) -> Option<Vec<u32>> {
        self.segments
            .get(&segment_id)?
            .get(&detail_level)
            .map(|meshes| meshes.keys().copied().collect())
    }
}

/// Complete metadata of one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub version: FormatVersion,

    pub entry_id: EntryId,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,

    pub volume: Option<VolumeSamplingInfo>,

    /// Lattice id -> lattice segmentation
    #[serde(default)]
    pub lattices: BTreeMap<u32, LatticeInfo>,

    #[serde(default)]
    pub meshes: Option<MeshSegmentationInfo>,
}

impl EntryMetadata {
    pub fn new(entry_id: EntryId) -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::default(),
            entry_id,
            created_at: now,
            modified_at: now,
            volume: None,
            lattices: BTreeMap::new(),
            meshes: None,
        }
    }

    pub fn with_volume(mut self, volume: VolumeSamplingInfo) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_lattice(mut self, lattice_id: u32, lattice: LatticeInfo) -> Self {
        self.lattices.insert(lattice_id, lattice);
        self
    }

    pub fn with_meshes(mut self, meshes: MeshSegmentationInfo) -> Self {
        self.meshes = Some(meshes);
        self
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Parse and validate
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let metadata: EntryMetadata = serde_json::from_slice(bytes)?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn volume_info(&self) -> Result<&VolumeSamplingInfo> {
        self.volume
            .as_ref()
            .ok_or_else(|| VolsegError::NotFound(format!("Entry {} has no volume", self.entry_id)))
    }

    pub fn lattice(&self, lattice_id: u32) -> Result<&LatticeInfo> {
        self.lattices.get(&lattice_id).ok_or_else(|| {
            VolsegError::NotFound(format!(
                "Entry {} has no lattice segmentation {}",
                self.entry_id, lattice_id
            ))
        })
    }

    /// Lattice ids in persisted order
    pub fn lattice_ids(&self) -> Vec<u32> {
        self.lattices.keys().copied().collect()
    }

    /// Persisted levels of a data kind, ascending
    pub fn persisted_levels(&self, kind: DataKind, lattice_id: Option<u32>) -> Result<Vec<Level>> {
        match (kind, lattice_id) {
            (DataKind::Volume, _) => Ok(self.volume_info()?.levels.keys().copied().collect()),
            (DataKind::Segmentation, Some(id)) => Ok(self.lattice(id)?.levels.keys().copied().collect()),
            (DataKind::Segmentation, None) => Err(VolsegError::InvalidInput(
                "Segmentation levels need a lattice id".to_string(),
            )),
        }
    }

    pub fn native_box(&self, kind: DataKind, lattice_id: Option<u32>) -> Result<LevelBox> {
        match (kind, lattice_id) {
            (DataKind::Volume, _) => Ok(self.volume_info()?.native_box),
            (DataKind::Segmentation, Some(id)) => Ok(self.lattice(id)?.native_box),
            (DataKind::Segmentation, None) => Err(VolsegError::InvalidInput(
                "Segmentation box needs a lattice id".to_string(),
            )),
        }
    }

    pub fn volume_statistics(&self, level: Level, time: u32, channel: u32) -> Result<DescriptiveStatistics> {
        self.volume_info()?
            .levels
            .get(&level)
            .and_then(|info| info.statistics.get(&time))
            .and_then(|channels| channels.get(&channel))
            .copied()
            .ok_or_else(|| {
                VolsegError::NotFound(format!(
                    "No statistics for level {}, time {}, channel {}",
                    level, time, channel
                ))
            })
    }

    /// Segment id -> detail levels, empty if the entry has no meshes
    pub fn available_detail_levels(&self) -> BTreeMap<u32, Vec<u32>> {
        self.meshes
            .as_ref()
            .map(MeshSegmentationInfo::available)
            .unwrap_or_default()
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible(&FormatVersion::CURRENT) {
            return Err(VolsegError::InvalidInput(format!(
                "Incompatible format version {}.{}",
                self.version.major, self.version.minor
            )));
        }

        if let Some(volume) = &self.volume {
            if volume.levels.is_empty() {
                return Err(VolsegError::DataShape("Volume has no persisted levels".to_string()));
            }
            for (&level, info) in &volume.levels {
                check_level_box(&volume.native_box, level, &info.level_box, "volume")?;
                for &time in &volume.time_frames {
                    for &channel in &volume.channel_ids {
                        let present = info
                            .statistics
                            .get(&time)
                            .map_or(false, |c| c.contains_key(&channel));
                        if !present {
                            return Err(VolsegError::DataShape(format!(
                                "Volume level {} lacks statistics for time {}, channel {}",
                                level, time, channel
                            )));
                        }
                    }
                }
            }
        }

        for (&id, lattice) in &self.lattices {
            if lattice.levels.is_empty() {
                return Err(VolsegError::DataShape(format!("Lattice {} has no persisted levels", id)));
            }
            for (&level, level_box) in &lattice.levels {
                check_level_box(&lattice.native_box, level, level_box, "lattice")?;
            }
            if let Some(volume) = &self.volume {
                if lattice.native_box != volume.native_box {
                    return Err(VolsegError::DataShape(format!(
                        "Lattice {} native box {:?} differs from volume native box {:?}",
                        id, lattice.native_box, volume.native_box
                    )));
                }
            }
        }

        if let Some(meshes) = &self.meshes {
            if let Some((segment, _)) = meshes.segments.iter().find(|(_, levels)| levels.is_empty()) {
                return Err(VolsegError::DataShape(format!(
                    "Mesh segment {} has no detail levels",
                    segment
                )));
            }
        }
        Ok(())
    }
}

fn check_level_box(native: &LevelBox, level: Level, level_box: &LevelBox, what: &str) -> Result<()> {
    let expected = dimensions_at_level(native.grid_dimensions, level);
    if level_box.grid_dimensions != expected || level_box.origin != native.origin {
        return Err(VolsegError::DataShape(format!(
            "{} level {} box {:?} does not derive from native box {:?}",
            what, level, level_box, native
        )));
    }
    Ok(())
}
