//! Offline build of one entry
//!
//! Stages run strictly in order: volume, lattice segmentations, meshes.
//! Lattices are framed by the box the volume stage produced. All members
//! and `metadata.json` are staged in one empty [`ArchiveTransaction`],
//! packed with the build's [`ArchiveConfig`], that is
//! committed only after every stage succeeded; a failing stage drops the
//! transaction and the previously committed archive stays as it was.
//!
//! Downsampling and mesh simplification run on the blocking thread pool.

use crate::access::encode_member;
use crate::archive::ArchiveTransaction;
use crate::config::{ArchiveConfig, BuildConfig};
use crate::db::FileSystemDb;
use crate::error::{Result, VolsegError};
use crate::layout::StoreKey;
use crate::mesh::{MeshList, MeshLodBuilder, SegmentLadder};
use crate::metadata::{
    EntryMetadata, LatticeInfo, MeshSegmentationInfo, StatisticsTable, VolumeLevelInfo, VolumeSamplingInfo,
};
use crate::primitives::{append_segmentation, GeometricSegmentation};
use crate::pyramid::{LatticeInput, LatticePyramid, PyramidBuilder, VolumeFrame, VolumePyramid};
use crate::types::{EntryId, LevelBox};
use crate::utils::format_bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Everything extracted from the source files of one entry
#[derive(Debug, Clone)]
pub struct EntryInput {
    pub entry_id: EntryId,
    /// Physical position of native voxel (0, 0, 0)
    pub origin: [f64; 3],
    pub voxel_size: [f64; 3],
    pub volume: Vec<VolumeFrame>,
    pub lattices: Vec<LatticeInput>,
    /// Segment id -> mesh id -> mesh
    pub meshes: BTreeMap<u32, MeshList>,
    pub geometric_segmentations: Vec<GeometricSegmentation>,
}

impl EntryInput {
    pub fn new(entry_id: EntryId, origin: [f64; 3], voxel_size: [f64; 3]) -> Self {
        Self {
            entry_id,
            origin,
            voxel_size,
            volume: Vec::new(),
            lattices: Vec::new(),
            meshes: BTreeMap::new(),
            geometric_segmentations: Vec::new(),
        }
    }

    pub fn with_volume(mut self, frames: Vec<VolumeFrame>) -> Self {
        self.volume = frames;
        self
    }

    pub fn with_lattice(mut self, lattice: LatticeInput) -> Self {
        self.lattices.push(lattice);
        self
    }

    pub fn with_meshes(mut self, meshes: BTreeMap<u32, MeshList>) -> Self {
        self.meshes = meshes;
        self
    }

    pub fn with_geometric_segmentation(mut self, segmentation: GeometricSegmentation) -> Self {
        self.geometric_segmentations.push(segmentation);
        self
    }

    fn native_box(&self, dims: [usize; 3]) -> Result<LevelBox> {
        if self.voxel_size.iter().any(|&v| !(v.is_finite() && v > 0.0)) {
            return Err(VolsegError::InvalidInput(format!(
                "Voxel size must be positive, got {:?}",
                self.voxel_size
            )));
        }
        if self.origin.iter().any(|o| !o.is_finite()) {
            return Err(VolsegError::InvalidInput(format!("Origin is not finite: {:?}", self.origin)));
        }
        Ok(LevelBox::new(self.origin, self.voxel_size, dims))
    }
}

/// Builds entries into a [`FileSystemDb`]
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    db: Arc<FileSystemDb>,
    pyramid: PyramidBuilder,
    mesh: Arc<MeshLodBuilder>,
    archive: ArchiveConfig,
}

impl EntryBuilder {
    pub fn new(db: Arc<FileSystemDb>, config: &BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            db,
            pyramid: PyramidBuilder::new(config.pyramid.clone())?,
            mesh: Arc::new(config.mesh.builder()?),
            archive: config.archive.clone(),
        })
    }

    pub fn db(&self) -> &Arc<FileSystemDb> {
        &self.db
    }

    /// Build and commit one entry, replacing whatever it held before.
    ///
    /// Geometric segmentations are appended to the entry's list after the
    /// archive commit; their ids must not exist yet.
    pub async fn build(&self, input: EntryInput) -> Result<Arc<EntryMetadata>> {
        let started = Instant::now();
        let entry = input.entry_id.clone();
        info!(%entry, "building entry");

        let mut geometric = self.db.read_geometric_segmentations(&entry).await?;
        for segmentation in &input.geometric_segmentations {
            append_segmentation(&mut geometric, segmentation.clone())?;
        }

        let txn = self.db.begin_rebuild(&entry, &self.archive).await?;
        let mut metadata = EntryMetadata::new(entry.clone());

        // volume
        let mut frame_box = None;
        if !input.volume.is_empty() {
            let pyramid = self.pyramid.clone();
            let frames = input.volume.clone();
            let volume = tokio::task::spawn_blocking(move || pyramid.build_volume(frames)).await??;
            let native_box = input.native_box(volume.native_dims)?;
            let info = write_volume(&txn, &volume, native_box).await?;
            debug!(%entry, levels = ?info.levels.keys().collect::<Vec<_>>(), "volume stage done");
            metadata.volume = Some(info);
            frame_box = Some(native_box);
        }

        // lattice segmentations
        for lattice in &input.lattices {
            if metadata.lattices.contains_key(&lattice.lattice_id) {
                return Err(VolsegError::AlreadyExists(format!(
                    "Lattice {} given twice for entry {}",
                    lattice.lattice_id, entry
                )));
            }
            let pyramid = self.pyramid.clone();
            let lattice = lattice.clone();
            let built = tokio::task::spawn_blocking(move || pyramid.build_lattice(lattice)).await??;
            let native_box = match frame_box {
                Some(native_box) if native_box.grid_dimensions != built.native_dims => {
                    return Err(VolsegError::DataShape(format!(
                        "Lattice {} has shape {:?}, volume has {:?}",
                        built.lattice_id, built.native_dims, native_box.grid_dimensions
                    )));
                }
                Some(native_box) => native_box,
                None => {
                    let native_box = input.native_box(built.native_dims)?;
                    frame_box = Some(native_box);
                    native_box
                }
            };
            let info = write_lattice(&txn, &built, native_box).await?;
            debug!(%entry, lattice_id = built.lattice_id, levels = info.levels.len(), "lattice stage done");
            metadata.lattices.insert(built.lattice_id, info);
        }

        // meshes
        if !input.meshes.is_empty() {
            let mesh = Arc::clone(&self.mesh);
            let segments = input.meshes.clone();
            let ladders = tokio::task::spawn_blocking(move || mesh.build(segments)).await??;
            let info = write_meshes(&txn, &ladders, self.mesh.curve().to_map()).await?;
            debug!(%entry, segments = info.segments.len(), "mesh stage done");
            if !info.segments.is_empty() {
                metadata.meshes = Some(info);
            }
        }

        metadata.validate()?;
        txn.put(&StoreKey::Metadata.path(), &metadata.to_json()?).await?;
        let staged = txn.staged_size().await?;
        debug!(%entry, staged = %format_bytes(staged as usize), "committing entry");
        txn.commit().await?;
        self.db.invalidate(&entry);

        for segmentation in input.geometric_segmentations {
            self.db.append_geometric_segmentation(&entry, segmentation).await?;
        }

        info!(%entry, elapsed_ms = started.elapsed().as_millis() as u64, "entry committed");
        Ok(Arc::new(metadata))
    }
}

/// Sorted distinct time frames and channels
fn frame_ids(frames: impl Iterator<Item = (u32, u32)>) -> (Vec<u32>, Vec<u32>) {
    let (times, channels): (BTreeSet<u32>, BTreeSet<u32>) = frames.unzip();
    (times.into_iter().collect(), channels.into_iter().collect())
}

async fn write_volume(
    txn: &ArchiveTransaction,
    pyramid: &VolumePyramid,
    native_box: LevelBox,
) -> Result<VolumeSamplingInfo> {
    let mut levels = BTreeMap::new();
    for volume_level in &pyramid.levels {
        let level = volume_level.level;
        let mut statistics = StatisticsTable::new();
        for frame in &volume_level.frames {
            let key = StoreKey::VolumeGrid {
                level,
                time: frame.time,
                channel: frame.channel,
            };
            txn.put(&key.path(), &encode_member(&frame.grid)?).await?;
            statistics
                .entry(frame.time)
                .or_default()
                .insert(frame.channel, frame.statistics);
        }
        levels.insert(
            level,
            VolumeLevelInfo {
                level_box: native_box.at_level(level),
                statistics,
            },
        );
    }

    let (time_frames, channel_ids) = frame_ids(
        pyramid
            .levels
            .iter()
            .flat_map(|l| l.frames.iter().map(|f| (f.time, f.channel))),
    );
    Ok(VolumeSamplingInfo {
        data_type: pyramid.data_type,
        native_box,
        time_frames,
        channel_ids,
        levels,
    })
}

async fn write_lattice(
    txn: &ArchiveTransaction,
    pyramid: &LatticePyramid,
    native_box: LevelBox,
) -> Result<LatticeInfo> {
    let lattice_id = pyramid.lattice_id;
    let mut levels = BTreeMap::new();
    for lattice_level in &pyramid.levels {
        let level = lattice_level.level;
        for frame in &lattice_level.frames {
            let (time, channel) = (frame.time, frame.channel);
            let grid_key = StoreKey::LatticeGrid {
                lattice_id,
                level,
                time,
                channel,
            };
            let table_key = StoreKey::LatticeSetTable {
                lattice_id,
                level,
                time,
                channel,
            };
            txn.put(&grid_key.path(), &encode_member(&frame.data.grid)?).await?;
            txn.put(&table_key.path(), &encode_member(&frame.data.set_table)?)
                .await?;
        }
        levels.insert(level, native_box.at_level(level));
    }

    let (time_frames, channel_ids) = frame_ids(
        pyramid
            .levels
            .iter()
            .flat_map(|l| l.frames.iter().map(|f| (f.time, f.channel))),
    );
    Ok(LatticeInfo {
        native_box,
        time_frames,
        channel_ids,
        levels,
        value_to_segment_id: pyramid.value_to_segment_id.clone(),
    })
}

async fn write_meshes(
    txn: &ArchiveTransaction,
    ladders: &[SegmentLadder],
    detail_lvl_to_fraction: BTreeMap<u32, f64>,
) -> Result<MeshSegmentationInfo> {
    let mut info = MeshSegmentationInfo {
        detail_lvl_to_fraction,
        segments: BTreeMap::new(),
    };
    for ladder in ladders.iter().filter(|l| !l.levels.is_empty()) {
        let segment = info.segments.entry(ladder.segment_id).or_default();
        for (&detail_level, meshes) in &ladder.levels {
            let counts = segment.entry(detail_level).or_default();
            for (&mesh_id, mesh) in meshes {
                let key = StoreKey::Mesh {
                    segment_id: ladder.segment_id,
                    detail_level,
                    mesh_id,
                };
                txn.put(&key.path(), &encode_member(mesh)?).await?;
                counts.insert(mesh_id, mesh.component_counts());
            }
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PackedArchive;
    use crate::compression::CompressionMethod;
    use crate::grid::ScalarGrid;
    use crate::mesh::Mesh;
    use crate::pyramid::{LatticeFrame, PyramidConfig};
    use crate::types::{DataKind, Level};
    use ndarray::Array3;
    use tempfile::TempDir;

    fn config() -> BuildConfig {
        BuildConfig::default().with_pyramid(PyramidConfig::default().with_min_grid_size(64))
    }

    fn volume(n: usize) -> Vec<VolumeFrame> {
        vec![VolumeFrame {
            time: 0,
            channel: 0,
            grid: ScalarGrid::from(Array3::from_shape_fn((n, n, n), |(x, y, z)| (x + y + z) as f32)),
        }]
    }

    fn lattice(n: usize) -> LatticeInput {
        LatticeInput {
            lattice_id: 0,
            value_to_segment_id: BTreeMap::from([(0, 10), (1, 11)]),
            frames: vec![LatticeFrame {
                time: 0,
                channel: 0,
                grid: Array3::from_shape_fn((n, n, n), |(x, _, _)| (x >= n / 2) as u32),
            }],
        }
    }

    fn builder(dir: &TempDir) -> EntryBuilder {
        EntryBuilder::new(Arc::new(FileSystemDb::new(dir.path())), &config()).unwrap()
    }

    #[tokio::test]
    async fn test_build_all_stages() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let entry = EntryId::new("emdb", "emd-1");
        let mesh = Mesh::new(vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![], vec![[0, 1, 2]]);
        let input = EntryInput::new(entry.clone(), [10.0, 0.0, 0.0], [2.0; 3])
            .with_volume(volume(16))
            .with_lattice(lattice(16))
            .with_meshes(BTreeMap::from([(10, MeshList::from([(0, mesh)]))]))
            .with_geometric_segmentation(GeometricSegmentation::new("shapes"));

        let built = builder.build(input).await.unwrap();
        let volume = built.volume_info().unwrap();
        assert_eq!(volume.native_box.grid_dimensions, [16; 3]);
        assert!(volume.levels.contains_key(&Level::NATIVE));
        assert_eq!(
            built.persisted_levels(DataKind::Segmentation, Some(0)).unwrap(),
            built.persisted_levels(DataKind::Volume, None).unwrap()
        );
        assert_eq!(built.available_detail_levels()[&10][0], 1);

        let stored = builder.db().read_metadata(&entry).await.unwrap();
        assert_eq!(stored.volume, built.volume);
        assert_eq!(stored.lattices, built.lattices);
        assert!(builder.db().get_geometric_segmentation(&entry, "shapes").await.is_ok());
    }

    #[tokio::test]
    async fn test_members_packed_with_build_archive_config() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let db = Arc::new(FileSystemDb::new(dir.path()));
        let config = config().with_archive(ArchiveConfig {
            compression: CompressionMethod::Deflate,
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..Default::default()
        });
        let builder = EntryBuilder::new(Arc::clone(&db), &config).unwrap();
        let entry = EntryId::new("emdb", "emd-deflate");
        for _ in 0..2 {
            builder
                .build(
                    EntryInput::new(entry.clone(), [0.0; 3], [1.0; 3])
                        .with_volume(volume(8))
                        .with_lattice(lattice(8)),
                )
                .await
                .unwrap();
        }

        let archive = PackedArchive::open(db.archive_path(&entry).unwrap()).await.unwrap();
        assert!(archive.len() > 1);
        for key in archive.keys() {
            assert_eq!(archive.record(key).unwrap().compression, CompressionMethod::Deflate, "{}", key);
        }
        // scratch areas were created under the configured directory and reclaimed
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_lattice_shape_mismatch_leaves_archive() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let entry = EntryId::new("emdb", "emd-2");
        builder
            .build(EntryInput::new(entry.clone(), [0.0; 3], [1.0; 3]).with_volume(volume(8)))
            .await
            .unwrap();
        let archive = builder.db().archive_path(&entry).unwrap();
        let before = std::fs::read(&archive).unwrap();

        let bad = EntryInput::new(entry.clone(), [0.0; 3], [1.0; 3])
            .with_volume(volume(16))
            .with_lattice(lattice(8));
        assert!(matches!(builder.build(bad).await, Err(VolsegError::DataShape(_))));
        assert_eq!(std::fs::read(&archive).unwrap(), before);
    }

    #[tokio::test]
    async fn test_unmapped_category_rejected() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let mut input = lattice(8);
        input.value_to_segment_id.remove(&1);
        let result = builder
            .build(EntryInput::new(EntryId::new("emdb", "emd-3"), [0.0; 3], [1.0; 3]).with_lattice(input))
            .await;
        assert!(matches!(result, Err(VolsegError::InvalidInput(_))));
        assert!(!builder.db().contains(&EntryId::new("emdb", "emd-3")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_members() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let entry = EntryId::new("emdb", "emd-4");
        builder
            .build(
                EntryInput::new(entry.clone(), [0.0; 3], [1.0; 3])
                    .with_volume(volume(8))
                    .with_lattice(lattice(8)),
            )
            .await
            .unwrap();
        let rebuilt = builder
            .build(EntryInput::new(entry.clone(), [0.0; 3], [1.0; 3]).with_volume(volume(8)))
            .await
            .unwrap();
        assert!(rebuilt.lattices.is_empty());

        let reader = builder.db().open_entry(&entry).await.unwrap();
        assert!(reader.metadata().lattices.is_empty());
    }
}
