//! Read access to a committed entry archive

use crate::archive::PackedArchive;
use crate::categorical::SetTable;
use crate::error::{Result, VolsegError};
use crate::grid::ScalarGrid;
use crate::layout::StoreKey;
use crate::mesh::Mesh;
use crate::metadata::EntryMetadata;
use crate::types::{IndexBox, Level};
use ndarray::{s, Array3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn encode_member<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_member<T: DeserializeOwned>(key: &StoreKey, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| VolsegError::Serialization(format!("member {}: {}", key, e)))
}

/// Set-id slice of a lattice plus the set-table rows it references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeSlice {
    pub grid: Array3<u32>,
    pub set_table: SetTable,
}

/// Reads grids, set tables and meshes of one entry
#[derive(Debug, Clone)]
pub struct EntryReader {
    archive: PackedArchive,
    metadata: Arc<EntryMetadata>,
}

impl EntryReader {
    /// Open an archive and parse its metadata
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let archive = PackedArchive::open(path).await?;
        let bytes = archive.read(&StoreKey::Metadata.path()).await?;
        let metadata = EntryMetadata::from_json(&bytes)?;
        Ok(Self {
            archive,
            metadata: Arc::new(metadata),
        })
    }

    /// Reuse already-parsed metadata
    pub async fn open_with_metadata(path: impl AsRef<Path>, metadata: Arc<EntryMetadata>) -> Result<Self> {
        let archive = PackedArchive::open(path).await?;
        Ok(Self { archive, metadata })
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    pub fn shared_metadata(&self) -> Arc<EntryMetadata> {
        Arc::clone(&self.metadata)
    }

    async fn read_member<T: DeserializeOwned>(&self, key: StoreKey) -> Result<T> {
        let bytes = self.archive.read(&key.path()).await?;
        decode_member(&key, &bytes)
    }

    pub async fn read_volume_grid(&self, level: Level, time: u32, channel: u32) -> Result<ScalarGrid> {
        let volume = self.metadata.volume_info()?;
        check_frame(
            "volume",
            level,
            time,
            channel,
            &volume.levels.keys().copied().collect(),
            &volume.time_frames,
            &volume.channel_ids,
        )?;
        self.read_member(StoreKey::VolumeGrid {
            level,
            time,
            channel,
        })
        .await
    }

    /// Copy out an inclusive index box of a volume grid
    pub async fn read_volume_slice(
        &self,
        level: Level,
        time: u32,
        channel: u32,
        index_box: &IndexBox,
    ) -> Result<ScalarGrid> {
        let grid = self.read_volume_grid(level, time, channel).await?;
        grid.slice(index_box.min, index_box.max)
    }

    /// Copy out an inclusive index box of a lattice and the set-table rows
    /// the box references
    pub async fn read_lattice_slice(
        &self,
        lattice_id: u32,
        level: Level,
        time: u32,
        channel: u32,
        index_box: &IndexBox,
    ) -> Result<LatticeSlice> {
        let lattice = self.metadata.lattice(lattice_id)?;
        check_frame(
            "lattice",
            level,
            time,
            channel,
            &lattice.levels.keys().copied().collect(),
            &lattice.time_frames,
            &lattice.channel_ids,
        )?;

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
        let grid: Array3<u32> = self.read_member(grid_key).await?;
        let table: SetTable = self.read_member(table_key).await?;

        let (x, y, z) = grid.dim();
        if !index_box.fits([x, y, z]) {
            return Err(VolsegError::InvalidInput(format!(
                "Slice {:?} outside lattice grid {:?}",
                index_box,
                [x, y, z]
            )));
        }
        let (lo, hi) = (index_box.min, index_box.max);
        let part = grid
            .slice(s![lo[0]..=hi[0], lo[1]..=hi[1], lo[2]..=hi[2]])
            .to_owned();
        let ids: BTreeSet<u32> = part.iter().copied().collect();
        Ok(LatticeSlice {
            set_table: table.subset(ids),
            grid: part,
        })
    }

    /// Every mesh of a segment at a detail level, in mesh id order
    pub async fn read_meshes(&self, segment_id: u32, detail_level: u32) -> Result<Vec<(u32, Mesh)>> {
        let mesh_ids = self
            .metadata
            .meshes
            .as_ref()
            .and_then(|m| m.mesh_ids(segment_id, detail_level))
            .ok_or_else(|| VolsegError::MeshNotFound {
                segment_id,
                detail_level,
                available: self.metadata.available_detail_levels(),
            })?;

        let keys: Vec<StoreKey> = mesh_ids
            .iter()
            .map(|&mesh_id| StoreKey::Mesh {
                segment_id,
                detail_level,
                mesh_id,
            })
            .collect();
        let paths: Vec<String> = keys.iter().map(StoreKey::path).collect();
        let blobs = self.archive.read_many(&paths).await?;

        mesh_ids
            .into_iter()
            .zip(keys.iter().zip(blobs))
            .map(|(id, (key, bytes))| Ok((id, decode_member(key, &bytes)?)))
            .collect()
    }
}

fn check_frame(
    what: &str,
    level: Level,
    time: u32,
    channel: u32,
    levels: &BTreeSet<Level>,
    times: &[u32],
    channels: &[u32],
) -> Result<()> {
    if !levels.contains(&level) {
        return Err(VolsegError::NotFound(format!(
            "{} level {} (persisted: {:?})",
            what,
            level,
            levels.iter().map(Level::factor).collect::<Vec<_>>()
        )));
    }
    if !times.contains(&time) {
        return Err(VolsegError::NotFound(format!("{} time frame {}", what, time)));
    }
    if !channels.contains(&channel) {
        return Err(VolsegError::NotFound(format!("{} channel {}", what, channel)));
    }
    Ok(())
}
