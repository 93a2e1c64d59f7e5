//! Key space of the hierarchical entry store
//!
//! ```text
//! metadata.json
//! _volume_data/{level}/{time}/{channel}/grid
//! _lattice_segmentation_data/{lattice}/{level}/{time}/{channel}/grid
//! _lattice_segmentation_data/{lattice}/{level}/{time}/{channel}/set_table
//! _mesh_segmentation_data/{segment}/{detail_level}/{mesh_id}
//! ```

use crate::error::{Result, VolsegError};
use crate::types::Level;
use std::fmt;

pub const METADATA_KEY: &str = "metadata.json";
pub const VOLUME_DATA_GROUP: &str = "_volume_data";
pub const LATTICE_SEGMENTATION_GROUP: &str = "_lattice_segmentation_data";
pub const MESH_SEGMENTATION_GROUP: &str = "_mesh_segmentation_data";

const GRID: &str = "grid";
const SET_TABLE: &str = "set_table";

/// Address of one member of an entry store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKey {
    Metadata,
    VolumeGrid {
        level: Level,
        time: u32,
        channel: u32,
    },
    LatticeGrid {
        lattice_id: u32,
        level: Level,
        time: u32,
        channel: u32,
    },
    LatticeSetTable {
        lattice_id: u32,
        level: Level,
        time: u32,
        channel: u32,
    },
    Mesh {
        segment_id: u32,
        detail_level: u32,
        mesh_id: u32,
    },
}

impl StoreKey {
    pub fn path(&self) -> String {
        self.to_string()
    }

    /// Inverse of [`StoreKey::path`]
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || VolsegError::InvalidInput(format!("Not a store key: {}", path));
        let num = |s: &str| s.parse::<u32>().map_err(|_| invalid());
        let level = |s: &str| num(s).and_then(|f| Level::new(f).ok_or_else(invalid));

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [METADATA_KEY] => Ok(StoreKey::Metadata),
            [VOLUME_DATA_GROUP, l, t, c, GRID] => Ok(StoreKey::VolumeGrid {
                level: level(l)?,
                time: num(t)?,
                channel: num(c)?,
            }),
            [LATTICE_SEGMENTATION_GROUP, id, l, t, c, leaf] => {
                let (lattice_id, level, time, channel) = (num(id)?, level(l)?, num(t)?, num(c)?);
                match *leaf {
                    GRID => Ok(StoreKey::LatticeGrid {
                        lattice_id,
                        level,
                        time,
                        channel,
                    }),
                    SET_TABLE => Ok(StoreKey::LatticeSetTable {
                        lattice_id,
                        level,
                        time,
                        channel,
                    }),
                    _ => Err(invalid()),
                }
            }
            [MESH_SEGMENTATION_GROUP, s, d, m] => Ok(StoreKey::Mesh {
                segment_id: num(s)?,
                detail_level: num(d)?,
                mesh_id: num(m)?,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Metadata => write!(f, "{}", METADATA_KEY),
            StoreKey::VolumeGrid {
                level,
                time,
                channel,
            } => write!(f, "{}/{}/{}/{}/{}", VOLUME_DATA_GROUP, level, time, channel, GRID),
            StoreKey::LatticeGrid {
                lattice_id,
                level,
                time,
                channel,
            } => write!(
                f,
                "{}/{}/{}/{}/{}/{}",
                LATTICE_SEGMENTATION_GROUP, lattice_id, level, time, channel, GRID
            ),
            StoreKey::LatticeSetTable {
                lattice_id,
                level,
                time,
                channel,
            } => write!(
                f,
                "{}/{}/{}/{}/{}/{}",
                LATTICE_SEGMENTATION_GROUP, lattice_id, level, time, channel, SET_TABLE
            ),
            StoreKey::Mesh {
                segment_id,
                detail_level,
                mesh_id,
            } => write!(
                f,
                "{}/{}/{}/{}",
                MESH_SEGMENTATION_GROUP, segment_id, detail_level, mesh_id
            ),
        }
    }
}

/// Prefix of every volume member
pub fn volume_prefix() -> String {
    format!("{}/", VOLUME_DATA_GROUP)
}

/// Prefix of every member of one lattice segmentation
pub fn lattice_prefix(lattice_id: u32) -> String {
    format!("{}/{}/", LATTICE_SEGMENTATION_GROUP, lattice_id)
}

/// Prefix of every mesh member; meshes form a single segmentation
pub fn mesh_prefix() -> String {
    format!("{}/", MESH_SEGMENTATION_GROUP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let key = StoreKey::VolumeGrid {
            level: Level::new(4).unwrap(),
            time: 0,
            channel: 2,
        };
        assert_eq!(key.path(), "_volume_data/4/0/2/grid");

        let key = StoreKey::LatticeSetTable {
            lattice_id: 7,
            level: Level::NATIVE,
            time: 1,
            channel: 0,
        };
        assert_eq!(key.path(), "_lattice_segmentation_data/7/1/1/0/set_table");
        assert!(key.path().starts_with(&lattice_prefix(7)));
    }

    #[test]
    fn test_parse_inverts_path() {
        let keys = [
            StoreKey::Metadata,
            StoreKey::LatticeGrid {
                lattice_id: 0,
                level: Level::new(8).unwrap(),
                time: 3,
                channel: 1,
            },
            StoreKey::Mesh {
                segment_id: 12,
                detail_level: 4,
                mesh_id: 0,
            },
        ];
        for key in keys {
            assert_eq!(StoreKey::parse(&key.path()).unwrap(), key);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_paths() {
        assert!(StoreKey::parse("_volume_data/3/0/0/grid").is_err());
        assert!(StoreKey::parse("_volume_data/2/0/0").is_err());
        assert!(StoreKey::parse("other/thing").is_err());
    }
}
