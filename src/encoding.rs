//! Wire encoding of query results
//!
//! The transport format is pluggable through [`SliceEncoder`]; the crate
//! ships a bincode implementation.

use crate::access::LatticeSlice;
use crate::error::Result;
use crate::grid::ScalarGrid;
use crate::mesh::Mesh;
use crate::selector::Selection;
use crate::types::{IndexBox, Level, LevelBox};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raw data of a served slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SliceData {
    Volume(ScalarGrid),
    Lattice { lattice_id: u32, slice: LatticeSlice },
}

/// Turns query results into transport bytes
pub trait SliceEncoder: Send + Sync {
    fn content_type(&self) -> &'static str;

    /// Encode a slice together with the level and box it was read from
    fn encode_slice(&self, selection: &Selection, data: &SliceData) -> Result<Bytes>;

    fn encode_meshes(&self, meshes: &[(u32, Mesh)]) -> Result<Bytes>;
}

#[derive(Serialize)]
struct EncodedSliceRef<'a> {
    level: Level,
    index_box: &'a IndexBox,
    level_box: &'a LevelBox,
    data: &'a SliceData,
}

/// Decoded form of [`BincodeSliceEncoder::encode_slice`] output
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecodedSlice {
    pub level: Level,
    pub index_box: IndexBox,
    pub level_box: LevelBox,
    pub data: SliceData,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSliceEncoder;

impl BincodeSliceEncoder {
    pub fn decode_slice(bytes: &[u8]) -> Result<DecodedSlice> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn decode_meshes(bytes: &[u8]) -> Result<Vec<(u32, Mesh)>> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl SliceEncoder for BincodeSliceEncoder {
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn encode_slice(&self, selection: &Selection, data: &SliceData) -> Result<Bytes> {
        let encoded = EncodedSliceRef {
            level: selection.level,
            index_box: &selection.index_box,
            level_box: &selection.level_box,
            data,
        };
        Ok(Bytes::from(bincode::serialize(&encoded)?))
    }

    fn encode_meshes(&self, meshes: &[(u32, Mesh)]) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(meshes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorical::SetTable;
    use ndarray::Array3;

    fn selection() -> Selection {
        let native = LevelBox::new([0.0; 3], [1.0; 3], [8, 8, 8]);
        let level = Level::new(2).unwrap();
        Selection {
            level,
            index_box: IndexBox::new([0; 3], [1; 3]),
            level_box: native.at_level(level),
        }
    }

    #[test]
    fn test_volume_slice_carries_selection() {
        let grid = ScalarGrid::from(Array3::from_elem((2, 2, 2), 1.5f32));
        let bytes = BincodeSliceEncoder
            .encode_slice(&selection(), &SliceData::Volume(grid.clone()))
            .unwrap();
        let decoded = BincodeSliceEncoder::decode_slice(&bytes).unwrap();
        assert_eq!(decoded.level.factor(), 2);
        assert_eq!(decoded.level_box.voxel_size, [2.0; 3]);
        assert_eq!(decoded.data, SliceData::Volume(grid));
    }

    #[test]
    fn test_lattice_slice_keeps_set_table() {
        let grid = Array3::from_elem((2, 2, 2), 4u32);
        let slice = LatticeSlice {
            set_table: SetTable::singletons(&grid.view()),
            grid,
        };
        let bytes = BincodeSliceEncoder
            .encode_slice(
                &selection(),
                &SliceData::Lattice {
                    lattice_id: 0,
                    slice: slice.clone(),
                },
            )
            .unwrap();
        match BincodeSliceEncoder::decode_slice(&bytes).unwrap().data {
            SliceData::Lattice { lattice_id, slice: back } => {
                assert_eq!(lattice_id, 0);
                assert_eq!(back, slice);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
