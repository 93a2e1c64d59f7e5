//! Request-time choice of a persisted level and voxel-index box
//!
//! Selection only reads metadata and never touches grid data, so it is
//! cheap and safe to run from any number of concurrent queries.

use crate::error::{Result, VolsegError};
use crate::types::{IndexBox, Level, LevelBox, PhysicalBox};
use tracing::debug;

/// Outcome of planning one read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub level: Level,
    /// Inclusive index box in the grid of `level`
    pub index_box: IndexBox,
    /// Frame of the chosen level, for mapping results back to physical space
    pub level_box: LevelBox,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionSelector;

impl ResolutionSelector {
    pub fn new() -> Self {
        Self
    }

    /// Requested lattice if available, else the first available one
    pub fn decide_lattice(&self, requested: Option<u32>, available: &[u32]) -> Option<u32> {
        match requested {
            Some(id) if available.contains(&id) => Some(id),
            _ => available.first().copied(),
        }
    }

    /// Nearest voxel index of a physical coordinate, clamped into the grid.
    /// Exact halves go to the even index.
    pub fn coord_to_index(&self, coord: f64, origin: f64, voxel_size: f64, dimension: usize) -> usize {
        let raw = ((coord - origin) / voxel_size).round_ties_even();
        let last = dimension.saturating_sub(1);
        if raw <= 0.0 {
            0
        } else if raw >= last as f64 {
            last
        } else {
            raw as usize
        }
    }

    /// Native index box covering a physical box
    pub fn physical_to_index_box(&self, physical: &PhysicalBox, native: &LevelBox) -> Result<IndexBox> {
        check_frame(native)?;
        if physical.min.iter().chain(physical.max.iter()).any(|c| !c.is_finite()) {
            return Err(VolsegError::InvalidInput(format!(
                "Query box has non-finite coordinates: {:?}",
                physical
            )));
        }
        let corner = |p: &[f64; 3]| {
            [0, 1, 2].map(|a| {
                self.coord_to_index(p[a], native.origin[a], native.voxel_size[a], native.grid_dimensions[a])
            })
        };
        Ok(IndexBox::new(corner(&physical.min), corner(&physical.max)))
    }

    /// Pick a level from the persisted set.
    ///
    /// Without a budget: level 1 if persisted, else the finest level. With a
    /// budget of `n` points: the finest level whose factor is at least
    /// `ceil(volume / n)`, else the coarsest level.
    pub fn decide_level(&self, box_volume: u64, max_points: Option<u64>, persisted: &[Level]) -> Result<Level> {
        let mut levels = persisted.to_vec();
        levels.sort();
        let (finest, coarsest) = match (levels.first(), levels.last()) {
            (Some(&f), Some(&c)) => (f, c),
            _ => return Err(VolsegError::NotFound("No persisted levels".to_string())),
        };

        let Some(max_points) = max_points else {
            return Ok(if levels.contains(&Level::NATIVE) {
                Level::NATIVE
            } else {
                finest
            });
        };
        if max_points == 0 {
            return Err(VolsegError::InvalidInput("max_points must be positive".to_string()));
        }

        let desired = box_volume.div_ceil(max_points);
        let chosen = levels
            .iter()
            .copied()
            .find(|l| u64::from(l.factor()) >= desired)
            .unwrap_or(coarsest);
        debug!(
            box_volume,
            max_points,
            desired,
            ?levels,
            chosen = chosen.factor(),
            "resolution decision"
        );
        Ok(chosen)
    }

    /// Map a native index box into the grid of `level`
    pub fn rescale(&self, native: IndexBox, level: Level, level_dims: [usize; 3]) -> IndexBox {
        if level.is_native() {
            return native;
        }
        let factor = level.factor() as f64;
        let scale = |i: [usize; 3]| {
            [0, 1, 2].map(|a| {
                let scaled = (i[a] as f64 / factor).round_ties_even() as usize;
                scaled.min(level_dims[a].saturating_sub(1))
            })
        };
        IndexBox::new(scale(native.min), scale(native.max))
    }

    /// Full planning step: physical box (or whole grid) + budget -> level and box
    pub fn select(
        &self,
        native: &LevelBox,
        persisted: &[Level],
        physical: Option<&PhysicalBox>,
        max_points: Option<u64>,
    ) -> Result<Selection> {
        let native_index_box = match physical {
            Some(physical) => self.physical_to_index_box(physical, native)?,
            None => {
                check_frame(native)?;
                native.full_index_box()
            }
        };
        let level = self.decide_level(native_index_box.volume(), max_points, persisted)?;
        let level_box = native.at_level(level);
        let index_box = self.rescale(native_index_box, level, level_box.grid_dimensions);
        debug!(?native_index_box, level = level.factor(), ?index_box, "selected slice");
        Ok(Selection {
            level,
            index_box,
            level_box,
        })
    }
}

fn check_frame(native: &LevelBox) -> Result<()> {
    if native.grid_dimensions.iter().any(|&d| d == 0) {
        return Err(VolsegError::DataShape(format!(
            "Grid has an empty axis: {:?}",
            native.grid_dimensions
        )));
    }
    if native.voxel_size.iter().any(|&v| !(v.is_finite() && v > 0.0)) {
        return Err(VolsegError::DataShape(format!(
            "Voxel size must be positive: {:?}",
            native.voxel_size
        )));
    }
    Ok(())
}
