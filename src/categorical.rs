//! Label-preserving downsampling of categorical (lattice segmentation) grids
//!
//! Every output cell stores a set-id whose category set is the union of the
//! stored sets of the input cells under its footprint. Unions are taken over
//! the previous level's set table, never over native data, so each step costs
//! time proportional to the number of cells regardless of pyramid depth.
//! Identical category sets share one set-id.

use crate::error::{Result, VolsegError};
use crate::kernel::SeparableKernel;
use crate::types::Level;
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

/// Original label value of a lattice voxel
pub type CategoryId = u32;

/// Compact id of a category set at one level
pub type SetId = u32;

/// Deduplicated mapping from set-id to the category set it stands for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTable {
    sets: BTreeMap<SetId, BTreeSet<CategoryId>>,
}

impl SetTable {
    /// Level-1 table: every distinct value maps to the singleton of itself
    pub fn singletons(grid: &ArrayView3<CategoryId>) -> Self {
        let sets = grid
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|value| (value, BTreeSet::from([value])))
            .collect();
        Self { sets }
    }

    pub fn get(&self, id: SetId) -> Option<&BTreeSet<CategoryId>> {
        self.sets.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SetId, &BTreeSet<CategoryId>)> {
        self.sets.iter()
    }

    /// Every category referenced by any set
    pub fn categories(&self) -> BTreeSet<CategoryId> {
        self.sets.values().flatten().copied().collect()
    }

    /// Table restricted to the given set-ids (unknown ids are skipped)
    pub fn subset(&self, ids: impl IntoIterator<Item = SetId>) -> SetTable {
        let sets = ids
            .into_iter()
            .filter_map(|id| self.sets.get(&id).map(|set| (id, set.clone())))
            .collect();
        SetTable { sets }
    }
}

/// Assigns compact ids to category sets in first-seen order
#[derive(Default)]
struct SetInterner {
    table: BTreeMap<SetId, BTreeSet<CategoryId>>,
    index: HashMap<BTreeSet<CategoryId>, SetId>,
}

impl SetInterner {
    fn intern(&mut self, set: BTreeSet<CategoryId>) -> SetId {
        if let Some(&id) = self.index.get(&set) {
            return id;
        }
        let id = self.table.len() as SetId;
        self.table.insert(id, set.clone());
        self.index.insert(set, id);
        id
    }

    fn finish(self) -> SetTable {
        SetTable { sets: self.table }
    }
}

/// Neighbourhood read for every output cell: input indices
/// `2i - radius ..= 2i + radius` along each axis, clipped to the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    radius: usize,
}

impl Footprint {
    /// Radius 0 would skip every odd input cell, so it is rejected
    pub fn new(radius: usize) -> Result<Self> {
        if radius == 0 {
            return Err(VolsegError::Configuration(
                "Categorical footprint radius must be at least 1".to_string(),
            ));
        }
        Ok(Self { radius })
    }

    /// Footprint with the same support as a continuous kernel
    pub fn from_kernel(kernel: &SeparableKernel) -> Self {
        Self {
            radius: kernel.radius().max(1),
        }
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Input indices contributing to output index `out` along an axis of length `len`
    pub fn contributing_range(&self, out: usize, len: usize) -> Range<usize> {
        let center = 2 * out;
        center.saturating_sub(self.radius)..(center + self.radius + 1).min(len)
    }
}

impl Default for Footprint {
    fn default() -> Self {
        Self::from_kernel(&SeparableKernel::default())
    }
}

/// One level of a categorical pyramid: a set-id grid plus its set table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalLevel {
    pub level: Level,
    pub grid: Array3<SetId>,
    pub set_table: SetTable,
}

impl CategoricalLevel {
    /// Native level: set-ids equal the category values
    pub fn native(grid: Array3<CategoryId>) -> Self {
        let set_table = SetTable::singletons(&grid.view());
        Self {
            level: Level::NATIVE,
            grid,
            set_table,
        }
    }

    pub fn dim(&self) -> [usize; 3] {
        let (x, y, z) = self.grid.dim();
        [x, y, z]
    }

    /// Category set behind the set-id stored at `index`
    pub fn categories_at(&self, index: [usize; 3]) -> Option<&BTreeSet<CategoryId>> {
        self.grid
            .get(index)
            .and_then(|&id| self.set_table.get(id))
    }
}

/// Halves categorical grids per axis while keeping every label
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoricalDownsampler {
    footprint: Footprint,
}

impl CategoricalDownsampler {
    pub fn new(footprint: Footprint) -> Self {
        Self { footprint }
    }

    pub fn footprint(&self) -> Footprint {
        self.footprint
    }

    /// Produce the next coarser level from `prev`
    pub fn downsample(&self, prev: &CategoricalLevel) -> Result<CategoricalLevel> {
        let [n0, n1, n2] = prev.dim();
        let out_dim = (n0.div_ceil(2), n1.div_ceil(2), n2.div_ceil(2));

        let mut interner = SetInterner::default();
        // distinct contributing set-ids -> output set-id
        let mut combos: HashMap<Vec<SetId>, SetId> = HashMap::new();
        let mut ids: Vec<SetId> = Vec::new();
        let mut out = Vec::with_capacity(out_dim.0 * out_dim.1 * out_dim.2);

        for i in 0..out_dim.0 {
            let rx = self.footprint.contributing_range(i, n0);
            for j in 0..out_dim.1 {
                let ry = self.footprint.contributing_range(j, n1);
                for k in 0..out_dim.2 {
                    let rz = self.footprint.contributing_range(k, n2);

                    ids.clear();
                    for x in rx.clone() {
                        for y in ry.clone() {
                            for z in rz.clone() {
                                ids.push(prev.grid[[x, y, z]]);
                            }
                        }
                    }
                    ids.sort_unstable();
                    ids.dedup();

                    let set_id = match combos.get(&ids) {
                        Some(&id) => id,
                        None => {
                            let mut union = BTreeSet::new();
                            for &id in &ids {
                                let set = prev.set_table.get(id).ok_or_else(|| {
                                    VolsegError::DataShape(format!(
                                        "Set id {} at level {} missing from its set table",
                                        id, prev.level
                                    ))
                                })?;
                                union.extend(set.iter().copied());
                            }
                            let id = interner.intern(union);
                            combos.insert(ids.clone(), id);
                            id
                        }
                    };
                    out.push(set_id);
                }
            }
        }

        let grid = Array3::from_shape_vec(out_dim, out)
            .map_err(|e| VolsegError::DataShape(e.to_string()))?;

        Ok(CategoricalLevel {
            level: Level::from_steps(prev.level.steps() + 1),
            grid,
            set_table: interner.finish(),
        })
    }

    /// Native level followed by `steps` successively coarser levels
    pub fn pyramid(&self, native: Array3<CategoryId>, steps: u32) -> Result<Vec<CategoricalLevel>> {
        let mut levels = vec![CategoricalLevel::native(native)];
        for _ in 0..steps {
            let next = match levels.last() {
                Some(prev) => self.downsample(prev)?,
                None => break,
            };
            levels.push(next);
        }
        Ok(levels)
    }
}
