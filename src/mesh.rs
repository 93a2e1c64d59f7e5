//! Mesh level-of-detail ladders
//!
//! Each segment owns a list of meshes at detail level 1 (the input geometry).
//! Coarser detail levels are produced by simplifying the *input* meshes with
//! the retained fraction of that level. A segment's ladder stops as soon as
//! its vertex density falls to the threshold or a simplification step leaves
//! no geometry, so different segments can end at different detail levels.

use crate::error::{Result, VolsegError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Default vertex density (vertices per unit of surface area) at which
/// simplification stops
pub const DEFAULT_DENSITY_THRESHOLD: f64 = 0.02;

/// Detail level holding the unsimplified input meshes
pub const ORIGINAL_DETAIL_LEVEL: u32 = 1;

/// Triangle mesh with per-vertex normals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn new(vertices: Vec<[f32; 3]>, normals: Vec<[f32; 3]>, triangles: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            normals,
            triangles,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Check that every triangle references an existing vertex
    pub fn validate(&self) -> Result<()> {
        if !self.normals.is_empty() && self.normals.len() != self.vertices.len() {
            return Err(VolsegError::DataShape(format!(
                "Mesh has {} normals for {} vertices",
                self.normals.len(),
                self.vertices.len()
            )));
        }
        let n = self.vertices.len() as u32;
        if let Some(t) = self.triangles.iter().find(|t| t.iter().any(|&i| i >= n)) {
            return Err(VolsegError::DataShape(format!(
                "Triangle {:?} references a vertex beyond {}",
                t, n
            )));
        }
        Ok(())
    }

    /// Total surface area of all triangles
    pub fn area(&self) -> f64 {
        self.triangles
            .iter()
            .map(|t| {
                let [a, b, c] = t.map(|i| self.vertices[i as usize].map(f64::from));
                let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
                let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
                let cross = [
                    u[1] * v[2] - u[2] * v[1],
                    u[2] * v[0] - u[0] * v[2],
                    u[0] * v[1] - u[1] * v[0],
                ];
                0.5 * (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt()
            })
            .sum()
    }

    pub fn component_counts(&self) -> MeshComponentCounts {
        MeshComponentCounts {
            num_vertices: self.vertices.len(),
            num_normals: self.normals.len(),
            num_triangles: self.triangles.len(),
        }
    }
}

/// Sizes of the arrays of one stored mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshComponentCounts {
    pub num_vertices: usize,
    pub num_normals: usize,
    pub num_triangles: usize,
}

/// Meshes of one segment at one detail level, keyed by mesh id
pub type MeshList = BTreeMap<u32, Mesh>;

/// Vertices per unit of surface area over a whole mesh list.
///
/// Zero-area geometry with vertices has unbounded density.
pub fn vertex_density(meshes: &MeshList) -> f64 {
    let vertices: usize = meshes.values().map(|m| m.vertices.len()).sum();
    let area: f64 = meshes.values().map(Mesh::area).sum();
    if vertices == 0 {
        0.0
    } else if area <= 0.0 {
        f64::INFINITY
    } else {
        vertices as f64 / area
    }
}

/// Detail level -> fraction of geometry retained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<u32, f64>", into = "BTreeMap<u32, f64>")]
pub struct SimplificationCurve {
    points: BTreeMap<u32, f64>,
}

impl SimplificationCurve {
    /// Fractions must lie in (0, 1] and never increase with the detail level.
    /// Detail level 1 is reserved for the input meshes and must map to 1.0.
    pub fn new(points: BTreeMap<u32, f64>) -> Result<Self> {
        if points.is_empty() {
            return Err(VolsegError::Configuration(
                "Simplification curve is empty".to_string(),
            ));
        }
        if points.contains_key(&0) {
            return Err(VolsegError::Configuration(
                "Detail levels start at 1".to_string(),
            ));
        }
        if let Some(&f) = points.get(&ORIGINAL_DETAIL_LEVEL) {
            if f != 1.0 {
                return Err(VolsegError::Configuration(format!(
                    "Detail level 1 must retain fraction 1.0, got {}",
                    f
                )));
            }
        }
        let mut prev = 1.0;
        for (&level, &fraction) in &points {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(VolsegError::Configuration(format!(
                    "Fraction {} at detail level {} outside (0, 1]",
                    fraction, level
                )));
            }
            if fraction > prev {
                return Err(VolsegError::Configuration(format!(
                    "Fraction increases at detail level {}",
                    level
                )));
            }
            prev = fraction;
        }
        Ok(Self { points })
    }

    pub fn fraction(&self, detail_level: u32) -> Option<f64> {
        self.points.get(&detail_level).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.points.iter().map(|(&l, &f)| (l, f))
    }

    pub fn to_map(&self) -> BTreeMap<u32, f64> {
        self.points.clone()
    }
}

impl Default for SimplificationCurve {
    fn default() -> Self {
        let fractions = [1.0, 0.9, 0.8, 0.7, 0.6, 0.5, 0.4, 0.3, 0.2, 0.1];
        Self {
            points: (1..).zip(fractions).collect(),
        }
    }
}

impl TryFrom<BTreeMap<u32, f64>> for SimplificationCurve {
    type Error = VolsegError;

    fn try_from(points: BTreeMap<u32, f64>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<SimplificationCurve> for BTreeMap<u32, f64> {
    fn from(curve: SimplificationCurve) -> Self {
        curve.points
    }
}

/// Reduces a mesh to roughly `fraction` of its vertices
pub trait MeshSimplifier: Send + Sync {
    fn simplify(&self, mesh: &Mesh, fraction: f64) -> Mesh;
}

/// Vertex clustering on a uniform grid.
///
/// The cell size is chosen so that a surface of the mesh's area intersects
/// about `fraction * vertices` cells. Vertices in one cell merge into their
/// centroid, normals are averaged, and triangles that collapse are dropped.
/// A target below three vertices cannot hold a triangle and yields an empty
/// mesh.
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexClusteringSimplifier;

impl MeshSimplifier for VertexClusteringSimplifier {
    fn simplify(&self, mesh: &Mesh, fraction: f64) -> Mesh {
        let n = mesh.vertices.len();
        let target = (fraction * n as f64).round() as usize;
        if target >= n {
            return mesh.clone();
        }
        if target < 3 {
            return Mesh::default();
        }

        let area = mesh.area();
        let cell = (area / target as f64).sqrt();
        if !cell.is_finite() || cell <= 0.0 {
            return mesh.clone();
        }

        let mut lo = [f64::INFINITY; 3];
        for v in &mesh.vertices {
            for a in 0..3 {
                lo[a] = lo[a].min(f64::from(v[a]));
            }
        }

        // cell -> cluster, clusters numbered in first-seen vertex order
        let mut cells: HashMap<[i64; 3], usize> = HashMap::new();
        let mut cluster_of = Vec::with_capacity(n);
        let mut sums: Vec<([f64; 3], [f64; 3], usize)> = Vec::new();
        let has_normals = mesh.normals.len() == n;
        for (i, v) in mesh.vertices.iter().enumerate() {
            let key = [0, 1, 2].map(|a| ((f64::from(v[a]) - lo[a]) / cell).floor() as i64);
            let c = *cells.entry(key).or_insert_with(|| {
                sums.push(([0.0; 3], [0.0; 3], 0));
                sums.len() - 1
            });
            let (pos, nrm, count) = &mut sums[c];
            for a in 0..3 {
                pos[a] += f64::from(v[a]);
                if has_normals {
                    nrm[a] += f64::from(mesh.normals[i][a]);
                }
            }
            *count += 1;
            cluster_of.push(c);
        }

        let triangles: Vec<[usize; 3]> = mesh
            .triangles
            .iter()
            .map(|t| t.map(|i| cluster_of[i as usize]))
            .filter(|[a, b, c]| a != b && b != c && a != c)
            .collect();

        // keep only clusters referenced by a surviving triangle
        let mut remap: Vec<Option<u32>> = vec![None; sums.len()];
        let mut vertices = Vec::new();
        let mut normals = Vec::new();
        let mut out_triangles = Vec::with_capacity(triangles.len());
        for t in triangles {
            let mapped = t.map(|c| {
                *remap[c].get_or_insert_with(|| {
                    let (pos, nrm, count) = sums[c];
                    vertices.push(pos.map(|p| (p / count as f64) as f32));
                    if has_normals {
                        let len = (nrm[0] * nrm[0] + nrm[1] * nrm[1] + nrm[2] * nrm[2]).sqrt();
                        let unit = if len > 0.0 { nrm.map(|x| x / len) } else { nrm };
                        normals.push(unit.map(|x| x as f32));
                    }
                    (vertices.len() - 1) as u32
                })
            });
            out_triangles.push(mapped);
        }

        Mesh {
            vertices,
            normals,
            triangles: out_triangles,
        }
    }
}

/// Ladder of one segment: detail level -> meshes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentLadder {
    pub segment_id: u32,
    pub levels: BTreeMap<u32, MeshList>,
}

impl SegmentLadder {
    pub fn detail_levels(&self) -> Vec<u32> {
        self.levels.keys().copied().collect()
    }
}

/// Builds per-segment detail ladders
pub struct MeshLodBuilder {
    curve: SimplificationCurve,
    density_threshold: f64,
    simplifier: Box<dyn MeshSimplifier>,
}

impl std::fmt::Debug for MeshLodBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshLodBuilder")
            .field("curve", &self.curve)
            .field("density_threshold", &self.density_threshold)
            .finish_non_exhaustive()
    }
}

impl MeshLodBuilder {
    pub fn new(curve: SimplificationCurve, density_threshold: f64) -> Result<Self> {
        Self::with_simplifier(curve, density_threshold, Box::new(VertexClusteringSimplifier))
    }

    pub fn with_simplifier(
        curve: SimplificationCurve,
        density_threshold: f64,
        simplifier: Box<dyn MeshSimplifier>,
    ) -> Result<Self> {
        if !(density_threshold >= 0.0 && density_threshold.is_finite()) {
            return Err(VolsegError::Configuration(format!(
                "Density threshold must be a non-negative number, got {}",
                density_threshold
            )));
        }
        Ok(Self {
            curve,
            density_threshold,
            simplifier,
        })
    }

    pub fn curve(&self) -> &SimplificationCurve {
        &self.curve
    }

    /// Walk the curve for one segment.
    ///
    /// Empty input meshes are discarded up front; a segment without any
    /// geometry gets an empty ladder.
    pub fn build_segment(&self, segment_id: u32, original: MeshList) -> Result<SegmentLadder> {
        for mesh in original.values() {
            mesh.validate()?;
        }
        let original: MeshList = original.into_iter().filter(|(_, m)| !m.is_empty()).collect();

        let mut ladder = SegmentLadder {
            segment_id,
            levels: BTreeMap::new(),
        };
        if original.is_empty() {
            return Ok(ladder);
        }
        ladder.levels.insert(ORIGINAL_DETAIL_LEVEL, original.clone());

        let mut reference = ORIGINAL_DETAIL_LEVEL;
        for (level, fraction) in self.curve.iter() {
            let current = &ladder.levels[&reference];
            if self.density_threshold != 0.0 && vertex_density(current) <= self.density_threshold {
                debug!(segment_id, level, "vertex density threshold reached");
                break;
            }
            if fraction == 1.0 {
                continue;
            }

            let simplified: MeshList = original
                .iter()
                .map(|(&id, mesh)| (id, self.simplifier.simplify(mesh, fraction)))
                .filter(|(_, m)| !m.is_empty())
                .collect();
            if simplified.is_empty() {
                debug!(segment_id, level, "simplification left no geometry");
                break;
            }
            ladder.levels.insert(level, simplified);
            reference = level;
        }
        Ok(ladder)
    }

    /// Build ladders for every segment, in segment id order
    pub fn build(&self, segments: BTreeMap<u32, MeshList>) -> Result<Vec<SegmentLadder>> {
        segments
            .into_iter()
            .map(|(segment_id, meshes)| self.build_segment(segment_id, meshes))
            .collect()
    }
}
