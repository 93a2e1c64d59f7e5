//! Geometric-primitive segmentations
//!
//! These are small lists of analytic shapes and live outside the gridded
//! store, as an append-only JSON list per entry.

use crate::error::{Result, VolsegError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapePrimitive {
    Sphere {
        id: u32,
        center: [f64; 3],
        radius: f64,
    },
    Box {
        id: u32,
        translation: [f64; 3],
        scaling: [f64; 3],
        /// Axis-angle rotation (axis, radians)
        #[serde(default)]
        rotation: Option<([f64; 3], f64)>,
    },
    Cylinder {
        id: u32,
        start: [f64; 3],
        end: [f64; 3],
        radius_bottom: f64,
        radius_top: f64,
    },
    Ellipsoid {
        id: u32,
        center: [f64; 3],
        dir_major: [f64; 3],
        dir_minor: [f64; 3],
        radius_scale: [f64; 3],
    },
    Pyramid {
        id: u32,
        translation: [f64; 3],
        scaling: [f64; 3],
    },
}

impl ShapePrimitive {
    pub fn id(&self) -> u32 {
        match self {
            ShapePrimitive::Sphere { id, .. }
            | ShapePrimitive::Box { id, .. }
            | ShapePrimitive::Cylinder { id, .. }
            | ShapePrimitive::Ellipsoid { id, .. }
            | ShapePrimitive::Pyramid { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ShapePrimitive::Sphere { .. } => "sphere",
            ShapePrimitive::Box { .. } => "box",
            ShapePrimitive::Cylinder { .. } => "cylinder",
            ShapePrimitive::Ellipsoid { .. } => "ellipsoid",
            ShapePrimitive::Pyramid { .. } => "pyramid",
        }
    }

    fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(VolsegError::InvalidInput(format!(
                    "{} {} has non-positive {}: {}",
                    self.kind(),
                    self.id(),
                    name,
                    v
                )))
            }
        };
        match self {
            ShapePrimitive::Sphere { radius, .. } => positive("radius", *radius),
            ShapePrimitive::Box { scaling, .. } | ShapePrimitive::Pyramid { scaling, .. } => {
                scaling.iter().try_for_each(|&s| positive("scaling", s))
            }
            ShapePrimitive::Cylinder {
                radius_bottom,
                radius_top,
                ..
            } => {
                positive("radius_bottom", *radius_bottom)?;
                positive("radius_top", *radius_top)
            }
            ShapePrimitive::Ellipsoid { radius_scale, .. } => {
                radius_scale.iter().try_for_each(|&s| positive("radius_scale", s))
            }
        }
    }
}

/// One geometric segmentation: primitives per time frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometricSegmentation {
    pub segmentation_id: String,
    pub primitives: BTreeMap<u32, Vec<ShapePrimitive>>,
}

impl GeometricSegmentation {
    pub fn new(segmentation_id: impl Into<String>) -> Self {
        Self {
            segmentation_id: segmentation_id.into(),
            primitives: BTreeMap::new(),
        }
    }

    pub fn with_primitives(mut self, time: u32, primitives: Vec<ShapePrimitive>) -> Self {
        self.primitives.entry(time).or_default().extend(primitives);
        self
    }

    /// Shapes must have positive extents and unique ids within a time frame
    pub fn validate(&self) -> Result<()> {
        if self.segmentation_id.is_empty() {
            return Err(VolsegError::InvalidInput(
                "Geometric segmentation id is empty".to_string(),
            ));
        }
        for (time, shapes) in &self.primitives {
            let mut ids = BTreeSet::new();
            for shape in shapes {
                shape.validate()?;
                if !ids.insert(shape.id()) {
                    return Err(VolsegError::InvalidInput(format!(
                        "Duplicate primitive id {} at time {} in segmentation {}",
                        shape.id(),
                        time,
                        self.segmentation_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Append `segmentation` to an existing list, rejecting a repeated id
pub fn append_segmentation(
    list: &mut Vec<GeometricSegmentation>,
    segmentation: GeometricSegmentation,
) -> Result<()> {
    segmentation.validate()?;
    if list
        .iter()
        .any(|s| s.segmentation_id == segmentation.segmentation_id)
    {
        return Err(VolsegError::AlreadyExists(format!(
            "Geometric segmentation {}",
            segmentation.segmentation_id
        )));
    }
    list.push(segmentation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(id: u32, radius: f64) -> ShapePrimitive {
        ShapePrimitive::Sphere {
            id,
            center: [0.0, 1.0, 2.0],
            radius,
        }
    }

    #[test]
    fn test_json_shape() {
        let seg = GeometricSegmentation::new("shapes").with_primitives(0, vec![sphere(1, 2.0)]);
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["primitives"]["0"][0]["kind"], "sphere");
        let back: GeometricSegmentation = serde_json::from_value(json).unwrap();
        assert_eq!(back, seg);
    }

    #[test]
    fn test_validation() {
        let bad = GeometricSegmentation::new("s").with_primitives(0, vec![sphere(1, 0.0)]);
        assert!(matches!(bad.validate(), Err(VolsegError::InvalidInput(_))));

        let dup = GeometricSegmentation::new("s").with_primitives(0, vec![sphere(1, 1.0), sphere(1, 2.0)]);
        assert!(dup.validate().is_err());

        // same id in different time frames is fine
        let ok = GeometricSegmentation::new("s")
            .with_primitives(0, vec![sphere(1, 1.0)])
            .with_primitives(1, vec![sphere(1, 1.0)]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_append_rejects_duplicate_id() {
        let mut list = Vec::new();
        append_segmentation(&mut list, GeometricSegmentation::new("a")).unwrap();
        append_segmentation(&mut list, GeometricSegmentation::new("b")).unwrap();
        let err = append_segmentation(&mut list, GeometricSegmentation::new("a")).unwrap_err();
        assert!(matches!(err, VolsegError::AlreadyExists(_)));
        assert_eq!(list.len(), 2);
    }
}
