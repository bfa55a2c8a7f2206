//! Spatial influence field.
//!
//! Anchors are named points bound to a position along a curve. Each carries a
//! congestion density and a flow speed derived from the latest snapshot. The
//! field blends them with Gaussian radial weights, so any point in space gets a
//! smooth `{density, speed}` bounded by the anchor values.

use crate::aggregator::{BlendedMetric, Snapshot};
use crate::config::FieldConfig;
use crate::curve::CurveSet;
use crate::error::{PulseError, Result};
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Density used for an anchor whose road has not reported yet.
const UNOBSERVED_DENSITY: f32 = 0.0;

/// Speed used for an anchor whose road has not reported yet.
const UNOBSERVED_SPEED: f32 = 0.5;

/// Static binding of a named anchor to a curve location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorBinding {
    /// Traffic source name this anchor reads.
    pub key: String,
    #[serde(default)]
    pub label: String,
    pub curve: usize,
    /// Curve parameter in [0, 1].
    pub t: f32,
}

impl AnchorBinding {
    pub fn new(key: &str, label: &str, curve: usize, t: f32) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            curve,
            t,
        }
    }
}

/// Congestion density in [0, 1]. Scores measure free flow, so a high score
/// means an empty road.
pub fn derived_density(score: f64) -> f32 {
    (1.0 - score / 100.0).clamp(0.0, 1.0) as f32
}

/// Flow speed factor in [0.4, 1.8].
pub fn derived_speed(speed: f64) -> f32 {
    (speed / 20.0).clamp(0.4, 1.8) as f32
}

/// Anchor bindings with their world positions resolved against the curves.
#[derive(Debug, Clone)]
pub struct AnchorLayout {
    bindings: Vec<AnchorBinding>,
    positions: Vec<Vec3>,
}

impl AnchorLayout {
    pub fn resolve(bindings: &[AnchorBinding], curves: &CurveSet) -> Result<Self> {
        let mut positions = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let curve = curves
                .get(binding.curve)
                .ok_or_else(|| PulseError::AnchorOutOfRange {
                    name: binding.key.clone(),
                    curve: binding.curve,
                    available: curves.len(),
                })?;
            if !(0.0..=1.0).contains(&binding.t) {
                return Err(PulseError::AnchorParameter {
                    name: binding.key.clone(),
                    t: binding.t,
                });
            }
            positions.push(curve.point_at(binding.t));
        }
        Ok(Self {
            bindings: bindings.to_vec(),
            positions,
        })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Attach live attributes from a snapshot.
    pub fn anchors(&self, snapshot: &Snapshot) -> Vec<Anchor> {
        self.bindings
            .iter()
            .zip(&self.positions)
            .map(|(binding, &position)| Anchor::new(binding, position, snapshot.metric(&binding.key)))
            .collect()
    }
}

/// An anchor with its live-derived attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anchor {
    pub key: String,
    pub label: String,
    pub position: Vec3,
    pub density: f32,
    pub speed: f32,
}

impl Anchor {
    fn new(binding: &AnchorBinding, position: Vec3, metric: Option<&BlendedMetric>) -> Self {
        let (density, speed) = match metric {
            Some(m) => (derived_density(m.score), derived_speed(m.speed)),
            None => (UNOBSERVED_DENSITY, UNOBSERVED_SPEED),
        };
        Self {
            key: binding.key.clone(),
            label: binding.label.clone(),
            position,
            density,
            speed,
        }
    }
}

/// Field value at a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Influence {
    pub density: f32,
    pub speed: f32,
}

/// Gaussian RBF blend of anchor attributes. Pure given its anchors.
#[derive(Debug, Clone)]
pub struct InfluenceField {
    anchors: Vec<Anchor>,
    radius: f32,
    min_weight: f32,
    neutral: Influence,
}

impl InfluenceField {
    pub fn new(anchors: Vec<Anchor>, config: &FieldConfig) -> Self {
        Self {
            anchors,
            radius: config.radius,
            min_weight: config.min_weight,
            neutral: Influence {
                density: config.neutral_density,
                speed: config.neutral_speed,
            },
        }
    }

    pub fn from_snapshot(layout: &AnchorLayout, snapshot: &Snapshot, config: &FieldConfig) -> Self {
        Self::new(layout.anchors(snapshot), config)
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn neutral(&self) -> Influence {
        self.neutral
    }

    pub fn influence_at(&self, point: Vec3) -> Influence {
        let mut total = 0.0;
        let mut density = 0.0;
        let mut speed = 0.0;
        for anchor in &self.anchors {
            let d = point.distance(anchor.position) / self.radius;
            let w = (-(d * d)).exp();
            total += w;
            density += w * anchor.density;
            speed += w * anchor.speed;
        }

        if total < self.min_weight {
            return self.neutral;
        }
        Influence {
            density: density / total,
            speed: speed / total,
        }
    }
}
