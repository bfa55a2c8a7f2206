//! Curve particle system.
//!
//! Each curve carries a population of particles flowing along it. The size
//! of a population follows the influence field sampled along the curve. The
//! density is cubed so that quiet roads stay sparse and congested ones light
//! up sharply. A live-vehicle multiplier scales the whole population.
//!
//! Populations are rebuilt, not patched, whenever their allocation changes,
//! and every rebuilt particle gets a fresh uniformly random phase so that
//! resizes never produce bunched pulses.

use crate::config::ParticleConfig;
use crate::curve::CurveSet;
use crate::field::{Anchor, InfluenceField};
use crate::palette::{Reading, Rgb, Tint};
use glam::Vec3;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

const COLOR_START: u32 = 0xff6666;
const COLOR_END: u32 = 0xff2222;

/// Speed multipliers closer than this count as unchanged.
const SPEED_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub curve: usize,
    /// Position along the curve in [0, 1).
    pub phase: f32,
    pub speed: f32,
    /// +1 or -1.
    pub direction: f32,
}

impl Particle {
    /// Move along the curve by `distance` (in phase units), wrapping.
    pub fn advance(&mut self, distance: f32) {
        let mut phase = (self.phase + distance * self.speed * self.direction).rem_euclid(1.0);
        // rem_euclid can round up to exactly 1.0 for tiny negative inputs.
        if phase >= 1.0 {
            phase = 0.0;
        }
        self.phase = phase;
    }
}

/// Clamp the live-vehicle ratio into the configured multiplier range. No
/// vehicle data counts as zero vehicles.
pub fn vehicle_multiplier(vehicles: Option<u32>, config: &ParticleConfig) -> f32 {
    let count = vehicles.unwrap_or(0) as f32;
    (count / config.expected_vehicles).clamp(config.min_multiplier, config.max_multiplier)
}

/// `round((base + range * density^3) * multiplier)`.
pub fn particle_count(avg_density: f32, multiplier: f32, config: &ParticleConfig) -> usize {
    let density = avg_density.clamp(0.0, 1.0);
    let raw = (config.base_count + config.count_range * density.powi(3)) * multiplier;
    raw.round().max(0.0) as usize
}

/// Sizing inputs and result for one curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Allocation {
    pub avg_density: f32,
    pub avg_speed: f32,
    pub multiplier: f32,
    pub count: usize,
    pub speed_multiplier: f32,
}

impl Allocation {
    /// Average the field at evenly spaced parameters along `curve`.
    pub fn for_curve(
        field: &InfluenceField,
        curves: &CurveSet,
        curve: usize,
        multiplier: f32,
        config: &ParticleConfig,
    ) -> Self {
        let samples = config.samples_per_curve.max(2);
        let (mut density, mut speed) = (0.0, 0.0);
        if let Some(c) = curves.get(curve) {
            for s in 0..samples {
                let t = s as f32 / (samples - 1) as f32;
                let influence = field.influence_at(c.point_at(t));
                density += influence.density;
                speed += influence.speed;
            }
        }
        let avg_density = density / samples as f32;
        let avg_speed = speed / samples as f32;
        Self {
            avg_density,
            avg_speed,
            multiplier,
            count: particle_count(avg_density, multiplier, config),
            speed_multiplier: 0.5 + avg_speed,
        }
    }

    fn same_as(&self, other: &Allocation) -> bool {
        self.count == other.count
            && (self.speed_multiplier - other.speed_multiplier).abs() < SPEED_EPSILON
    }
}

/// The particle population on one curve.
#[derive(Debug, Clone)]
pub struct Branch {
    pub curve: usize,
    pub allocation: Allocation,
    pub direction: f32,
    pub particles: Vec<Particle>,
}

impl Branch {
    fn build(curve: usize, allocation: Allocation, config: &ParticleConfig, rng: &mut impl Rng) -> Self {
        let direction = if curve % 2 == 0 { 1.0 } else { -1.0 };
        let speed = (config.speed_floor + rng.gen::<f32>() * config.speed_spread)
            * allocation.speed_multiplier;
        let particles = (0..allocation.count)
            .map(|_| Particle {
                curve,
                phase: rng.gen_range(0.0..1.0),
                speed,
                direction,
            })
            .collect();
        Self {
            curve,
            allocation,
            direction,
            particles,
        }
    }
}

/// All branches plus the flat render buffers.
#[derive(Debug, Clone)]
pub struct ParticleSystem {
    config: ParticleConfig,
    branches: Vec<Branch>,
    positions: Vec<f32>,
    colors: Vec<f32>,
}

impl ParticleSystem {
    pub fn new(config: ParticleConfig) -> Self {
        Self {
            config,
            branches: Vec::new(),
            positions: Vec::new(),
            colors: Vec::new(),
        }
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn total(&self) -> usize {
        self.branches.iter().map(|b| b.particles.len()).sum()
    }

    /// Recompute every curve's allocation and rebuild the branches whose
    /// allocation changed. Returns how many branches were rebuilt.
    pub fn resize(
        &mut self,
        curves: &CurveSet,
        field: &InfluenceField,
        vehicles: Option<u32>,
        rng: &mut impl Rng,
    ) -> usize {
        let multiplier = vehicle_multiplier(vehicles, &self.config);
        let mut rebuilt = 0;
        let mut branches = Vec::with_capacity(curves.len());
        let mut previous = std::mem::take(&mut self.branches).into_iter();

        for curve in 0..curves.len() {
            let allocation = Allocation::for_curve(field, curves, curve, multiplier, &self.config);
            match previous.next() {
                Some(branch) if branch.allocation.same_as(&allocation) => branches.push(branch),
                _ => {
                    rebuilt += 1;
                    branches.push(Branch::build(curve, allocation, &self.config, &mut *rng));
                }
            }
        }

        self.branches = branches;
        let total = self.total();
        self.positions.resize(total * 3, 0.0);
        self.colors.resize(total * 3, 0.0);
        debug!(rebuilt, total, multiplier, "resized particle populations");
        rebuilt
    }

    /// Advance every particle by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        let distance = self.config.flow_rate * dt;
        for particle in self.branches.iter_mut().flat_map(|b| b.particles.iter_mut()) {
            particle.advance(distance);
        }
    }

    /// Refresh the interleaved xyz position and rgb color buffers.
    pub fn write_buffers(&mut self, curves: &CurveSet) {
        let start = Rgb::from_u32(COLOR_START);
        let end = Rgb::from_u32(COLOR_END);
        let particles = self.branches.iter().flat_map(|b| b.particles.iter());
        for (i, particle) in particles.enumerate() {
            let position = curves
                .get(particle.curve)
                .map(|c| c.point_at(particle.phase))
                .unwrap_or(Vec3::ZERO);
            let color = start.lerp(end, particle.phase);
            self.positions[i * 3..i * 3 + 3].copy_from_slice(&position.to_array());
            self.colors[i * 3..i * 3 + 3].copy_from_slice(&[color.r, color.g, color.b]);
        }
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn colors(&self) -> &[f32] {
        &self.colors
    }
}

/// Per-frame visual state of one anchor marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorPulse {
    pub key: String,
    pub position: Vec3,
    pub scale: f32,
    pub emissive: f32,
    pub tint: Tint,
}

/// Size pulses faster and wider as congestion rises; index offsets the phase
/// so neighbouring anchors do not beat in unison.
pub fn anchor_pulses(anchors: &[Anchor], time: f32) -> Vec<AnchorPulse> {
    anchors
        .iter()
        .enumerate()
        .map(|(i, anchor)| {
            let density = anchor.density;
            let base_size = 1.0 + density * 1.8;
            let amplitude = 0.1 + 0.45 * density;
            let rate = 1.2 + anchor.speed * 3.5;
            AnchorPulse {
                key: anchor.key.clone(),
                position: anchor.position,
                scale: base_size * (1.0 + amplitude * (time * rate + i as f32).sin()),
                emissive: 1.5 + density * 1.5,
                tint: Reading::Congestion(density).tint(),
            }
        })
        .collect()
}
