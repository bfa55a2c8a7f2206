//! Per-frame visual state.
//!
//! [`Visualizer`] owns everything that changes between frames: the influence
//! field, particle populations, oscillator and history. It reads snapshots but
//! never writes them, and it never touches the network, so a frame costs the
//! same whether the feeds are healthy or not.

use crate::aggregator::Snapshot;
use crate::config::PulseConfig;
use crate::curve::CurveSet;
use crate::error::Result;
use crate::field::{Anchor, AnchorLayout, Influence, InfluenceField};
use crate::history::{History, HistorySummary};
use crate::oscillator::{drive_from_carbon, Oscillator};
use crate::palette::{Reading, Tint};
use crate::particles::{anchor_pulses, Allocation, AnchorPulse, ParticleSystem};
use glam::Vec3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// What a renderer needs besides the particle buffers.
#[derive(Debug, Clone, Serialize)]
pub struct FrameOutput {
    pub revision: u64,
    pub particles: usize,
    /// Oscillator output in beats per minute.
    pub bpm: f32,
    pub body_scale: f32,
    pub pulses: Vec<AnchorPulse>,
    pub weather: Option<Tint>,
    pub energy: Option<Tint>,
}

/// Serializable picture of the current state.
#[derive(Debug, Clone, Serialize)]
pub struct VisualSummary {
    pub revision: u64,
    pub particles: usize,
    pub curves: Vec<Allocation>,
    pub anchors: Vec<Anchor>,
    pub bpm: f32,
    pub target_bpm: f32,
    pub history: Option<HistorySummary>,
    pub degraded: Vec<String>,
}

pub struct Visualizer {
    config: PulseConfig,
    curves: CurveSet,
    layout: AnchorLayout,
    field: Arc<InfluenceField>,
    particles: ParticleSystem,
    oscillator: Oscillator,
    history: History,
    rng: StdRng,
    /// Snapshot revision the field and populations were last built from.
    revision: Option<u64>,
    degraded: Vec<String>,
}

impl Visualizer {
    /// Fails if an anchor refers to a curve that does not exist.
    pub fn new(config: PulseConfig, curves: CurveSet, seed: u64) -> Result<Self> {
        let layout = AnchorLayout::resolve(&config.anchors, &curves)?;
        let field = Arc::new(InfluenceField::from_snapshot(
            &layout,
            &Snapshot::default(),
            &config.field,
        ));
        Ok(Self {
            particles: ParticleSystem::new(config.particles.clone()),
            oscillator: Oscillator::new(config.oscillator.clone()),
            history: History::new(&config.history),
            rng: StdRng::seed_from_u64(seed),
            revision: None,
            degraded: Vec::new(),
            config,
            curves,
            layout,
            field,
        })
    }

    pub fn curves(&self) -> &CurveSet {
        &self.curves
    }

    pub fn field(&self) -> &InfluenceField {
        &self.field
    }

    /// The current field, shareable with readers outside the frame loop.
    /// Replaced, never mutated, when a new snapshot arrives.
    pub fn shared_field(&self) -> Arc<InfluenceField> {
        Arc::clone(&self.field)
    }

    pub fn particles(&self) -> &ParticleSystem {
        &self.particles
    }

    pub fn oscillator(&self) -> &Oscillator {
        &self.oscillator
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn influence_at(&self, point: Vec3) -> Influence {
        self.field.influence_at(point)
    }

    /// Rebuild the field and resize populations if `snapshot` is new.
    /// Returns whether anything was rebuilt.
    pub fn sync(&mut self, snapshot: &Snapshot) -> bool {
        if self.revision == Some(snapshot.revision) {
            return false;
        }
        self.field = Arc::new(InfluenceField::from_snapshot(
            &self.layout,
            snapshot,
            &self.config.field,
        ));
        let rebuilt = self.particles.resize(
            &self.curves,
            &self.field,
            snapshot.vehicles,
            &mut self.rng,
        );
        self.revision = Some(snapshot.revision);
        self.degraded = snapshot.degraded.clone();
        debug!(
            revision = snapshot.revision,
            rebuilt,
            particles = self.particles.total(),
            "visual state synced"
        );
        true
    }

    /// Advance everything by `dt` seconds; `time` is the animation clock.
    pub fn frame(&mut self, dt: f32, time: f32, snapshot: &Snapshot) -> FrameOutput {
        self.sync(snapshot);

        self.particles.advance(dt);
        self.particles.write_buffers(&self.curves);

        let drive = snapshot
            .energy
            .as_ref()
            .map(|e| drive_from_carbon(e.carbon_intensity))
            .unwrap_or(self.config.oscillator.initial);
        let bpm = self.oscillator.step(dt, drive, &mut self.rng);

        FrameOutput {
            revision: snapshot.revision,
            particles: self.particles.total(),
            bpm,
            body_scale: self.oscillator.pulse_scale(time),
            pulses: anchor_pulses(self.field.anchors(), time),
            weather: snapshot
                .weather
                .as_ref()
                .map(|w| Reading::Weather(&w.description).tint()),
            energy: snapshot.energy.as_ref().map(|e| Reading::Energy(e.score).tint()),
        }
    }

    /// Record the current oscillator value into the history.
    pub fn record_sample(&mut self, now_ms: i64) {
        self.history.record(self.oscillator.value(), now_ms);
    }

    pub fn summary(&self) -> VisualSummary {
        VisualSummary {
            revision: self.revision.unwrap_or(0),
            particles: self.particles.total(),
            curves: self.particles.branches().iter().map(|b| b.allocation).collect(),
            anchors: self.field.anchors().to_vec(),
            bpm: self.oscillator.value(),
            target_bpm: self.oscillator.state().target,
            history: self.history.summary(),
            degraded: self.degraded.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::BlendedMetric;
    use crate::config::OscillatorConfig;
    use crate::field::AnchorBinding;
    use crate::sources::EnergyReport;

    fn curves() -> CurveSet {
        CurveSet::from_paths(
            &[
                vec![[0.0, 0.0, 0.0], [0.1, 0.05, 0.0], [0.2, 0.0, 0.0]],
                vec![[0.0, 1.0, 0.0], [0.1, 1.05, 0.0], [0.2, 1.0, 0.0]],
            ],
            16,
        )
        .unwrap()
    }

    fn config() -> PulseConfig {
        PulseConfig {
            anchors: vec![AnchorBinding::new("princes", "Princes Street", 0, 0.5)],
            oscillator: OscillatorConfig {
                jitter_amplitude: 0.0,
                ..OscillatorConfig::default()
            },
            ..PulseConfig::default()
        }
    }

    fn snapshot(revision: u64, score: f64) -> Snapshot {
        let mut snapshot = Snapshot {
            revision,
            vehicles: Some(50),
            ..Snapshot::default()
        };
        snapshot
            .traffic
            .insert("princes".into(), BlendedMetric { score, speed: 20.0 });
        snapshot
    }

    #[test]
    fn rejects_anchor_on_missing_curve() {
        let mut config = config();
        config.anchors[0].curve = 5;
        assert!(Visualizer::new(config, curves(), 1).is_err());
    }

    #[test]
    fn frame_resizes_only_on_new_revision() {
        let mut vis = Visualizer::new(config(), curves(), 7).unwrap();
        let congested = snapshot(1, 0.0);
        let out = vis.frame(1.0 / 60.0, 0.0, &congested);
        let busy = out.particles;
        assert_eq!(vis.particles().positions().len(), busy * 3);
        assert!(!vis.sync(&congested));

        // Same revision, different content: ignored until the revision moves.
        let quiet = snapshot(1, 100.0);
        assert_eq!(vis.frame(1.0 / 60.0, 0.1, &quiet).particles, busy);
        let quiet = snapshot(2, 100.0);
        assert!(vis.frame(1.0 / 60.0, 0.2, &quiet).particles < busy);
    }

    #[test]
    fn far_curve_sees_neutral_field() {
        let mut vis = Visualizer::new(config(), curves(), 3).unwrap();
        vis.frame(0.016, 0.0, &snapshot(1, 0.0));
        let far = vis.particles().branches()[1].allocation;
        assert!((far.avg_density - 0.1).abs() < 1e-6);
        assert!((far.avg_speed - 0.5).abs() < 1e-6);
    }

    #[test]
    fn oscillator_follows_energy() {
        let mut vis = Visualizer::new(config(), curves(), 9).unwrap();
        let mut snap = snapshot(1, 50.0);
        snap.energy = Some(EnergyReport {
            carbon_intensity: 250.0,
            dominant_fuel: "gas".into(),
            score: 43.0,
        });
        let mut out = vis.frame(0.0, 0.0, &snap);
        for i in 0..1200 {
            out = vis.frame(1.0 / 60.0, i as f32 / 60.0, &snap);
        }
        assert!((out.bpm - 92.5).abs() < 0.05);
        assert_eq!(out.energy.unwrap().color.to_hex(), "#ff4444");
        assert!(out.weather.is_none());
        assert_eq!(out.pulses.len(), 1);
    }

    #[test]
    fn history_records_oscillator_value() {
        let mut vis = Visualizer::new(config(), curves(), 11).unwrap();
        vis.frame(0.016, 0.0, &snapshot(1, 50.0));
        vis.record_sample(1_000);
        vis.record_sample(16_000);
        let summary = vis.summary();
        assert_eq!(summary.history.unwrap().count, 2);
        assert_eq!(summary.curves.len(), 2);
        assert_eq!(summary.revision, 1);
    }
}
