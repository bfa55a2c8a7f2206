//! Driven oscillator.
//!
//! The pulse rate is driven by grid carbon intensity through a piecewise
//! linear map. A jitter offset is redrawn every few seconds, and the
//! current rate eases toward the jittered target, so the output drifts
//! organically instead of tracking the raw input step for step.

use crate::config::OscillatorConfig;
use rand::Rng;
use serde::Serialize;
use std::f32::consts::PI;

/// `(lower bound, output at lower bound, output gained per 100 units)`.
const CARBON_SEGMENTS: [(f32, f32, f32); 5] = [
    (0.0, 60.0, 5.0),
    (100.0, 75.0, 10.0),
    (200.0, 85.0, 15.0),
    (300.0, 100.0, 20.0),
    (400.0, 120.0, 20.0),
];

/// Span of the last segment; beyond it the output saturates.
const CARBON_TAIL: f32 = 100.0;

/// Drive value for a carbon intensity in gCO2/kWh.
///
/// Non-decreasing over the whole domain, with output in [60, 140].
pub fn drive_from_carbon(intensity: f64) -> f32 {
    let x = (intensity as f32).max(0.0);
    let (lower, base, gain) = CARBON_SEGMENTS
        .iter()
        .rev()
        .find(|(lower, _, _)| x >= *lower)
        .copied()
        .unwrap_or(CARBON_SEGMENTS[0]);
    let mut progress = (x - lower) / 100.0;
    if lower == CARBON_SEGMENTS[CARBON_SEGMENTS.len() - 1].0 {
        progress = progress.min(CARBON_TAIL / 100.0);
    }
    base + progress * gain
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OscillatorState {
    pub current: f32,
    pub target: f32,
    /// Oscillator clock, in seconds, at the last jitter draw.
    pub last_jitter_time: f32,
}

#[derive(Debug, Clone)]
pub struct Oscillator {
    config: OscillatorConfig,
    state: OscillatorState,
    clock: f32,
    jitter: f32,
    next_jitter_in: f32,
}

impl Oscillator {
    pub fn new(config: OscillatorConfig) -> Self {
        let initial = config.initial.clamp(config.min_output, config.max_output);
        Self {
            state: OscillatorState {
                current: initial,
                target: initial,
                last_jitter_time: 0.0,
            },
            clock: 0.0,
            jitter: 0.0,
            // Draw on the first step.
            next_jitter_in: 0.0,
            config,
        }
    }

    pub fn state(&self) -> OscillatorState {
        self.state
    }

    pub fn value(&self) -> f32 {
        self.state.current
    }

    /// Advance by `dt` seconds toward `base_drive`.
    pub fn step(&mut self, dt: f32, base_drive: f32, rng: &mut impl Rng) -> f32 {
        let dt = dt.max(0.0);
        let (min, max) = (self.config.min_output, self.config.max_output);
        self.clock += dt;

        if self.clock - self.state.last_jitter_time >= self.next_jitter_in {
            let amplitude = self.config.jitter_amplitude;
            self.jitter = if amplitude > 0.0 {
                rng.gen_range(-amplitude..=amplitude)
            } else {
                0.0
            };
            let (lo, hi) = (self.config.jitter_min_secs, self.config.jitter_max_secs);
            self.next_jitter_in = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
            self.state.last_jitter_time = self.clock;
        }

        self.state.target = (base_drive + self.jitter).clamp(min, max);

        // Frame-rate independent form of "close `approach_rate` of the gap
        // per reference frame".
        let frames = dt * self.config.reference_fps;
        let k = 1.0 - (1.0 - self.config.approach_rate).powf(frames);
        let current = self.state.current + (self.state.target - self.state.current) * k;
        self.state.current = current.clamp(min, max);
        self.state.current
    }

    /// Visual scale of the beating body at time `t` seconds.
    pub fn pulse_scale(&self, t: f32) -> f32 {
        let frequency = self.state.current / 60.0;
        1.0 + 0.02 * (t * frequency * PI * 0.5).sin()
    }
}
