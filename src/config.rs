//! Configuration loading for Pulse.
//!
//! Configuration is loaded from TOML files with environment variable overrides.

use crate::error::PulseError;
use crate::field::AnchorBinding;
use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub feeds: FeedsConfig,

    #[serde(default)]
    pub push: PushConfig,

    #[serde(default)]
    pub field: FieldConfig,

    #[serde(default)]
    pub particles: ParticleConfig,

    #[serde(default)]
    pub oscillator: OscillatorConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub frame: FrameConfig,

    #[serde(default)]
    pub geometry: GeometryConfig,

    #[serde(default = "default_anchors")]
    pub anchors: Vec<AnchorBinding>,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            feeds: FeedsConfig::default(),
            push: PushConfig::default(),
            field: FieldConfig::default(),
            particles: ParticleConfig::default(),
            oscillator: OscillatorConfig::default(),
            history: HistoryConfig::default(),
            frame: FrameConfig::default(),
            geometry: GeometryConfig::default(),
            anchors: default_anchors(),
        }
    }
}

/// A named per-road traffic endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RoadEndpoint {
    pub name: String,
    pub path: String,
}

impl RoadEndpoint {
    fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_roads")]
    pub roads: Vec<RoadEndpoint>,

    #[serde(default = "default_vehicles_path")]
    pub vehicles_path: String,

    #[serde(default = "default_weather_path")]
    pub weather_path: String,

    #[serde(default = "default_energy_path")]
    pub energy_path: String,

    /// Seconds between full poll cycles.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Seconds between cycles while a single road is focused.
    #[serde(default = "default_focus_interval")]
    pub focus_interval: u64,

    /// Per-fetch timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            roads: default_roads(),
            vehicles_path: default_vehicles_path(),
            weather_path: default_weather_path(),
            energy_path: default_energy_path(),
            interval: default_interval(),
            focus_interval: default_focus_interval(),
            timeout: default_timeout(),
        }
    }
}

impl FeedsConfig {
    pub fn poll_interval(&self, focused: bool) -> Duration {
        if focused {
            Duration::from_secs(self.focus_interval)
        } else {
            Duration::from_secs(self.interval)
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn road(&self, name: &str) -> Option<&RoadEndpoint> {
        self.roads.iter().find(|r| r.name == name)
    }

    /// A focus must name a configured road, otherwise no cycle could ever
    /// publish anything.
    pub fn check_focus(&self, focus: Option<&str>) -> crate::error::Result<()> {
        match focus {
            Some(name) if self.road(name).is_none() => {
                let known: Vec<&str> = self.roads.iter().map(|r| r.name.as_str()).collect();
                Err(PulseError::InvalidConfig(format!(
                    "focus road {name} is not configured (known: {})",
                    known.join(", ")
                )))
            }
            _ => Ok(()),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_roads() -> Vec<RoadEndpoint> {
    vec![
        RoadEndpoint::new("princes", "/api/traffic/princes-street"),
        RoadEndpoint::new("leith", "/api/traffic/leith-street"),
        RoadEndpoint::new("nicolson", "/api/traffic/nicolson-street"),
        RoadEndpoint::new("portobello", "/api/traffic/portobello-high-street"),
        RoadEndpoint::new("lady", "/api/traffic/lady-road"),
        RoadEndpoint::new("gilmerton", "/api/traffic/gilmerton-road"),
        RoadEndpoint::new("airport", "/api/traffic/edinburgh-airport"),
    ]
}

fn default_vehicles_path() -> String {
    "/api/live-transport".to_string()
}

fn default_weather_path() -> String {
    "/api/weather".to_string()
}

fn default_energy_path() -> String {
    "/api/energy".to_string()
}

fn default_interval() -> u64 {
    30
}

fn default_focus_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,

    /// `host:port` of the push feed (newline-delimited JSON documents).
    #[serde(default = "default_push_address")]
    pub address: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Road that a pushed document's single `traffic` reading belongs to.
    #[serde(default = "default_primary_road")]
    pub primary_road: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_push_address(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            primary_road: default_primary_road(),
        }
    }
}

fn default_push_address() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_primary_road() -> String {
    "princes".to_string()
}

impl PushConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    /// Gaussian falloff radius in model units.
    #[serde(default = "default_radius")]
    pub radius: f32,

    /// Total weight below which a query falls back to the neutral value.
    #[serde(default = "default_min_weight")]
    pub min_weight: f32,

    #[serde(default = "default_neutral_density")]
    pub neutral_density: f32,

    #[serde(default = "default_neutral_speed")]
    pub neutral_speed: f32,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            min_weight: default_min_weight(),
            neutral_density: default_neutral_density(),
            neutral_speed: default_neutral_speed(),
        }
    }
}

fn default_radius() -> f32 {
    0.2
}

fn default_min_weight() -> f32 {
    0.01
}

fn default_neutral_density() -> f32 {
    0.1
}

fn default_neutral_speed() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticleConfig {
    #[serde(default = "default_base_count")]
    pub base_count: f32,

    #[serde(default = "default_count_range")]
    pub count_range: f32,

    /// Field samples taken along each curve when sizing its population.
    #[serde(default = "default_samples_per_curve")]
    pub samples_per_curve: usize,

    #[serde(default = "default_resample_points")]
    pub resample_points: usize,

    #[serde(default = "default_expected_vehicles")]
    pub expected_vehicles: f32,

    #[serde(default = "default_min_multiplier")]
    pub min_multiplier: f32,

    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f32,

    /// Phase advanced per second at unit speed.
    #[serde(default = "default_flow_rate")]
    pub flow_rate: f32,

    #[serde(default = "default_speed_floor")]
    pub speed_floor: f32,

    #[serde(default = "default_speed_spread")]
    pub speed_spread: f32,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            base_count: default_base_count(),
            count_range: default_count_range(),
            samples_per_curve: default_samples_per_curve(),
            resample_points: default_resample_points(),
            expected_vehicles: default_expected_vehicles(),
            min_multiplier: default_min_multiplier(),
            max_multiplier: default_max_multiplier(),
            flow_rate: default_flow_rate(),
            speed_floor: default_speed_floor(),
            speed_spread: default_speed_spread(),
        }
    }
}

fn default_base_count() -> f32 {
    40.0
}

fn default_count_range() -> f32 {
    220.0
}

fn default_samples_per_curve() -> usize {
    5
}

fn default_resample_points() -> usize {
    64
}

fn default_expected_vehicles() -> f32 {
    50.0
}

fn default_min_multiplier() -> f32 {
    0.25
}

fn default_max_multiplier() -> f32 {
    1.8
}

fn default_flow_rate() -> f32 {
    // 0.00015 phase per frame at 60 fps
    0.009
}

fn default_speed_floor() -> f32 {
    0.45
}

fn default_speed_spread() -> f32 {
    0.15
}

#[derive(Debug, Clone, Deserialize)]
pub struct OscillatorConfig {
    #[serde(default = "default_min_output")]
    pub min_output: f32,

    #[serde(default = "default_max_output")]
    pub max_output: f32,

    #[serde(default = "default_initial")]
    pub initial: f32,

    /// Fraction of the remaining gap closed per reference frame.
    #[serde(default = "default_approach_rate")]
    pub approach_rate: f32,

    #[serde(default = "default_reference_fps")]
    pub reference_fps: f32,

    /// Half-width of the uniform jitter added to the target, in output units.
    #[serde(default = "default_jitter_amplitude")]
    pub jitter_amplitude: f32,

    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: f32,

    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: f32,
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        Self {
            min_output: default_min_output(),
            max_output: default_max_output(),
            initial: default_initial(),
            approach_rate: default_approach_rate(),
            reference_fps: default_reference_fps(),
            jitter_amplitude: default_jitter_amplitude(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
        }
    }
}

fn default_min_output() -> f32 {
    50.0
}

fn default_max_output() -> f32 {
    140.0
}

fn default_initial() -> f32 {
    72.0
}

fn default_approach_rate() -> f32 {
    0.02
}

fn default_reference_fps() -> f32 {
    60.0
}

fn default_jitter_amplitude() -> f32 {
    1.5
}

fn default_jitter_min_secs() -> f32 {
    3.0
}

fn default_jitter_max_secs() -> f32 {
    6.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_max_points")]
    pub max_points: usize,

    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_points: default_max_points(),
            sample_interval: default_sample_interval(),
        }
    }
}

fn default_retention_secs() -> u64 {
    600
}

fn default_max_points() -> usize {
    40
}

fn default_sample_interval() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Seconds between status log lines in live mode.
    #[serde(default = "default_status_every")]
    pub status_every: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            status_every: default_status_every(),
        }
    }
}

impl FrameConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

fn default_fps() -> u32 {
    60
}

fn default_status_every() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeometryConfig {
    #[serde(default = "default_curves_path")]
    pub curves: String,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            curves: default_curves_path(),
        }
    }
}

fn default_curves_path() -> String {
    "data/heart_paths.json".to_string()
}

fn default_anchors() -> Vec<AnchorBinding> {
    vec![
        AnchorBinding::new("princes", "Princes Street", 2, 0.5),
        AnchorBinding::new("leith", "Leith Street", 4, 0.38),
        AnchorBinding::new("nicolson", "Nicolson Street", 8, 0.75),
        AnchorBinding::new("portobello", "Portobello", 7, 0.72),
        AnchorBinding::new("lady", "Lady Road", 8, 0.83),
        AnchorBinding::new("gilmerton", "Gilmerton", 1, 0.12),
        AnchorBinding::new("airport", "Edinburgh Airport", 3, 0.56),
    ]
}

impl PulseConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("PULSE").separator("_"))
            .build()?;

        let pulse_config: PulseConfig = config.try_deserialize()?;
        pulse_config.validate()?;
        Ok(pulse_config)
    }

    /// Reject values no animation can run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: &str| Err(PulseError::InvalidConfig(msg.to_string()));

        if self.feeds.interval == 0 || self.feeds.focus_interval == 0 {
            return invalid("poll intervals must be positive");
        }
        if self.feeds.timeout == 0 {
            return invalid("feeds.timeout must be positive");
        }
        if self.field.radius <= 0.0 {
            return invalid("field.radius must be positive");
        }
        if self.particles.samples_per_curve < 2 {
            return invalid("particles.samples_per_curve must be at least 2");
        }
        if self.particles.resample_points < 2 {
            return invalid("particles.resample_points must be at least 2");
        }
        if self.particles.expected_vehicles <= 0.0 {
            return invalid("particles.expected_vehicles must be positive");
        }
        if self.particles.min_multiplier <= 0.0 {
            return invalid("particles.min_multiplier must be positive");
        }
        if self.particles.min_multiplier > self.particles.max_multiplier {
            return invalid("particles.min_multiplier exceeds max_multiplier");
        }
        if self.oscillator.min_output >= self.oscillator.max_output {
            return invalid("oscillator.min_output must be below max_output");
        }
        if self.oscillator.jitter_amplitude < 0.0 {
            return invalid("oscillator.jitter_amplitude must not be negative");
        }
        if self.oscillator.jitter_min_secs < 0.0
            || self.oscillator.jitter_min_secs > self.oscillator.jitter_max_secs
        {
            return invalid("oscillator jitter interval must satisfy 0 <= min <= max");
        }
        if self.oscillator.reference_fps <= 0.0 {
            return invalid("oscillator.reference_fps must be positive");
        }
        if !(0.0..=1.0).contains(&self.oscillator.approach_rate) {
            return invalid("oscillator.approach_rate must be within [0, 1]");
        }
        if self.history.max_points == 0 {
            return invalid("history.max_points must be positive");
        }
        if self.frame.fps == 0 {
            return invalid("frame.fps must be positive");
        }
        for anchor in &self.anchors {
            if !(0.0..=1.0).contains(&anchor.t) {
                return Err(PulseError::AnchorParameter {
                    name: anchor.key.clone(),
                    t: anchor.t,
                });
            }
        }
        Ok(())
    }
}
