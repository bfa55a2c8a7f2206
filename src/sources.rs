//! Metric source adapters.
//!
//! Each adapter turns one feed's raw JSON into a canonical record. Anything
//! that does not have the expected shape is reported as
//! [`FetchError::Malformed`], so callers can treat it exactly like a failed
//! request.

use crate::error::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Score used when a traffic feed is down or omits its score.
pub const FALLBACK_SCORE: f64 = 50.0;

/// Speed used when a traffic feed is down or omits its speed.
pub const FALLBACK_SPEED: f64 = 10.0;

/// One normalized traffic reading.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Flow score in [0, 100]; higher means freer flowing traffic.
    pub score: f64,
    /// Current speed, never negative.
    pub speed: f64,
    pub raw: Value,
}

impl MetricSample {
    pub fn new(score: f64, speed: f64) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            speed: speed.max(0.0),
            raw: Value::Null,
        }
    }

    /// The value substituted for a failed traffic source.
    pub fn fallback() -> Self {
        Self::new(FALLBACK_SCORE, FALLBACK_SPEED)
    }
}

fn number(value: &Value, key: &str) -> Option<f64> {
    let parsed = match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        // Some upstreams serialise numbers as strings.
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Normalize a per-road payload `{score, current_speed, ...}`.
///
/// Missing fields take the traffic fallback; a payload that is not an object
/// is malformed.
pub fn normalize_traffic(endpoint: &str, raw: Value) -> Result<MetricSample, FetchError> {
    if !raw.is_object() {
        return Err(FetchError::malformed(endpoint, "expected a JSON object"));
    }
    let score = number(&raw, "score").unwrap_or(FALLBACK_SCORE);
    let speed = number(&raw, "current_speed").unwrap_or(FALLBACK_SPEED);
    Ok(MetricSample {
        raw,
        ..MetricSample::new(score, speed)
    })
}

/// Count live vehicles whose `vehicle_type` is `"bus"`.
///
/// Accepts a bare list or an object wrapping the list under `raw` or
/// `vehicles`.
pub fn count_buses(endpoint: &str, raw: &Value) -> Result<u32, FetchError> {
    let list = match raw {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("raw")
            .or_else(|| map.get("vehicles"))
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::malformed(endpoint, "no vehicle list"))?,
        _ => return Err(FetchError::malformed(endpoint, "expected a vehicle list")),
    };

    let buses = list
        .iter()
        .filter(|v| v.get("vehicle_type").and_then(Value::as_str) == Some("bus"))
        .count();
    Ok(buses as u32)
}

/// Current weather conditions. There is no fabricated fallback: a broken
/// weather feed leaves the report absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub temperature: Option<f64>,
    pub description: String,
    pub wind_speed: Option<f64>,
    pub feels_like: Option<f64>,
}

impl WeatherReport {
    pub fn from_payload(endpoint: &str, raw: &Value) -> Result<Self, FetchError> {
        let description = raw
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::malformed(endpoint, "missing description"))?;
        Ok(Self {
            temperature: number(raw, "temperature"),
            description: description.to_string(),
            wind_speed: number(raw, "wind_speed"),
            feels_like: number(raw, "feels_like"),
        })
    }
}

/// Grid carbon intensity and generation mix summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReport {
    /// gCO2/kWh.
    pub carbon_intensity: f64,
    pub dominant_fuel: String,
    /// 0-100, higher means cleaner.
    pub score: f64,
}

impl EnergyReport {
    pub fn from_payload(endpoint: &str, raw: &Value) -> Result<Self, FetchError> {
        let carbon_intensity = number(raw, "carbon_intensity")
            .ok_or_else(|| FetchError::malformed(endpoint, "missing carbon_intensity"))?;
        let dominant_fuel = raw
            .get("dominant_fuel")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let score = number(raw, "score").unwrap_or_else(|| carbon_score(carbon_intensity));
        Ok(Self {
            carbon_intensity: carbon_intensity.max(0.0),
            dominant_fuel,
            score: score.clamp(0.0, 100.0),
        })
    }
}

/// Map carbon intensity to a 0-100 cleanliness score: 100 at or below 50
/// gCO2/kWh, 0 at or above 400, linear between.
pub fn carbon_score(intensity: f64) -> f64 {
    if intensity <= 50.0 {
        100.0
    } else if intensity >= 400.0 {
        0.0
    } else {
        100.0 * (1.0 - (intensity - 50.0) / 350.0)
    }
}
