//! Error types.
//!
//! Only configuration and geometry problems are fatal. Everything a live feed
//! can do wrong is a [`FetchError`], which the aggregator turns into a fallback.

use thiserror::Error;

/// Result type for fatal setup operations.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Fatal errors raised while loading configuration or static geometry.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("curve set is empty")]
    EmptyCurveSet,

    #[error("curve {index} has {points} control points, need at least 2")]
    DegenerateCurve { index: usize, points: usize },

    #[error("curve {index} contains a non-finite coordinate")]
    NonFiniteCurve { index: usize },

    #[error("anchor {name} is bound to curve {curve}, but only {available} curves exist")]
    AnchorOutOfRange {
        name: String,
        curve: usize,
        available: usize,
    },

    #[error("anchor {name} has parameter {t} outside [0, 1]")]
    AnchorParameter { name: String, t: f32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read geometry from {path}: {source}")]
    GeometryIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed geometry: {0}")]
    GeometryFormat(#[from] serde_json::Error),
}

/// Per-source fetch failures. Never fatal.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("malformed payload from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
}

impl FetchError {
    pub fn malformed(endpoint: &str, message: impl Into<String>) -> Self {
        FetchError::Malformed {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }
}
