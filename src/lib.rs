//! Pulse - a live city pulse rendered as flowing particles.
//!
//! Traffic, transit, weather and grid-energy feeds are polled and blended
//! into snapshots. A Gaussian influence field spreads per-road congestion
//! across a fixed set of 3D curves; particle populations flowing along those
//! curves grow with congestion and bus activity, and a driven oscillator
//! beats faster as the grid gets dirtier.

pub mod aggregator;
pub mod config;
pub mod curve;
pub mod engine;
pub mod error;
pub mod feed;
pub mod field;
pub mod history;
pub mod oscillator;
pub mod palette;
pub mod particles;
pub mod push;
pub mod runtime;
pub mod sources;
pub mod status;

pub use aggregator::{Aggregator, FeedUpdate, PollOutcome, Snapshot, SnapshotHandle};
pub use config::PulseConfig;
pub use curve::CurveSet;
pub use engine::{FrameOutput, Visualizer};
pub use error::{FetchError, PulseError};
pub use feed::{FeedClient, HttpFeedClient, ScriptedFeed};
pub use field::{Influence, InfluenceField};
pub use runtime::{RunOptions, Runtime};
pub use status::ConnectionStatus;
