//! Bounded sample history for the oscillator output.

use crate::config::HistoryConfig;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistorySample {
    pub value: f32,
    pub timestamp_ms: i64,
}

/// Computed on read, so it always matches the retained samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistorySummary {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub latest: f32,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct History {
    samples: VecDeque<HistorySample>,
    retention_ms: i64,
    max_points: usize,
}

impl History {
    pub fn new(config: &HistoryConfig) -> Self {
        Self::with_limits(config.retention_secs as i64 * 1000, config.max_points)
    }

    pub fn with_limits(retention_ms: i64, max_points: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_points.min(1024)),
            retention_ms,
            max_points,
        }
    }

    /// Append a sample, then drop anything past the retention window and
    /// finally the oldest entries beyond the point cap.
    pub fn record(&mut self, value: f32, now_ms: i64) {
        self.samples.push_back(HistorySample {
            value,
            timestamp_ms: now_ms,
        });
        let retention = self.retention_ms;
        self.samples.retain(|s| now_ms - s.timestamp_ms <= retention);
        while self.samples.len() > self.max_points {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &HistorySample> {
        self.samples.iter()
    }

    pub fn summary(&self) -> Option<HistorySummary> {
        let latest = self.samples.back()?.value;
        let (min, max, sum) = self.samples.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0.0f32),
            |(min, max, sum), s| (min.min(s.value), max.max(s.value), sum + s.value),
        );
        Some(HistorySummary {
            min,
            max,
            mean: sum / self.samples.len() as f32,
            latest,
            count: self.samples.len(),
        })
    }
}
