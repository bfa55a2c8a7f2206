//! Streaming aggregator.
//!
//! Polls every configured feed on a fixed cadence, blends each traffic sample
//! into a running exponential average and publishes immutable [`Snapshot`]s
//! through a [`SnapshotHandle`]. Publishing is a single atomic pointer swap,
//! so readers see either the old snapshot or the new one, never a mix.
//!
//! The aggregator is the only writer. Push updates reach it through the same
//! task via an `mpsc` channel rather than by touching shared state.

use crate::config::{FeedsConfig, RoadEndpoint};
use crate::error::FetchError;
use crate::feed::FeedClient;
use crate::sources::{count_buses, normalize_traffic, EnergyReport, MetricSample, WeatherReport};
use arc_swap::ArcSwap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Smoothing factor applied to every traffic attribute.
pub const BLEND_ALPHA: f64 = 0.3;

pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Exponentially smoothed traffic reading for one road.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlendedMetric {
    pub score: f64,
    pub speed: f64,
}

impl BlendedMetric {
    /// First observation of a road. Seeding from the sample itself keeps the
    /// running value inside the hull of what was actually observed.
    pub fn seed(sample: &MetricSample) -> Self {
        Self {
            score: sample.score,
            speed: sample.speed,
        }
    }

    pub fn blend(self, sample: &MetricSample, alpha: f64) -> Self {
        Self {
            score: lerp(self.score, sample.score, alpha),
            speed: lerp(self.speed, sample.speed, alpha),
        }
    }
}

/// Everything a frame needs to know about the outside world.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Increments on every publish; zero means nothing has arrived yet.
    pub revision: u64,
    pub updated_at_ms: Option<i64>,
    pub traffic: BTreeMap<String, BlendedMetric>,
    /// Live buses. `None` until the vehicle feed has answered once.
    pub vehicles: Option<u32>,
    pub weather: Option<WeatherReport>,
    pub energy: Option<EnergyReport>,
    /// Sources that fell back during the cycle that produced this snapshot.
    pub degraded: Vec<String>,
}

impl Snapshot {
    pub fn metric(&self, name: &str) -> Option<&BlendedMetric> {
        self.traffic.get(name)
    }

    pub fn age_ms(&self, now_ms: i64) -> Option<i64> {
        self.updated_at_ms.map(|at| (now_ms - at).max(0))
    }
}

/// Shared read side of the aggregator.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<ArcSwap<Snapshot>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    fn publish(&self, snapshot: Snapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

/// An out-of-band update, e.g. from the push channel.
#[derive(Debug, Clone, Default)]
pub struct FeedUpdate {
    pub timestamp_ms: i64,
    pub traffic: Vec<(String, MetricSample)>,
    pub vehicles: Option<u32>,
    pub weather: Option<WeatherReport>,
    pub energy: Option<EnergyReport>,
}

impl FeedUpdate {
    pub fn is_empty(&self) -> bool {
        self.traffic.is_empty()
            && self.vehicles.is_none()
            && self.weather.is_none()
            && self.energy.is_none()
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Published { revision: u64, degraded: Vec<String> },
    /// Every source failed; the previous snapshot stays current.
    Stale,
}

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    at_ms: i64,
}

impl<T> Stamped<T> {
    /// Replace the value unless `at_ms` is older than what is stored.
    fn offer(slot: &mut Option<Stamped<T>>, value: T, at_ms: i64) -> bool {
        match slot {
            Some(current) if at_ms < current.at_ms => false,
            _ => {
                *slot = Some(Stamped { value, at_ms });
                true
            }
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn fetch_with_timeout<C: FeedClient>(
    client: &C,
    endpoint: &str,
    timeout: Duration,
) -> Result<Value, FetchError> {
    match tokio::time::timeout(timeout, client.fetch_json(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            endpoint: endpoint.to_string(),
        }),
    }
}

pub struct Aggregator<C> {
    client: Arc<C>,
    feeds: FeedsConfig,
    alpha: f64,
    focus: Option<String>,
    traffic: BTreeMap<String, Stamped<BlendedMetric>>,
    vehicles: Option<Stamped<u32>>,
    weather: Option<Stamped<WeatherReport>>,
    energy: Option<Stamped<EnergyReport>>,
    revision: u64,
    last_update_ms: Option<i64>,
    /// Sources that fell back in the latest poll cycle.
    degraded: Vec<String>,
    handle: SnapshotHandle,
}

impl<C: FeedClient> Aggregator<C> {
    pub fn new(client: Arc<C>, feeds: FeedsConfig) -> Self {
        Self {
            client,
            feeds,
            alpha: BLEND_ALPHA,
            focus: None,
            traffic: BTreeMap::new(),
            vehicles: None,
            weather: None,
            energy: None,
            revision: 0,
            last_update_ms: None,
            degraded: Vec::new(),
            handle: SnapshotHandle::new(),
        }
    }

    /// Poll only the named road, at the faster focus cadence.
    pub fn with_focus(mut self, road: Option<String>) -> Self {
        self.focus = road;
        self
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    fn active_roads(&self) -> Vec<RoadEndpoint> {
        match &self.focus {
            Some(name) => self
                .feeds
                .roads
                .iter()
                .filter(|r| &r.name == name)
                .cloned()
                .collect(),
            None => self.feeds.roads.clone(),
        }
    }

    /// Fetch every active source concurrently, blend, and publish.
    pub async fn poll(&mut self, now_ms: i64) -> PollOutcome {
        let roads = self.active_roads();
        let timeout = self.feeds.fetch_timeout();
        let focused = self.focus.is_some();
        let client = self.client.as_ref();
        let feeds = &self.feeds;

        let traffic = join_all(roads.iter().map(|road| async move {
            let result = fetch_with_timeout(client, &road.path, timeout)
                .await
                .and_then(|raw| normalize_traffic(&road.path, raw));
            (road.name.clone(), result)
        }));

        let auxiliary = async {
            if focused {
                return (None, None, None);
            }
            let (vehicles, weather, energy) = tokio::join!(
                fetch_with_timeout(client, &feeds.vehicles_path, timeout),
                fetch_with_timeout(client, &feeds.weather_path, timeout),
                fetch_with_timeout(client, &feeds.energy_path, timeout),
            );
            let vehicles = vehicles.and_then(|raw| count_buses(&feeds.vehicles_path, &raw));
            let weather =
                weather.and_then(|raw| WeatherReport::from_payload(&feeds.weather_path, &raw));
            let energy =
                energy.and_then(|raw| EnergyReport::from_payload(&feeds.energy_path, &raw));
            (Some(vehicles), Some(weather), Some(energy))
        };

        let (traffic, (vehicles, weather, energy)) = tokio::join!(traffic, auxiliary);

        let attempted = traffic.len()
            + usize::from(vehicles.is_some())
            + usize::from(weather.is_some())
            + usize::from(energy.is_some());
        let failed = traffic.iter().filter(|(_, r)| r.is_err()).count()
            + usize::from(matches!(vehicles, Some(Err(_))))
            + usize::from(matches!(weather, Some(Err(_))))
            + usize::from(matches!(energy, Some(Err(_))));

        if attempted == 0 || failed == attempted {
            warn!(attempted, "every source failed, keeping previous snapshot");
            return PollOutcome::Stale;
        }

        let mut degraded = Vec::new();
        for (name, result) in traffic {
            let sample = match result {
                Ok(sample) => sample,
                Err(error) => {
                    warn!(source = %name, %error, "traffic source failed, using fallback");
                    degraded.push(name.clone());
                    MetricSample::fallback()
                }
            };
            self.blend_traffic(&name, &sample, now_ms);
        }

        match vehicles {
            Some(Ok(count)) => {
                Stamped::offer(&mut self.vehicles, count, now_ms);
            }
            Some(Err(error)) => {
                warn!(%error, "vehicle feed failed, keeping last count");
                degraded.push("vehicles".to_string());
            }
            None => {}
        }
        match weather {
            Some(Ok(report)) => {
                Stamped::offer(&mut self.weather, report, now_ms);
            }
            Some(Err(error)) => {
                warn!(%error, "weather feed failed");
                degraded.push("weather".to_string());
            }
            None => {}
        }
        match energy {
            Some(Ok(report)) => {
                Stamped::offer(&mut self.energy, report, now_ms);
            }
            Some(Err(error)) => {
                warn!(%error, "energy feed failed");
                degraded.push("energy".to_string());
            }
            None => {}
        }

        self.degraded = degraded.clone();
        let revision = self.publish(now_ms);
        debug!(revision, degraded = degraded.len(), "published snapshot");
        PollOutcome::Published { revision, degraded }
    }

    fn blend_traffic(&mut self, name: &str, sample: &MetricSample, at_ms: i64) {
        match self.traffic.get_mut(name) {
            Some(current) if at_ms < current.at_ms => {
                debug!(source = name, "ignoring traffic sample older than current value");
            }
            Some(current) => {
                current.value = current.value.blend(sample, self.alpha);
                current.at_ms = at_ms;
            }
            None => {
                self.traffic.insert(
                    name.to_string(),
                    Stamped {
                        value: BlendedMetric::seed(sample),
                        at_ms,
                    },
                );
            }
        }
    }

    /// Merge an out-of-band update. Per source, the more recent timestamp
    /// wins; roads that are not configured are dropped. Returns the new
    /// revision if anything was published.
    pub fn apply_update(&mut self, mut update: FeedUpdate) -> Option<u64> {
        let feeds = &self.feeds;
        update.traffic.retain(|(name, _)| {
            let known = feeds.road(name).is_some();
            if !known {
                debug!(road = %name, "dropping update for unconfigured road");
            }
            known
        });
        if update.is_empty() {
            return None;
        }
        let at = update.timestamp_ms;
        for (name, sample) in &update.traffic {
            self.blend_traffic(name, sample, at);
        }
        if let Some(count) = update.vehicles {
            Stamped::offer(&mut self.vehicles, count, at);
        }
        if let Some(report) = update.weather {
            Stamped::offer(&mut self.weather, report, at);
        }
        if let Some(report) = update.energy {
            Stamped::offer(&mut self.energy, report, at);
        }
        Some(self.publish(at.max(self.last_update_ms.unwrap_or(at))))
    }

    fn publish(&mut self, at_ms: i64) -> u64 {
        self.revision += 1;
        self.last_update_ms = Some(at_ms);
        self.handle.publish(Snapshot {
            revision: self.revision,
            updated_at_ms: self.last_update_ms,
            traffic: self
                .traffic
                .iter()
                .map(|(name, stamped)| (name.clone(), stamped.value))
                .collect(),
            vehicles: self.vehicles.as_ref().map(|s| s.value),
            weather: self.weather.as_ref().map(|s| s.value.clone()),
            energy: self.energy.as_ref().map(|s| s.value.clone()),
            degraded: self.degraded.clone(),
        });
        self.revision
    }

    /// Poll on a fixed cadence until cancelled, merging pushed updates in
    /// between. A cycle still in flight when the next tick is due makes that
    /// tick be skipped.
    pub async fn run(mut self, mut updates: mpsc::Receiver<FeedUpdate>, cancel: CancellationToken) {
        let period = self.feeds.poll_interval(self.focus.is_some());
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            period = ?period,
            roads = self.active_roads().len(),
            focus = ?self.focus,
            "aggregator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = now_ms();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        outcome = self.poll(now) => {
                            if outcome == PollOutcome::Stale {
                                debug!("poll cycle produced no snapshot");
                            }
                        }
                    }
                }
                Some(update) = updates.recv() => {
                    if let Some(revision) = self.apply_update(update) {
                        debug!(revision, "applied pushed update");
                    }
                }
            }
        }

        info!("aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ScriptedFeed;
    use serde_json::json;

    fn feeds() -> FeedsConfig {
        FeedsConfig {
            roads: vec![
                RoadEndpoint {
                    name: "princes".into(),
                    path: "/princes".into(),
                },
                RoadEndpoint {
                    name: "leith".into(),
                    path: "/leith".into(),
                },
            ],
            timeout: 1,
            ..FeedsConfig::default()
        }
    }

    fn healthy_feed() -> Arc<ScriptedFeed> {
        let feed = Arc::new(ScriptedFeed::new());
        feed.respond("/princes", json!({"score": 20, "current_speed": 5}));
        feed.respond("/leith", json!({"score": 80, "current_speed": 30}));
        feed.respond(
            "/api/live-transport",
            json!({"raw": [{"vehicle_type": "bus"}, {"vehicle_type": "tram"}]}),
        );
        feed.respond("/api/weather", json!({"temperature": 9, "description": "Light rain"}));
        feed.respond(
            "/api/energy",
            json!({"carbon_intensity": 250, "dominant_fuel": "gas", "score": 43}),
        );
        feed
    }

    #[test]
    fn blend_is_convex() {
        let prev = BlendedMetric {
            score: 10.0,
            speed: 40.0,
        };
        let sample = MetricSample::new(90.0, 2.0);
        for step in 1..100 {
            let alpha = step as f64 / 100.0;
            let blended = prev.blend(&sample, alpha);
            assert!((10.0..=90.0).contains(&blended.score));
            assert!((2.0..=40.0).contains(&blended.speed));
        }
    }

    #[tokio::test]
    async fn first_poll_publishes_every_source() {
        let mut aggregator = Aggregator::new(healthy_feed(), feeds());
        let handle = aggregator.handle();
        assert_eq!(handle.current().revision, 0);

        let outcome = aggregator.poll(1_000).await;
        assert_eq!(
            outcome,
            PollOutcome::Published {
                revision: 1,
                degraded: vec![]
            }
        );

        let snapshot = handle.current();
        assert_eq!(snapshot.updated_at_ms, Some(1_000));
        assert_eq!(snapshot.metric("princes").unwrap().score, 20.0);
        assert_eq!(snapshot.vehicles, Some(1));
        assert_eq!(snapshot.weather.as_ref().unwrap().description, "Light rain");
        assert_eq!(snapshot.energy.as_ref().unwrap().carbon_intensity, 250.0);
    }

    #[tokio::test]
    async fn later_polls_blend_with_alpha() {
        let feed = healthy_feed();
        let mut aggregator = Aggregator::new(feed.clone(), feeds());
        aggregator.poll(1_000).await;

        feed.respond("/princes", json!({"score": 60, "current_speed": 15}));
        aggregator.poll(2_000).await;

        let princes = *aggregator.handle().current().metric("princes").unwrap();
        assert!((princes.score - 32.0).abs() < 1e-9);
        assert!((princes.speed - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failing_source_falls_back_alone() {
        let feed = healthy_feed();
        feed.fail("/leith", "connection reset");
        let mut aggregator = Aggregator::new(feed, feeds());

        let outcome = aggregator.poll(1_000).await;
        assert_eq!(
            outcome,
            PollOutcome::Published {
                revision: 1,
                degraded: vec!["leith".to_string()]
            }
        );

        let snapshot = aggregator.handle().current();
        let leith = snapshot.metric("leith").unwrap();
        assert_eq!((leith.score, leith.speed), (50.0, 10.0));
        assert_eq!(snapshot.metric("princes").unwrap().score, 20.0);
    }

    #[tokio::test]
    async fn total_failure_keeps_previous_snapshot() {
        let feed = healthy_feed();
        let mut aggregator = Aggregator::new(feed.clone(), feeds());
        aggregator.poll(1_000).await;

        for endpoint in [
            "/princes",
            "/leith",
            "/api/live-transport",
            "/api/weather",
            "/api/energy",
        ] {
            feed.fail(endpoint, "offline");
        }
        assert_eq!(aggregator.poll(2_000).await, PollOutcome::Stale);

        let snapshot = aggregator.handle().current();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.updated_at_ms, Some(1_000));
        assert_eq!(snapshot.metric("princes").unwrap().score, 20.0);
    }

    #[tokio::test]
    async fn slow_source_times_out_without_blocking_others() {
        let feed = healthy_feed();
        feed.delay("/princes", Duration::from_secs(5));
        let mut aggregator = Aggregator::new(feed, feeds());

        let started = std::time::Instant::now();
        let outcome = aggregator.poll(1_000).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(
            outcome,
            PollOutcome::Published {
                revision: 1,
                degraded: vec!["princes".to_string()]
            }
        );
        assert_eq!(
            aggregator.handle().current().metric("leith").unwrap().score,
            80.0
        );
    }

    #[tokio::test]
    async fn focus_polls_a_single_road() {
        let feed = healthy_feed();
        let mut aggregator =
            Aggregator::new(feed, feeds()).with_focus(Some("leith".to_string()));
        aggregator.poll(1_000).await;

        let snapshot = aggregator.handle().current();
        assert!(snapshot.metric("princes").is_none());
        assert!(snapshot.metric("leith").is_some());
        assert_eq!(snapshot.vehicles, None);
    }

    #[tokio::test]
    async fn newer_timestamp_wins_between_push_and_poll() {
        let feed = healthy_feed();
        let mut aggregator = Aggregator::new(feed, feeds());
        aggregator.poll(5_000).await;

        // Older push: ignored for the road, but still no regression.
        let stale = FeedUpdate {
            timestamp_ms: 4_000,
            traffic: vec![("princes".to_string(), MetricSample::new(100.0, 50.0))],
            vehicles: Some(40),
            ..FeedUpdate::default()
        };
        aggregator.apply_update(stale);
        let snapshot = aggregator.handle().current();
        assert_eq!(snapshot.metric("princes").unwrap().score, 20.0);
        assert_eq!(snapshot.vehicles, Some(1));

        let fresh = FeedUpdate {
            timestamp_ms: 6_000,
            vehicles: Some(40),
            ..FeedUpdate::default()
        };
        aggregator.apply_update(fresh);
        assert_eq!(aggregator.handle().current().vehicles, Some(40));
    }

    #[tokio::test]
    async fn pushed_update_keeps_degraded_sources() {
        let feed = healthy_feed();
        feed.fail("/leith", "connection reset");
        let mut aggregator = Aggregator::new(feed, feeds());
        aggregator.poll(1_000).await;

        aggregator.apply_update(FeedUpdate {
            timestamp_ms: 2_000,
            vehicles: Some(12),
            ..FeedUpdate::default()
        });
        let snapshot = aggregator.handle().current();
        assert_eq!(snapshot.revision, 2);
        assert_eq!(snapshot.degraded, vec!["leith".to_string()]);
    }

    #[tokio::test]
    async fn unconfigured_pushed_roads_are_dropped() {
        let mut aggregator = Aggregator::new(healthy_feed(), feeds());
        let update = FeedUpdate {
            timestamp_ms: 1_000,
            traffic: vec![
                ("princes".to_string(), MetricSample::new(40.0, 12.0)),
                ("nowhere".to_string(), MetricSample::new(90.0, 3.0)),
            ],
            ..FeedUpdate::default()
        };
        assert_eq!(aggregator.apply_update(update), Some(1));
        let snapshot = aggregator.handle().current();
        assert!(snapshot.metric("princes").is_some());
        assert!(snapshot.metric("nowhere").is_none());

        let only_unknown = FeedUpdate {
            timestamp_ms: 2_000,
            traffic: vec![("nowhere".to_string(), MetricSample::new(90.0, 3.0))],
            ..FeedUpdate::default()
        };
        assert_eq!(aggregator.apply_update(only_unknown), None);
        assert_eq!(aggregator.handle().current().revision, 1);
    }

    #[tokio::test]
    async fn local_time_push_does_not_shadow_later_polls() {
        // 2025-07-01T12:00:00Z.
        let noon = 1_751_371_200_000;
        let feed = healthy_feed();
        let mut aggregator = Aggregator::new(feed.clone(), feeds());
        aggregator.poll(noon).await;

        // The backend writes naive local time: 13:00 BST is noon UTC.
        let document = json!({
            "timestamp": "2025-07-01T13:00:00.000000",
            "traffic": {"score": 20, "current_speed": 5},
        });
        let update = crate::push::parse_push(&document, "princes", noon + 5_000).unwrap();
        aggregator.apply_update(update);

        feed.respond("/princes", json!({"score": 100, "current_speed": 5}));
        for cycle in 1..=10 {
            aggregator.poll(noon + cycle * 30_000).await;
        }
        let princes = *aggregator.handle().current().metric("princes").unwrap();
        assert!(princes.score > 95.0, "{}", princes.score);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_during_a_slow_cycle_are_skipped() {
        let feed = healthy_feed();
        feed.delay("/princes", Duration::from_millis(3_500));
        let config = FeedsConfig {
            interval: 1,
            timeout: 10,
            ..feeds()
        };
        let aggregator = Aggregator::new(feed.clone(), config);
        let handle = aggregator.handle();
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(aggregator.run(rx, cancel.clone()));

        // Only the first cycle is slow.
        tokio::time::sleep(Duration::from_secs(1)).await;
        feed.delay("/princes", Duration::ZERO);

        // The first cycle ends at 3.5 s and the overdue tick fires once.
        // After that the cadence realigns to 4, 5 and 6 s instead of
        // replaying the ticks missed at 1, 2 and 3 s.
        tokio::time::sleep(Duration::from_millis(5_250)).await;
        assert_eq!(handle.current().revision, 5);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn empty_update_publishes_nothing() {
        let mut aggregator = Aggregator::new(healthy_feed(), feeds());
        assert_eq!(aggregator.apply_update(FeedUpdate::default()), None);
        assert_eq!(aggregator.handle().current().revision, 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let aggregator = Aggregator::new(healthy_feed(), feeds());
        let handle = aggregator.handle();
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(aggregator.run(rx, cancel.clone()));
        // The first tick fires immediately.
        for _ in 0..200 {
            if handle.current().revision >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.current().revision >= 1);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("aggregator did not stop")
            .unwrap();
    }
}
