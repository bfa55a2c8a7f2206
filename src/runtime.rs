//! Live runtime.
//!
//! Wires the aggregator, the optional push channel and the frame loop
//! together under one [`CancellationToken`]. The frame loop owns the
//! [`Visualizer`] outright; everything else observes it through published
//! [`LiveView`]s.

use crate::aggregator::{now_ms, Aggregator, FeedUpdate, SnapshotHandle};
use crate::config::PulseConfig;
use crate::curve::CurveSet;
use crate::engine::{FrameOutput, Visualizer};
use crate::error::Result;
use crate::feed::FeedClient;
use crate::field::InfluenceField;
use crate::history::{HistorySample, HistorySummary};
use crate::push::{run_push, TcpLineTransport};
use crate::status::{ConnectionStatus, ConnectionTracker, StatusHandle, StatusReport};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Poll a single road at the focus cadence.
    pub focus: Option<String>,
    pub seed: u64,
}

/// Latest frame as seen from outside the frame loop.
#[derive(Debug, Clone)]
pub struct LiveView {
    pub frame: FrameOutput,
    pub positions: Vec<f32>,
    pub colors: Vec<f32>,
    /// Field the frame was built from; query it with `influence_at`.
    pub field: Arc<InfluenceField>,
    /// Retained oscillator samples, oldest first.
    pub history: Arc<[HistorySample]>,
    pub history_summary: Option<HistorySummary>,
}

pub struct Runtime {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    snapshots: SnapshotHandle,
    connection: Option<StatusHandle>,
    view: Arc<ArcSwapOption<LiveView>>,
}

impl Runtime {
    /// Validate the focus road and geometry against the anchors, then spawn
    /// every task.
    pub fn start<C: FeedClient>(
        config: PulseConfig,
        client: Arc<C>,
        curves: CurveSet,
        options: RunOptions,
    ) -> Result<Self> {
        config.feeds.check_focus(options.focus.as_deref())?;
        let visualizer = Visualizer::new(config.clone(), curves, options.seed)?;
        let cancel = CancellationToken::new();
        let (updates_tx, updates_rx) = mpsc::channel::<FeedUpdate>(UPDATE_CHANNEL_CAPACITY);

        let aggregator =
            Aggregator::new(client, config.feeds.clone()).with_focus(options.focus.clone());
        let snapshots = aggregator.handle();
        let mut tasks = vec![tokio::spawn(aggregator.run(updates_rx, cancel.clone()))];

        let connection = if config.push.enabled {
            let tracker = ConnectionTracker::new(config.push.reconnect_delay());
            let handle = tracker.handle();
            tasks.push(tokio::spawn(run_push(
                TcpLineTransport::new(config.push.address.clone()),
                config.push.clone(),
                tracker,
                updates_tx,
                cancel.clone(),
            )));
            Some(handle)
        } else {
            drop(updates_tx);
            None
        };

        let view = Arc::new(ArcSwapOption::empty());
        tasks.push(tokio::spawn(frame_loop(
            visualizer,
            config,
            snapshots.clone(),
            connection.clone(),
            view.clone(),
            cancel.clone(),
        )));

        info!(tasks = tasks.len(), focus = ?options.focus, "runtime started");
        Ok(Self {
            cancel,
            tasks,
            snapshots,
            connection,
            view,
        })
    }

    pub fn snapshots(&self) -> &SnapshotHandle {
        &self.snapshots
    }

    /// Push connection status, if the push channel is enabled.
    pub fn connection(&self) -> Option<Arc<StatusReport>> {
        self.connection.as_ref().map(StatusHandle::current)
    }

    pub fn latest(&self) -> Option<Arc<LiveView>> {
        self.view.load_full()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "runtime task ended abnormally");
            }
        }
        info!("runtime stopped");
    }
}

async fn frame_loop(
    mut visualizer: Visualizer,
    config: PulseConfig,
    snapshots: SnapshotHandle,
    connection: Option<StatusHandle>,
    view: Arc<ArcSwapOption<LiveView>>,
    cancel: CancellationToken,
) {
    let mut frames = tokio::time::interval(config.frame.frame_duration());
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut samples = tokio::time::interval(Duration::from_secs(config.history.sample_interval.max(1)));
    samples.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reports = tokio::time::interval(Duration::from_secs(config.frame.status_every.max(1)));
    reports.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let started = Instant::now();
    let mut last = started;
    let mut history: Arc<[HistorySample]> = Arc::from(Vec::new());
    let mut history_summary = None;
    // Buffers of the previous view, reclaimed once no reader holds it.
    let mut spare: Option<(Vec<f32>, Vec<f32>)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            now = frames.tick() => {
                let dt = now.duration_since(last).as_secs_f32();
                last = now;
                let snapshot = snapshots.current();
                let frame = visualizer.frame(dt, now.duration_since(started).as_secs_f32(), &snapshot);
                let particles = visualizer.particles();
                let (mut positions, mut colors) = spare.take().unwrap_or_default();
                positions.clear();
                positions.extend_from_slice(particles.positions());
                colors.clear();
                colors.extend_from_slice(particles.colors());
                let previous = view.swap(Some(Arc::new(LiveView {
                    frame,
                    positions,
                    colors,
                    field: visualizer.shared_field(),
                    history: Arc::clone(&history),
                    history_summary,
                })));
                spare = previous
                    .and_then(|old| Arc::try_unwrap(old).ok())
                    .map(|old| (old.positions, old.colors));
            }
            _ = samples.tick() => {
                visualizer.record_sample(now_ms());
                history = visualizer.history().samples().copied().collect();
                history_summary = visualizer.history().summary();
            }
            _ = reports.tick() => {
                let snapshot = snapshots.current();
                let push = connection
                    .as_ref()
                    .map(|h| h.current().status)
                    .unwrap_or(ConnectionStatus::Disconnected);
                info!(
                    bpm = visualizer.oscillator().value(),
                    particles = visualizer.particles().total(),
                    revision = snapshot.revision,
                    age_ms = ?snapshot.age_ms(now_ms()),
                    degraded = snapshot.degraded.len(),
                    push = %push,
                    "pulse"
                );
            }
        }
    }

    info!("frame loop stopped");
}
