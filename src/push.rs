//! Push channel.
//!
//! The backend broadcasts its combined city document whenever it refreshes.
//! This module keeps a connection to that broadcast open, turns each document
//! into a [`FeedUpdate`] and hands it to the aggregator over a channel. A lost
//! connection is retried after a fixed backoff; every step goes through the
//! [`ConnectionTracker`] state machine.
//!
//! The transport is pluggable. [`TcpLineTransport`] reads newline-delimited
//! JSON from a TCP socket.

use crate::aggregator::{now_ms, FeedUpdate};
use crate::config::PushConfig;
use crate::error::FetchError;
use crate::sources::{count_buses, normalize_traffic, EnergyReport, WeatherReport};
use crate::status::{ConnectionEvent, ConnectionTracker};
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use std::future::Future;
use std::io;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PUSH_ENDPOINT: &str = "push";

/// Opens connections to a push source.
pub trait PushTransport: Send + Sync + 'static {
    type Stream: PushStream;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// An open push connection.
pub trait PushStream: Send {
    /// Next raw message, or `None` once the peer has closed the stream.
    fn next_message(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpLineTransport {
    address: String,
}

impl TcpLineTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

pub struct TcpLineStream {
    lines: Lines<BufReader<TcpStream>>,
}

impl PushTransport for TcpLineTransport {
    type Stream = TcpLineStream;

    async fn connect(&self) -> io::Result<TcpLineStream> {
        let stream = TcpStream::connect(self.address.as_str()).await?;
        Ok(TcpLineStream {
            lines: BufReader::new(stream).lines(),
        })
    }
}

impl PushStream for TcpLineStream {
    async fn next_message(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

/// Document time in epoch milliseconds. Accepts RFC 3339, a naive ISO 8601
/// time (read as UTC) or a number of milliseconds.
fn document_time(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp_millis())
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|t| t.and_utc().timestamp_millis())
            }),
        _ => None,
    }
}

/// Map one pushed document onto a [`FeedUpdate`].
///
/// The document time is capped at `received_ms`.
/// The document's `traffic` block belongs to `primary_road`; a `roads` object
/// may carry further per-road readings keyed by road name. Sections that are
/// missing or unusable are left out of the update rather than faked.
pub fn parse_push(
    document: &Value,
    primary_road: &str,
    received_ms: i64,
) -> Result<FeedUpdate, FetchError> {
    let Some(map) = document.as_object() else {
        return Err(FetchError::malformed(PUSH_ENDPOINT, "expected a JSON object"));
    };

    // The peer's clock may be skewed or in local time; a document can never
    // be newer than its arrival, or it would shadow every later poll.
    let timestamp_ms = map
        .get("timestamp")
        .and_then(document_time)
        .map_or(received_ms, |at| at.min(received_ms));

    let mut traffic = Vec::new();
    if let Some(block) = map.get("traffic").filter(|v| v.is_object()) {
        traffic.push((
            primary_road.to_string(),
            normalize_traffic(PUSH_ENDPOINT, block.clone())?,
        ));
    }
    if let Some(roads) = map.get("roads").and_then(Value::as_object) {
        for (name, block) in roads {
            match normalize_traffic(PUSH_ENDPOINT, block.clone()) {
                Ok(sample) => traffic.push((name.clone(), sample)),
                Err(error) => debug!(road = %name, %error, "skipping pushed road"),
            }
        }
    }

    let vehicles = map
        .get("live_transport")
        .and_then(|v| count_buses(PUSH_ENDPOINT, v).ok());
    let weather = map
        .get("weather")
        .and_then(|v| WeatherReport::from_payload(PUSH_ENDPOINT, v).ok())
        .filter(|w| !w.description.eq_ignore_ascii_case("unknown"));
    let energy = map
        .get("energy")
        .and_then(|v| EnergyReport::from_payload(PUSH_ENDPOINT, v).ok());

    Ok(FeedUpdate {
        timestamp_ms,
        traffic,
        vehicles,
        weather,
        energy,
    })
}

pub fn parse_push_message(
    text: &str,
    primary_road: &str,
    received_ms: i64,
) -> Result<FeedUpdate, FetchError> {
    let document: Value = serde_json::from_str(text)
        .map_err(|e| FetchError::malformed(PUSH_ENDPOINT, e.to_string()))?;
    parse_push(&document, primary_road, received_ms)
}

enum Session {
    /// Peer closed or the transport failed; reconnect after the backoff.
    Lost,
    Stop,
}

/// Keep a push connection alive until `cancel` fires, forwarding every
/// decoded document to `updates`.
pub async fn run_push<T: PushTransport>(
    transport: T,
    config: PushConfig,
    mut tracker: ConnectionTracker,
    updates: mpsc::Sender<FeedUpdate>,
    cancel: CancellationToken,
) {
    info!(address = %config.address, "push channel started");

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.connect() => result,
        };

        let session = match connected {
            Ok(mut stream) => {
                tracker.apply(ConnectionEvent::Opened);
                info!(address = %config.address, "push channel connected");
                read_session(&mut stream, &config, &mut tracker, &updates, &cancel).await
            }
            Err(err) => {
                error!(address = %config.address, error = %err, "push connect failed");
                tracker.fail(&err);
                Session::Lost
            }
        };

        if let Session::Stop = session {
            break;
        }

        debug!(status = %tracker.status(), backoff = ?tracker.backoff(), "push channel waiting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tracker.backoff()) => {}
        }
        tracker.apply(ConnectionEvent::Retry);
    }

    tracker.shut_down();
    info!("push channel stopped");
}

async fn read_session<S: PushStream>(
    stream: &mut S,
    config: &PushConfig,
    tracker: &mut ConnectionTracker,
    updates: &mpsc::Sender<FeedUpdate>,
    cancel: &CancellationToken,
) -> Session {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Session::Stop,
            message = stream.next_message() => message,
        };

        let text = match message {
            Ok(Some(text)) => text,
            Ok(None) => {
                warn!("push channel closed by peer");
                tracker.apply(ConnectionEvent::Closed);
                return Session::Lost;
            }
            Err(err) => {
                error!(error = %err, "push channel read failed");
                tracker.fail(&err);
                return Session::Lost;
            }
        };
        if text.trim().is_empty() {
            continue;
        }

        let received = now_ms();
        tracker.message_received(received);
        let update = match parse_push_message(&text, &config.primary_road, received) {
            Ok(update) => update,
            Err(error) => {
                warn!(%error, "discarding push message");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Session::Stop,
            sent = updates.send(update) => {
                if sent.is_err() {
                    info!("aggregator gone, closing push channel");
                    return Session::Stop;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ConnectionStatus, StatusHandle};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    // 2025-03-02T00:00:00Z, after every document time used below.
    const RECEIVED: i64 = 1_740_873_600_000;

    fn document() -> Value {
        json!({
            "timestamp": "2025-03-01T12:00:00.250000",
            "traffic": {"score": 35, "current_speed": 14, "free_flow_speed": 30},
            "weather": {"score": 70, "temperature": 8.5, "description": "Partly cloudy"},
            "energy": {"score": 55, "carbon_intensity": 180, "dominant_fuel": "wind"},
            "flights": {"score": 40}
        })
    }

    #[test]
    fn maps_backend_document() {
        let update = parse_push(&document(), "princes", RECEIVED).unwrap();
        assert_eq!(update.timestamp_ms, 1_740_830_400_250);
        assert_eq!(update.traffic.len(), 1);
        let (road, sample) = &update.traffic[0];
        assert_eq!(road, "princes");
        assert_eq!((sample.score, sample.speed), (35.0, 14.0));
        assert_eq!(update.weather.unwrap().description, "Partly cloudy");
        assert_eq!(update.energy.unwrap().carbon_intensity, 180.0);
        assert_eq!(update.vehicles, None);
    }

    #[test]
    fn timestamp_variants() {
        let rfc = json!({"timestamp": "2025-03-01T12:00:00Z"});
        assert_eq!(
            parse_push(&rfc, "p", RECEIVED).unwrap().timestamp_ms,
            1_740_830_400_000
        );

        let millis = json!({"timestamp": 1234});
        assert_eq!(parse_push(&millis, "p", RECEIVED).unwrap().timestamp_ms, 1234);

        let garbage = json!({"timestamp": "yesterday"});
        assert_eq!(
            parse_push(&garbage, "p", RECEIVED).unwrap().timestamp_ms,
            RECEIVED
        );
    }

    #[test]
    fn future_document_time_is_capped_at_arrival() {
        // Local time an hour ahead of UTC, read as UTC.
        let ahead = json!({"timestamp": "2025-03-02T01:00:00.000000"});
        assert_eq!(parse_push(&ahead, "p", RECEIVED).unwrap().timestamp_ms, RECEIVED);

        let far = json!({"timestamp": "2099-01-01T00:00:00Z"});
        assert_eq!(parse_push(&far, "p", RECEIVED).unwrap().timestamp_ms, RECEIVED);
    }

    #[test]
    fn unusable_sections_are_left_out() {
        let doc = json!({
            "weather": {"score": 50, "description": "Unknown", "temperature": null},
            "energy": {"score": 50, "carbon_intensity": null},
            "live_transport": {"vehicles": [{"vehicle_type": "bus"}, {"vehicle_type": "bus"}]},
            "roads": {"leith": {"score": 90, "current_speed": 28}, "broken": 3}
        });
        let update = parse_push(&doc, "princes", 0).unwrap();
        assert!(update.weather.is_none());
        assert!(update.energy.is_none());
        assert_eq!(update.vehicles, Some(2));
        assert_eq!(update.traffic.len(), 1);
        assert_eq!(update.traffic[0].0, "leith");
    }

    #[test]
    fn non_object_messages_are_malformed() {
        assert!(matches!(
            parse_push_message("[1, 2]", "p", 0),
            Err(FetchError::Malformed { .. })
        ));
        assert!(parse_push_message("{not json", "p", 0).is_err());
    }

    async fn wait_for(handle: &StatusHandle, pred: impl Fn(&crate::status::StatusReport) -> bool) {
        for _ in 0..300 {
            if pred(&handle.current()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never matched: {:?}", handle.current());
    }

    #[tokio::test]
    async fn forwards_messages_and_reconnects_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            for score in [20, 80] {
                let (mut socket, _) = listener.accept().await.unwrap();
                let line = format!("\n{{\"traffic\": {{\"score\": {score}}}}}\nnot json\n");
                socket.write_all(line.as_bytes()).await.unwrap();
                // Dropping the socket closes the session.
            }
        });

        let config = PushConfig {
            enabled: true,
            address: address.clone(),
            reconnect_delay_ms: 20,
            ..PushConfig::default()
        };
        let tracker = ConnectionTracker::new(config.reconnect_delay());
        let status = tracker.handle();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_push(
            TcpLineTransport::new(address),
            config,
            tracker,
            tx,
            cancel.clone(),
        ));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.traffic[0].1.score, 20.0);
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.traffic[0].1.score, 80.0);

        wait_for(&status, |r| r.reconnects >= 1 && r.last_update_ms.is_some()).await;
        server.await.unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.current().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn refused_connection_reports_error_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = PushConfig {
            address: address.clone(),
            reconnect_delay_ms: 10,
            ..PushConfig::default()
        };
        let tracker = ConnectionTracker::new(config.reconnect_delay());
        let status = tracker.handle();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_push(
            TcpLineTransport::new(address),
            config,
            tracker,
            tx,
            cancel.clone(),
        ));

        wait_for(&status, |r| r.reconnects >= 2 && r.last_error.is_some()).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
