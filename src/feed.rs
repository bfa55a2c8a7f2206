//! Feed transport.
//!
//! [`FeedClient`] is the seam between the aggregator and the network. The
//! aggregator only ever sees parsed JSON or a [`FetchError`].

use crate::error::FetchError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fetches one JSON document per endpoint.
pub trait FeedClient: Send + Sync + 'static {
    fn fetch_json(&self, endpoint: &str) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// HTTP implementation backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeedClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                endpoint: base_url.to_string(),
                message: format!("http client init failed: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }
}

impl FeedClient for HttpFeedClient {
    async fn fetch_json(&self, endpoint: &str) -> Result<Value, FetchError> {
        let url = self.url(endpoint);
        let response = self
            .client
            .get(&url)
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout {
                        endpoint: endpoint.to_string(),
                    }
                } else {
                    FetchError::Transport {
                        endpoint: endpoint.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::malformed(endpoint, e.to_string()))
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Respond(Value),
    Fail(String),
}

/// In-memory feed whose responses are set per endpoint.
///
/// Drives offline simulation and tests. Unknown endpoints answer with
/// status 404.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    responses: Mutex<HashMap<String, Scripted>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, endpoint: &str, value: Value) {
        self.lock_responses()
            .insert(endpoint.to_string(), Scripted::Respond(value));
    }

    pub fn fail(&self, endpoint: &str, message: &str) {
        self.lock_responses()
            .insert(endpoint.to_string(), Scripted::Fail(message.to_string()));
    }

    /// Hold every answer for `endpoint` back by `delay`.
    pub fn delay(&self, endpoint: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), delay);
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, HashMap<String, Scripted>> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl FeedClient for ScriptedFeed {
    async fn fetch_json(&self, endpoint: &str) -> Result<Value, FetchError> {
        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.lock_responses().get(endpoint).cloned();
        match scripted {
            Some(Scripted::Respond(value)) => Ok(value),
            Some(Scripted::Fail(message)) => Err(FetchError::Transport {
                endpoint: endpoint.to_string(),
                message,
            }),
            None => Err(FetchError::Status {
                endpoint: endpoint.to_string(),
                status: 404,
            }),
        }
    }
}
