//! Outbound webhook notification.
//!
//! Callbacks are best-effort: invalid URLs are dropped with a warning at
//! notification time, all sinks fire concurrently, non-2xx responses are
//! logged and never retried, and nothing here propagates to the caller.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallbackMethod {
    #[serde(rename = "GET", alias = "get")]
    Get,
    #[default]
    #[serde(rename = "POST", alias = "post")]
    Post,
    #[serde(rename = "PUT", alias = "put")]
    Put,
    #[serde(rename = "PATCH", alias = "patch")]
    Patch,
}

/// A registered completion sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSink {
    pub url: String,
    #[serde(default)]
    pub method: CallbackMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum CallbackParseError {
    #[error("callbacks must be a JSON array of sinks: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse the `callbacks` form field. Clients routinely mangle it, so two
/// repairs are applied before parsing: a bare object becomes a one-element
/// array, and `},{`-joined concatenations of objects are re-wrapped into an
/// array.
pub fn parse_callbacks(raw: &str) -> Result<Vec<CallbackSink>, CallbackParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let repaired = if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        format!("[{trimmed}]")
    };
    Ok(serde_json::from_str(&repaired)?)
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotifySummary {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum FireResult {
    Delivered,
    Failed,
    Skipped,
}

pub struct CallbackNotifier {
    client: Client,
}

impl Default for CallbackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackNotifier {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .user_agent(concat!("imgpress/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }

    /// Fire every callback concurrently and wait for all of them to settle.
    pub async fn notify(&self, callbacks: &[CallbackSink], payload: &Value) -> NotifySummary {
        if callbacks.is_empty() {
            return NotifySummary::default();
        }
        let results = join_all(callbacks.iter().map(|cb| self.fire(cb, payload))).await;
        let mut summary = NotifySummary::default();
        for result in results {
            match result {
                FireResult::Delivered => summary.delivered += 1,
                FireResult::Failed => summary.failed += 1,
                FireResult::Skipped => summary.skipped += 1,
            }
        }
        info!(
            delivered = summary.delivered,
            failed = summary.failed,
            skipped = summary.skipped,
            "callback fan-out settled"
        );
        summary
    }

    async fn fire(&self, callback: &CallbackSink, payload: &Value) -> FireResult {
        let url = match Url::parse(&callback.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                warn!(url = %callback.url, "skipping callback with invalid url");
                return FireResult::Skipped;
            }
        };

        let mut request = match callback.method {
            CallbackMethod::Get => self.client.get(url.clone()),
            CallbackMethod::Post => self.client.post(url.clone()),
            CallbackMethod::Put => self.client.put(url.clone()),
            CallbackMethod::Patch => self.client.patch(url.clone()),
        };
        request = request.header(CONTENT_TYPE, "application/json");
        for (name, value) in &callback.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if callback.method != CallbackMethod::Get {
            request = request.json(payload);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => FireResult::Delivered,
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "callback rejected");
                FireResult::Failed
            }
            Err(err) => {
                warn!(url = %url, %err, "callback request failed");
                FireResult::Failed
            }
        }
    }
}
