//! Fire-and-forget structured events to an external chat webhook. Never on
//! the critical path: failures are logged at `warn` and dropped, never
//! propagated to the caller.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifierEvent {
    QueueEntryEnqueued { contact_id: String, queue_id: i64 },
    CallInitiated { contact_id: String, call_id: String },
    CallAnsweredByHuman { call_id: String },
    RetryLadderExhausted { contact_id: String, call_id: String },
    CallStateWriteVerifyMismatch { call_id: String },
}

/// Posts structured JSON events to a configured webhook URL. Cheap to
/// clone; holds only a `reqwest::Client` and the destination URL.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");
        Self { client, webhook_url }
    }

    /// Send an event, spawning the actual HTTP request so this never blocks
    /// the caller's critical-path operation.
    pub fn notify(&self, event: NotifierEvent) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&event).send().await {
                tracing::warn!(error = %e, "notifier webhook delivery failed");
            }
        });
    }
}
