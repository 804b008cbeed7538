//! AI agent provider client: signed conversation-URL issuance. The per-call
//! streaming endpoint itself is consumed by [`crate::bridge`] over
//! `tokio-tungstenite`, not here.

use crate::http_client::{DownstreamError, HttpClient, RetryPolicy};
use serde::Deserialize;

pub type AgentError = DownstreamError;

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Client for the AI agent provider's signed-URL issuance endpoint.
pub struct AgentClient {
    http: HttpClient,
    base_url: String,
    api_key: String,
    agent_id: String,
}

impl AgentClient {
    pub fn new(base_url: String, api_key: String, agent_id: String) -> Self {
        Self {
            http: HttpClient::new(RetryPolicy::agent()),
            base_url,
            api_key,
            agent_id,
        }
    }

    /// Fetch a fresh signed WebSocket URL for this agent. Called by the
    /// initiator when a queue entry's cached URL is missing or expired, and
    /// by the bridge itself if the cached URL turns out to be stale.
    pub async fn fetch_signed_url(&self) -> Result<String, AgentError> {
        let url = format!(
            "{}/v1/convai/conversation/get-signed-url?agent_id={}",
            self.base_url, self.agent_id
        );
        let api_key = self.api_key.clone();
        let response = self
            .http
            .execute_with_retry(|| self.http.inner().get(&url).header("xi-api-key", &api_key))
            .await?;

        let parsed: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| AgentError::unknown(format!("failed to parse signed-url response: {e}")))?;
        Ok(parsed.signed_url)
    }
}
