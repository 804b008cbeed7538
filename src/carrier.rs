//! Carrier control API client: call creation, active-call count, call
//! termination. Treated as an opaque two-endpoint dependency (the control
//! API here; the per-call media stream is handled by [`crate::bridge`]).

use crate::http_client::{DownstreamError, HttpClient, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;

pub type CarrierError = DownstreamError;

/// Carrier-side call states counted toward the active-call cap.
const ACTIVE_CALL_STATUSES: &[&str] = &["queued", "ringing", "in-progress"];

/// Status-callback events the carrier is asked to subscribe the call to.
pub const STATUS_CALLBACK_EVENTS: &[&str] = &["initiated", "ringing", "answered", "completed"];

pub const RING_TIMEOUT_SECS: u32 = 25;
pub const CALL_TIME_LIMIT_SECS: u32 = 900;

/// Parameters for `create_call`, mirroring the carrier control API's call
/// creation form fields bit-for-bit where compatibility matters (§6).
#[derive(Debug, Clone)]
pub struct CreateCallParams {
    pub from: String,
    pub to: String,
    pub twiml_url: String,
    pub status_callback_url: String,
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct CallListResponse {
    calls: Vec<CallSummary>,
}

#[derive(Debug, Deserialize)]
struct CallSummary {
    #[allow(dead_code)]
    sid: String,
}

/// Client for the carrier control API.
pub struct CarrierClient {
    http: HttpClient,
    base_url: String,
    account_sid: String,
    auth_token: String,
}

impl CarrierClient {
    pub fn new(base_url: String, account_sid: String, auth_token: String) -> Self {
        Self {
            http: HttpClient::new(RetryPolicy::carrier()),
            base_url,
            account_sid,
            auth_token,
        }
    }

    /// Create a call with the ring timeout, time limit, status callback
    /// subscription, and async answering-machine detection §4.5 requires.
    pub async fn create_call(&self, params: &CreateCallParams) -> Result<String, CarrierError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.base_url, self.account_sid
        );
        let form: Vec<(&str, String)> = vec![
            ("From", params.from.clone()),
            ("To", params.to.clone()),
            ("Url", params.twiml_url.clone()),
            ("Timeout", RING_TIMEOUT_SECS.to_string()),
            ("TimeLimit", CALL_TIME_LIMIT_SECS.to_string()),
            ("StatusCallback", params.status_callback_url.clone()),
            ("StatusCallbackEvent", STATUS_CALLBACK_EVENTS.join(",")),
            ("MachineDetection", "DetectMessageEnd".to_string()),
            ("AsyncAmd", "true".to_string()),
            ("AsyncAmdStatusCallback", params.status_callback_url.clone()),
            // Fetch the TwiML document via GET so the carrier appends its own
            // webhook parameters (CallSid included) to the query string; we
            // have no call id to embed in `twiml_url` ourselves at this point.
            ("Method", "GET".to_string()),
        ];

        let account_sid = self.account_sid.clone();
        let auth_token = self.auth_token.clone();
        let response = self
            .http
            .execute_with_retry(|| {
                self.http
                    .inner()
                    .post(&url)
                    .basic_auth(&account_sid, Some(&auth_token))
                    .form(&form)
            })
            .await?;

        let parsed: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::unknown(format!("failed to parse call creation response: {e}")))?;
        Ok(parsed.sid)
    }

    /// Count of calls currently in a non-terminal state, used to compute
    /// the scheduler's available slots. Callers MUST fail-closed (treat the
    /// cap as fully used) when this errors.
    pub async fn active_call_count(&self) -> Result<u32, CarrierError> {
        let mut total = 0u32;
        for status in ACTIVE_CALL_STATUSES {
            let url = format!(
                "{}/2010-04-01/Accounts/{}/Calls.json?Status={}",
                self.base_url, self.account_sid, status
            );
            let account_sid = self.account_sid.clone();
            let auth_token = self.auth_token.clone();
            let response = self
                .http
                .execute_with_retry(|| {
                    self.http
                        .inner()
                        .get(&url)
                        .basic_auth(&account_sid, Some(&auth_token))
                })
                .await?;
            let parsed: CallListResponse = response
                .json()
                .await
                .map_err(|e| CarrierError::unknown(format!("failed to parse call list response: {e}")))?;
            total += u32::try_from(parsed.calls.len()).unwrap_or(u32::MAX);
        }
        Ok(total)
    }

    /// Best-effort request to end an in-progress call (used on mid-call
    /// machine detection). Callers treat failures as non-fatal.
    pub async fn end_call(&self, call_id: &str) -> Result<(), CarrierError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.base_url, self.account_sid, call_id
        );
        let form = [("Status", "completed")];
        let account_sid = self.account_sid.clone();
        let auth_token = self.auth_token.clone();
        self.http
            .execute_with_retry(|| {
                self.http
                    .inner()
                    .post(&url)
                    .basic_auth(&account_sid, Some(&auth_token))
                    .form(&form)
            })
            .await?;
        Ok(())
    }
}

/// Best-effort timeout applied by handlers awaiting a carrier round trip
/// from an HTTP request context (§5: "implementation-chosen deadline >= 10s").
pub const HANDLER_DOWNSTREAM_DEADLINE: Duration = Duration::from_secs(15);
