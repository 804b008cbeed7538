//! API request and response types.

use serde::{Deserialize, Serialize};

/// Request to enqueue a sequence's first attempt. Accepts several synonyms
/// per field so callers using either snake_case or the carrier's own
/// casing conventions are both understood without per-call-site fallbacks.
#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    #[serde(alias = "phoneNumber", alias = "Phone")]
    pub phone: String,
    #[serde(alias = "contactId", alias = "Id")]
    pub contact_id: String,
    #[serde(default, alias = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "fullAddress", alias = "address")]
    pub full_address: Option<String>,
    #[serde(default, rename = "customData")]
    pub custom_data: Option<serde_json::Value>,
    #[serde(default, alias = "pastCallSummary")]
    pub past_call_summary: Option<String>,
    #[serde(default, alias = "originalConversationId")]
    pub original_conversation_id: Option<String>,
    #[serde(default, alias = "availabilitySlots")]
    pub availability: Option<String>,
}

/// Response to a successful enqueue.
#[derive(Debug, Serialize)]
pub struct OutboundCallResponse {
    pub success: bool,
    #[serde(rename = "queueId")]
    pub queue_id: i64,
}

/// Carrier form-encoded status callback.
#[derive(Debug, Deserialize)]
pub struct CallStatusCallback {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "AnsweredBy", default)]
    pub answered_by: Option<String>,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
}

/// Query parameters for the stream-connect TwiML document.
#[derive(Debug, Deserialize)]
pub struct TwimlQuery {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub phone: String,
    pub contact_id: String,
    #[serde(default)]
    pub full_address: Option<String>,
    #[serde(default)]
    pub abrupt_retry: bool,
    #[serde(default)]
    pub past_call_summary: Option<String>,
    #[serde(default)]
    pub original_conversation_id: Option<String>,
    #[serde(default)]
    pub availability: Option<String>,
    /// Populated by the carrier itself (we ask it to GET-fetch this URL so
    /// its standard webhook parameters land in the query string).
    #[serde(default, rename = "CallSid")]
    pub call_sid: Option<String>,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}
