//! HTTP and WebSocket request handlers.

use super::types::{CallStatusCallback, OutboundCallRequest, OutboundCallResponse, TwimlQuery};
use super::AppState;
use crate::bridge;
use crate::carrier::HANDLER_DOWNSTREAM_DEADLINE;
use crate::db::{AnsweredBy, NewQueueEntry};
use crate::error::AppError;
use crate::notifier::NotifierEvent;
use crate::queue;
use axum::extract::ws::WebSocketUpgrade;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Form, Json, Router,
};
use chrono::Utc;
use tokio::time::timeout;

/// Build the router. Routes are fixed (`/outgoing/...`) to match the
/// addresses the carrier and agent providers are configured against; the
/// configurable `route_prefix` is applied by the caller via `nest`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/outbound-call", post(enqueue_call))
        .route("/call-status", post(call_status))
        .route("/outbound-call-twiml", any(outbound_call_twiml))
        .route("/outbound-media-stream", get(outbound_media_stream))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// `POST /outgoing/outbound-call` — enqueue a sequence's first attempt.
async fn enqueue_call(
    State(state): State<AppState>,
    Json(req): Json<OutboundCallRequest>,
) -> Result<(StatusCode, Json<OutboundCallResponse>), AppError> {
    if req.phone.trim().is_empty() {
        return Err(AppError::BadRequest("phone is required".to_string()));
    }
    if req.contact_id.trim().is_empty() {
        return Err(AppError::BadRequest("contact_id is required".to_string()));
    }

    let now = Utc::now();
    let call_options_blob = req
        .custom_data
        .as_ref()
        .map(|v| v.to_string());

    let entry = NewQueueEntry {
        contact_id: req.contact_id.clone(),
        phone: req.phone,
        first_name: req.first_name,
        full_name: req.full_name,
        email: req.email,
        full_address: req.full_address,
        attempt_index: 0,
        scheduled_at: now,
        first_attempt_timestamp: now,
        call_options_blob,
        initial_signed_url: None,
        past_call_summary: req.past_call_summary,
        original_conversation_id: req.original_conversation_id,
        availability: req.availability,
    };

    let queue_id = match timeout(HANDLER_DOWNSTREAM_DEADLINE, async { state.db.insert_queue_entry(&entry) }).await {
        Ok(result) => result?,
        Err(_) => return Err(AppError::Internal("queue write timed out".to_string())),
    };

    state.notifier.notify(NotifierEvent::QueueEntryEnqueued {
        contact_id: req.contact_id,
        queue_id,
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(OutboundCallResponse {
            success: true,
            queue_id,
        }),
    ))
}

/// `POST /outgoing/call-status` — carrier status callback. Always
/// acknowledges with 200 once the form body itself parses; classification
/// failures are handled internally by the ingress state machine.
async fn call_status(State(state): State<AppState>, Form(payload): Form<CallStatusCallback>) -> impl IntoResponse {
    let answered_by = payload
        .answered_by
        .as_deref()
        .and_then(|s| s.parse::<AnsweredBy>().ok());

    let handled = timeout(
        HANDLER_DOWNSTREAM_DEADLINE,
        queue::handle_status_event(
            &state.db,
            &state.carrier,
            &state.notifier,
            &state.config,
            &payload.call_sid,
            &payload.call_status,
            answered_by,
            payload.to.as_deref(),
        ),
    )
    .await;

    if handled.is_err() {
        tracing::warn!(call_id = %payload.call_sid, "status event handling exceeded downstream deadline");
    }

    (StatusCode::OK, "OK")
}

/// `ALL /outgoing/outbound-call-twiml` — instruct the carrier to open the
/// media stream, carrying the per-call context as `<Parameter>` elements so
/// the bridge needs no DB lookup to assemble its dynamic variables.
async fn outbound_call_twiml(State(state): State<AppState>, Query(q): Query<TwimlQuery>) -> Response {
    let ws_base = if state.config.public_url.starts_with("https://") {
        state.config.public_url.replacen("https://", "wss://", 1)
    } else {
        state.config.public_url.replacen("http://", "ws://", 1)
    };
    let stream_url = format!("{ws_base}{}/outbound-media-stream", state.config.route_prefix);

    let mut parameters = vec![
        ("contact_id", q.contact_id.clone()),
        ("phone", q.phone.clone()),
    ];
    if let Some(sid) = &q.call_sid {
        parameters.push(("call_id", sid.clone()));
    }
    if let Some(v) = &q.first_name {
        parameters.push(("first_name", v.clone()));
    }
    if let Some(v) = &q.full_name {
        parameters.push(("full_name", v.clone()));
    }
    if let Some(v) = &q.email {
        parameters.push(("email", v.clone()));
    }
    if let Some(v) = &q.full_address {
        parameters.push(("full_address", v.clone()));
    }
    if let Some(v) = &q.availability {
        parameters.push(("availability", v.clone()));
    }
    if q.abrupt_retry {
        parameters.push(("abrupt_retry", "true".to_string()));
        if let Some(v) = &q.past_call_summary {
            parameters.push(("past_call_summary", v.clone()));
        }
        if let Some(v) = &q.original_conversation_id {
            parameters.push(("original_conversation_id", v.clone()));
        }
    }

    let param_tags: String = parameters
        .iter()
        .map(|(name, value)| {
            format!(
                "      <Parameter name=\"{}\" value=\"{}\"/>\n",
                xml_escape(name),
                xml_escape(value)
            )
        })
        .collect();

    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>\n  <Connect>\n    <Stream url=\"{}\">\n{}    </Stream>\n  </Connect>\n</Response>\n",
        xml_escape(&stream_url),
        param_tags
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        xml,
    )
        .into_response()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// `WS /outgoing/outbound-media-stream` — upgrade to the live media bridge.
async fn outbound_media_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        bridge::accept(socket, state.agent.clone(), state.db.clone(), state.notifier.clone()).await;
    })
}
