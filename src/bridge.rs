//! Per-call media bridge: pairs the carrier's inbound media WebSocket with an
//! outbound WebSocket to the AI agent provider. One bridge task per live
//! call; no state is shared between bridges.

use crate::agent::AgentClient;
use crate::db::{CallStatePatch, Database};
use crate::notifier::{Notifier, NotifierEvent};
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// Per-call context delivered back to us as the carrier's stream-start
/// custom parameters. Populated entirely from the TwiML `<Parameter>`
/// elements; no DB lookup is needed to assemble it.
#[derive(Debug, Clone, Default)]
pub struct BridgeContext {
    pub call_id: String,
    pub contact_id: String,
    pub phone: String,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    pub availability: Option<String>,
    pub abrupt_retry: bool,
    pub past_call_summary: Option<String>,
    pub original_conversation_id: Option<String>,
}

impl BridgeContext {
    fn from_custom_parameters(params: &HashMap<String, String>) -> Self {
        Self {
            call_id: params.get("call_id").cloned().unwrap_or_default(),
            contact_id: params.get("contact_id").cloned().unwrap_or_default(),
            phone: params.get("phone").cloned().unwrap_or_default(),
            first_name: params.get("first_name").cloned(),
            full_name: params.get("full_name").cloned(),
            email: params.get("email").cloned(),
            full_address: params.get("full_address").cloned(),
            availability: params.get("availability").cloned(),
            abrupt_retry: params.get("abrupt_retry").map(|v| v == "true").unwrap_or(false),
            past_call_summary: params.get("past_call_summary").cloned(),
            original_conversation_id: params.get("original_conversation_id").cloned(),
        }
    }
}

/// Wait for the carrier's `start` event (skipping the preceding `connected`
/// event), then run the bridge until either side closes. Never returns an
/// error: failures are logged and the sockets are torn down.
pub async fn accept(mut carrier_socket: WebSocket, agent: Arc<AgentClient>, db: Database, notifier: Notifier) {
    let (stream_sid, ctx) = loop {
        match carrier_socket.recv().await {
            Some(Ok(AxumMessage::Text(text))) => match serde_json::from_str::<CarrierEvent>(&text) {
                Ok(CarrierEvent::Start { start }) => {
                    let ctx = BridgeContext::from_custom_parameters(&start.custom_parameters);
                    break (start.stream_sid, ctx);
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "unrecognized carrier frame while awaiting start");
                    continue;
                }
            },
            Some(Ok(AxumMessage::Close(_))) | None => return,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "carrier ws read error while awaiting start");
                return;
            }
            _ => continue,
        }
    };

    let cached_signed_url = db
        .get_call_state(&ctx.call_id)
        .ok()
        .flatten()
        .and_then(|state| state.signed_url);

    run(carrier_socket, ctx, agent, db, notifier, stream_sid, cached_signed_url).await;
}

/// Run the bridge for a single live call until either side closes. Never
/// returns an error: failures are logged and the sockets are torn down.
async fn run(
    carrier_socket: WebSocket,
    ctx: BridgeContext,
    agent: Arc<AgentClient>,
    db: Database,
    notifier: Notifier,
    stream_sid: String,
    cached_signed_url: Option<String>,
) {
    let agent_stream = match connect_with_fallback(&agent, cached_signed_url.as_deref(), &ctx.call_id).await {
        Some(stream) => stream,
        None => return,
    };

    let (mut agent_write, mut agent_read) = agent_stream.split();
    let (mut carrier_write, mut carrier_read) = carrier_socket.split();

    if let Err(e) = agent_write
        .send(TungsteniteMessage::Text(
            build_initiation_frame(&ctx).to_string().into(),
        ))
        .await
    {
        tracing::error!(call_id = %ctx.call_id, error = %e, "failed to send agent initiation frame");
        return;
    }

    let mut abnormal = false;

    loop {
        tokio::select! {
            msg = carrier_read.next() => {
                match msg {
                    Some(Ok(AxumMessage::Text(text))) => {
                        match serde_json::from_str::<CarrierEvent>(&text) {
                            Ok(CarrierEvent::Start { .. }) => {}
                            Ok(CarrierEvent::Media { media }) => {
                                let frame = json!({
                                    "user_audio_chunk": media.payload,
                                });
                                if agent_write.send(TungsteniteMessage::Text(frame.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(CarrierEvent::Stop { .. }) => break,
                            Ok(CarrierEvent::Other) => {}
                            Err(e) => {
                                tracing::debug!(call_id = %ctx.call_id, error = %e, "unrecognized carrier frame");
                            }
                        }
                    }
                    Some(Ok(AxumMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(call_id = %ctx.call_id, error = %e, "carrier ws read error");
                        abnormal = true;
                        break;
                    }
                    _ => {}
                }
            }

            msg = agent_read.next() => {
                match msg {
                    Some(Ok(TungsteniteMessage::Text(text))) => {
                        match serde_json::from_str::<AgentEvent>(&text) {
                            Ok(AgentEvent::Audio { audio_event }) => {
                                let payload = audio_event
                                    .audio_base_64
                                    .or(audio_event.audio)
                                    .unwrap_or_default();
                                let frame = json!({
                                    "event": "media",
                                    "streamSid": stream_sid,
                                    "media": { "payload": payload },
                                });
                                if carrier_write
                                    .send(AxumMessage::Text(frame.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Ok(AgentEvent::Interruption { .. }) => {
                                let frame = json!({ "event": "clear", "streamSid": stream_sid });
                                if carrier_write
                                    .send(AxumMessage::Text(frame.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Ok(AgentEvent::Ping { ping_event }) => {
                                let pong = json!({
                                    "type": "pong",
                                    "event_id": ping_event.event_id,
                                });
                                if agent_write.send(TungsteniteMessage::Text(pong.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(AgentEvent::ConversationInitiationMetadata { conversation_initiation_metadata_event }) => {
                                if let Err(e) = db.update_call_state(
                                    &ctx.call_id,
                                    &CallStatePatch {
                                        conversation_id: Some(conversation_initiation_metadata_event.conversation_id),
                                        ..Default::default()
                                    },
                                ) {
                                    tracing::warn!(call_id = %ctx.call_id, error = %e, "failed to persist conversation id");
                                }
                            }
                            Ok(AgentEvent::Other) => {}
                            Err(e) => {
                                tracing::debug!(call_id = %ctx.call_id, error = %e, "unrecognized agent frame");
                            }
                        }
                    }
                    Some(Ok(TungsteniteMessage::Close(frame))) => {
                        let normal = frame
                            .as_ref()
                            .map(|f| matches!(u16::from(f.code), 1000 | 1005))
                            .unwrap_or(true);
                        if !normal {
                            abnormal = true;
                        }
                        break;
                    }
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!(call_id = %ctx.call_id, error = %e, "agent ws read error");
                        abnormal = true;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = carrier_write.close().await;
    let _ = agent_write.close().await;

    if abnormal {
        tracing::warn!(call_id = %ctx.call_id, "media bridge closed abnormally");
        notifier.notify(NotifierEvent::CallStateWriteVerifyMismatch {
            call_id: ctx.call_id.clone(),
        });
    }
}

type AgentWsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_agent(url: &str) -> Result<AgentWsStream, tokio_tungstenite::tungstenite::Error> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

/// Try the cached signed URL first (if any); fall back to a freshly fetched
/// one on failure, per the spec's "fresh fetch if the cached one fails".
async fn connect_with_fallback(
    agent: &AgentClient,
    cached_signed_url: Option<&str>,
    call_id: &str,
) -> Option<AgentWsStream> {
    if let Some(url) = cached_signed_url {
        match connect_agent(url).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                tracing::warn!(call_id, error = %e, "cached signed url failed, refetching");
            }
        }
    }

    let fresh = match agent.fetch_signed_url().await {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(call_id, error = %e, "signed url fetch failed");
            return None;
        }
    };
    match connect_agent(&fresh).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::error!(call_id, error = %e, "agent ws connect failed after refetch");
            None
        }
    }
}

fn build_initiation_frame(ctx: &BridgeContext) -> serde_json::Value {
    let mut dynamic_variables = json!({
        "firstName": ctx.first_name,
        "fullName": ctx.full_name,
        "email": ctx.email,
        "phone": ctx.phone,
        "contactId": ctx.contact_id,
        "fullAddress": ctx.full_address,
        "availability": ctx.availability,
    });

    let mut frame = json!({
        "type": "conversation_initiation_client_data",
        "dynamic_variables": dynamic_variables,
    });

    if ctx.abrupt_retry {
        if let Some(obj) = dynamic_variables.as_object_mut() {
            obj.insert(
                "pastCallSummary".to_string(),
                json!(ctx.past_call_summary.clone()),
            );
            obj.insert(
                "originalConversationId".to_string(),
                json!(ctx.original_conversation_id.clone()),
            );
        }
        if let (Some(obj), Some(summary)) = (frame.as_object_mut(), &ctx.past_call_summary) {
            obj.insert(
                "first_message_override".to_string(),
                json!(format!(
                    "Picking up from our last conversation: {summary}"
                )),
            );
        }
        frame["dynamic_variables"] = dynamic_variables;
    }

    frame
}

/// Carrier streaming protocol events we care about. Unknown events
/// (`connected`, `mark`, `dtmf`) fall through to `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum CarrierEvent {
    Start { start: CarrierStart },
    Media { media: CarrierMedia },
    Stop {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CarrierStart {
    #[serde(rename = "streamSid")]
    stream_sid: String,
    #[serde(rename = "customParameters", default)]
    custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CarrierMedia {
    payload: String,
}

/// Agent provider events we translate. Transcript/agent-response frames fall
/// through to `Other` and are ignored here.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
    Audio { audio_event: AgentAudioEvent },
    Interruption { interruption_event: serde_json::Value },
    Ping { ping_event: AgentPingEvent },
    #[serde(rename = "conversation_initiation_metadata")]
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: ConversationInitiationMetadataEvent,
    },
    #[serde(other)]
    Other,
}

/// The provider has been observed to use both `audio_base_64` and `audio`
/// as the base64 payload key across protocol revisions; both are accepted.
#[derive(Debug, Deserialize)]
struct AgentAudioEvent {
    #[serde(default)]
    audio_base_64: Option<String>,
    #[serde(default)]
    audio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentPingEvent {
    event_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ConversationInitiationMetadataEvent {
    conversation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_frame_carries_dynamic_variables() {
        let ctx = BridgeContext {
            call_id: "CA1".into(),
            contact_id: "contact-1".into(),
            phone: "+15551234567".into(),
            first_name: Some("Ada".into()),
            full_name: Some("Ada Lovelace".into()),
            email: None,
            full_address: None,
            availability: Some("Tue 9am, Wed 2pm".into()),
            abrupt_retry: false,
            past_call_summary: None,
            original_conversation_id: None,
        };
        let frame = build_initiation_frame(&ctx);
        assert_eq!(frame["type"], "conversation_initiation_client_data");
        assert_eq!(frame["dynamic_variables"]["availability"], "Tue 9am, Wed 2pm");
        assert_eq!(frame["dynamic_variables"]["firstName"], "Ada");
        assert!(frame.get("first_message_override").is_none());
    }

    #[test]
    fn abrupt_retry_adds_first_message_override() {
        let ctx = BridgeContext {
            call_id: "CA2".into(),
            contact_id: "contact-2".into(),
            phone: "+15551234567".into(),
            first_name: None,
            full_name: None,
            email: None,
            full_address: None,
            availability: None,
            abrupt_retry: true,
            past_call_summary: Some("discussed pricing".into()),
            original_conversation_id: Some("conv-abc".into()),
        };
        let frame = build_initiation_frame(&ctx);
        assert!(frame["first_message_override"]
            .as_str()
            .unwrap()
            .contains("discussed pricing"));
        assert_eq!(
            frame["dynamic_variables"]["originalConversationId"],
            "conv-abc"
        );
    }

    #[test]
    fn carrier_media_event_parses() {
        let raw = r#"{"event":"media","media":{"payload":"abcd"}}"#;
        let parsed: CarrierEvent = serde_json::from_str(raw).unwrap();
        matches!(parsed, CarrierEvent::Media { .. });
    }

    #[test]
    fn agent_audio_event_accepts_either_payload_key() {
        let raw = r#"{"type":"audio","audio_event":{"audio_base_64":"xyz"}}"#;
        let parsed: AgentEvent = serde_json::from_str(raw).unwrap();
        match parsed {
            AgentEvent::Audio { audio_event } => {
                assert_eq!(audio_event.audio_base_64.as_deref(), Some("xyz"));
            }
            _ => panic!("expected audio event"),
        }
    }
}
