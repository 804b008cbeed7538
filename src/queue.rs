//! Queue scheduler, call initiator, and the status-ingress retry-scheduling
//! helper. The scheduler is a single cooperative task; the retry helper is
//! also called directly by the HTTP status-callback handler.

use crate::agent::AgentClient;
use crate::carrier::{CarrierClient, CreateCallParams};
use crate::config::Config;
use crate::db::{AnsweredBy, CallState, CallStatePatch, Database, DbResult, NewQueueEntry, QueueEntry};
use crate::notifier::{Notifier, NotifierEvent};
use crate::retry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Carrier statuses that are not yet terminal.
const PROGRESS_STATUSES: &[&str] = &["initiated", "queued", "ringing", "in-progress"];
/// Terminal statuses that always consume a retry-ladder step regardless of
/// who answered.
const RETRYABLE_TERMINAL_STATUSES: &[&str] = &["no-answer", "busy", "failed"];
/// Terminal statuses whose retry/success classification depends on
/// `answered_by`.
const AMBIGUOUS_TERMINAL_STATUSES: &[&str] = &["completed", "canceled"];

/// Reset `in-flight` queue rows stranded by a crash back to `pending`. Run
/// once at startup before the scheduler loop begins.
pub fn run_startup_recovery(db: &Database, config: &Config) -> DbResult<usize> {
    let threshold = chrono::Duration::from_std(config.stale_in_flight_threshold)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let recovered = db.recover_stale_in_flight(threshold)?;
    if recovered > 0 {
        tracing::info!(recovered, "recovered stale in-flight queue entries at startup");
    }
    Ok(recovered)
}

/// Ticks forever at `config.queue_interval`. Spawned once from `main` and
/// never expected to return.
pub async fn run_scheduler(
    db: Database,
    carrier: Arc<CarrierClient>,
    agent: Arc<AgentClient>,
    notifier: Notifier,
    config: Arc<Config>,
) {
    let mut interval = tokio::time::interval(config.queue_interval);
    loop {
        interval.tick().await;
        tick(&db, &carrier, &agent, &notifier, &config).await;
    }
}

async fn tick(
    db: &Database,
    carrier: &CarrierClient,
    agent: &AgentClient,
    notifier: &Notifier,
    config: &Config,
) {
    let active = match carrier.active_call_count().await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "carrier active-call query failed, treating cap as saturated");
            config.max_active_calls
        }
    };

    let slots = config.max_active_calls.saturating_sub(active);
    if slots == 0 {
        return;
    }

    let eligible = match db.select_eligible_queue_entries(slots as i64) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "failed to select eligible queue entries");
            return;
        }
    };

    for entry in eligible {
        match db.claim_queue_entry(entry.queue_id) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(queue_id = entry.queue_id, error = %e, "failed to claim queue entry");
                continue;
            }
        }

        match initiate_call(db, carrier, agent, notifier, config, &entry).await {
            Ok(call_id) => {
                if let Err(e) = db.delete_queue_entry(entry.queue_id) {
                    tracing::warn!(queue_id = entry.queue_id, error = %e, "failed to delete dispatched queue entry");
                }
                notifier.notify(NotifierEvent::CallInitiated {
                    contact_id: entry.contact_id.clone(),
                    call_id,
                });
            }
            Err(message) => {
                tracing::warn!(queue_id = entry.queue_id, error = %message, "call initiation failed");
                if let Err(e) = db.fail_queue_entry(entry.queue_id, &message) {
                    tracing::warn!(queue_id = entry.queue_id, error = %e, "failed to mark queue entry failed");
                }
            }
        }
    }
}

/// §4.5 call initiator: pre-fetch signed url, create the carrier call, then
/// write-then-verify the `CallState` row before the queue entry is removed.
async fn initiate_call(
    db: &Database,
    carrier: &CarrierClient,
    agent: &AgentClient,
    notifier: &Notifier,
    config: &Config,
    entry: &QueueEntry,
) -> Result<String, String> {
    let signed_url = match &entry.initial_signed_url {
        Some(url) => url.clone(),
        None => agent
            .fetch_signed_url()
            .await
            .map_err(|e| format!("signed url fetch failed: {e}"))?,
    };

    let twiml_url = build_twiml_url(config, entry);
    let status_callback_url = build_status_callback_url(config);

    let call_id = carrier
        .create_call(&CreateCallParams {
            from: config.source_phone.clone(),
            to: entry.phone.clone(),
            twiml_url,
            status_callback_url,
        })
        .await
        .map_err(|e| format!("carrier call creation failed: {e}"))?;

    let now = Utc::now();
    let state = CallState {
        call_id: call_id.clone(),
        contact_id: entry.contact_id.clone(),
        phone: entry.phone.clone(),
        first_name: entry.first_name.clone(),
        full_name: entry.full_name.clone(),
        email: entry.email.clone(),
        full_address: entry.full_address.clone(),
        attempt_index: entry.attempt_index,
        status: "initiated".to_string(),
        answered_by: None,
        conversation_id: None,
        signed_url: Some(signed_url),
        created_at: now,
        first_attempt_timestamp: entry.first_attempt_timestamp,
        retry_scheduled: false,
        past_call_summary: entry.past_call_summary.clone(),
        original_conversation_id: entry.original_conversation_id.clone(),
        availability: entry.availability.clone(),
    };

    db.put_call_state(&state)
        .map_err(|e| format!("call-state write failed: {e}"))?;

    match db.get_call_state(&call_id) {
        Ok(Some(_)) => Ok(call_id),
        Ok(None) => {
            tracing::error!(call_id = %call_id, "call-state write/verify mismatch: row missing after write");
            notifier.notify(NotifierEvent::CallStateWriteVerifyMismatch {
                call_id: call_id.clone(),
            });
            Err("call-state write/verify mismatch".to_string())
        }
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "call-state write/verify read failed");
            notifier.notify(NotifierEvent::CallStateWriteVerifyMismatch {
                call_id: call_id.clone(),
            });
            Err(format!("call-state write/verify read failed: {e}"))
        }
    }
}

/// Build the stream-connect callback URL, carrying the per-call business
/// context URL-encoded so the TwiML/media-stream handlers need no DB lookup.
fn build_twiml_url(config: &Config, entry: &QueueEntry) -> String {
    let base = format!("{}{}/outbound-call-twiml", config.public_url, config.route_prefix);
    let mut url = Url::parse(&base).expect("PUBLIC_URL must be a valid base URL");
    {
        let mut qp = url.query_pairs_mut();
        qp.append_pair("contact_id", &entry.contact_id);
        qp.append_pair("phone", &entry.phone);
        if let Some(v) = &entry.first_name {
            qp.append_pair("first_name", v);
        }
        if let Some(v) = &entry.full_name {
            qp.append_pair("full_name", v);
        }
        if let Some(v) = &entry.email {
            qp.append_pair("email", v);
        }
        if let Some(v) = &entry.full_address {
            qp.append_pair("full_address", v);
        }
        if let Some(v) = &entry.availability {
            qp.append_pair("availability", v);
        }
        let abrupt_retry = entry.past_call_summary.is_some() || entry.original_conversation_id.is_some();
        if abrupt_retry {
            qp.append_pair("abrupt_retry", "true");
            if let Some(v) = &entry.past_call_summary {
                qp.append_pair("past_call_summary", v);
            }
            if let Some(v) = &entry.original_conversation_id {
                qp.append_pair("original_conversation_id", v);
            }
        }
    }
    url.to_string()
}

fn build_status_callback_url(config: &Config) -> String {
    format!("{}{}/call-status", config.public_url, config.route_prefix)
}

/// §4.6 status ingress: classify a carrier status callback and drive the
/// retry state machine. Called directly by the HTTP handler; never panics
/// and never propagates an error, matching the "handler always acks" rule.
///
/// `to` is the carrier webhook's own `To` field, backfilled onto the
/// canonical `phone` column when the stored row is missing it.
pub async fn handle_status_event(
    db: &Database,
    carrier: &CarrierClient,
    notifier: &Notifier,
    config: &Config,
    call_id: &str,
    call_status: &str,
    answered_by: Option<AnsweredBy>,
    to: Option<&str>,
) {
    let mut state = match lookup_with_retry(db, call_id).await {
        Some(state) => state,
        None => {
            tracing::warn!(call_id, "status event for unknown call-id, dropped");
            return;
        }
    };

    if state.retry_scheduled {
        tracing::debug!(call_id, "status event dropped: retry already scheduled");
        return;
    }

    if state.status != call_status {
        if let Err(e) = db.update_call_state(
            call_id,
            &CallStatePatch {
                status: Some(call_status.to_string()),
                ..Default::default()
            },
        ) {
            tracing::warn!(call_id, error = %e, "failed to persist call status");
        }
        state.status = call_status.to_string();
    }

    if state.phone.trim().is_empty() {
        if let Some(to) = to.filter(|v| !v.trim().is_empty()) {
            if let Err(e) = db.update_call_state(
                call_id,
                &CallStatePatch {
                    phone: Some(to.to_string()),
                    ..Default::default()
                },
            ) {
                tracing::warn!(call_id, error = %e, "failed to backfill phone from carrier To field");
            }
            state.phone = to.to_string();
        }
    }

    if let Some(ab) = answered_by {
        if state.answered_by != Some(ab) {
            if let Err(e) = db.update_call_state(
                call_id,
                &CallStatePatch {
                    answered_by: Some(ab),
                    ..Default::default()
                },
            ) {
                tracing::warn!(call_id, error = %e, "failed to persist answered_by");
            }
            state.answered_by = Some(ab);
        }
    }

    let is_machine = state.answered_by.map(AnsweredBy::is_machine).unwrap_or(false);

    if PROGRESS_STATUSES.contains(&call_status) {
        if is_machine {
            let _ = carrier.end_call(call_id).await;
            schedule_retry(db, notifier, config, &state, "machine_detected").await;
        }
        return;
    }

    if RETRYABLE_TERMINAL_STATUSES.contains(&call_status) {
        schedule_retry(db, notifier, config, &state, call_status).await;
        return;
    }

    if AMBIGUOUS_TERMINAL_STATUSES.contains(&call_status) {
        if is_machine {
            schedule_retry(db, notifier, config, &state, call_status).await;
        } else {
            notifier.notify(NotifierEvent::CallAnsweredByHuman {
                call_id: call_id.to_string(),
            });
        }
    }
}

async fn lookup_with_retry(db: &Database, call_id: &str) -> Option<CallState> {
    match db.get_call_state(call_id) {
        Ok(Some(state)) => return Some(state),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(call_id, error = %e, "call-state lookup failed");
            return None;
        }
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    db.get_call_state(call_id).ok().flatten()
}

/// Sets the retry-scheduled latch and, if this call won the race, inserts
/// the next queue entry (or emits the ladder-exhausted event).
async fn schedule_retry(db: &Database, notifier: &Notifier, config: &Config, state: &CallState, reason: &str) {
    match db.try_set_retry_scheduled(&state.call_id) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            tracing::warn!(call_id = %state.call_id, error = %e, "failed to set retry-scheduled latch");
            return;
        }
    }

    let i = state.attempt_index;
    if i >= config.max_attempts - 1 {
        tracing::info!(call_id = %state.call_id, reason, "retry ladder exhausted");
        notifier.notify(NotifierEvent::RetryLadderExhausted {
            contact_id: state.contact_id.clone(),
            call_id: state.call_id.clone(),
        });
        return;
    }

    let decision = retry::next(i, Utc::now(), config.civil_timezone);
    let new_entry = NewQueueEntry {
        contact_id: state.contact_id.clone(),
        phone: state.phone.clone(),
        first_name: state.first_name.clone(),
        full_name: state.full_name.clone(),
        email: state.email.clone(),
        full_address: state.full_address.clone(),
        attempt_index: i + 1,
        scheduled_at: decision.scheduled_at,
        first_attempt_timestamp: state.first_attempt_timestamp,
        call_options_blob: None,
        initial_signed_url: None,
        past_call_summary: state.past_call_summary.clone(),
        original_conversation_id: state.original_conversation_id.clone(),
        availability: state.availability.clone(),
    };

    if let Err(e) = db.insert_queue_entry(&new_entry) {
        tracing::warn!(call_id = %state.call_id, error = %e, reason, "failed to insert retry queue entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_queue_entry() -> QueueEntry {
        let now = Utc::now();
        QueueEntry {
            queue_id: 1,
            contact_id: "c1".into(),
            phone: "+390123456789".into(),
            first_name: Some("Mario".into()),
            full_name: Some("Mario Rossi".into()),
            email: Some("m@x.test".into()),
            full_address: Some("Via Roma 1".into()),
            attempt_index: 0,
            status: crate::db::QueueStatus::Pending,
            scheduled_at: now,
            created_at: now,
            first_attempt_timestamp: now,
            last_attempt_at: None,
            last_error: None,
            call_options_blob: None,
            initial_signed_url: None,
            past_call_summary: None,
            original_conversation_id: None,
            availability: None,
        }
    }

    fn sample_config() -> Config {
        Config {
            max_active_calls: 3,
            queue_interval: Duration::from_secs(10),
            max_attempts: 10,
            civil_timezone: chrono_tz::Europe::Rome,
            source_phone: "+10000000000".into(),
            public_url: "https://orchestrator.test".into(),
            route_prefix: "/outgoing".into(),
            db_path: ":memory:".into(),
            stale_in_flight_threshold: Duration::from_secs(300),
            carrier_account_sid: "AC_test".into(),
            carrier_auth_token: "token".into(),
            carrier_base_url: "https://api.twilio.test".into(),
            agent_id: "agent_test".into(),
            agent_api_key: "key".into(),
            agent_base_url: "https://api.agent.test".into(),
            crm_base_url: None,
            crm_client_id: None,
            crm_client_secret: None,
            notifier_webhook_url: None,
        }
    }

    #[test]
    fn twiml_url_carries_business_context() {
        let config = sample_config();
        let entry = sample_queue_entry();
        let url = build_twiml_url(&config, &entry);
        assert!(url.contains("contact_id=c1"));
        assert!(url.contains("phone=%2B390123456789"));
        assert!(!url.contains("abrupt_retry"));
    }

    #[test]
    fn twiml_url_carries_availability() {
        let config = sample_config();
        let mut entry = sample_queue_entry();
        entry.availability = Some("Tue 9am".into());
        let url = build_twiml_url(&config, &entry);
        assert!(url.contains("availability=Tue"));
    }

    #[test]
    fn twiml_url_flags_abrupt_retry() {
        let config = sample_config();
        let mut entry = sample_queue_entry();
        entry.past_call_summary = Some("discussed pricing".into());
        entry.original_conversation_id = Some("conv-abc".into());
        let url = build_twiml_url(&config, &entry);
        assert!(url.contains("abrupt_retry=true"));
        assert!(url.contains("original_conversation_id=conv-abc"));
    }

    #[tokio::test]
    async fn schedule_retry_is_latched_once() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Notifier::new(None);
        let config = sample_config();
        let now = Utc::now();
        let state = CallState {
            call_id: "CA1".into(),
            contact_id: "c1".into(),
            phone: "+390123456789".into(),
            first_name: None,
            full_name: None,
            email: None,
            full_address: None,
            attempt_index: 0,
            status: "no-answer".into(),
            answered_by: None,
            conversation_id: None,
            signed_url: None,
            created_at: now,
            first_attempt_timestamp: now,
            retry_scheduled: false,
            past_call_summary: None,
            original_conversation_id: None,
            availability: None,
        };
        db.put_call_state(&state).unwrap();

        schedule_retry(&db, &notifier, &config, &state, "no-answer").await;
        schedule_retry(&db, &notifier, &config, &state, "no-answer").await;

        let eligible = db.select_eligible_queue_entries(10).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].attempt_index, 1);
    }

    #[tokio::test]
    async fn schedule_retry_stops_at_ladder_exhaustion() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Notifier::new(None);
        let config = sample_config();
        let now = Utc::now();
        let state = CallState {
            call_id: "CA2".into(),
            contact_id: "c2".into(),
            phone: "+390123456789".into(),
            first_name: None,
            full_name: None,
            email: None,
            full_address: None,
            attempt_index: config.max_attempts - 1,
            status: "no-answer".into(),
            answered_by: None,
            conversation_id: None,
            signed_url: None,
            created_at: now,
            first_attempt_timestamp: now,
            retry_scheduled: false,
            past_call_summary: None,
            original_conversation_id: None,
            availability: None,
        };
        db.put_call_state(&state).unwrap();

        schedule_retry(&db, &notifier, &config, &state, "no-answer").await;

        let eligible = db.select_eligible_queue_entries(10).unwrap();
        assert!(eligible.is_empty());
    }
}
