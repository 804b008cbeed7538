//! Database schema and row types for the queue, call-state, and OAuth tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id TEXT NOT NULL,
    phone TEXT NOT NULL,
    first_name TEXT,
    full_name TEXT,
    email TEXT,
    full_address TEXT,
    attempt_index INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    scheduled_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    first_attempt_timestamp TEXT NOT NULL,
    last_attempt_at TEXT,
    last_error TEXT,
    call_options_blob TEXT,
    initial_signed_url TEXT,
    past_call_summary TEXT,
    original_conversation_id TEXT,
    availability TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_dispatch ON queue_entries(status, scheduled_at, queue_id);

CREATE TABLE IF NOT EXISTS call_state (
    call_id TEXT PRIMARY KEY,
    contact_id TEXT NOT NULL,
    phone TEXT NOT NULL,
    first_name TEXT,
    full_name TEXT,
    email TEXT,
    full_address TEXT,
    attempt_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    answered_by TEXT,
    conversation_id TEXT,
    signed_url TEXT,
    created_at TEXT NOT NULL,
    first_attempt_timestamp TEXT NOT NULL,
    retry_scheduled BOOLEAN NOT NULL DEFAULT 0,
    past_call_summary TEXT,
    original_conversation_id TEXT,
    availability TEXT
);

CREATE INDEX IF NOT EXISTS idx_call_state_created ON call_state(created_at DESC);

CREATE TABLE IF NOT EXISTS oauth_tokens (
    location_id TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Additive migrations: add a column if it doesn't already exist, tolerating
/// rusqlite's "duplicate column name" error on repeated startups.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE queue_entries ADD COLUMN past_call_summary TEXT",
    "ALTER TABLE queue_entries ADD COLUMN original_conversation_id TEXT",
    "ALTER TABLE call_state ADD COLUMN past_call_summary TEXT",
    "ALTER TABLE call_state ADD COLUMN original_conversation_id TEXT",
    "ALTER TABLE queue_entries ADD COLUMN availability TEXT",
    "ALTER TABLE call_state ADD COLUMN availability TEXT",
];

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::InFlight => write!(f, "in-flight"),
            QueueStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in-flight" => Ok(QueueStatus::InFlight),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// A pending or in-flight unit of outbound-call work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub contact_id: String,
    pub phone: String,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    pub attempt_index: i64,
    pub status: QueueStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub first_attempt_timestamp: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub call_options_blob: Option<String>,
    pub initial_signed_url: Option<String>,
    pub past_call_summary: Option<String>,
    pub original_conversation_id: Option<String>,
    pub availability: Option<String>,
}

/// Fields needed to enqueue a new sequence's first attempt, or a retry.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub contact_id: String,
    pub phone: String,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    pub attempt_index: i64,
    pub scheduled_at: DateTime<Utc>,
    pub first_attempt_timestamp: DateTime<Utc>,
    pub call_options_blob: Option<String>,
    pub initial_signed_url: Option<String>,
    pub past_call_summary: Option<String>,
    pub original_conversation_id: Option<String>,
    pub availability: Option<String>,
}

/// Carrier classification of who/what picked up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnsweredBy {
    Human,
    MachineStart,
    Fax,
    MachineBeep,
    MachineEndSilence,
    MachineEndOther,
    MachineEndBeep,
    Unknown,
}

impl AnsweredBy {
    pub fn is_machine(self) -> bool {
        matches!(
            self,
            AnsweredBy::MachineStart
                | AnsweredBy::Fax
                | AnsweredBy::MachineBeep
                | AnsweredBy::MachineEndSilence
                | AnsweredBy::MachineEndOther
                | AnsweredBy::MachineEndBeep
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnsweredBy::Human => "human",
            AnsweredBy::MachineStart => "machine_start",
            AnsweredBy::Fax => "fax",
            AnsweredBy::MachineBeep => "machine_beep",
            AnsweredBy::MachineEndSilence => "machine_end_silence",
            AnsweredBy::MachineEndOther => "machine_end_other",
            AnsweredBy::MachineEndBeep => "machine_end_beep",
            AnsweredBy::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for AnsweredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(AnsweredBy::Human),
            "machine_start" => Ok(AnsweredBy::MachineStart),
            "fax" => Ok(AnsweredBy::Fax),
            "machine_beep" => Ok(AnsweredBy::MachineBeep),
            "machine_end_silence" => Ok(AnsweredBy::MachineEndSilence),
            "machine_end_other" => Ok(AnsweredBy::MachineEndOther),
            "machine_end_beep" => Ok(AnsweredBy::MachineEndBeep),
            "" | "unknown" => Ok(AnsweredBy::Unknown),
            other => Err(format!("unknown answered_by value: {other}")),
        }
    }
}

impl fmt::Display for AnsweredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tracked carrier call, keyed by carrier call-id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallState {
    pub call_id: String,
    pub contact_id: String,
    pub phone: String,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    pub attempt_index: i64,
    pub status: String,
    pub answered_by: Option<AnsweredBy>,
    pub conversation_id: Option<String>,
    pub signed_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub first_attempt_timestamp: DateTime<Utc>,
    pub retry_scheduled: bool,
    pub past_call_summary: Option<String>,
    pub original_conversation_id: Option<String>,
    pub availability: Option<String>,
}

/// Partial patch applied to an existing `CallState` row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CallStatePatch {
    pub status: Option<String>,
    pub answered_by: Option<AnsweredBy>,
    pub conversation_id: Option<String>,
    pub retry_scheduled: Option<bool>,
    pub phone: Option<String>,
}

/// OAuth token record for a CRM tenant/location, read-mostly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenRecord {
    pub location_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
