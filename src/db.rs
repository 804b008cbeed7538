//! Durable store for the outbound call orchestrator.
//!
//! Single embedded SQLite database holding the queue, the call-state
//! registry, and the OAuth token cache. All three tables share one
//! connection; callers get a cheap `Clone` of the handle.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("queue entry not found: {0}")]
    QueueEntryNotFound(i64),
    #[error("call state not found: {0}")]
    CallStateNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (used by tests).
    #[allow(dead_code)]
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Ignore "duplicate column name" on repeated startups against an
            // older on-disk file that already has the column.
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    // ==================== Queue Operations ====================

    /// Insert a new queue entry (first attempt or a scheduled retry).
    pub fn insert_queue_entry(&self, entry: &NewQueueEntry) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO queue_entries (
                contact_id, phone, first_name, full_name, email, full_address,
                attempt_index, status, scheduled_at, created_at, first_attempt_timestamp,
                call_options_blob, initial_signed_url, past_call_summary, original_conversation_id,
                availability
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry.contact_id,
                entry.phone,
                entry.first_name,
                entry.full_name,
                entry.email,
                entry.full_address,
                entry.attempt_index,
                entry.scheduled_at.to_rfc3339(),
                now.to_rfc3339(),
                entry.first_attempt_timestamp.to_rfc3339(),
                entry.call_options_blob,
                entry.initial_signed_url,
                entry.past_call_summary,
                entry.original_conversation_id,
                entry.availability,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Select up to `limit` pending entries whose `scheduled_at <= now`, FIFO
    /// by `scheduled_at` then `queue_id`.
    pub fn select_eligible_queue_entries(&self, limit: i64) -> DbResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT queue_id, contact_id, phone, first_name, full_name, email, full_address,
                    attempt_index, status, scheduled_at, created_at, first_attempt_timestamp,
                    last_attempt_at, last_error, call_options_blob, initial_signed_url,
                    past_call_summary, original_conversation_id, availability
             FROM queue_entries
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at ASC, queue_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit], parse_queue_entry_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Atomically claim a pending entry for dispatch. Returns `true` if this
    /// call performed the transition (i.e. no other worker got there first).
    pub fn claim_queue_entry(&self, queue_id: i64) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE queue_entries SET status = 'in-flight', last_attempt_at = ?1
             WHERE queue_id = ?2 AND status = 'pending'",
            params![now, queue_id],
        )?;
        Ok(changed == 1)
    }

    /// Mark a queue entry failed with a free-text error, leaving it for
    /// observability rather than retrying it via the ladder.
    pub fn fail_queue_entry(&self, queue_id: i64, last_error: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE queue_entries SET status = 'failed', last_error = ?1 WHERE queue_id = ?2",
            params![last_error, queue_id],
        )?;
        if updated == 0 {
            return Err(DbError::QueueEntryNotFound(queue_id));
        }
        Ok(())
    }

    /// Delete a queue entry (on successful initiation).
    pub fn delete_queue_entry(&self, queue_id: i64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM queue_entries WHERE queue_id = ?1", params![queue_id])?;
        if deleted == 0 {
            return Err(DbError::QueueEntryNotFound(queue_id));
        }
        Ok(())
    }

    /// Reset stale `in-flight` rows (older than `threshold`) back to
    /// `pending`, healing crashes that happened between claim and handoff.
    pub fn recover_stale_in_flight(&self, threshold: chrono::Duration) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - threshold).to_rfc3339();
        let changed = conn.execute(
            "UPDATE queue_entries SET status = 'pending', last_error = 'stale in-flight recovered'
             WHERE status = 'in-flight' AND last_attempt_at <= ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    // ==================== Call-state Operations ====================

    /// Insert-or-replace the full canonical call-state row.
    pub fn put_call_state(&self, state: &CallState) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO call_state (
                call_id, contact_id, phone, first_name, full_name, email, full_address,
                attempt_index, status, answered_by, conversation_id, signed_url,
                created_at, first_attempt_timestamp, retry_scheduled,
                past_call_summary, original_conversation_id, availability
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(call_id) DO UPDATE SET
                contact_id = excluded.contact_id,
                phone = excluded.phone,
                first_name = excluded.first_name,
                full_name = excluded.full_name,
                email = excluded.email,
                full_address = excluded.full_address,
                attempt_index = excluded.attempt_index,
                status = excluded.status,
                answered_by = excluded.answered_by,
                conversation_id = excluded.conversation_id,
                signed_url = excluded.signed_url,
                created_at = excluded.created_at,
                first_attempt_timestamp = excluded.first_attempt_timestamp,
                retry_scheduled = excluded.retry_scheduled,
                past_call_summary = excluded.past_call_summary,
                original_conversation_id = excluded.original_conversation_id,
                availability = excluded.availability",
            params![
                state.call_id,
                state.contact_id,
                state.phone,
                state.first_name,
                state.full_name,
                state.email,
                state.full_address,
                state.attempt_index,
                state.status,
                state.answered_by.map(|a| a.to_string()),
                state.conversation_id,
                state.signed_url,
                state.created_at.to_rfc3339(),
                state.first_attempt_timestamp.to_rfc3339(),
                state.retry_scheduled,
                state.past_call_summary,
                state.original_conversation_id,
                state.availability,
            ],
        )?;
        Ok(())
    }

    /// Look up a call-state row by carrier call-id.
    pub fn get_call_state(&self, call_id: &str) -> DbResult<Option<CallState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT call_id, contact_id, phone, first_name, full_name, email, full_address,
                    attempt_index, status, answered_by, conversation_id, signed_url,
                    created_at, first_attempt_timestamp, retry_scheduled,
                    past_call_summary, original_conversation_id, availability
             FROM call_state WHERE call_id = ?1",
        )?;
        stmt.query_row(params![call_id], parse_call_state_row)
            .optional()
            .map_err(DbError::from)
    }

    /// Apply a partial patch to an existing call-state row by key. Returns
    /// [`DbError::CallStateNotFound`] if `call_id` doesn't name an existing row.
    pub fn update_call_state(&self, call_id: &str, patch: &CallStatePatch) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        if let Some(status) = &patch.status {
            let changed = conn.execute(
                "UPDATE call_state SET status = ?1 WHERE call_id = ?2",
                params![status, call_id],
            )?;
            if changed == 0 {
                return Err(DbError::CallStateNotFound(call_id.to_string()));
            }
        }
        if let Some(answered_by) = patch.answered_by {
            let changed = conn.execute(
                "UPDATE call_state SET answered_by = ?1 WHERE call_id = ?2",
                params![answered_by.to_string(), call_id],
            )?;
            if changed == 0 {
                return Err(DbError::CallStateNotFound(call_id.to_string()));
            }
        }
        if let Some(conversation_id) = &patch.conversation_id {
            let changed = conn.execute(
                "UPDATE call_state SET conversation_id = ?1 WHERE call_id = ?2",
                params![conversation_id, call_id],
            )?;
            if changed == 0 {
                return Err(DbError::CallStateNotFound(call_id.to_string()));
            }
        }
        if let Some(retry_scheduled) = patch.retry_scheduled {
            let changed = conn.execute(
                "UPDATE call_state SET retry_scheduled = ?1 WHERE call_id = ?2",
                params![retry_scheduled, call_id],
            )?;
            if changed == 0 {
                return Err(DbError::CallStateNotFound(call_id.to_string()));
            }
        }
        if let Some(phone) = &patch.phone {
            let changed = conn.execute(
                "UPDATE call_state SET phone = ?1 WHERE call_id = ?2",
                params![phone, call_id],
            )?;
            if changed == 0 {
                return Err(DbError::CallStateNotFound(call_id.to_string()));
            }
        }
        Ok(())
    }

    /// Atomically set the retry-scheduled latch, returning `true` only if
    /// this call flipped it from false to true (so callers know whether
    /// they, and not a racing status event, own the retry scheduling work).
    /// Returns [`DbError::CallStateNotFound`] if `call_id` doesn't name an existing row.
    pub fn try_set_retry_scheduled(&self, call_id: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let exists = conn
            .query_row("SELECT 1 FROM call_state WHERE call_id = ?1", params![call_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(DbError::CallStateNotFound(call_id.to_string()));
        }
        let changed = conn.execute(
            "UPDATE call_state SET retry_scheduled = 1 WHERE call_id = ?1 AND retry_scheduled = 0",
            params![call_id],
        )?;
        Ok(changed == 1)
    }

    // ==================== OAuth token Operations ====================

    /// Read a cached OAuth token for a CRM tenant/location.
    pub fn get_oauth_token(&self, location_id: &str) -> DbResult<Option<OAuthTokenRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT location_id, access_token, refresh_token, expires_at, updated_at
             FROM oauth_tokens WHERE location_id = ?1",
        )?;
        stmt.query_row(params![location_id], |row| {
            Ok(OAuthTokenRecord {
                location_id: row.get(0)?,
                access_token: row.get(1)?,
                refresh_token: row.get(2)?,
                expires_at: parse_datetime(&row.get::<_, String>(3)?),
                updated_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })
        .optional()
        .map_err(DbError::from)
    }

    /// Upsert a freshly-refreshed OAuth token.
    pub fn put_oauth_token(&self, record: &OAuthTokenRecord) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO oauth_tokens (location_id, access_token, refresh_token, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(location_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                record.location_id,
                record.access_token,
                record.refresh_token,
                record.expires_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn parse_queue_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let status_str: String = row.get(8)?;
    Ok(QueueEntry {
        queue_id: row.get(0)?,
        contact_id: row.get(1)?,
        phone: row.get(2)?,
        first_name: row.get(3)?,
        full_name: row.get(4)?,
        email: row.get(5)?,
        full_address: row.get(6)?,
        attempt_index: row.get(7)?,
        status: status_str.parse().unwrap_or(QueueStatus::Failed),
        scheduled_at: parse_datetime(&row.get::<_, String>(9)?),
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        first_attempt_timestamp: parse_datetime(&row.get::<_, String>(11)?),
        last_attempt_at: row.get::<_, Option<String>>(12)?.map(|s| parse_datetime(&s)),
        last_error: row.get(13)?,
        call_options_blob: row.get(14)?,
        initial_signed_url: row.get(15)?,
        past_call_summary: row.get(16)?,
        original_conversation_id: row.get(17)?,
        availability: row.get(18)?,
    })
}

fn parse_call_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallState> {
    Ok(CallState {
        call_id: row.get(0)?,
        contact_id: row.get(1)?,
        phone: row.get(2)?,
        first_name: row.get(3)?,
        full_name: row.get(4)?,
        email: row.get(5)?,
        full_address: row.get(6)?,
        attempt_index: row.get(7)?,
        status: row.get(8)?,
        answered_by: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| s.parse().ok()),
        conversation_id: row.get(10)?,
        signed_url: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
        first_attempt_timestamp: parse_datetime(&row.get::<_, String>(13)?),
        retry_scheduled: row.get(14)?,
        past_call_summary: row.get(15)?,
        original_conversation_id: row.get(16)?,
        availability: row.get(17)?,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> NewQueueEntry {
        let now = Utc::now();
        NewQueueEntry {
            contact_id: "c1".into(),
            phone: "+390123456789".into(),
            first_name: Some("Mario".into()),
            full_name: Some("Mario Rossi".into()),
            email: Some("m@x.test".into()),
            full_address: None,
            attempt_index: 0,
            scheduled_at: now,
            first_attempt_timestamp: now,
            call_options_blob: None,
            initial_signed_url: None,
            past_call_summary: None,
            original_conversation_id: None,
            availability: None,
        }
    }

    #[test]
    fn insert_and_select_eligible_entry() {
        let db = Database::open_in_memory().unwrap();
        let queue_id = db.insert_queue_entry(&sample_entry()).unwrap();

        let eligible = db.select_eligible_queue_entries(10).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].queue_id, queue_id);
        assert_eq!(eligible[0].status, QueueStatus::Pending);
    }

    #[test]
    fn claim_is_at_most_once() {
        let db = Database::open_in_memory().unwrap();
        let queue_id = db.insert_queue_entry(&sample_entry()).unwrap();

        assert!(db.claim_queue_entry(queue_id).unwrap());
        assert!(!db.claim_queue_entry(queue_id).unwrap());

        let eligible = db.select_eligible_queue_entries(10).unwrap();
        assert!(eligible.is_empty());
    }

    #[test]
    fn put_then_get_call_state_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let state = CallState {
            call_id: "CA1".into(),
            contact_id: "c1".into(),
            phone: "+390123456789".into(),
            first_name: Some("Mario".into()),
            full_name: None,
            email: None,
            full_address: None,
            attempt_index: 0,
            status: "initiated".into(),
            answered_by: None,
            conversation_id: None,
            signed_url: Some("https://agent.test/ws".into()),
            created_at: now,
            first_attempt_timestamp: now,
            retry_scheduled: false,
            past_call_summary: None,
            original_conversation_id: None,
            availability: None,
        };
        db.put_call_state(&state).unwrap();

        let fetched = db.get_call_state("CA1").unwrap().expect("row exists");
        assert_eq!(fetched.contact_id, "c1");
        assert_eq!(fetched.status, "initiated");
        assert!(!fetched.retry_scheduled);
    }

    #[test]
    fn retry_scheduled_latch_fires_once() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.put_call_state(&CallState {
            call_id: "CA2".into(),
            contact_id: "c2".into(),
            phone: "+390123456789".into(),
            first_name: None,
            full_name: None,
            email: None,
            full_address: None,
            attempt_index: 0,
            status: "completed".into(),
            answered_by: Some(AnsweredBy::MachineStart),
            conversation_id: None,
            signed_url: None,
            created_at: now,
            first_attempt_timestamp: now,
            retry_scheduled: false,
            past_call_summary: None,
            original_conversation_id: None,
            availability: None,
        })
        .unwrap();

        assert!(db.try_set_retry_scheduled("CA2").unwrap());
        assert!(!db.try_set_retry_scheduled("CA2").unwrap());
    }

    #[test]
    fn stale_in_flight_recovers_to_pending() {
        let db = Database::open_in_memory().unwrap();
        let queue_id = db.insert_queue_entry(&sample_entry()).unwrap();
        db.claim_queue_entry(queue_id).unwrap();

        let recovered = db.recover_stale_in_flight(chrono::Duration::seconds(-1)).unwrap();
        assert_eq!(recovered, 1);

        let eligible = db.select_eligible_queue_entries(10).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].last_error.as_deref(), Some("stale in-flight recovered"));
    }
}
