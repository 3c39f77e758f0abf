//! Database repository layer
//!
//! Provides query and insert operations for accounts, sessions, events, and
//! upload blobs, including the two transactional pipeline steps: cutting a
//! blob and committing a delivered blob.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

/// Point-in-time view of an account's local queue, for status reporting.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Id of the currently open session, if any
    pub open_session_id: Option<String>,
    /// Events recorded but not yet claimed by a blob
    pub unclaimed_events: i64,
    /// Events claimed by blobs that have not been confirmed uploaded
    pub claimed_events: i64,
    /// Blobs awaiting a confirmed upload
    pub open_blobs: i64,
    /// Whether the account is currently opted out
    pub opted_out: bool,
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Account operations
    // ============================================

    /// Fetch the account row for an API key, creating it (with a fresh
    /// install UUID) on first use.
    pub fn ensure_account(&self, api_key: &str) -> Result<Account> {
        if let Some(account) = self.get_account(api_key)? {
            return Ok(account);
        }

        let install_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (api_key, install_id, opted_out, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![api_key, install_id, created_at.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        tracing::info!(api_key, install_id = %install_id, "Registered new account");

        Ok(Account {
            id,
            api_key: api_key.to_string(),
            install_id,
            opted_out: false,
            created_at,
        })
    }

    /// Get an account by API key
    pub fn get_account(&self, api_key: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM accounts WHERE api_key = ?",
            [api_key],
            Self::row_to_account,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Flip the account-level opt-out flag
    pub fn set_opted_out(&self, account_id: i64, opted_out: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET opted_out = ?1 WHERE id = ?2",
            params![opted_out as i64, account_id],
        )?;
        Ok(())
    }

    fn row_to_account(row: &Row) -> rusqlite::Result<Account> {
        let created_at_str: String = row.get("created_at")?;
        Ok(Account {
            id: row.get("id")?,
            api_key: row.get("api_key")?,
            install_id: row.get("install_id")?,
            opted_out: row.get::<_, i64>("opted_out")? != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // ============================================
    // Session operations
    // ============================================

    /// Insert a session row
    pub fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, account_id, started_at, metadata)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session.id,
                session.account_id,
                session.started_at.to_rfc3339(),
                session.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Get a session by id
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get the account's currently open session (one with no close event)
    pub fn open_session(&self, account_id: i64) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT s.* FROM sessions s
             WHERE s.account_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM events e
                   WHERE e.session_id = s.id AND e.kind = 'close'
               )
             ORDER BY s.started_at DESC
             LIMIT 1",
            [account_id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let started_at_str: String = row.get("started_at")?;
        let metadata_str: Option<String> = row.get("metadata")?;
        Ok(Session {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            started_at: DateTime::parse_from_rfc3339(&started_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            metadata: metadata_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::json!({})),
        })
    }

    // ============================================
    // Event operations
    // ============================================

    /// Append an event (and its attributes) to the durable queue.
    ///
    /// Returns the new event's row id.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_event(
        &self,
        account_id: i64,
        session_id: Option<&str>,
        kind: EventKind,
        name: Option<&str>,
        wall_time: DateTime<Utc>,
        elapsed_ms: i64,
        attributes: &[(String, String)],
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (account_id, session_id, kind, name, wall_time, elapsed_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account_id,
                session_id,
                kind.as_str(),
                name,
                wall_time.to_rfc3339(),
                elapsed_ms,
            ],
        )?;
        let event_id = conn.last_insert_rowid();

        let mut stmt = conn.prepare_cached(
            "INSERT INTO event_attributes (event_id, attr_key, attr_value) VALUES (?1, ?2, ?3)",
        )?;
        for (key, value) in attributes {
            stmt.execute(params![event_id, key, value])?;
        }

        Ok(event_id)
    }

    /// Delete an event row and its attributes.
    ///
    /// Used when a reconnecting open cancels a still-pending close event.
    pub fn delete_event(&self, event_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM event_attributes WHERE event_id = ?",
            [event_id],
        )?;
        conn.execute("DELETE FROM events WHERE id = ?", [event_id])?;
        Ok(())
    }

    /// The account's most recent close event not yet claimed by a blob.
    ///
    /// This is the reconnect candidate: if it is young enough the tracker
    /// deletes it and resumes its session instead of opening a new one.
    pub fn latest_unclaimed_close(&self, account_id: i64) -> Result<Option<Event>> {
        let event = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT e.* FROM events e
                 LEFT JOIN upload_blob_events ube ON ube.event_id = e.id
                 WHERE e.account_id = ?1 AND e.kind = 'close' AND ube.event_id IS NULL
                 ORDER BY e.id DESC
                 LIMIT 1",
                [account_id],
                Self::row_to_event,
            )
            .optional()?
        };
        Ok(event)
    }

    /// All events for a session, oldest first (test/debug helper)
    pub fn session_events(&self, session_id: &str) -> Result<Vec<Event>> {
        let mut events = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT * FROM events WHERE session_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map([session_id], Self::row_to_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        self.load_attributes(&mut events)?;
        Ok(events)
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let kind_str: String = row.get("kind")?;
        let kind = EventKind::from_str(&kind_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?;
        let wall_time_str: String = row.get("wall_time")?;

        Ok(Event {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            session_id: row.get("session_id")?,
            kind,
            name: row.get("name")?,
            wall_time: DateTime::parse_from_rfc3339(&wall_time_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            elapsed_ms: row.get("elapsed_ms")?,
            attributes: Vec::new(),
        })
    }

    /// Populate the attributes vector for each event in place
    fn load_attributes(&self, events: &mut [Event]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT attr_key, attr_value FROM event_attributes WHERE event_id = ?1 ORDER BY id",
        )?;
        for event in events.iter_mut() {
            let rows = stmt.query_map([event.id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            event.attributes = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(())
    }

    // ============================================
    // Event history operations
    // ============================================

    /// Record a history marker for duplicate suppression / flow reconstruction
    pub fn insert_history(
        &self,
        session_id: &str,
        kind: HistoryKind,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_history (session_id, kind, name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, kind.as_str(), name, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Name of the most recently tagged screen for a session
    pub fn last_screen(&self, session_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name FROM event_history
             WHERE session_id = ?1 AND kind = 'screen'
             ORDER BY id DESC
             LIMIT 1",
            [session_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Ordered screen flow consumed by a blob for one session.
    ///
    /// Only markers claimed by this blob participate; markers for sessions
    /// whose close was not claimed remain live for a later blob.
    pub fn blob_flow(&self, blob_id: &str, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM event_history
             WHERE processed_in_blob = ?1 AND session_id = ?2 AND kind = 'screen'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![blob_id, session_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Blob operations
    // ============================================

    /// Claim every eligible unclaimed event for the account into a new blob.
    ///
    /// Close events younger than the reconnect window are left unclaimed so
    /// an in-flight reconnect is not prematurely finalized. Returns `None`
    /// when nothing qualifies; no empty blob row is ever created.
    pub fn cut_blob(
        &self,
        account_id: i64,
        reconnect_window: Duration,
    ) -> Result<Option<UploadBlob>> {
        let cutoff = Utc::now() - reconnect_window;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let eligible: i64 = tx.query_row(
            "SELECT COUNT(*) FROM events e
             LEFT JOIN upload_blob_events ube ON ube.event_id = e.id
             WHERE e.account_id = ?1 AND ube.event_id IS NULL
               AND NOT (e.kind = 'close' AND e.wall_time > ?2)",
            params![account_id, cutoff.to_rfc3339()],
            |row| row.get(0),
        )?;
        if eligible == 0 {
            return Ok(None);
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM upload_blobs WHERE account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;

        let blob = UploadBlob {
            id: Uuid::new_v4().to_string(),
            account_id,
            seq,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO upload_blobs (id, account_id, seq, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![blob.id, blob.account_id, blob.seq, blob.created_at.to_rfc3339()],
        )?;

        let claimed = tx.execute(
            "INSERT INTO upload_blob_events (blob_id, event_id)
             SELECT ?1, e.id FROM events e
             LEFT JOIN upload_blob_events ube ON ube.event_id = e.id
             WHERE e.account_id = ?2 AND ube.event_id IS NULL
               AND NOT (e.kind = 'close' AND e.wall_time > ?3)",
            params![blob.id, account_id, cutoff.to_rfc3339()],
        )?;

        // Consume history markers for sessions finalized by this blob
        tx.execute(
            "UPDATE event_history SET processed_in_blob = ?1
             WHERE processed_in_blob IS NULL
               AND session_id IN (
                   SELECT e.session_id FROM events e
                   JOIN upload_blob_events ube ON ube.event_id = e.id
                   WHERE ube.blob_id = ?1 AND e.kind = 'close'
                     AND e.session_id IS NOT NULL
               )",
            [&blob.id],
        )?;

        tx.commit()?;

        tracing::debug!(blob_id = %blob.id, seq, claimed, "Cut upload blob");
        Ok(Some(blob))
    }

    /// The account's oldest unconfirmed blob, if any.
    ///
    /// Blobs are re-sent oldest-first so the collector sees sequence numbers
    /// in order.
    pub fn oldest_open_blob(&self, account_id: i64) -> Result<Option<UploadBlob>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM upload_blobs WHERE account_id = ?1 ORDER BY seq LIMIT 1",
            [account_id],
            Self::row_to_blob,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Events claimed by a blob, oldest first, with attributes populated
    pub fn blob_events(&self, blob_id: &str) -> Result<Vec<Event>> {
        let mut events = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT e.* FROM events e
                 JOIN upload_blob_events ube ON ube.event_id = e.id
                 WHERE ube.blob_id = ?1
                 ORDER BY e.id",
            )?;
            let rows = stmt.query_map([blob_id], Self::row_to_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        self.load_attributes(&mut events)?;
        Ok(events)
    }

    /// Delete a confirmed blob together with everything it consumed.
    ///
    /// Removes the blob's events and their attributes, the consumed history
    /// markers, the join rows, the blob itself, and any session fully
    /// finalized (closed) by this blob. Runs in one transaction so a crash
    /// never leaves a half-committed queue.
    pub fn commit_blob(&self, blob_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let event_ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT event_id FROM upload_blob_events WHERE blob_id = ?1")?;
            let rows = stmt.query_map([blob_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if event_ids.is_empty() {
            return Err(Error::BlobNotFound(blob_id.to_string()));
        }

        let closed_sessions: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT e.session_id FROM events e
                 JOIN upload_blob_events ube ON ube.event_id = e.id
                 WHERE ube.blob_id = ?1 AND e.kind = 'close' AND e.session_id IS NOT NULL",
            )?;
            let rows = stmt.query_map([blob_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        tx.execute(
            "DELETE FROM event_history WHERE processed_in_blob = ?1",
            [blob_id],
        )?;
        tx.execute(
            "DELETE FROM upload_blob_events WHERE blob_id = ?1",
            [blob_id],
        )?;
        {
            let mut attr_stmt =
                tx.prepare_cached("DELETE FROM event_attributes WHERE event_id = ?1")?;
            let mut event_stmt = tx.prepare_cached("DELETE FROM events WHERE id = ?1")?;
            for event_id in &event_ids {
                attr_stmt.execute([event_id])?;
                event_stmt.execute([event_id])?;
            }
        }
        {
            let mut session_stmt = tx.prepare_cached(
                "DELETE FROM sessions
                 WHERE id = ?1
                   AND NOT EXISTS (SELECT 1 FROM events e WHERE e.session_id = ?1)",
            )?;
            for session_id in &closed_sessions {
                session_stmt.execute([session_id])?;
            }
        }
        tx.execute("DELETE FROM upload_blobs WHERE id = ?1", [blob_id])?;

        tx.commit()?;

        tracing::debug!(
            blob_id,
            events = event_ids.len(),
            sessions = closed_sessions.len(),
            "Committed upload blob"
        );
        Ok(())
    }

    fn row_to_blob(row: &Row) -> rusqlite::Result<UploadBlob> {
        let created_at_str: String = row.get("created_at")?;
        Ok(UploadBlob {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            seq: row.get("seq")?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // ============================================
    // Status
    // ============================================

    /// Summarize the account's local queue
    pub fn queue_stats(&self, account_id: i64) -> Result<QueueStats> {
        let open_session_id = self.open_session(account_id)?.map(|s| s.id);
        let opted_out = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT opted_out FROM accounts WHERE id = ?1",
                [account_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0)
                != 0
        };

        let conn = self.conn.lock().unwrap();
        let unclaimed_events: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events e
             LEFT JOIN upload_blob_events ube ON ube.event_id = e.id
             WHERE e.account_id = ?1 AND ube.event_id IS NULL",
            [account_id],
            |row| row.get(0),
        )?;
        let claimed_events: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events e
             JOIN upload_blob_events ube ON ube.event_id = e.id
             WHERE e.account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        let open_blobs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM upload_blobs WHERE account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;

        Ok(QueueStats {
            open_session_id,
            unclaimed_events,
            claimed_events,
            open_blobs,
            opted_out,
        })
    }
}
