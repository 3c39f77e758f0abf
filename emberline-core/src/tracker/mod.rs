//! Session lifecycle tracking
//!
//! The tracker is the write side of the pipeline: it appends open/close,
//! custom, flow, and opt events to the durable queue, stitching rapid
//! close/open pairs into one logical session via the reconnect window.
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Application │ ──► │ SessionTracker │ ──► │ Database (queue) │
//! └─────────────┘     └────────────────┘     └──────────────────┘
//! ```
//!
//! A close event only becomes final once it ages past the reconnect window
//! and is claimed by a blob; until then a new open deletes it and resumes
//! the same session row.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::types::{device_snapshot, Account, EventKind, HistoryKind, Session};

/// Result of an open-session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new session row was created
    New(String),
    /// A recent close was cancelled and its session resumed
    Resumed(String),
    /// A session was already open; nothing changed
    AlreadyOpen(String),
    /// The account is opted out; nothing was recorded
    OptedOut,
}

impl OpenOutcome {
    /// The session id this outcome refers to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OpenOutcome::New(id) | OpenOutcome::Resumed(id) | OpenOutcome::AlreadyOpen(id) => {
                Some(id)
            }
            OpenOutcome::OptedOut => None,
        }
    }
}

/// Records session lifecycle and application events for one account.
pub struct SessionTracker {
    db: Database,
    account: Account,
    reconnect_window: Duration,
    max_attributes: usize,
}

impl SessionTracker {
    /// Create a tracker for an API key, registering the account on first use.
    pub fn new(db: Database, api_key: &str, config: &TrackerConfig) -> Result<Self> {
        let account = db.ensure_account(api_key)?;
        Ok(Self {
            db,
            account,
            reconnect_window: Duration::seconds(config.reconnect_window_secs as i64),
            max_attributes: config.max_attributes,
        })
    }

    /// The account this tracker writes for
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Access the underlying database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Open a session, resuming the previous one when its close is still
    /// within the reconnect window.
    pub fn open_session(&self) -> Result<OpenOutcome> {
        if self.is_opted_out()? {
            tracing::debug!("Open ignored: account is opted out");
            return Ok(OpenOutcome::OptedOut);
        }

        if let Some(session) = self.db.open_session(self.account.id)? {
            tracing::warn!(session_id = %session.id, "Open ignored: session already open");
            return Ok(OpenOutcome::AlreadyOpen(session.id));
        }

        let now = Utc::now();

        // A close younger than the reconnect window is not final yet: delete
        // it and pick the session back up.
        if let Some(close) = self.db.latest_unclaimed_close(self.account.id)? {
            if close.wall_time + self.reconnect_window > now {
                if let Some(session_id) = close.session_id {
                    self.db.delete_event(close.id)?;
                    tracing::info!(session_id = %session_id, "Resumed session within reconnect window");
                    return Ok(OpenOutcome::Resumed(session_id));
                }
            }
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            account_id: self.account.id,
            started_at: now,
            metadata: device_snapshot(),
        };
        self.db.insert_session(&session)?;
        self.db.insert_event(
            self.account.id,
            Some(&session.id),
            EventKind::Open,
            None,
            now,
            0,
            &[],
        )?;

        tracing::info!(session_id = %session.id, "Opened session");
        Ok(OpenOutcome::New(session.id))
    }

    /// Close the open session. Returns false when no session is open.
    pub fn close_session(&self) -> Result<bool> {
        let Some(session) = self.db.open_session(self.account.id)? else {
            tracing::warn!("Close ignored: no open session");
            return Ok(false);
        };

        let now = Utc::now();
        self.db.insert_event(
            self.account.id,
            Some(&session.id),
            EventKind::Close,
            None,
            now,
            elapsed_ms(&session, now),
            &[],
        )?;

        tracing::info!(session_id = %session.id, "Closed session");
        Ok(true)
    }

    /// Record an application event against the open session.
    ///
    /// Attributes beyond the configured cap are dropped. Returns false when
    /// the event was suppressed (opted out or no open session).
    pub fn tag_event(&self, name: &str, attributes: &[(String, String)]) -> Result<bool> {
        if self.is_opted_out()? {
            tracing::debug!(name, "Event ignored: account is opted out");
            return Ok(false);
        }
        let Some(session) = self.db.open_session(self.account.id)? else {
            tracing::warn!(name, "Event ignored: no open session");
            return Ok(false);
        };

        let attributes = if attributes.len() > self.max_attributes {
            tracing::warn!(
                name,
                dropped = attributes.len() - self.max_attributes,
                cap = self.max_attributes,
                "Attribute cap exceeded, dropping extras"
            );
            &attributes[..self.max_attributes]
        } else {
            attributes
        };

        let now = Utc::now();
        self.db.insert_event(
            self.account.id,
            Some(&session.id),
            EventKind::Custom,
            Some(name),
            now,
            elapsed_ms(&session, now),
            attributes,
        )?;
        self.db
            .insert_history(&session.id, HistoryKind::Event, name, now)?;

        Ok(true)
    }

    /// Record a screen transition against the open session.
    ///
    /// Consecutive tags of the same screen are suppressed. Returns false
    /// when nothing was recorded.
    pub fn tag_screen(&self, name: &str) -> Result<bool> {
        if self.is_opted_out()? {
            tracing::debug!(name, "Screen ignored: account is opted out");
            return Ok(false);
        }
        let Some(session) = self.db.open_session(self.account.id)? else {
            tracing::warn!(name, "Screen ignored: no open session");
            return Ok(false);
        };

        if self.db.last_screen(&session.id)?.as_deref() == Some(name) {
            tracing::debug!(name, "Screen ignored: duplicate of current screen");
            return Ok(false);
        }

        let now = Utc::now();
        self.db.insert_event(
            self.account.id,
            Some(&session.id),
            EventKind::Flow,
            Some(name),
            now,
            elapsed_ms(&session, now),
            &[],
        )?;
        self.db
            .insert_history(&session.id, HistoryKind::Screen, name, now)?;

        Ok(true)
    }

    /// Opt the account out of data collection.
    ///
    /// Closes any open session, then records a single opt-out event so the
    /// collector learns of the transition. Returns false when already
    /// opted out.
    pub fn opt_out(&self) -> Result<bool> {
        if self.is_opted_out()? {
            return Ok(false);
        }

        self.close_session()?;
        self.db.set_opted_out(self.account.id, true)?;
        self.db.insert_event(
            self.account.id,
            None,
            EventKind::OptOut,
            None,
            Utc::now(),
            0,
            &[],
        )?;

        tracing::info!("Account opted out");
        Ok(true)
    }

    /// Opt the account back in. Returns false when not opted out.
    pub fn opt_in(&self) -> Result<bool> {
        if !self.is_opted_out()? {
            return Ok(false);
        }

        self.db.set_opted_out(self.account.id, false)?;
        self.db.insert_event(
            self.account.id,
            None,
            EventKind::OptIn,
            None,
            Utc::now(),
            0,
            &[],
        )?;

        tracing::info!("Account opted back in");
        Ok(true)
    }

    /// Summarize the account's local queue
    pub fn stats(&self) -> Result<crate::db::QueueStats> {
        self.db.queue_stats(self.account.id)
    }

    /// Read the opt-out flag from the store so concurrent processes observe
    /// transitions immediately.
    fn is_opted_out(&self) -> Result<bool> {
        Ok(self
            .db
            .get_account(&self.account.api_key)?
            .map(|a| a.opted_out)
            .unwrap_or(false))
    }
}

/// Milliseconds since the session opened, clamped to zero.
fn elapsed_ms(session: &Session, now: chrono::DateTime<Utc>) -> i64 {
    (now - session.started_at).num_milliseconds().max(0)
}
