//! Core domain types for emberline
//!
//! These types model the durable event queue that feeds the upload pipeline.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Account** | An API key registered with the collector, plus its per-install identity |
//! | **Session** | One continuous period of application usage, possibly stitched across brief backgrounding |
//! | **Event** | A discrete occurrence recorded against a session (open, close, custom, ...) |
//! | **Blob** | An immutable batch of events claimed for one upload attempt |
//! | **History row** | A lightweight marker used for duplicate-screen suppression and flow reconstruction |
//!
//! Events are append-only: once written they are never mutated, only claimed
//! into a blob and eventually deleted when that blob's upload is confirmed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Accounts
// ============================================

/// An API key known to the local store.
///
/// Each key carries a per-install UUID (generated the first time the key is
/// used on this machine) and the account-level opt-out flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Row id (database-assigned)
    pub id: i64,
    /// The API key string supplied by the application
    pub api_key: String,
    /// Install-scoped UUID, stable for the lifetime of the local store
    pub install_id: String,
    /// When true, tagging operations are suppressed
    pub opted_out: bool,
    /// When this key was first seen locally
    pub created_at: DateTime<Utc>,
}

// ============================================
// Sessions
// ============================================

/// One continuous period of application usage.
///
/// A session may be reconstructed across brief backgrounding: an open that
/// arrives within the reconnect window of the previous close resumes the same
/// session row instead of starting a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// FK to the accounts table
    pub account_id: i64,
    /// When the session opened
    pub started_at: DateTime<Utc>,
    /// Device/network attributes snapshotted at open
    pub metadata: serde_json::Value,
}

// ============================================
// Events
// ============================================

/// Kind of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Session opened
    Open,
    /// Session closed
    Close,
    /// Account opted back in to data collection
    OptIn,
    /// Account opted out of data collection
    OptOut,
    /// Application-defined event with optional attributes
    Custom,
    /// Screen transition
    Flow,
}

impl EventKind {
    /// Returns the identifier used in database storage and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::OptIn => "opt_in",
            EventKind::OptOut => "opt_out",
            EventKind::Custom => "custom",
            EventKind::Flow => "flow",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(EventKind::Open),
            "close" => Ok(EventKind::Close),
            "opt_in" => Ok(EventKind::OptIn),
            "opt_out" => Ok(EventKind::OptOut),
            "custom" => Ok(EventKind::Custom),
            "flow" => Ok(EventKind::Flow),
            _ => Err(format!("unknown event kind: {}", s)),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A discrete occurrence recorded against a session.
///
/// Opt transition events carry no session: they are recorded even when no
/// session is open so the collector learns of the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Row id (database-assigned)
    pub id: i64,
    /// FK to the accounts table
    pub account_id: i64,
    /// Session this event belongs to (None only for opt transitions)
    pub session_id: Option<String>,
    /// What happened
    pub kind: EventKind,
    /// Event name (custom/flow events), None for lifecycle events
    pub name: Option<String>,
    /// Wall-clock time the event occurred
    pub wall_time: DateTime<Utc>,
    /// Milliseconds since the owning session opened (0 for sessionless events)
    pub elapsed_ms: i64,
    /// Attribute key/value pairs, capped at recording time
    pub attributes: Vec<(String, String)>,
}

// ============================================
// Event history
// ============================================

/// Kind of an event-history marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// A screen was tagged
    Screen,
    /// A custom event was tagged
    Event,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Screen => "screen",
            HistoryKind::Event => "event",
        }
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screen" => Ok(HistoryKind::Screen),
            "event" => Ok(HistoryKind::Event),
            _ => Err(format!("unknown history kind: {}", s)),
        }
    }
}

// ============================================
// Upload blobs
// ============================================

/// An immutable batch of events claimed for one upload attempt.
///
/// A blob survives failed (5xx) uploads untouched and is re-sent verbatim on
/// the next attempt; it is deleted together with its events only after a
/// confirmed non-5xx response.
#[derive(Debug, Clone)]
pub struct UploadBlob {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// FK to the accounts table
    pub account_id: i64,
    /// Per-account monotonically increasing sequence number
    pub seq: i64,
    /// When the blob was cut
    pub created_at: DateTime<Utc>,
}

// ============================================
// Device snapshot
// ============================================

/// Capture the device/runtime attributes recorded at session open and echoed
/// in every blob header.
pub fn device_snapshot() -> serde_json::Value {
    serde_json::json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "locale": std::env::var("LANG").ok(),
        "client_version": env!("CARGO_PKG_VERSION"),
    })
}
