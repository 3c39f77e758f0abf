//! # emberline-core
//!
//! Core library for emberline - a local-first session analytics pipeline.
//!
//! This library provides:
//! - Domain types for accounts, sessions, events, and upload blobs
//! - A durable SQLite-backed event queue
//! - Session lifecycle tracking with reconnect stitching
//! - Blob batching and single-flight upload delivery
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through a two-stage batch pipeline:
//! - **Accumulate:** the tracker appends events to the local queue
//! - **Cut:** an upload call claims all eligible events into an immutable blob
//! - **Deliver:** the blob is gzipped LDJSON, POSTed, and garbage-collected
//!   only after a confirmed non-5xx response
//!
//! ## Example
//!
//! ```rust,no_run
//! use emberline_core::{Config, Database, SessionTracker};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let tracker = SessionTracker::new(db, "em_live_abc123", &config.tracker)
//!     .expect("failed to create tracker");
//! tracker.open_session().expect("failed to open session");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{Database, QueueStats};
pub use error::{Error, Result};
pub use tracker::{OpenOutcome, SessionTracker};
pub use types::*;
pub use upload::{SyncUploader, UploadRun, UploadStats, Uploader};

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod tracker;
pub mod types;
pub mod upload;
