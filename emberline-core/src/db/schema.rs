//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Accounts
    -- ============================================

    CREATE TABLE IF NOT EXISTS accounts (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        api_key          TEXT NOT NULL UNIQUE,
        install_id       TEXT NOT NULL,
        opted_out        INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    -- ============================================
    -- Durable event queue
    -- ============================================

    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        account_id       INTEGER NOT NULL REFERENCES accounts(id),
        started_at       DATETIME NOT NULL,

        -- Device/network attributes snapshotted at open
        metadata         JSON
    );

    CREATE TABLE IF NOT EXISTS events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id       INTEGER NOT NULL REFERENCES accounts(id),
        session_id       TEXT REFERENCES sessions(id),
        kind             TEXT NOT NULL,
        name             TEXT,
        wall_time        DATETIME NOT NULL,
        elapsed_ms       INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS event_attributes (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id         INTEGER NOT NULL REFERENCES events(id),
        attr_key         TEXT NOT NULL,
        attr_value       TEXT NOT NULL
    );

    -- ============================================
    -- Upload batching
    -- ============================================

    CREATE TABLE IF NOT EXISTS upload_blobs (
        id               TEXT PRIMARY KEY,
        account_id       INTEGER NOT NULL REFERENCES accounts(id),
        seq              INTEGER NOT NULL,
        created_at       DATETIME NOT NULL,

        UNIQUE(account_id, seq)
    );

    -- Join table: which events were claimed by which blob.
    -- The UNIQUE(event_id) constraint is what makes "an event belongs to
    -- exactly one blob once batched" a database invariant.
    CREATE TABLE IF NOT EXISTS upload_blob_events (
        blob_id          TEXT NOT NULL REFERENCES upload_blobs(id),
        event_id         INTEGER NOT NULL REFERENCES events(id),

        PRIMARY KEY (blob_id, event_id),
        UNIQUE(event_id)
    );

    -- ============================================
    -- Event history markers
    -- ============================================

    CREATE TABLE IF NOT EXISTS event_history (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        kind             TEXT NOT NULL,
        name             TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        processed_in_blob TEXT REFERENCES upload_blobs(id)
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id);
    CREATE INDEX IF NOT EXISTS idx_events_account ON events(account_id);
    CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
    CREATE INDEX IF NOT EXISTS idx_event_attributes_event ON event_attributes(event_id);
    CREATE INDEX IF NOT EXISTS idx_event_history_session ON event_history(session_id);
    CREATE INDEX IF NOT EXISTS idx_event_history_blob ON event_history(processed_in_blob);
    CREATE INDEX IF NOT EXISTS idx_upload_blobs_account ON upload_blobs(account_id, seq);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
