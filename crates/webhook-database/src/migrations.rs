//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_webhook_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_retry_indexes(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: webhook_events with one active row per idempotency key.
fn migrate_v1_webhook_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: webhook events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            transaction_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'delivered', 'failed', 'cancelled')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            next_retry_at TEXT,
            delivered_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            CHECK (retry_count >= 0 AND retry_count <= max_retries AND max_retries <= 10)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_webhook_events_active_key
            ON webhook_events(idempotency_key) WHERE is_deleted = 0;
        CREATE INDEX IF NOT EXISTS idx_webhook_events_created_at
            ON webhook_events(created_at);
        ",
    )?;

    record_migration(conn, 1, "webhook_events")?;
    Ok(())
}

/// V2: indexes for due-claim scans and stale-claim recovery.
fn migrate_v2_retry_indexes(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: retry indexes");

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_webhook_events_due
            ON webhook_events(status, next_retry_at) WHERE is_deleted = 0;
        CREATE INDEX IF NOT EXISTS idx_webhook_events_status_updated
            ON webhook_events(status, updated_at);
        ",
    )?;

    record_migration(conn, 2, "retry_indexes")?;
    Ok(())
}
