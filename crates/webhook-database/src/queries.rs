//! Standalone query functions over `webhook_events`.
//!
//! Each function takes a `&Connection`, so the same code runs under the sync
//! [`crate::Database`] and inside [`crate::AsyncDatabase::call`].
//!
//! Timestamps are stored as RFC 3339 UTC with millisecond precision, which
//! sorts lexicographically in time order.

use crate::{
    DatabaseError, DatabaseResult, DeletedFilter, DeliveryStats, DeliveryStatus, EventFilter,
    NewWebhookEvent, UpsertOutcome, WebhookEvent,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

macro_rules! event_columns {
    () => {
        "id, idempotency_key, event_type, payload, transaction_id, status, retry_count, \
         max_retries, next_retry_at, delivered_at, last_error, created_at, updated_at, is_deleted"
    };
}

/// Due rows: PENDING with nothing scheduled, or anything scheduled at or
/// before `?1`. Exhausted FAILED rows have no schedule and never match.
macro_rules! due_condition {
    () => {
        "is_deleted = 0
           AND status IN (SELECT value FROM json_each(?2))
           AND ((next_retry_at IS NULL AND status = 'pending') OR next_retry_at <= ?1)"
    };
}

// ==========================================
// Create / read
// ==========================================

/// Insert a PENDING event, or merge into the active row holding the same
/// idempotency key.
///
/// A merge refreshes `event_type`, `payload`, `transaction_id` (when given)
/// and `updated_at`. Status, retry bookkeeping and the key are left alone.
pub fn upsert_event(
    conn: &Connection,
    event: &NewWebhookEvent,
    now: DateTime<Utc>,
) -> DatabaseResult<(WebhookEvent, UpsertOutcome)> {
    let id = Uuid::new_v4().to_string();
    let now = format_timestamp(now);

    let mut stmt = conn.prepare_cached(concat!(
        "INSERT INTO webhook_events (id, idempotency_key, event_type, payload, transaction_id,
                                     status, retry_count, max_retries, created_at, updated_at, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?7, 0)
         ON CONFLICT(idempotency_key) WHERE is_deleted = 0 DO UPDATE SET
             event_type = excluded.event_type,
             payload = excluded.payload,
             transaction_id = COALESCE(excluded.transaction_id, webhook_events.transaction_id),
             updated_at = excluded.updated_at
         RETURNING ",
        event_columns!()
    ))?;

    let stored = stmt.query_row(
        params![
            id,
            event.idempotency_key,
            event.event_type,
            event.payload,
            event.transaction_id,
            event.max_retries,
            now,
        ],
        event_from_row,
    )?;

    let outcome = if stored.id == id {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Merged
    };
    debug!(event_id = %stored.id, key = %stored.idempotency_key, ?outcome, "Upserted webhook event");
    Ok((stored, outcome))
}

/// Get an event by ID, deleted or not.
pub fn get_event(conn: &Connection, id: &str) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        event_columns!(),
        " FROM webhook_events WHERE id = ?1"
    ))?;
    Ok(stmt.query_row(params![id], event_from_row).optional()?)
}

/// Get the active (non-deleted) event holding an idempotency key.
pub fn find_by_idempotency_key(
    conn: &Connection,
    idempotency_key: &str,
) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        event_columns!(),
        " FROM webhook_events WHERE idempotency_key = ?1 AND is_deleted = 0"
    ))?;
    Ok(stmt.query_row(params![idempotency_key], event_from_row).optional()?)
}

/// Every row ever stored under a key, oldest first.
pub fn list_key_history(
    conn: &Connection,
    idempotency_key: &str,
) -> DatabaseResult<Vec<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        event_columns!(),
        " FROM webhook_events WHERE idempotency_key = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let events = stmt
        .query_map(params![idempotency_key], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// List events matching a filter.
pub fn list_events(conn: &Connection, filter: &EventFilter) -> DatabaseResult<Vec<WebhookEvent>> {
    let sql = format!(
        concat!(
            "SELECT ",
            event_columns!(),
            " FROM webhook_events
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR is_deleted = ?2)
             ORDER BY {}
             LIMIT ?3"
        ),
        filter.order.as_sql()
    );

    let deleted: Option<bool> = match filter.deleted {
        DeletedFilter::ActiveOnly => Some(false),
        DeletedFilter::DeletedOnly => Some(true),
        DeletedFilter::All => None,
    };
    let limit: i64 = filter
        .limit
        .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));

    let mut stmt = conn.prepare_cached(&sql)?;
    let events = stmt
        .query_map(
            params![filter.status.map(|s| s.as_str()), deleted, limit],
            event_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Active row counts per status plus the soft-deleted total.
pub fn delivery_stats(conn: &Connection) -> DatabaseResult<DeliveryStats> {
    let mut stats = DeliveryStats::default();

    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*), SUM(CASE WHEN next_retry_at IS NULL THEN 1 ELSE 0 END)
         FROM webhook_events WHERE is_deleted = 0 GROUP BY status",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    for row in rows {
        let (status, count, unscheduled) = row?;
        let (count, unscheduled) = (count.max(0) as u64, unscheduled.max(0) as u64);
        match DeliveryStatus::parse(&status) {
            Some(DeliveryStatus::Pending) => stats.pending = count,
            Some(DeliveryStatus::Processing) => stats.processing = count,
            Some(DeliveryStatus::Delivered) => stats.delivered = count,
            Some(DeliveryStatus::Failed) => {
                stats.failed = count;
                stats.exhausted = unscheduled;
            }
            Some(DeliveryStatus::Cancelled) => stats.cancelled = count,
            None => {
                return Err(DatabaseError::InvalidData(format!(
                    "unknown delivery status '{status}'"
                )))
            }
        }
    }

    let deleted: i64 = conn.query_row(
        "SELECT COUNT(*) FROM webhook_events WHERE is_deleted = 1",
        [],
        |row| row.get(0),
    )?;
    stats.deleted = deleted.max(0) as u64;

    Ok(stats)
}

// ==========================================
// Claims
// ==========================================

/// Atomically move the earliest due event to PROCESSING.
///
/// `claimable` lists the statuses a claim may start from. Selection and
/// transition happen in one statement, so concurrent callers never receive
/// the same row.
pub fn claim_due(
    conn: &Connection,
    now: DateTime<Utc>,
    claimable: &[DeliveryStatus],
) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE webhook_events
         SET status = 'processing', next_retry_at = NULL, updated_at = ?1
         WHERE id = (
             SELECT id FROM webhook_events
             WHERE ",
        due_condition!(),
        "
             ORDER BY COALESCE(next_retry_at, created_at) ASC, created_at ASC
             LIMIT 1
         )
         RETURNING ",
        event_columns!()
    ))?;

    let claimed = stmt
        .query_row(
            params![format_timestamp(now), status_list(claimable)?],
            event_from_row,
        )
        .optional()?;

    if let Some(event) = &claimed {
        debug!(event_id = %event.id, retry_count = event.retry_count, "Claimed webhook event");
    }
    Ok(claimed)
}

/// Claim up to `limit` due events in one statement.
///
/// The earliest due rows are chosen; the returned batch is ordered by
/// creation time since pre-update schedules are not visible to `RETURNING`.
pub fn claim_due_batch(
    conn: &Connection,
    now: DateTime<Utc>,
    claimable: &[DeliveryStatus],
    limit: usize,
) -> DatabaseResult<Vec<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE webhook_events
         SET status = 'processing', next_retry_at = NULL, updated_at = ?1
         WHERE id IN (
             SELECT id FROM webhook_events
             WHERE ",
        due_condition!(),
        "
             ORDER BY COALESCE(next_retry_at, created_at) ASC, created_at ASC
             LIMIT ?3
         )
         RETURNING ",
        event_columns!()
    ))?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut claimed = stmt
        .query_map(
            params![format_timestamp(now), status_list(claimable)?, limit],
            event_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    debug!(count = claimed.len(), "Claimed webhook event batch");
    Ok(claimed)
}

// ==========================================
// Guarded transitions
// ==========================================

/// PROCESSING -> DELIVERED bookkeeping.
pub fn mark_delivered(
    conn: &Connection,
    id: &str,
    from: &[DeliveryStatus],
    now: DateTime<Utc>,
) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE webhook_events
         SET status = 'delivered', delivered_at = ?2, next_retry_at = NULL,
             last_error = NULL, updated_at = ?2
         WHERE id = ?1 AND status IN (SELECT value FROM json_each(?3))
         RETURNING ",
        event_columns!()
    ))?;
    Ok(stmt
        .query_row(
            params![id, format_timestamp(now), status_list(from)?],
            event_from_row,
        )
        .optional()?)
}

/// New retry bookkeeping written by [`mark_failed`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    pub reason: String,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Move to FAILED with new retry bookkeeping.
///
/// Guarded on the retry count the caller read, so two drivers recording an
/// outcome for the same claim cannot both advance it.
pub fn mark_failed(
    conn: &Connection,
    id: &str,
    from: &[DeliveryStatus],
    expected_retry_count: u32,
    update: &FailureUpdate,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE webhook_events
         SET status = 'failed', last_error = ?2, retry_count = ?3,
             next_retry_at = ?4, updated_at = ?5
         WHERE id = ?1 AND retry_count = ?6 AND status IN (SELECT value FROM json_each(?7))
         RETURNING ",
        event_columns!()
    ))?;
    Ok(stmt
        .query_row(
            params![
                id,
                update.reason,
                update.retry_count,
                update.next_retry_at.map(format_timestamp),
                format_timestamp(now),
                expected_retry_count,
                status_list(from)?,
            ],
            event_from_row,
        )
        .optional()?)
}

/// Move to `to`, clearing any scheduled retry. With `reset_retries` the
/// retry count returns to zero.
pub fn transition(
    conn: &Connection,
    id: &str,
    from: &[DeliveryStatus],
    to: DeliveryStatus,
    reset_retries: bool,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE webhook_events
         SET status = ?2, next_retry_at = NULL,
             retry_count = CASE WHEN ?3 THEN 0 ELSE retry_count END,
             updated_at = ?4
         WHERE id = ?1 AND status IN (SELECT value FROM json_each(?5))
         RETURNING ",
        event_columns!()
    ))?;
    Ok(stmt
        .query_row(
            params![
                id,
                to.as_str(),
                reset_retries,
                format_timestamp(now),
                status_list(from)?,
            ],
            event_from_row,
        )
        .optional()?)
}

/// Return claims untouched since `stale_before` to `to`.
pub fn recover_stale_claims(
    conn: &Connection,
    from: &[DeliveryStatus],
    to: DeliveryStatus,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE webhook_events
         SET status = ?1, next_retry_at = NULL, updated_at = ?2
         WHERE status IN (SELECT value FROM json_each(?3)) AND updated_at < ?4",
        params![
            to.as_str(),
            format_timestamp(now),
            status_list(from)?,
            format_timestamp(stale_before),
        ],
    )?;
    if count > 0 {
        debug!(count, "Recovered stale claims");
    }
    Ok(count)
}

// ==========================================
// Soft delete / cleanup
// ==========================================

/// Flip `is_deleted` from `!deleted` to `deleted`.
///
/// Restoring a row whose key is now held by another active row fails with
/// [`DatabaseError::Conflict`].
pub fn set_deleted(
    conn: &Connection,
    id: &str,
    deleted: bool,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<WebhookEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE webhook_events SET is_deleted = ?2, updated_at = ?3
         WHERE id = ?1 AND is_deleted = ?4
         RETURNING ",
        event_columns!()
    ))?;

    let result = stmt
        .query_row(
            params![id, deleted, format_timestamp(now), !deleted],
            event_from_row,
        )
        .optional()
        .map_err(DatabaseError::from);

    match result {
        Err(e) if !deleted && e.is_constraint_violation() => Err(DatabaseError::Conflict(
            format!("another active event holds the idempotency key of {id}"),
        )),
        other => other,
    }
}

/// Hard-delete soft-deleted rows created before `cutoff`.
pub fn purge_deleted_before(conn: &Connection, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM webhook_events WHERE is_deleted = 1 AND created_at < ?1",
        params![format_timestamp(cutoff)],
    )?;
    Ok(count)
}

// ==========================================
// Helpers
// ==========================================

/// Storage format for every timestamp column.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn status_list(statuses: &[DeliveryStatus]) -> DatabaseResult<String> {
    Ok(serde_json::to_string(statuses)?)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookEvent> {
    Ok(WebhookEvent {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        transaction_id: row.get(4)?,
        status: status_column(row, 5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        next_retry_at: optional_datetime_column(row, 8)?,
        delivered_at: optional_datetime_column(row, 9)?,
        last_error: row.get(10)?,
        created_at: datetime_column(row, 11)?,
        updated_at: datetime_column(row, 12)?,
        is_deleted: row.get(13)?,
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DeliveryStatus> {
    let value: String = row.get(idx)?;
    DeliveryStatus::parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown delivery status '{value}'").into(),
        )
    })
}

fn parse_datetime(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_datetime(idx, &value)
}

fn optional_datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|value| parse_datetime(idx, &value))
        .transpose()
}
