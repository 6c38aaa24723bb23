use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use tempfile::tempdir;
use webhook_database::queries::{self, FailureUpdate};
use webhook_database::{
    Database, DatabaseError, DeletedFilter, DeliveryStatus, EventFilter, EventOrder,
    NewWebhookEvent, UpsertOutcome,
};

const CLAIMABLE: &[DeliveryStatus] = &[DeliveryStatus::Pending, DeliveryStatus::Failed];
const PROCESSING: &[DeliveryStatus] = &[DeliveryStatus::Processing];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn new_event(key: &str) -> NewWebhookEvent {
    NewWebhookEvent::new(key, "order.created", format!(r#"{{"key":"{key}"}}"#), 3)
}

#[test]
fn upsert_merges_into_active_row() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (first, outcome) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    assert_eq!(outcome, UpsertOutcome::Inserted);
    assert_eq!(first.status, DeliveryStatus::Pending);
    assert_eq!(first.retry_count, 0);

    let update = NewWebhookEvent::new("k1", "order.updated", r#"{"v":2}"#, 9)
        .with_transaction_id("txn-7");
    let later = t0() + Duration::seconds(5);
    let (merged, outcome) = queries::upsert_event(conn, &update, later).unwrap();

    assert_eq!(outcome, UpsertOutcome::Merged);
    assert_eq!(merged.id, first.id);
    assert_eq!(merged.event_type, "order.updated");
    assert_eq!(merged.payload, r#"{"v":2}"#);
    assert_eq!(merged.transaction_id.as_deref(), Some("txn-7"));
    assert_eq!(merged.max_retries, 3);
    assert_eq!(merged.created_at, t0());
    assert_eq!(merged.updated_at, later);
}

#[test]
fn upsert_does_not_reopen_a_delivered_event() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    let claimed = queries::claim_due(conn, t0(), CLAIMABLE).unwrap().unwrap();
    queries::mark_delivered(conn, &claimed.id, PROCESSING, t0()).unwrap();

    let (merged, _) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    assert_eq!(merged.status, DeliveryStatus::Delivered);
}

#[test]
fn max_retries_above_ten_is_rejected() {
    let db = Database::open_in_memory().unwrap();
    let mut event = new_event("k1");
    event.max_retries = 11;

    let err = queries::upsert_event(db.connection(), &event, t0()).unwrap_err();
    assert!(err.is_constraint_violation());
}

#[test]
fn claim_picks_earliest_due_and_skips_future_retries() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (a, _) = queries::upsert_event(conn, &new_event("a"), t0()).unwrap();
    let (b, _) = queries::upsert_event(conn, &new_event("b"), t0() + Duration::seconds(1)).unwrap();

    // a fails and is rescheduled an hour out.
    queries::claim_due(conn, t0(), CLAIMABLE).unwrap().unwrap();
    queries::mark_failed(
        conn,
        &a.id,
        PROCESSING,
        0,
        &FailureUpdate {
            reason: "HTTP 503".into(),
            retry_count: 1,
            next_retry_at: Some(t0() + Duration::hours(1)),
        },
        t0(),
    )
    .unwrap()
    .unwrap();

    let now = t0() + Duration::seconds(10);
    let claimed = queries::claim_due(conn, now, CLAIMABLE).unwrap().unwrap();
    assert_eq!(claimed.id, b.id);
    assert_eq!(claimed.status, DeliveryStatus::Processing);

    assert!(queries::claim_due(conn, now, CLAIMABLE).unwrap().is_none());

    let retry = queries::claim_due(conn, t0() + Duration::hours(1), CLAIMABLE)
        .unwrap()
        .unwrap();
    assert_eq!(retry.id, a.id);
    assert_eq!(retry.next_retry_at, None);
    assert_eq!(retry.retry_count, 1);
}

#[test]
fn exhausted_failures_are_never_claimed() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (event, _) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    queries::claim_due(conn, t0(), CLAIMABLE).unwrap().unwrap();
    let failed = queries::mark_failed(
        conn,
        &event.id,
        PROCESSING,
        0,
        &FailureUpdate {
            reason: "HTTP 404".into(),
            retry_count: 0,
            next_retry_at: None,
        },
        t0(),
    )
    .unwrap()
    .unwrap();
    assert!(failed.is_exhausted());

    let far_future = t0() + Duration::days(365);
    assert!(queries::claim_due(conn, far_future, CLAIMABLE).unwrap().is_none());
}

#[test]
fn mark_failed_is_guarded_by_expected_retry_count() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (event, _) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    queries::claim_due(conn, t0(), CLAIMABLE).unwrap().unwrap();

    let update = FailureUpdate {
        reason: "timeout".into(),
        retry_count: 1,
        next_retry_at: Some(t0() + Duration::seconds(2)),
    };
    let stale = queries::mark_failed(conn, &event.id, PROCESSING, 5, &update, t0()).unwrap();
    assert!(stale.is_none());

    let applied = queries::mark_failed(conn, &event.id, PROCESSING, 0, &update, t0())
        .unwrap()
        .unwrap();
    assert_eq!(applied.last_error.as_deref(), Some("timeout"));

    // Already FAILED, not PROCESSING.
    let again = queries::mark_failed(conn, &event.id, PROCESSING, 1, &update, t0()).unwrap();
    assert!(again.is_none());
}

#[test]
fn transition_respects_guard_and_resets_retries() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (event, _) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    queries::claim_due(conn, t0(), CLAIMABLE).unwrap().unwrap();
    queries::mark_failed(
        conn,
        &event.id,
        PROCESSING,
        0,
        &FailureUpdate {
            reason: "HTTP 500".into(),
            retry_count: 1,
            next_retry_at: Some(t0() + Duration::minutes(1)),
        },
        t0(),
    )
    .unwrap()
    .unwrap();

    let denied = queries::transition(
        conn,
        &event.id,
        PROCESSING,
        DeliveryStatus::Pending,
        false,
        t0(),
    )
    .unwrap();
    assert!(denied.is_none());

    let restarted = queries::transition(
        conn,
        &event.id,
        &[DeliveryStatus::Failed],
        DeliveryStatus::Pending,
        true,
        t0(),
    )
    .unwrap()
    .unwrap();
    assert_eq!(restarted.status, DeliveryStatus::Pending);
    assert_eq!(restarted.retry_count, 0);
    assert_eq!(restarted.next_retry_at, None);
}

#[test]
fn soft_deleted_rows_free_the_key_and_block_restore() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (old, _) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    let deleted = queries::set_deleted(conn, &old.id, true, t0()).unwrap().unwrap();
    assert!(deleted.is_deleted);
    assert!(queries::find_by_idempotency_key(conn, "k1").unwrap().is_none());

    // Deleting twice matches nothing.
    assert!(queries::set_deleted(conn, &old.id, true, t0()).unwrap().is_none());

    let (fresh, outcome) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    assert_eq!(outcome, UpsertOutcome::Inserted);
    assert_ne!(fresh.id, old.id);

    let err = queries::set_deleted(conn, &old.id, false, t0()).unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));

    let history = queries::list_key_history(conn, "k1").unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn soft_deleted_rows_are_not_claimed() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (event, _) = queries::upsert_event(conn, &new_event("k1"), t0()).unwrap();
    queries::set_deleted(conn, &event.id, true, t0()).unwrap();

    assert!(queries::claim_due(conn, t0(), CLAIMABLE).unwrap().is_none());

    queries::set_deleted(conn, &event.id, false, t0()).unwrap().unwrap();
    assert!(queries::claim_due(conn, t0(), CLAIMABLE).unwrap().is_some());
}

#[test]
fn purge_only_removes_old_soft_deleted_rows() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (old_deleted, _) = queries::upsert_event(conn, &new_event("a"), t0()).unwrap();
    let (old_active, _) = queries::upsert_event(conn, &new_event("b"), t0()).unwrap();
    let recent = t0() + Duration::days(10);
    let (new_deleted, _) = queries::upsert_event(conn, &new_event("c"), recent).unwrap();

    queries::set_deleted(conn, &old_deleted.id, true, recent).unwrap();
    queries::set_deleted(conn, &new_deleted.id, true, recent).unwrap();

    let purged = queries::purge_deleted_before(conn, t0() + Duration::days(5)).unwrap();
    assert_eq!(purged, 1);

    assert!(queries::get_event(conn, &old_deleted.id).unwrap().is_none());
    assert!(queries::get_event(conn, &old_active.id).unwrap().is_some());
    assert!(queries::get_event(conn, &new_deleted.id).unwrap().is_some());
}

#[test]
fn recover_stale_claims_only_touches_old_processing_rows() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    queries::upsert_event(conn, &new_event("a"), t0()).unwrap();
    queries::upsert_event(conn, &new_event("b"), t0()).unwrap();
    let stale = queries::claim_due(conn, t0(), CLAIMABLE).unwrap().unwrap();
    let fresh = queries::claim_due(conn, t0() + Duration::minutes(9), CLAIMABLE)
        .unwrap()
        .unwrap();

    let now = t0() + Duration::minutes(10);
    let recovered = queries::recover_stale_claims(
        conn,
        PROCESSING,
        DeliveryStatus::Pending,
        now - Duration::minutes(5),
        now,
    )
    .unwrap();
    assert_eq!(recovered, 1);

    let stale = queries::get_event(conn, &stale.id).unwrap().unwrap();
    let fresh = queries::get_event(conn, &fresh.id).unwrap().unwrap();
    assert_eq!(stale.status, DeliveryStatus::Pending);
    assert_eq!(fresh.status, DeliveryStatus::Processing);
}

#[test]
fn list_filters_and_orders() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (a, _) = queries::upsert_event(conn, &new_event("a"), t0()).unwrap();
    let (b, _) = queries::upsert_event(conn, &new_event("b"), t0() + Duration::seconds(1)).unwrap();
    let (c, _) = queries::upsert_event(conn, &new_event("c"), t0() + Duration::seconds(2)).unwrap();
    queries::set_deleted(conn, &b.id, true, t0() + Duration::seconds(3)).unwrap();
    queries::claim_due(conn, t0() + Duration::seconds(4), CLAIMABLE).unwrap();

    let ids = |filter: EventFilter| -> Vec<String> {
        queries::list_events(conn, &filter)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    };

    assert_eq!(ids(EventFilter::default()), vec![a.id.clone(), c.id.clone()]);
    assert_eq!(
        ids(EventFilter::default().order_by(EventOrder::CreatedDesc)),
        vec![c.id.clone(), a.id.clone()]
    );
    assert_eq!(
        ids(EventFilter::default().deleted(DeletedFilter::DeletedOnly)),
        vec![b.id.clone()]
    );
    assert_eq!(ids(EventFilter::default().deleted(DeletedFilter::All).limit(2)).len(), 2);
    assert_eq!(
        ids(EventFilter::default().with_status(DeliveryStatus::Processing)),
        vec![a.id.clone()]
    );
    assert_eq!(
        ids(EventFilter::default().order_by(EventOrder::UpdatedDesc)),
        vec![a.id, c.id]
    );
}

#[test]
fn stats_count_active_rows_by_status() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    let (a, _) = queries::upsert_event(conn, &new_event("a"), t0()).unwrap();
    let (b, _) = queries::upsert_event(conn, &new_event("b"), t0()).unwrap();
    queries::upsert_event(conn, &new_event("c"), t0() + Duration::seconds(1)).unwrap();
    queries::set_deleted(conn, &b.id, true, t0()).unwrap();
    queries::claim_due(conn, t0(), CLAIMABLE).unwrap();
    queries::mark_failed(
        conn,
        &a.id,
        PROCESSING,
        0,
        &FailureUpdate {
            reason: "HTTP 400".into(),
            retry_count: 0,
            next_retry_at: None,
        },
        t0(),
    )
    .unwrap()
    .unwrap();

    let stats = queries::delivery_stats(conn).unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.active_total(), 2);
}

#[test]
fn batch_claim_respects_limit() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.connection();

    for n in 0..5 {
        queries::upsert_event(conn, &new_event(&format!("k{n}")), t0() + Duration::seconds(n))
            .unwrap();
    }

    let first = queries::claim_due_batch(conn, t0() + Duration::minutes(1), CLAIMABLE, 3).unwrap();
    assert_eq!(first.len(), 3);
    let keys: Vec<_> = first.iter().map(|e| e.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["k0", "k1", "k2"]);

    let rest = queries::claim_due_batch(conn, t0() + Duration::minutes(1), CLAIMABLE, 10).unwrap();
    assert_eq!(rest.len(), 2);
}

#[test]
fn concurrent_claims_across_connections_never_double_claim() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("courier.sqlite");

    {
        let db = Database::open(&path).unwrap();
        for n in 0..40 {
            queries::upsert_event(db.connection(), &new_event(&format!("k{n}")), t0()).unwrap();
        }
    }

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let db = Database::open(&path).unwrap();
                barrier.wait();
                let mut claimed = Vec::new();
                while let Some(event) =
                    queries::claim_due(db.connection(), t0() + Duration::seconds(1), CLAIMABLE)
                        .unwrap()
                {
                    claimed.push(event.id);
                }
                claimed
            })
        })
        .collect();

    let all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: HashSet<&String> = all.iter().collect();

    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}
