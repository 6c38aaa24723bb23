//! Persistence seam for the scheduler.
//!
//! Status lists passed to the guarded methods are the statuses the change
//! may start from. `None` means the guard did not match.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use webhook_database::queries::{self, FailureUpdate};
use webhook_database::{
    AsyncDatabase, DatabaseResult, DeliveryStats, DeliveryStatus, EventFilter, NewWebhookEvent,
    UpsertOutcome, WebhookEvent,
};

/// Storage operations the scheduler relies on.
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Insert, or merge into the active row holding the same key.
    async fn upsert(
        &self,
        event: NewWebhookEvent,
        now: DateTime<Utc>,
    ) -> DatabaseResult<(WebhookEvent, UpsertOutcome)>;

    async fn get(&self, id: &str) -> DatabaseResult<Option<WebhookEvent>>;

    async fn find_by_idempotency_key(&self, key: &str) -> DatabaseResult<Option<WebhookEvent>>;

    /// Every row stored under `key`, deleted ones included.
    async fn key_history(&self, key: &str) -> DatabaseResult<Vec<WebhookEvent>>;

    async fn list(&self, filter: EventFilter) -> DatabaseResult<Vec<WebhookEvent>>;

    async fn stats(&self) -> DatabaseResult<DeliveryStats>;

    /// Atomically move the earliest due row to PROCESSING.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        claimable: Vec<DeliveryStatus>,
    ) -> DatabaseResult<Option<WebhookEvent>>;

    async fn claim_due_batch(
        &self,
        now: DateTime<Utc>,
        claimable: Vec<DeliveryStatus>,
        limit: usize,
    ) -> DatabaseResult<Vec<WebhookEvent>>;

    async fn mark_delivered(
        &self,
        id: &str,
        from: Vec<DeliveryStatus>,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>>;

    async fn mark_failed(
        &self,
        id: &str,
        from: Vec<DeliveryStatus>,
        expected_retry_count: u32,
        update: FailureUpdate,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>>;

    async fn transition(
        &self,
        id: &str,
        from: Vec<DeliveryStatus>,
        to: DeliveryStatus,
        reset_retries: bool,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>>;

    async fn recover_stale_claims(
        &self,
        from: Vec<DeliveryStatus>,
        to: DeliveryStatus,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DatabaseResult<usize>;

    async fn set_deleted(
        &self,
        id: &str,
        deleted: bool,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>>;

    /// Hard-delete soft-deleted rows created before `cutoff`.
    async fn purge_deleted_before(&self, cutoff: DateTime<Utc>) -> DatabaseResult<usize>;
}

#[async_trait]
impl WebhookEventStore for AsyncDatabase {
    async fn upsert(
        &self,
        event: NewWebhookEvent,
        now: DateTime<Utc>,
    ) -> DatabaseResult<(WebhookEvent, UpsertOutcome)> {
        self.call(move |conn| queries::upsert_event(conn, &event, now))
            .await
    }

    async fn get(&self, id: &str) -> DatabaseResult<Option<WebhookEvent>> {
        let id = id.to_string();
        self.call(move |conn| queries::get_event(conn, &id)).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> DatabaseResult<Option<WebhookEvent>> {
        let key = key.to_string();
        self.call(move |conn| queries::find_by_idempotency_key(conn, &key))
            .await
    }

    async fn key_history(&self, key: &str) -> DatabaseResult<Vec<WebhookEvent>> {
        let key = key.to_string();
        self.call(move |conn| queries::list_key_history(conn, &key))
            .await
    }

    async fn list(&self, filter: EventFilter) -> DatabaseResult<Vec<WebhookEvent>> {
        self.call(move |conn| queries::list_events(conn, &filter))
            .await
    }

    async fn stats(&self) -> DatabaseResult<DeliveryStats> {
        self.call(|conn| queries::delivery_stats(conn)).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        claimable: Vec<DeliveryStatus>,
    ) -> DatabaseResult<Option<WebhookEvent>> {
        self.call(move |conn| queries::claim_due(conn, now, &claimable))
            .await
    }

    async fn claim_due_batch(
        &self,
        now: DateTime<Utc>,
        claimable: Vec<DeliveryStatus>,
        limit: usize,
    ) -> DatabaseResult<Vec<WebhookEvent>> {
        self.call(move |conn| queries::claim_due_batch(conn, now, &claimable, limit))
            .await
    }

    async fn mark_delivered(
        &self,
        id: &str,
        from: Vec<DeliveryStatus>,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>> {
        let id = id.to_string();
        self.call(move |conn| queries::mark_delivered(conn, &id, &from, now))
            .await
    }

    async fn mark_failed(
        &self,
        id: &str,
        from: Vec<DeliveryStatus>,
        expected_retry_count: u32,
        update: FailureUpdate,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>> {
        let id = id.to_string();
        self.call(move |conn| {
            queries::mark_failed(conn, &id, &from, expected_retry_count, &update, now)
        })
        .await
    }

    async fn transition(
        &self,
        id: &str,
        from: Vec<DeliveryStatus>,
        to: DeliveryStatus,
        reset_retries: bool,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>> {
        let id = id.to_string();
        self.call(move |conn| queries::transition(conn, &id, &from, to, reset_retries, now))
            .await
    }

    async fn recover_stale_claims(
        &self,
        from: Vec<DeliveryStatus>,
        to: DeliveryStatus,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DatabaseResult<usize> {
        self.call(move |conn| queries::recover_stale_claims(conn, &from, to, stale_before, now))
            .await
    }

    async fn set_deleted(
        &self,
        id: &str,
        deleted: bool,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Option<WebhookEvent>> {
        let id = id.to_string();
        self.call(move |conn| queries::set_deleted(conn, &id, deleted, now))
            .await
    }

    async fn purge_deleted_before(&self, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
        self.call(move |conn| queries::purge_deleted_before(conn, cutoff))
            .await
    }
}
