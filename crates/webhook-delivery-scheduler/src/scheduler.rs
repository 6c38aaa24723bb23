//! Webhook delivery scheduler.
//!
//! Owns the lifecycle of persisted webhook events: idempotent creation,
//! atomic claims of due work, outcome bookkeeping with a backoff schedule,
//! soft delete and retention cleanup. Every status change goes through the
//! delivery machine in [`crate::fsm`] and lands as one guarded update.

use crate::fsm::{self, DeliveryInput};
use crate::store::WebhookEventStore;
use crate::{SchedulerError, SchedulerResult};
use chrono::{DateTime, Utc};
use classified_retry::RetryPolicy;
use courier_config_and_utils::{SharedClock, SystemClock, MAX_REDELIVERY_RETRIES};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webhook_database::queries::FailureUpdate;
use webhook_database::{
    DatabaseError, DeliveryStats, EventFilter, NewWebhookEvent, UpsertOutcome, WebhookEvent,
};

/// Persisted redelivery scheduler.
///
/// Cheap to share behind an `Arc`; holds no state besides its store, clock
/// and backoff schedule.
pub struct WebhookDeliveryScheduler {
    store: Arc<dyn WebhookEventStore>,
    clock: SharedClock,
    backoff: RetryPolicy,
}

impl fmt::Debug for WebhookDeliveryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDeliveryScheduler")
            .field("clock", &self.clock)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl WebhookDeliveryScheduler {
    /// Scheduler on the system clock.
    ///
    /// `backoff` spaces redeliveries; its `max_retries` is unused since each
    /// event carries its own.
    pub fn new(store: Arc<dyn WebhookEventStore>, backoff: RetryPolicy) -> Self {
        Self::with_clock(store, backoff, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn WebhookEventStore>,
        backoff: RetryPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            clock,
            backoff,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn backoff(&self) -> &RetryPolicy {
        &self.backoff
    }

    // ==========================================
    // Creation
    // ==========================================

    /// Create a PENDING event, or merge into the active event holding the
    /// same idempotency key.
    ///
    /// A soft-deleted event never absorbs a create: the key is free again
    /// and a fresh row is inserted next to the deleted one.
    pub async fn create(
        &self,
        event: NewWebhookEvent,
    ) -> SchedulerResult<(WebhookEvent, UpsertOutcome)> {
        validate_new_event(&event)?;

        let (stored, outcome) = self.store.upsert(event, self.clock.now()).await?;
        match outcome {
            UpsertOutcome::Inserted => info!(
                event_id = %stored.id,
                key = %stored.idempotency_key,
                event_type = %stored.event_type,
                "Webhook event created"
            ),
            UpsertOutcome::Merged => debug!(
                event_id = %stored.id,
                key = %stored.idempotency_key,
                status = %stored.status,
                "Webhook event merged into active key"
            ),
        }
        Ok((stored, outcome))
    }

    // ==========================================
    // Claims
    // ==========================================

    /// Claim the earliest due event as of the scheduler clock.
    pub async fn claim_due(&self) -> SchedulerResult<Option<WebhookEvent>> {
        self.claim_due_at(self.clock.now()).await
    }

    /// Claim the earliest event due at `now`, moving it to PROCESSING.
    pub async fn claim_due_at(&self, now: DateTime<Utc>) -> SchedulerResult<Option<WebhookEvent>> {
        let guard = guard_for(DeliveryInput::Claim)?;
        Ok(self.store.claim_due(now, guard.from).await?)
    }

    /// Claim up to `limit` due events at once.
    pub async fn claim_due_batch(&self, limit: usize) -> SchedulerResult<Vec<WebhookEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let guard = guard_for(DeliveryInput::Claim)?;
        let claimed = self
            .store
            .claim_due_batch(self.clock.now(), guard.from, limit)
            .await?;
        Ok(claimed)
    }

    // ==========================================
    // Outcomes
    // ==========================================

    /// PROCESSING -> DELIVERED.
    pub async fn record_success(&self, id: &str) -> SchedulerResult<WebhookEvent> {
        let guard = guard_for(DeliveryInput::Succeed)?;
        match self
            .store
            .mark_delivered(id, guard.from, self.clock.now())
            .await?
        {
            Some(event) => {
                info!(event_id = %event.id, retry_count = event.retry_count, "Webhook delivered");
                Ok(event)
            }
            None => Err(self.rejection(id, DeliveryInput::Succeed).await),
        }
    }

    /// PROCESSING -> FAILED, scheduling the next attempt while retries
    /// remain.
    ///
    /// With retries left the count goes up by one and the next attempt is
    /// due after `backoff(previous count)`. Once the count has reached the
    /// event's `max_retries`, nothing is scheduled and the count stays put.
    pub async fn record_failure(&self, id: &str, reason: &str) -> SchedulerResult<WebhookEvent> {
        let current = self.require_accepts(id, DeliveryInput::Fail).await?;
        let now = self.clock.now();

        let update = if current.retry_count < current.max_retries {
            let delay = self.backoff.delay_for_attempt(current.retry_count);
            FailureUpdate {
                reason: reason.to_string(),
                retry_count: current.retry_count + 1,
                next_retry_at: Some(schedule_after(now, delay)?),
            }
        } else {
            FailureUpdate {
                reason: reason.to_string(),
                retry_count: current.retry_count,
                next_retry_at: None,
            }
        };

        let event = self.write_failure(&current, update, now).await?;
        match event.next_retry_at {
            Some(next_retry_at) => warn!(
                event_id = %event.id,
                retry_count = event.retry_count,
                max_retries = event.max_retries,
                next_retry_at = %next_retry_at,
                error = %reason,
                "Webhook delivery failed, redelivery scheduled"
            ),
            None => warn!(
                event_id = %event.id,
                retry_count = event.retry_count,
                error = %reason,
                "Webhook delivery retries exhausted"
            ),
        }
        Ok(event)
    }

    /// PROCESSING -> FAILED with nothing scheduled, for failures no retry
    /// can fix.
    pub async fn record_permanent_failure(
        &self,
        id: &str,
        reason: &str,
    ) -> SchedulerResult<WebhookEvent> {
        let current = self.require_accepts(id, DeliveryInput::Fail).await?;
        let now = self.clock.now();
        let update = FailureUpdate {
            reason: reason.to_string(),
            retry_count: current.retry_count,
            next_retry_at: None,
        };

        let event = self.write_failure(&current, update, now).await?;
        warn!(event_id = %event.id, error = %reason, "Webhook delivery failed permanently");
        Ok(event)
    }

    // ==========================================
    // Manual transitions
    // ==========================================

    /// Any non-terminal status -> CANCELLED.
    pub async fn cancel(&self, id: &str) -> SchedulerResult<WebhookEvent> {
        let event = self.apply(id, DeliveryInput::Cancel, false).await?;
        info!(event_id = %event.id, "Webhook event cancelled");
        Ok(event)
    }

    /// Hand a claimed event back: PROCESSING -> PENDING, due immediately.
    /// The retry count is kept.
    pub async fn release(&self, id: &str) -> SchedulerResult<WebhookEvent> {
        let event = self.apply(id, DeliveryInput::Release, false).await?;
        debug!(event_id = %event.id, "Webhook claim released");
        Ok(event)
    }

    /// FAILED -> PENDING with the retry count reset to zero.
    pub async fn restart(&self, id: &str) -> SchedulerResult<WebhookEvent> {
        let event = self.apply(id, DeliveryInput::Restart, true).await?;
        info!(event_id = %event.id, "Webhook event restarted");
        Ok(event)
    }

    /// Return PROCESSING events untouched for `older_than` to PENDING.
    ///
    /// Claims held by a driver that died never resolve on their own.
    pub async fn recover_stale_claims(&self, older_than: Duration) -> SchedulerResult<usize> {
        let guard = guard_for(DeliveryInput::Release)?;
        let now = self.clock.now();
        let stale_before = schedule_before(now, older_than)?;

        let recovered = self
            .store
            .recover_stale_claims(guard.from, guard.to, stale_before, now)
            .await?;
        if recovered > 0 {
            warn!(recovered, "Recovered stale webhook claims");
        }
        Ok(recovered)
    }

    // ==========================================
    // Soft delete / retention
    // ==========================================

    /// Hide an event from claims and active listings. Deleting an already
    /// deleted event returns it unchanged.
    pub async fn soft_delete(&self, id: &str) -> SchedulerResult<WebhookEvent> {
        if let Some(event) = self.store.set_deleted(id, true, self.clock.now()).await? {
            info!(event_id = %event.id, status = %event.status, "Webhook event soft-deleted");
            return Ok(event);
        }
        match self.store.get(id).await? {
            Some(event) if event.is_deleted => Ok(event),
            _ => Err(SchedulerError::NotFound(id.to_string())),
        }
    }

    /// Undo [`Self::soft_delete`].
    ///
    /// Fails with [`SchedulerError::KeyConflict`] when a newer active event
    /// took over the key in the meantime.
    pub async fn restore(&self, id: &str) -> SchedulerResult<WebhookEvent> {
        let restored = match self.store.set_deleted(id, false, self.clock.now()).await {
            Ok(restored) => restored,
            Err(DatabaseError::Conflict(message)) => {
                return Err(SchedulerError::KeyConflict(message))
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(event) = restored {
            info!(event_id = %event.id, "Webhook event restored");
            return Ok(event);
        }
        match self.store.get(id).await? {
            Some(event) if !event.is_deleted => Ok(event),
            _ => Err(SchedulerError::NotFound(id.to_string())),
        }
    }

    /// Hard-delete soft-deleted events created before `cutoff`. Active
    /// events are never touched.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<usize> {
        let purged = self.store.purge_deleted_before(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged soft-deleted webhook events");
        }
        Ok(purged)
    }

    // ==========================================
    // Queries
    // ==========================================

    pub async fn get(&self, id: &str) -> SchedulerResult<Option<WebhookEvent>> {
        Ok(self.store.get(id).await?)
    }

    /// The active event holding `key`, if any.
    pub async fn find_by_idempotency_key(&self, key: &str) -> SchedulerResult<Option<WebhookEvent>> {
        Ok(self.store.find_by_idempotency_key(key).await?)
    }

    /// Every event ever stored under `key`, deleted ones included.
    pub async fn key_history(&self, key: &str) -> SchedulerResult<Vec<WebhookEvent>> {
        Ok(self.store.key_history(key).await?)
    }

    pub async fn list(&self, filter: EventFilter) -> SchedulerResult<Vec<WebhookEvent>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn stats(&self) -> SchedulerResult<DeliveryStats> {
        Ok(self.store.stats().await?)
    }

    // ==========================================
    // Helpers
    // ==========================================

    async fn apply(
        &self,
        id: &str,
        input: DeliveryInput,
        reset_retries: bool,
    ) -> SchedulerResult<WebhookEvent> {
        let guard = guard_for(input)?;
        match self
            .store
            .transition(id, guard.from, guard.to, reset_retries, self.clock.now())
            .await?
        {
            Some(event) => Ok(event),
            None => Err(self.rejection(id, input).await),
        }
    }

    /// Load the event and check its status accepts `input`.
    async fn require_accepts(
        &self,
        id: &str,
        input: DeliveryInput,
    ) -> SchedulerResult<WebhookEvent> {
        let event = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if fsm::next_status(event.status, input).is_none() {
            return Err(invalid_transition(&event, input));
        }
        Ok(event)
    }

    async fn write_failure(
        &self,
        current: &WebhookEvent,
        update: FailureUpdate,
        now: DateTime<Utc>,
    ) -> SchedulerResult<WebhookEvent> {
        let guard = guard_for(DeliveryInput::Fail)?;
        self.store
            .mark_failed(&current.id, guard.from, current.retry_count, update, now)
            .await?
            .ok_or_else(|| {
                // Another driver recorded an outcome between our read and write.
                SchedulerError::InvalidTransition {
                    id: current.id.clone(),
                    status: current.status,
                    action: fsm::action_name(DeliveryInput::Fail),
                }
            })
    }

    /// Explain why a guarded update matched nothing.
    async fn rejection(&self, id: &str, input: DeliveryInput) -> SchedulerError {
        match self.store.get(id).await {
            Ok(Some(event)) => invalid_transition(&event, input),
            Ok(None) => SchedulerError::NotFound(id.to_string()),
            Err(e) => e.into(),
        }
    }
}

fn guard_for(input: DeliveryInput) -> SchedulerResult<fsm::Guard> {
    fsm::guard(input).ok_or_else(|| {
        SchedulerError::Validation(format!("no status accepts {}", fsm::action_name(input)))
    })
}

fn invalid_transition(event: &WebhookEvent, input: DeliveryInput) -> SchedulerError {
    SchedulerError::InvalidTransition {
        id: event.id.clone(),
        status: event.status,
        action: fsm::action_name(input),
    }
}

fn validate_new_event(event: &NewWebhookEvent) -> SchedulerResult<()> {
    if event.idempotency_key.trim().is_empty() {
        return Err(SchedulerError::Validation(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if event.event_type.trim().is_empty() {
        return Err(SchedulerError::Validation(
            "event type must not be empty".to_string(),
        ));
    }
    if event.max_retries > MAX_REDELIVERY_RETRIES {
        return Err(SchedulerError::Validation(format!(
            "max_retries must be at most {MAX_REDELIVERY_RETRIES}, got {}",
            event.max_retries
        )));
    }
    Ok(())
}

fn schedule_after(now: DateTime<Utc>, delay: Duration) -> SchedulerResult<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| SchedulerError::Validation(format!("retry delay {delay:?} out of range")))
}

fn schedule_before(now: DateTime<Utc>, age: Duration) -> SchedulerResult<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| SchedulerError::Validation(format!("age {age:?} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use courier_config_and_utils::ManualClock;
    use webhook_database::{AsyncDatabase, DeliveryStatus};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    async fn scheduler() -> (WebhookDeliveryScheduler, Arc<ManualClock>) {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let backoff = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
        );
        let scheduler = WebhookDeliveryScheduler::with_clock(Arc::new(db), backoff, clock.clone());
        (scheduler, clock)
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let (scheduler, _) = scheduler().await;

        let err = scheduler
            .create(NewWebhookEvent::new("  ", "order.created", "{}", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let err = scheduler
            .create(NewWebhookEvent::new("k", "", "{}", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let err = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 11))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_success_requires_claim() {
        let (scheduler, _) = scheduler().await;
        let (event, _) = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();

        let err = scheduler.record_success(&event.id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition {
                status: DeliveryStatus::Pending,
                ..
            }
        ));

        let err = scheduler.record_failure(&event.id, "boom").await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (scheduler, _) = scheduler().await;
        assert!(matches!(
            scheduler.cancel("missing").await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
        assert!(matches!(
            scheduler.record_failure("missing", "x").await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
        assert!(matches!(
            scheduler.soft_delete("missing").await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delivery_sets_delivered_at_and_clears_error() {
        let (scheduler, clock) = scheduler().await;
        let (event, _) = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();

        scheduler.claim_due().await.unwrap().unwrap();
        scheduler.record_failure(&event.id, "HTTP 503").await.unwrap();

        clock.advance(Duration::from_secs(1));
        let claimed = scheduler.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.id, event.id);
        assert_eq!(claimed.next_retry_at, None);

        clock.advance(Duration::from_millis(250));
        let delivered = scheduler.record_success(&event.id).await.unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);
        assert_eq!(
            delivered.delivered_at,
            Some(t0() + chrono::Duration::milliseconds(1250))
        );
        assert_eq!(delivered.last_error, None);
        assert_eq!(delivered.next_retry_at, None);
        assert_eq!(delivered.retry_count, 1);

        assert!(matches!(
            scheduler.cancel(&event.id).await.unwrap_err(),
            SchedulerError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_exhausted() {
        let (scheduler, _) = scheduler().await;
        let (event, _) = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();
        scheduler.claim_due().await.unwrap().unwrap();

        let failed = scheduler
            .record_permanent_failure(&event.id, "HTTP 400: bad payload")
            .await
            .unwrap();
        assert!(failed.is_exhausted());
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 400: bad payload"));
        assert!(scheduler.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_retry_count_and_is_due_now() {
        let (scheduler, clock) = scheduler().await;
        let (event, _) = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();
        scheduler.claim_due().await.unwrap().unwrap();
        scheduler.record_failure(&event.id, "timeout").await.unwrap();
        clock.advance(Duration::from_secs(5));
        scheduler.claim_due().await.unwrap().unwrap();

        let released = scheduler.release(&event.id).await.unwrap();
        assert_eq!(released.status, DeliveryStatus::Pending);
        assert_eq!(released.retry_count, 1);
        assert_eq!(released.next_retry_at, None);

        let again = scheduler.claim_due().await.unwrap().unwrap();
        assert_eq!(again.id, event.id);
    }

    #[tokio::test]
    async fn test_restart_resets_retries() {
        let (scheduler, _) = scheduler().await;
        let (event, _) = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 1))
            .await
            .unwrap();
        scheduler.claim_due().await.unwrap().unwrap();
        scheduler.record_permanent_failure(&event.id, "HTTP 404").await.unwrap();

        let restarted = scheduler.restart(&event.id).await.unwrap();
        assert_eq!(restarted.status, DeliveryStatus::Pending);
        assert_eq!(restarted.retry_count, 0);

        assert!(matches!(
            scheduler.restart(&event.id).await.unwrap_err(),
            SchedulerError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_and_restore_are_idempotent() {
        let (scheduler, _) = scheduler().await;
        let (event, _) = scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();

        assert!(scheduler.soft_delete(&event.id).await.unwrap().is_deleted);
        assert!(scheduler.soft_delete(&event.id).await.unwrap().is_deleted);
        assert!(scheduler.claim_due().await.unwrap().is_none());

        assert!(!scheduler.restore(&event.id).await.unwrap().is_deleted);
        assert!(!scheduler.restore(&event.id).await.unwrap().is_deleted);
        assert!(scheduler.claim_due().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_stale_claims_uses_age() {
        let (scheduler, clock) = scheduler().await;
        scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();
        scheduler.claim_due().await.unwrap().unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            scheduler
                .recover_stale_claims(Duration::from_secs(60))
                .await
                .unwrap(),
            0
        );

        clock.advance(Duration::from_secs(31));
        assert_eq!(
            scheduler
                .recover_stale_claims(Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        assert!(scheduler.claim_due().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_batch_claims_nothing() {
        let (scheduler, _) = scheduler().await;
        scheduler
            .create(NewWebhookEvent::new("k", "order.created", "{}", 3))
            .await
            .unwrap();
        assert!(scheduler.claim_due_batch(0).await.unwrap().is_empty());
        assert_eq!(scheduler.stats().await.unwrap().pending, 1);
    }
}
