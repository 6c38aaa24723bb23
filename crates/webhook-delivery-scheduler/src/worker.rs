//! Background delivery driver.
//!
//! [`DeliveryWorker`] ties the pieces together:
//!
//! 1. On every poll tick, claim a batch of due events from the scheduler.
//! 2. Send each one through the [`RetryEngine`]. The engine retries
//!    transient failures in-process and waits on the rate limiter before
//!    every attempt.
//! 3. Record the outcome. A retryable failure that survives the inline
//!    retries goes back to the scheduler's persisted backoff. A fatal one
//!    is failed for good.
//! 4. Every `maintenance_interval`, recover stale claims and purge old
//!    soft-deleted events.
//!
//! Cancellation stops the loop between events. Claims not yet attempted,
//! and any attempt abandoned mid-backoff, are released back to PENDING.

use crate::scheduler::WebhookDeliveryScheduler;
use crate::transport::WebhookTransport;
use crate::{SchedulerError, SchedulerResult};
use classified_retry::{Classify, RetryEngine, RetryError, RetryPolicy};
use courier_config_and_utils::DeliveryConfig;
use std::sync::Arc;
use std::time::Duration;
use token_bucket_limiter::RateGate;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webhook_database::WebhookEvent;

/// Floor for the poll tick; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polling and housekeeping settings for [`DeliveryWorker`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Time between claim cycles.
    pub poll_interval: Duration,
    /// Maximum events claimed per cycle.
    pub batch_size: usize,
    /// PROCESSING events untouched this long are returned to PENDING.
    pub stale_claim_timeout: Duration,
    /// Soft-deleted events older than this are purged.
    pub retention: Duration,
    pub maintenance_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for WorkerConfig {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.claim_batch_size,
            stale_claim_timeout: config.stale_claim_timeout(),
            retention: config.retention(),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// What happened to one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed with a redelivery scheduled.
    Rescheduled,
    /// Failed with nothing scheduled, retryable or not.
    Exhausted,
    /// Handed back to PENDING without an outcome.
    Released,
}

/// Tally of one claim cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub released: usize,
    /// Events whose outcome could not be recorded.
    pub errors: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Rescheduled => self.rescheduled += 1,
            DeliveryOutcome::Exhausted => self.exhausted += 1,
            DeliveryOutcome::Released => self.released += 1,
        }
    }
}

/// Tally of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub recovered: usize,
    pub purged: usize,
}

/// Polls the scheduler and delivers due events.
pub struct DeliveryWorker {
    scheduler: Arc<WebhookDeliveryScheduler>,
    transport: Arc<dyn WebhookTransport>,
    engine: RetryEngine,
    inline_policy: RetryPolicy,
    config: WorkerConfig,
}

impl DeliveryWorker {
    /// `inline_policy` governs in-process retries around each transport
    /// call, separate from the scheduler's persisted backoff.
    pub fn new(
        scheduler: Arc<WebhookDeliveryScheduler>,
        transport: Arc<dyn WebhookTransport>,
        inline_policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            scheduler,
            transport,
            engine: RetryEngine::new(),
            inline_policy,
            config,
        }
    }

    /// Gate every attempt, retries included, on `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<dyn RateGate>) -> Self {
        self.engine = RetryEngine::with_limiter(limiter);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `cancel` fires.
    ///
    /// Cycle and maintenance errors are logged and the loop carries on; a
    /// database outage should not kill the driver.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Delivery worker started"
        );

        let mut ticker = interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_maintenance: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let maintenance_due = last_maintenance
                .map_or(true, |at| at.elapsed() >= self.config.maintenance_interval);
            if maintenance_due {
                last_maintenance = Some(Instant::now());
                if let Err(e) = self.maintain().await {
                    warn!(error = %e, "Delivery maintenance failed");
                }
            }

            match self.run_once(&cancel).await {
                Ok(report) if report.claimed > 0 => debug!(?report, "Delivery cycle complete"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Delivery cycle failed"),
            }
        }

        info!("Delivery worker stopped");
    }

    /// Claim one batch and deliver it.
    pub async fn run_once(&self, cancel: &CancellationToken) -> SchedulerResult<CycleReport> {
        let mut report = CycleReport::default();
        if cancel.is_cancelled() {
            return Ok(report);
        }

        let batch = self.scheduler.claim_due_batch(self.config.batch_size).await?;
        report.claimed = batch.len();

        let mut remaining = batch.into_iter();
        for event in remaining.by_ref() {
            if cancel.is_cancelled() {
                self.release_or_count(&event, &mut report).await;
                break;
            }
            match self.deliver_one(&event, cancel).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.errors += 1;
                    warn!(event_id = %event.id, error = %e, "Failed to record delivery outcome");
                }
            }
        }
        for event in remaining {
            self.release_or_count(&event, &mut report).await;
        }

        Ok(report)
    }

    /// Recover stale claims and purge expired soft-deleted events.
    pub async fn maintain(&self) -> SchedulerResult<MaintenanceReport> {
        let recovered = self
            .scheduler
            .recover_stale_claims(self.config.stale_claim_timeout)
            .await?;

        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|_| SchedulerError::Validation("retention out of range".to_string()))?;
        let cutoff = self
            .scheduler
            .clock()
            .now()
            .checked_sub_signed(retention)
            .ok_or_else(|| SchedulerError::Validation("retention out of range".to_string()))?;
        let purged = self.scheduler.cleanup_older_than(cutoff).await?;

        Ok(MaintenanceReport { recovered, purged })
    }

    async fn deliver_one(
        &self,
        event: &WebhookEvent,
        cancel: &CancellationToken,
    ) -> SchedulerResult<DeliveryOutcome> {
        let result = self
            .engine
            .execute_with_cancel(&self.inline_policy, cancel, || {
                self.transport.deliver(event)
            })
            .await;

        match result {
            Ok(()) => {
                self.scheduler.record_success(&event.id).await?;
                Ok(DeliveryOutcome::Delivered)
            }
            Err(RetryError::Failed(error)) if error.is_retryable() => {
                let failed = self
                    .scheduler
                    .record_failure(&event.id, &error.to_string())
                    .await?;
                if failed.next_retry_at.is_some() {
                    Ok(DeliveryOutcome::Rescheduled)
                } else {
                    Ok(DeliveryOutcome::Exhausted)
                }
            }
            Err(RetryError::Failed(error)) => {
                self.scheduler
                    .record_permanent_failure(&event.id, &error.to_string())
                    .await?;
                Ok(DeliveryOutcome::Exhausted)
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                debug!(event_id = %event.id, attempts, "Delivery cancelled, releasing claim");
                self.scheduler.release(&event.id).await?;
                Ok(DeliveryOutcome::Released)
            }
        }
    }

    async fn release_or_count(&self, event: &WebhookEvent, report: &mut CycleReport) {
        match self.scheduler.release(&event.id).await {
            Ok(_) => report.record(DeliveryOutcome::Released),
            Err(e) => {
                report.errors += 1;
                warn!(event_id = %event.id, error = %e, "Failed to release claim");
            }
        }
    }
}
