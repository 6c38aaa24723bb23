//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Webhook event - one outbound delivery tracked until it is delivered,
/// cancelled or gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub idempotency_key: String,
    pub event_type: String,
    /// Opaque body sent to the endpoint as-is.
    pub payload: String,
    pub transaction_id: Option<String>,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl WebhookEvent {
    /// Failed with no further attempt scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.next_retry_at.is_none()
    }
}

/// Fields supplied when creating (or merging into) a webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWebhookEvent {
    pub idempotency_key: String,
    pub event_type: String,
    pub payload: String,
    pub transaction_id: Option<String>,
    pub max_retries: u32,
}

impl NewWebhookEvent {
    pub fn new(
        idempotency_key: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            transaction_id: None,
            max_retries,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// Whether an upsert created a row or merged into an active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
}

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Cancelled,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Delivered,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rows a listing includes with respect to soft deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletedFilter {
    #[default]
    ActiveOnly,
    DeletedOnly,
    All,
}

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrder {
    #[default]
    CreatedAsc,
    CreatedDesc,
    UpdatedAsc,
    UpdatedDesc,
}

impl EventOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::CreatedAsc => "created_at ASC, id ASC",
            Self::CreatedDesc => "created_at DESC, id DESC",
            Self::UpdatedAsc => "updated_at ASC, id ASC",
            Self::UpdatedDesc => "updated_at DESC, id DESC",
        }
    }
}

/// Filter for [`crate::queries::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<DeliveryStatus>,
    pub deleted: DeletedFilter,
    pub order: EventOrder,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn deleted(mut self, deleted: DeletedFilter) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn order_by(mut self, order: EventOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub pending: u64,
    pub processing: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Failed rows with no retry scheduled.
    pub exhausted: u64,
    pub cancelled: u64,
    /// Soft-deleted rows, not counted in any status above.
    pub deleted: u64,
}

impl DeliveryStats {
    pub fn active_total(&self) -> u64 {
        self.pending + self.processing + self.delivered + self.failed + self.cancelled
    }
}
