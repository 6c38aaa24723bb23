//! Webhook transport.
//!
//! One call per delivery attempt. Retrying, pacing and bookkeeping live
//! in the worker; a transport only maps what happened on the wire into an
//! [`OutboundError`] the classifier understands.

use crate::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use classified_retry::OutboundError;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;
use webhook_database::WebhookEvent;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";
pub const EVENT_ID_HEADER: &str = "X-Webhook-Id";
pub const TRANSACTION_ID_HEADER: &str = "X-Transaction-Id";

/// Deliver one webhook event.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, event: &WebhookEvent) -> Result<(), OutboundError>;
}

/// POSTs the payload to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    allow_empty_body: bool,
}

impl HttpTransport {
    /// `timeout` bounds each request from connect to the last body byte.
    pub fn new(endpoint: Url, timeout: Duration) -> SchedulerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            allow_empty_body: false,
        })
    }

    /// Accept a 2xx answer with no body as delivered. `204 No Content` is
    /// accepted regardless.
    pub fn allow_empty_body(mut self, allow: bool) -> Self {
        self.allow_empty_body = allow;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(&self, event: &WebhookEvent) -> Result<(), OutboundError> {
        debug!(
            url = %self.endpoint,
            event_id = %event.id,
            event_type = %event.event_type,
            "Sending webhook"
        );

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_KEY_HEADER, &event.idempotency_key)
            .header(EVENT_TYPE_HEADER, &event.event_type)
            .header(EVENT_ID_HEADER, &event.id);
        if let Some(transaction_id) = &event.transaction_id {
            request = request.header(TRANSACTION_ID_HEADER, transaction_id);
        }

        let response = request
            .body(event.payload.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            return Err(OutboundError::status(status.as_u16(), body));
        }
        if body.trim().is_empty() && status != StatusCode::NO_CONTENT && !self.allow_empty_body {
            return Err(OutboundError::EmptyBody);
        }
        Ok(())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> OutboundError {
    if e.is_timeout() {
        OutboundError::timeout_caused_by(e.to_string(), e)
    } else if e.is_connect() {
        OutboundError::connectivity_caused_by(e.to_string(), e)
    } else {
        OutboundError::other(e)
    }
}
