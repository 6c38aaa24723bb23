//! Outbound call error types.

use thiserror::Error;

/// Boxed cause carried by transport-level variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a single outbound call.
#[derive(Error, Debug)]
pub enum OutboundError {
    /// Connect, read or overall request timeout.
    #[error("Request timed out: {message}")]
    Timeout {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// DNS resolution failure, refused or reset connection.
    #[error("Connection failed: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A circuit breaker in front of the endpoint is open.
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    /// Endpoint answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Endpoint answered with success but no body.
    #[error("Empty response body")]
    EmptyBody,

    /// The request was rejected before or after sending as malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Credentials missing, expired or refused.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The network path is known to be gone for good.
    #[error("Network permanently unavailable: {0}")]
    NetworkUnavailable(String),

    /// Anything not recognised above.
    #[error("Unclassified error: {message}")]
    Other {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl OutboundError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout_caused_by(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Timeout {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            source: None,
        }
    }

    pub fn connectivity_caused_by(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connectivity {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Wrap an error nothing more specific is known about.
    pub fn other(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::Other {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// HTTP status code, if the endpoint answered.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
