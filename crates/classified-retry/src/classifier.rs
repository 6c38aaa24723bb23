//! Failure classification.

use crate::OutboundError;
use std::io;

/// Coarse retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Outbound failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeouts, DNS and connection failures.
    TransientConnectivity,
    /// The endpoint is up but shedding load.
    TransientServerOverload,
    /// The endpoint rejected the request itself.
    FatalClientError,
    /// The request or response is malformed.
    FatalValidation,
    /// Not recognised; never retried.
    FatalUnclassified,
}

impl FailureKind {
    pub fn class(self) -> ErrorClass {
        match self {
            Self::TransientConnectivity | Self::TransientServerOverload => ErrorClass::Retryable,
            Self::FatalClientError | Self::FatalValidation | Self::FatalUnclassified => {
                ErrorClass::Fatal
            }
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientConnectivity => "transient_connectivity",
            Self::TransientServerOverload => "transient_server_overload",
            Self::FatalClientError => "fatal_client_error",
            Self::FatalValidation => "fatal_validation",
            Self::FatalUnclassified => "fatal_unclassified",
        }
    }
}

/// Errors that can be mapped onto [`FailureKind`].
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;

    fn is_retryable(&self) -> bool {
        self.failure_kind().is_retryable()
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 => FailureKind::TransientConnectivity,
        429 | 500 | 502 | 503 | 504 => FailureKind::TransientServerOverload,
        400..=499 => FailureKind::FatalClientError,
        _ => FailureKind::FatalUnclassified,
    }
}

impl Classify for OutboundError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            OutboundError::Timeout { .. } | OutboundError::Connectivity { .. } => {
                FailureKind::TransientConnectivity
            }
            OutboundError::CircuitOpen(_) => FailureKind::TransientServerOverload,
            OutboundError::HttpStatus { status, .. } => classify_status(*status),
            OutboundError::EmptyBody | OutboundError::Validation(_) => FailureKind::FatalValidation,
            OutboundError::Authentication(_) | OutboundError::NetworkUnavailable(_) => {
                FailureKind::FatalClientError
            }
            OutboundError::Other { .. } => FailureKind::FatalUnclassified,
        }
    }
}

impl Classify for io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => FailureKind::TransientConnectivity,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                FailureKind::FatalValidation
            }
            io::ErrorKind::PermissionDenied => FailureKind::FatalClientError,
            _ => FailureKind::FatalUnclassified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(classify_status(status).is_retryable(), "{status}");
        }
        assert_eq!(classify_status(408), FailureKind::TransientConnectivity);
        assert_eq!(classify_status(429), FailureKind::TransientServerOverload);
    }

    #[test]
    fn test_other_client_errors_are_fatal() {
        for status in [400, 401, 403, 404, 409, 410, 422, 451] {
            assert_eq!(classify_status(status), FailureKind::FatalClientError, "{status}");
        }
    }

    #[test]
    fn test_unlisted_server_statuses_fail_closed() {
        assert_eq!(classify_status(501), FailureKind::FatalUnclassified);
        assert_eq!(classify_status(505), FailureKind::FatalUnclassified);
        assert_eq!(classify_status(302), FailureKind::FatalUnclassified);
    }

    #[test]
    fn test_outbound_error_mapping() {
        let cases = [
            (OutboundError::timeout("connect"), FailureKind::TransientConnectivity),
            (OutboundError::connectivity("dns"), FailureKind::TransientConnectivity),
            (
                OutboundError::CircuitOpen("hooks".into()),
                FailureKind::TransientServerOverload,
            ),
            (OutboundError::status(503, ""), FailureKind::TransientServerOverload),
            (OutboundError::status(404, ""), FailureKind::FatalClientError),
            (OutboundError::EmptyBody, FailureKind::FatalValidation),
            (
                OutboundError::Validation("bad payload".into()),
                FailureKind::FatalValidation,
            ),
            (
                OutboundError::Authentication("expired".into()),
                FailureKind::FatalClientError,
            ),
            (
                OutboundError::NetworkUnavailable("offline".into()),
                FailureKind::FatalClientError,
            ),
            (OutboundError::other("mystery"), FailureKind::FatalUnclassified),
        ];

        for (error, expected) in cases {
            assert_eq!(error.failure_kind(), expected, "{error}");
        }
    }

    #[test]
    fn test_io_error_mapping() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(timed_out.is_retryable());

        let weird = io::Error::new(io::ErrorKind::Other, "weird");
        assert_eq!(weird.failure_kind(), FailureKind::FatalUnclassified);
    }

    #[test]
    fn test_class_split() {
        assert_eq!(FailureKind::TransientServerOverload.class(), ErrorClass::Retryable);
        assert_eq!(FailureKind::FatalUnclassified.class(), ErrorClass::Fatal);
        assert_eq!(FailureKind::FatalValidation.as_str(), "fatal_validation");
    }
}
