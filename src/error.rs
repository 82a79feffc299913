//! Cache error types and wire error formatting.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abstract error kinds surfaced by peer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// ObjectId unknown on this peer.
    NotFound,
    /// CREATE on an objid that is already known.
    Exists,
    /// Object is still CREATING; reads must wait for seal.
    NotReady,
    /// Object was evicted or discarded while in use.
    Gone,
    /// Unknown or expired lease.
    InvalidLease,
    /// Operation not permitted by the lease's access flags.
    Forbidden,
    /// Write attempted on a sealed blob.
    SealViolation,
    /// Backend capacity exhausted and no eviction candidate exists.
    Full,
    /// Network or serialization failure on a cross-peer path.
    TransportError,
    /// Malformed request (bad objid, flags, ttl or blob specs).
    Validation,
    /// Unclassified internal failure.
    Internal,
}

impl ErrorKind {
    /// Returns the string representation used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Exists => "Exists",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::Gone => "Gone",
            ErrorKind::InvalidLease => "InvalidLease",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::SealViolation => "SealViolation",
            ErrorKind::Full => "Full",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::Validation => "Validation",
            ErrorKind::Internal => "Internal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NotFound" => Some(ErrorKind::NotFound),
            "Exists" => Some(ErrorKind::Exists),
            "NotReady" => Some(ErrorKind::NotReady),
            "Gone" => Some(ErrorKind::Gone),
            "InvalidLease" => Some(ErrorKind::InvalidLease),
            "Forbidden" => Some(ErrorKind::Forbidden),
            "SealViolation" => Some(ErrorKind::SealViolation),
            "Full" => Some(ErrorKind::Full),
            "TransportError" => Some(ErrorKind::TransportError),
            "Validation" => Some(ErrorKind::Validation),
            "Internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }

    /// Returns the HTTP status code for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound | ErrorKind::InvalidLease => StatusCode::NOT_FOUND,
            ErrorKind::Exists | ErrorKind::SealViolation => StatusCode::CONFLICT,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Gone => StatusCode::GONE,
            ErrorKind::NotReady => StatusCode::LOCKED,
            ErrorKind::Full => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::TransportError => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the default message for this error kind.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "The specified object does not exist on this peer.",
            ErrorKind::Exists => "An object with the specified id already exists.",
            ErrorKind::NotReady => "The object has not been sealed yet.",
            ErrorKind::Gone => "The object was discarded or evicted.",
            ErrorKind::InvalidLease => "The lease is unknown or has expired.",
            ErrorKind::Forbidden => "The lease does not permit this operation.",
            ErrorKind::SealViolation => "The blob is sealed and no longer writable.",
            ErrorKind::Full => "Backend capacity is exhausted.",
            ErrorKind::TransportError => "A cross-peer transport operation failed.",
            ErrorKind::Validation => "The request is malformed.",
            ErrorKind::Internal => "The peer encountered an internal error.",
        }
    }
}

/// Cache error with kind and message.
#[derive(Debug, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct CacheError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CacheError {
    /// Creates a new error with the kind's default message.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            message: kind.default_message().to_string(),
            kind,
        }
    }

    /// Creates a new error with a custom message.
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::with_message(ErrorKind::Internal, err.to_string())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::with_message(ErrorKind::TransportError, err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::internal(err)
    }
}

/// Wire envelope for errors: `{"error":{"kind","message"}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn from_error(err: &CacheError) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind.as_str().to_string(),
                message: err.message.clone(),
            },
        }
    }

    /// Reconstructs the error on the client side of a transport.
    pub fn into_error(self) -> CacheError {
        match ErrorKind::from_str(&self.error.kind) {
            Some(kind) => CacheError::with_message(kind, self.error.message),
            None => CacheError::with_message(ErrorKind::Internal, self.error.message),
        }
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let body = serde_json::to_string(&ErrorEnvelope::from_error(&self))
            .unwrap_or_else(|_| r#"{"error":{"kind":"Internal","message":"serialization"}}"#.into());

        match Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(body.into())
        {
            Ok(resp) => resp,
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_names() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Exists,
            ErrorKind::NotReady,
            ErrorKind::Gone,
            ErrorKind::InvalidLease,
            ErrorKind::Forbidden,
            ErrorKind::SealViolation,
            ErrorKind::Full,
            ErrorKind::TransportError,
            ErrorKind::Validation,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn envelope_preserves_kind_and_message() {
        let err = CacheError::with_message(ErrorKind::NotReady, "still creating");
        let env = ErrorEnvelope::from_error(&err);
        let back = env.into_error();
        assert_eq!(back.kind, ErrorKind::NotReady);
        assert_eq!(back.message, "still creating");
    }
}
