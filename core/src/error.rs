//! Error types for the request/response pipeline.
//!
//! # Design
//! Each pipeline stage has its own error category so callers can tell a bad
//! argument from a broken catalog from a dropped connection. All of them fold
//! into the top-level `Error`, which is what every public entry point returns.
//! Catalog defects are the only fatal kind: they mean the static endpoint or
//! object tables are wrong, not that the caller passed something bad.
//!
//! API-level failures keep the response headers so rate-limit data is still
//! reachable when a call fails.

use std::fmt;

use thiserror::Error;

use crate::object::ApiFailure;
use crate::validate::ArgKind;

/// Top-level error returned by every client operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied arguments were rejected before anything was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The endpoint or object catalog is inconsistent. Never retried.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The HTTP exchange itself failed (DNS, TLS, reset, timeout).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The exchange succeeded but the body reports a remote-side error.
    #[error("{0}")]
    Api(Box<ApiFailure>),

    /// Non-2xx status whose body carries no API error list.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        headers: Vec<(String, String)>,
    },

    /// The body was expected to be JSON and was not.
    #[error("response body is not valid JSON: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },

    /// The request signer refused to sign.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The call was cancelled before its response arrived.
    #[error("call was cancelled")]
    Cancelled,

    /// `refetch` was requested on a result that did not capture its call.
    #[error("{endpoint}: only GET results can be fetched again")]
    NotRepeatable { endpoint: String },

    /// The background engine could not accept work.
    #[error("async engine failure: {0}")]
    Engine(String),
}

impl Error {
    /// True for catalog-configuration defects, which abort the call and
    /// indicate broken static setup rather than bad runtime input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Catalog(_))
    }

    /// First API error code, if this is an API-level failure.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Error::Api(failure) => failure.code(),
            _ => None,
        }
    }

    /// HTTP status of the failed exchange, when one completed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(failure) => Some(failure.status),
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response headers of the failed exchange, when one completed.
    pub fn headers(&self) -> Option<&[(String, String)]> {
        match self {
            Error::Api(failure) => Some(&failure.headers),
            Error::Http { headers, .. } => Some(headers),
            _ => None,
        }
    }
}

impl From<ApiFailure> for Error {
    fn from(failure: ApiFailure) -> Self {
        Error::Api(Box::new(failure))
    }
}

/// Argument validation failures. Surfaced synchronously, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{endpoint}: missing required argument(s) {}; required: {}", missing.join(", "), required.join(", "))]
    MissingRequired {
        endpoint: String,
        missing: Vec<String>,
        required: Vec<String>,
    },

    #[error("{endpoint}: invalid argument '{name}'; valid arguments: {}", valid.join(", "))]
    UnknownArgument {
        endpoint: String,
        name: String,
        valid: Vec<String>,
    },

    #[error("{endpoint}: argument '{name}' is not a valid {kind}")]
    InvalidValue {
        endpoint: String,
        name: String,
        kind: ArgKind,
    },
}

impl ValidationError {
    /// Name of the endpoint whose rules rejected the call.
    pub fn endpoint(&self) -> &str {
        match self {
            ValidationError::MissingRequired { endpoint, .. }
            | ValidationError::UnknownArgument { endpoint, .. }
            | ValidationError::InvalidValue { endpoint, .. } => endpoint,
        }
    }
}

/// Defects in the static endpoint or object catalogs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("endpoint '{name}' is malformed: {reason}")]
    MalformedEndpoint { name: String, reason: String },

    #[error("endpoint '{endpoint}' declares argument '{name}' as both required and optional")]
    DuplicateRule { endpoint: String, name: String },

    #[error("endpoint '{endpoint}' has an invalid default for '{name}'")]
    InvalidDefault { endpoint: String, name: String },

    #[error("no value for URL token ':{token}' in path '{path}'")]
    MissingPathToken { path: String, token: String },

    #[error("unknown object type '{0}'")]
    UnknownType(String),

    #[error("object type '{type_name}' has a subtype declaration that is neither a name nor a field map")]
    MalformedSubtypes { type_name: String },

    #[error("argument '{name}' cannot be sent: {reason}")]
    UnsupportedValue { name: String, reason: String },

    #[error("catalog could not be parsed: {0}")]
    Parse(String),
}

/// Category of a low-level transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Timeout,
    Io,
    /// The engine shut down before the request ran.
    Aborted,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Aborted => "aborted",
            TransportErrorKind::Other => "transport",
        };
        f.write_str(label)
    }
}

/// A failed HTTP exchange, distinct from a completed exchange with a
/// non-2xx status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Request signing failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential is empty")]
    EmptyCredential,

    #[error("credential contains characters not allowed in a header value")]
    InvalidHeaderValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_errors_are_fatal() {
        let err: Error = CatalogError::UnknownType("widget".to_string()).into();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "unknown object type 'widget'");
    }

    #[test]
    fn validation_errors_are_not_fatal() {
        let err: Error = ValidationError::InvalidValue {
            endpoint: "get_user".to_string(),
            name: "user_id".to_string(),
            kind: ArgKind::Integer,
        }
        .into();
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "get_user: argument 'user_id' is not a valid integer"
        );
    }

    #[test]
    fn missing_required_lists_names() {
        let err = ValidationError::MissingRequired {
            endpoint: "tweet".to_string(),
            missing: vec!["status".to_string()],
            required: vec!["status".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "tweet: missing required argument(s) status; required: status"
        );
        assert_eq!(err.endpoint(), "tweet");
    }

    #[test]
    fn http_error_exposes_status_and_headers() {
        let err = Error::Http {
            status: 503,
            body: "over capacity".to_string(),
            headers: vec![("x-rate-limit-remaining".to_string(), "0".to_string())],
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.headers().map(|h| h.len()), Some(1));
        assert_eq!(err.api_code(), None);
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::new(TransportErrorKind::Timeout, "no response in 30s");
        assert_eq!(err.to_string(), "timeout failure: no response in 30s");
    }
}
