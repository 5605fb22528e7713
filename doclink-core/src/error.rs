//! Error types and result types for resource access operations.
//!
//! Every operation of the access layer completes with an [`AccessResult<T>`]. Errors are
//! grouped by where they arise: caller errors rejected before any network attempt,
//! authorization errors, connectivity errors, and errors reported by the server.

use bson::error::Error as BsonError;
use serde_json::{Error as SerdeJsonError, Value};
use thiserror::Error;

/// Represents all possible errors that can occur when accessing a resource.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccessError {
    /// A resource identifier in the target address is malformed.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// The client is missing a collaborator or credential it needs.
    #[error("Not configured: {0}")]
    NotConfigured(String),
    /// The credential does not grant access to the target.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// The service could not be reached (no network path, timeout, connection reset).
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The server answered with a non-success status.
    #[error("Server returned {status_code}: {payload}")]
    ServerApplication {
        /// HTTP status code of the response.
        status_code: u16,
        /// Error payload returned by the server, `Value::Null` if the body was empty.
        payload: Value,
    },
    /// The resource does not exist, or is not cached while the service is unreachable.
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// `next` was called without a prior listing to resume.
    #[error("next called before any listing request")]
    NextCalledTooEarly,
    /// The last listing reported no further pages.
    #[error("No more results")]
    NoMoreResults,
    /// A caller-supplied argument is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A body or persisted record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The persistence store failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// An unknown error occurred.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AccessError {
    /// Returns `true` for connectivity failures, the only errors that cause a write to be queued.
    pub fn is_transport(&self) -> bool {
        matches!(self, AccessError::TransportUnavailable(_))
    }

    /// Returns the HTTP status code for server-reported errors.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AccessError::ServerApplication { status_code, .. } => Some(*status_code),
            AccessError::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

/// A specialized `Result` type for access layer operations.
pub type AccessResult<T> = Result<T, AccessError>;

impl From<BsonError> for AccessError {
    fn from(err: BsonError) -> Self {
        AccessError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for AccessError {
    fn from(err: SerdeJsonError) -> Self {
        AccessError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_transport_errors_are_queueable() {
        assert!(AccessError::TransportUnavailable("timeout".into()).is_transport());
        assert!(!AccessError::PermissionDenied("nope".into()).is_transport());
        assert!(
            !AccessError::ServerApplication { status_code: 409, payload: json!({}) }.is_transport()
        );
    }

    #[test]
    fn test_status_code() {
        let err = AccessError::ServerApplication {
            status_code: 409,
            payload: json!({ "code": "Conflict" }),
        };

        assert_eq!(err.status_code(), Some(409));
        assert_eq!(AccessError::NotFound("dbs/a".into()).status_code(), Some(404));
        assert_eq!(AccessError::NoMoreResults.status_code(), None);
    }
}
