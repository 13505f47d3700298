//! Unified error handling for the server.
//!
//! Remote failures are classified once, at the adapter boundary, into an
//! [`ErrorKind`]. Everything above the adapter decides on the kind alone.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Classified failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure, retryable, falls back to the cache
    Network,
    /// Expired or invalid session, must reach the user
    Auth,
    /// Row-level policy rejection, treated like a network failure
    Permission,
    NotFound,
    /// Unorderable records; reported through merge results, never raised
    Conflict,
    /// Local quota exhausted
    StorageFull,
    Unknown,
}

impl ErrorKind {
    /// Whether a read or write may fall back to the local cache.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Permission | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StorageFull => "storage_full",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified remote store failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error whose kind is inferred from its message and status.
    pub fn classified(message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        Self {
            kind: classify(&message, status),
            message,
        }
    }

    pub fn not_configured() -> Self {
        Self::new(ErrorKind::Network, "remote store not configured")
    }
}

/// Result type for remote store calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

const NETWORK_MARKERS: &[&str] = &[
    "cors",
    "networkerror",
    "failed to fetch",
    "connection refused",
    "connection reset",
    "timed out",
];

const PERMISSION_MARKERS: &[&str] = &["permission", "policy"];

const AUTH_MARKERS: &[&str] = &[
    "password authentication failed",
    "jwt expired",
    "invalid api key",
];

/// Classify a raw failure message and optional HTTP-like status.
///
/// Checked in order: network markers, permission markers, auth status or
/// markers. Anything else is [`ErrorKind::Unknown`].
pub fn classify(message: &str, status: Option<u16>) -> ErrorKind {
    let lower = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains_any(NETWORK_MARKERS) {
        ErrorKind::Network
    } else if contains_any(PERMISSION_MARKERS) {
        ErrorKind::Permission
    } else if matches!(status, Some(401) | Some(403)) || contains_any(AUTH_MARKERS) {
        ErrorKind::Auth
    } else {
        ErrorKind::Unknown
    }
}

impl From<sqlx::Error> for RemoteError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => ErrorKind::Network,
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("28000") | Some("28P01") => ErrorKind::Auth,
                Some("42501") => ErrorKind::Permission,
                _ => classify(db.message(), None),
            },
            other => classify(&other.to_string(), None),
        };
        Self::new(kind, err.to_string())
    }
}

/// Local storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::QuotaExceeded => ErrorKind::StorageFull,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Errors surfaced by the sync coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The session is no longer valid; never masked by a cache fallback
    #[error("authentication required: {0}")]
    Auth(RemoteError),

    #[error("remote store error: {0}")]
    Remote(RemoteError),

    #[error("invalid record: {0}")]
    Invalid(#[from] tandem_engine::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            ErrorKind::Auth => SyncError::Auth(err),
            _ => SyncError::Remote(err),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Remote(e) => e.kind,
            SyncError::Invalid(_) => ErrorKind::Unknown,
            SyncError::Storage(e) => e.kind(),
        }
    }
}

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<tandem_engine::Error> for AppError {
    fn from(err: tandem_engine::Error) -> Self {
        AppError::Sync(SyncError::Invalid(err))
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, kind) = match &self {
            AppError::Sync(SyncError::Auth(e)) => {
                tracing::error!(error = %e, "Remote store rejected the session");
                (
                    StatusCode::UNAUTHORIZED,
                    "please sign in again".to_string(),
                    Some(ErrorKind::Auth),
                )
            }
            AppError::Sync(SyncError::Invalid(e)) => {
                tracing::warn!("Invalid record: {:?}", e);
                (StatusCode::BAD_REQUEST, e.to_string(), None)
            }
            AppError::Sync(SyncError::Remote(e)) => {
                tracing::error!(kind = %e.kind, "Remote store error: {}", e.message);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Remote store unavailable".to_string(),
                    Some(e.kind),
                )
            }
            AppError::Sync(SyncError::Storage(e)) => {
                tracing::error!("Storage error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Local storage error".to_string(),
                    Some(e.kind()),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, msg.clone(), Some(ErrorKind::NotFound))
            }
        };

        (status, Json(ErrorResponse { error, kind })).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_markers_win_over_everything() {
        assert_eq!(classify("CORS request did not succeed", Some(401)), ErrorKind::Network);
        assert_eq!(classify("NetworkError when attempting to fetch", None), ErrorKind::Network);
        assert_eq!(classify("TypeError: Failed to fetch", None), ErrorKind::Network);
        assert_eq!(classify("connection refused (os error 111)", None), ErrorKind::Network);
    }

    #[test]
    fn permission_markers() {
        assert_eq!(
            classify("new row violates row-level security policy", None),
            ErrorKind::Permission
        );
        assert_eq!(classify("permission denied for table users", Some(403)), ErrorKind::Permission);
    }

    #[test]
    fn auth_by_status_or_message() {
        assert_eq!(classify("Unauthorized", Some(401)), ErrorKind::Auth);
        assert_eq!(classify("forbidden", Some(403)), ErrorKind::Auth);
        assert_eq!(classify("JWT expired", None), ErrorKind::Auth);
        assert_eq!(
            classify("password authentication failed for user \"app\"", None),
            ErrorKind::Auth
        );
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(classify("duplicate key value", Some(409)), ErrorKind::Unknown);
        assert_eq!(classify("", None), ErrorKind::Unknown);
    }

    #[test]
    fn sqlx_transport_errors_are_network() {
        let err: RemoteError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind, ErrorKind::Network);

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RemoteError = sqlx::Error::Io(io).into();
        assert_eq!(err.kind, ErrorKind::Network);
    }

    #[test]
    fn recoverable_kinds() {
        assert!(ErrorKind::Network.is_recoverable());
        assert!(ErrorKind::Permission.is_recoverable());
        assert!(ErrorKind::Unknown.is_recoverable());
        assert!(!ErrorKind::Auth.is_recoverable());
    }

    #[test]
    fn sync_error_routes_auth() {
        let err: SyncError = RemoteError::new(ErrorKind::Auth, "jwt expired").into();
        assert!(matches!(err, SyncError::Auth(_)));
        let err: SyncError = RemoteError::new(ErrorKind::Network, "down").into();
        assert!(matches!(err, SyncError::Remote(_)));
    }

    #[test]
    fn auth_maps_to_unauthorized() {
        let err = AppError::Sync(SyncError::Auth(RemoteError::new(ErrorKind::Auth, "jwt expired")));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        let err: AppError = tandem_engine::Error::InvalidPayload("x".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
