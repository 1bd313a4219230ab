//! Error types shared across the sync core

use std::fmt;

/// Failure of a sync, drain or account-level operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Connection dropped, timed out, or the server was unreachable
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// Credentials rejected; the account needs user attention
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server answered something we cannot interpret
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Local data is inconsistent; the folder needs a full resync
    #[error("Data corruption: {0}")]
    DataCorruption(String),

    /// A queued command can never be applied and was dropped
    #[error("Command permanently failed: {0}")]
    PermanentCommandFailure(String),

    /// The local database could not be read or written
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::StorageUnavailable(_)
        )
    }
}

/// Failure of a local store operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::DataCorruption(e.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => {
                StoreError::DataCorruption(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
            _ => StoreError::StorageUnavailable(e.to_string()),
        }
    }
}

impl From<rusqlite_migration::Error> for StoreError {
    fn from(e: rusqlite_migration::Error) -> Self {
        StoreError::StorageUnavailable(format!("migration failed: {e}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::DataCorruption(format!("undecodable row: {e}"))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StorageUnavailable(msg) => SyncError::StorageUnavailable(msg),
            StoreError::DataCorruption(msg) => SyncError::DataCorruption(msg),
            StoreError::NotFound(msg) => SyncError::DataCorruption(format!("missing row: {msg}")),
        }
    }
}

/// Category of a failure reported by a remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Network,
    Timeout,
    Authentication,
    /// Malformed or unexpected server response
    Protocol,
    /// The message or folder does not exist on the server
    NotFound,
    /// The server refused the command (NO/BAD for a well-formed request)
    Rejected,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::Network => "network",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Authentication => "authentication",
            RemoteErrorKind::Protocol => "protocol",
            RemoteErrorKind::NotFound => "not found",
            RemoteErrorKind::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Error returned by a protocol session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }

    /// Failures that may succeed if the same request is sent again later
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Network | RemoteErrorKind::Timeout
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::Network | RemoteErrorKind::Timeout => {
                SyncError::TransientNetwork(e.message)
            }
            RemoteErrorKind::Authentication => SyncError::AuthenticationFailed(e.message),
            RemoteErrorKind::Protocol | RemoteErrorKind::NotFound | RemoteErrorKind::Rejected => {
                SyncError::ProtocolViolation(e.to_string())
            }
        }
    }
}

/// Failure to turn a search condition tree into a store query
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("Unsupported predicate: {attribute} on {field}")]
    UnsupportedPredicate { field: String, attribute: String },

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::TransientNetwork("reset".into()).is_retryable());
        assert!(SyncError::StorageUnavailable("busy".into()).is_retryable());
        assert!(!SyncError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(!SyncError::DataCorruption("x".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_remote_error_mapping() {
        let e: SyncError = RemoteError::new(RemoteErrorKind::Timeout, "30s").into();
        assert_eq!(e, SyncError::TransientNetwork("30s".into()));

        let e: SyncError = RemoteError::new(RemoteErrorKind::Authentication, "no").into();
        assert!(matches!(e, SyncError::AuthenticationFailed(_)));

        let e: SyncError = RemoteError::rejected("BAD").into();
        assert!(matches!(e, SyncError::ProtocolViolation(_)));
    }

    #[test]
    fn test_store_error_mapping() {
        let e: SyncError = StoreError::DataCorruption("bad row".into()).into();
        assert!(matches!(e, SyncError::DataCorruption(_)));
        let e: SyncError = StoreError::StorageUnavailable("locked".into()).into();
        assert!(e.is_retryable());
    }

    #[test]
    fn test_sqlite_no_rows_is_not_found() {
        let e: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, StoreError::NotFound(_)));
    }
}
