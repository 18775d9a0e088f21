//! Error types for pki-forge.
//!
//! Every core operation returns [`Result<T>`], whose error side is a
//! [`PkiError`]. Each variant maps onto exactly one [`ErrorKind`] so callers
//! (the CLI, the socket protocol) can branch on the kind without parsing text.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{entity} '{name}' not found")]
    NotFound { entity: &'static str, name: String },

    #[error("{entity} '{name}' already exists")]
    Conflict { entity: &'static str, name: String },

    #[error("Stored {entity} at {path} is unreadable: {reason}")]
    Corrupt {
        entity: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("Cryptographic failure while trying to {operation}: {reason}")]
    Crypto {
        operation: &'static str,
        reason: String,
    },

    #[error("Permission denied: {operation} requires administrator/root privileges")]
    PermissionDenied { operation: &'static str },

    #[error("{operation} is not supported on {platform}")]
    Unsupported {
        operation: &'static str,
        platform: &'static str,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' did not finish within {seconds}s")]
    OperationTimeout { command: String, seconds: u64 },
}

/// Kind of a [`PkiError`], stable across the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Conflict,
    Corrupt,
    CryptoError,
    PermissionDenied,
    Unsupported,
    IOError,
    OperationTimeout,
}

impl PkiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PkiError::Validation { .. } => ErrorKind::ValidationError,
            PkiError::NotFound { .. } => ErrorKind::NotFound,
            PkiError::Conflict { .. } => ErrorKind::Conflict,
            PkiError::Corrupt { .. } => ErrorKind::Corrupt,
            PkiError::Crypto { .. } => ErrorKind::CryptoError,
            PkiError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            PkiError::Unsupported { .. } => ErrorKind::Unsupported,
            PkiError::Io { .. } => ErrorKind::IOError,
            PkiError::OperationTimeout { .. } => ErrorKind::OperationTimeout,
        }
    }

    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        PkiError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        PkiError::NotFound {
            entity,
            name: name.into(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, name: impl Into<String>) -> Self {
        PkiError::Conflict {
            entity,
            name: name.into(),
        }
    }

    pub(crate) fn corrupt(entity: &'static str, path: &Path, reason: impl ToString) -> Self {
        PkiError::Corrupt {
            entity,
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn crypto(operation: &'static str, reason: impl ToString) -> Self {
        PkiError::Crypto {
            operation,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        PkiError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// Attach an operation name to an OpenSSL error stack.
pub(crate) trait CryptoContext<T> {
    fn crypto_context(self, operation: &'static str) -> Result<T>;
}

impl<T> CryptoContext<T> for std::result::Result<T, openssl::error::ErrorStack> {
    fn crypto_context(self, operation: &'static str) -> Result<T> {
        self.map_err(|e| PkiError::crypto(operation, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            PkiError::not_found("CA", "Root-A").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            PkiError::conflict("CA", "Root-A").kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            PkiError::validation("common name", "must not be empty").kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn test_messages_carry_context() {
        let err = PkiError::not_found("certificate", "device1.local_signed-by_Root-A");
        assert_eq!(
            err.to_string(),
            "certificate 'device1.local_signed-by_Root-A' not found"
        );

        let err = PkiError::PermissionDenied {
            operation: "install CA",
        };
        assert!(err.to_string().contains("install CA"));
    }
}
