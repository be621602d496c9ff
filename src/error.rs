// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pave

use thiserror::Error;

use crate::cloud::CloudError;

/// Result type alias for pave operations
pub type Result<T> = std::result::Result<T, PaveError>;

/// Errors that can occur during pave operations
#[derive(Error, Debug)]
pub enum PaveError {
    /// Credential file or cloud resource is absent
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Create collided with an existing resource
    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    /// Filesystem or cloud authorization failure
    #[error("Permission denied: {message}")]
    Permission { message: String },

    /// Missing or malformed required parameter
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Provider limit hit
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// Policy-enforced refusal
    #[error("Refused: {message}")]
    Refused { message: String },

    /// Deletion ordering violation that survived one retry
    #[error("Dependency error on {resource}: {message}")]
    Dependency { resource: String, message: String },

    /// A pre-flight gate failed
    #[error("Pre-flight gate '{gate}' failed")]
    PreflightFailed { gate: String },

    /// Operator declined a destructive action
    #[error("Cancelled: {action}")]
    Cancelled { action: String },

    /// Any other provider error, message preserved verbatim
    #[error("{operation} failed: {source}")]
    Provider {
        operation: String,
        #[source]
        source: CloudError,
    },

    /// External command failed
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Invalid configuration format
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl PaveError {
    /// Classify a provider error raised by `operation`.
    ///
    /// Well-known provider codes map onto the crate's error kinds; the
    /// provider's own message is kept in every case.
    pub fn from_cloud(operation: impl Into<String>, error: CloudError) -> Self {
        let operation = operation.into();
        if error.is_not_found() {
            PaveError::NotFound {
                what: format!("{operation}: {}", error.message),
            }
        } else if error.is_already_exists() {
            PaveError::AlreadyExists {
                what: format!("{operation}: {}", error.message),
            }
        } else if error.is_access_denied() {
            PaveError::Permission {
                message: format!("{operation}: {}", error.message),
            }
        } else if error.is_limit_exceeded() {
            PaveError::QuotaExceeded {
                message: format!("{operation}: {}", error.message),
            }
        } else if error.is_dependency_conflict() {
            PaveError::Dependency {
                resource: operation,
                message: error.message,
            }
        } else {
            PaveError::Provider {
                operation,
                source: error,
            }
        }
    }

    /// Whether this error means the target was already absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, PaveError::NotFound { .. })
    }
}

/// Map "already absent" to `None`
pub(crate) fn absent_ok<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Attach an operation name to provider results
pub(crate) trait CloudResultExt<T> {
    fn op(self, operation: &str) -> Result<T>;
}

impl<T> CloudResultExt<T> for std::result::Result<T, CloudError> {
    fn op(self, operation: &str) -> Result<T> {
        self.map_err(|e| PaveError::from_cloud(operation, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cloud_classification() {
        let err = PaveError::from_cloud("GetUser", CloudError::new("NoSuchEntity", "gone"));
        assert!(err.is_not_found());

        let limit = CloudError::new("LimitExceeded", "max 2");
        let err = PaveError::from_cloud("CreateAccessKey", limit);
        assert!(matches!(err, PaveError::QuotaExceeded { .. }));

        let not_empty = CloudError::new("BucketNotEmpty", "has objects");
        let err = PaveError::from_cloud("DeleteBucket", not_empty);
        assert!(matches!(err, PaveError::Dependency { .. }));

        let err = PaveError::from_cloud("Throttle", CloudError::new("Throttling", "slow down"));
        match err {
            PaveError::Provider { operation, source } => {
                assert_eq!(operation, "Throttle");
                assert_eq!(source.message, "slow down");
            }
            other => panic!("Expected Provider, got {other:?}"),
        }
    }

    #[test]
    fn test_provider_message_preserved() {
        let err = PaveError::from_cloud(
            "DeleteUser",
            CloudError::new("AccessDenied", "explicit deny in an identity-based policy"),
        );
        assert!(err.to_string().contains("explicit deny in an identity-based policy"));
    }
}
