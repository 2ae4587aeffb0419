//! Unified error types for the parcelbox core library.
//!
//! This module provides a unified error type [`ParcelboxError`] that covers all failure
//! modes across the parcelbox system. Some modules also have their own specific error types
//! ([`StoreError`](crate::store::StoreError), [`ConfigError`](crate::config::ConfigError))
//! which convert into the unified type.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use parcelbox_core::error::{ParcelboxError, Result};
//!
//! fn require_requester(user_id: &str) -> Result<()> {
//!     if user_id.trim().is_empty() {
//!         return Err(ParcelboxError::InvalidRequester);
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all parcelbox operations.
#[derive(Debug, Error)]
pub enum ParcelboxError {
    // =========================================================================
    // PAIRING ERRORS
    // =========================================================================
    /// The session record store could not be reached.
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// No session in the `waiting` state matches the request.
    #[error("No active pairing session is waiting for a credential")]
    SessionNotActive,

    /// The requester id was empty.
    #[error("Requester id cannot be empty")]
    InvalidRequester,

    /// The credential submitted by the device is malformed.
    #[error("Invalid credential '{0}'. Expected 8 hexadecimal characters (e.g., 'A1B2C3D4').")]
    InvalidCredential(String),

    /// Binding the credential to the requester's profile failed.
    #[error("Failed to bind credential to profile: {0}")]
    FinalizationFailed(String),

    /// The change subscription dropped or lagged behind.
    #[error("Session subscription error: {0}")]
    Subscription(String),

    // =========================================================================
    // CAPACITY ERRORS
    // =========================================================================
    /// A sensor height was negative, not finite, or a max height was not positive.
    #[error("Invalid height {value}: {reason}")]
    InvalidHeight {
        /// The rejected value.
        value: f64,
        /// Why it was rejected.
        reason: &'static str,
    },

    // =========================================================================
    // PROFILE ERRORS
    // =========================================================================
    /// No profile exists with the given id.
    #[error("Profile not found: '{0}'")]
    ProfileNotFound(String),

    /// The profile exists but has been soft-deleted.
    #[error("Profile '{0}' has been deleted. Restore it before using it.")]
    ProfileDeleted(String),

    /// The profile is already soft-deleted.
    #[error("Profile '{0}' is already deleted")]
    ProfileAlreadyDeleted(String),

    /// The profile payload failed validation.
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    /// A profile with the same id already exists.
    #[error("Profile '{0}' already exists")]
    ProfileExists(String),

    /// Another active profile already holds this RFID code.
    #[error("RFID code '{0}' is already bound to another profile")]
    CredentialInUse(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for parcelbox operations.
pub type Result<T> = std::result::Result<T, ParcelboxError>;

/// Short alias for [`ParcelboxError`].
pub type Error = ParcelboxError;

impl ParcelboxError {
    /// Returns `true` if this error comes from the pairing handshake.
    #[inline]
    #[must_use]
    pub const fn is_pairing_error(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::SessionNotActive
                | Self::InvalidRequester
                | Self::InvalidCredential(_)
                | Self::FinalizationFailed(_)
                | Self::Subscription(_)
        )
    }

    /// Returns `true` if this error is related to profile management.
    #[inline]
    #[must_use]
    pub const fn is_profile_error(&self) -> bool {
        matches!(
            self,
            Self::ProfileNotFound(_)
                | Self::ProfileDeleted(_)
                | Self::ProfileAlreadyDeleted(_)
                | Self::InvalidProfile(_)
                | Self::ProfileExists(_)
                | Self::CredentialInUse(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if the caller may simply try again later.
    ///
    /// Nothing inside the core retries on its own.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Subscription(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidRequester
            | Self::InvalidCredential(_)
            | Self::InvalidHeight { .. }
            | Self::InvalidProfile(_) => 400,

            // 404 Not Found
            Self::ProfileNotFound(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - the slot or record is in the wrong state
            Self::SessionNotActive
            | Self::ProfileAlreadyDeleted(_)
            | Self::ProfileExists(_)
            | Self::CredentialInUse(_) => 409,

            // 410 Gone - soft-deleted
            Self::ProfileDeleted(_) => 410,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::FinalizationFailed(_)
            | Self::Subscription(_)
            | Self::PersistenceError(_)
            | Self::IoError(_) => 500,

            // 503 Service Unavailable - rendezvous store unreachable
            Self::StoreUnavailable(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::SessionNotActive => "SESSION_NOT_ACTIVE",
            Self::InvalidRequester => "INVALID_REQUESTER",
            Self::InvalidCredential(_) => "INVALID_CREDENTIAL",
            Self::FinalizationFailed(_) => "FINALIZATION_FAILED",
            Self::Subscription(_) => "SUBSCRIPTION_ERROR",
            Self::InvalidHeight { .. } => "INVALID_HEIGHT",
            Self::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Self::ProfileDeleted(_) => "PROFILE_DELETED",
            Self::ProfileAlreadyDeleted(_) => "PROFILE_ALREADY_DELETED",
            Self::InvalidProfile(_) => "INVALID_PROFILE",
            Self::ProfileExists(_) => "PROFILE_EXISTS",
            Self::CredentialInUse(_) => "CREDENTIAL_IN_USE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for ParcelboxError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => Self::PersistenceError(format!(
                "Failed to read {}: {}",
                path.display(),
                source
            )),
            ConfigError::WriteError { path, source } => Self::PersistenceError(format!(
                "Failed to write {}: {}",
                path.display(),
                source
            )),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
            ConfigError::NoConfigDir => {
                Self::ConfigValidationError("Cannot determine config directory".into())
            }
        }
    }
}

impl From<crate::store::StoreError> for ParcelboxError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::Unavailable { message } => Self::StoreUnavailable(message),
            StoreError::Corrupt { path, source } => Self::PersistenceError(format!(
                "Corrupt session record at {}: {}",
                path.display(),
                source
            )),
            StoreError::Io { path, source } => Self::StoreUnavailable(format!(
                "{}: {}",
                path.display(),
                source
            )),
        }
    }
}

impl From<serde_json::Error> for ParcelboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_pairing_error_classification() {
        assert!(ParcelboxError::SessionNotActive.is_pairing_error());
        assert!(ParcelboxError::StoreUnavailable("down".into()).is_pairing_error());
        assert!(ParcelboxError::InvalidCredential("xyz".into()).is_pairing_error());
        assert!(ParcelboxError::FinalizationFailed("boom".into()).is_pairing_error());

        assert!(!ParcelboxError::ProfileNotFound("u1".into()).is_pairing_error());
    }

    #[test]
    fn test_profile_error_classification() {
        assert!(ParcelboxError::ProfileNotFound("u1".into()).is_profile_error());
        assert!(ParcelboxError::ProfileDeleted("u1".into()).is_profile_error());
        assert!(ParcelboxError::ProfileAlreadyDeleted("u1".into()).is_profile_error());

        assert!(!ParcelboxError::SessionNotActive.is_profile_error());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(ParcelboxError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(ParcelboxError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(ParcelboxError::ConfigValidationError("bad".into()).is_config_error());

        assert!(!ParcelboxError::SessionNotActive.is_config_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(ParcelboxError::StoreUnavailable("timeout".into()).is_recoverable());
        assert!(!ParcelboxError::SessionNotActive.is_recoverable());
        assert!(!ParcelboxError::FinalizationFailed("x".into()).is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(ParcelboxError::InvalidRequester.http_status_code(), 400);
        assert_eq!(
            ParcelboxError::ProfileNotFound("u1".into()).http_status_code(),
            404
        );
        assert_eq!(ParcelboxError::SessionNotActive.http_status_code(), 409);
        assert_eq!(
            ParcelboxError::ProfileDeleted("u1".into()).http_status_code(),
            410
        );
        assert_eq!(
            ParcelboxError::ConfigParseError("error".into()).http_status_code(),
            422
        );
        assert_eq!(
            ParcelboxError::PersistenceError("error".into()).http_status_code(),
            500
        );
        assert_eq!(
            ParcelboxError::StoreUnavailable("down".into()).http_status_code(),
            503
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ParcelboxError::SessionNotActive.error_code(),
            "SESSION_NOT_ACTIVE"
        );
        assert_eq!(
            ParcelboxError::StoreUnavailable(String::new()).error_code(),
            "STORE_UNAVAILABLE"
        );
        assert_eq!(
            ParcelboxError::InvalidHeight {
                value: -1.0,
                reason: "negative"
            }
            .error_code(),
            "INVALID_HEIGHT"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let err: ParcelboxError = io_err.into();
        assert!(matches!(err, ParcelboxError::IoError(_)));
        assert!(err.is_io_error());
    }

    #[test]
    fn test_from_store_error() {
        let err: ParcelboxError = crate::store::StoreError::Unavailable {
            message: "connection refused".into(),
        }
        .into();
        assert!(matches!(err, ParcelboxError::StoreUnavailable(ref m) if m == "connection refused"));
    }

    #[test]
    fn test_error_display_messages() {
        let err = ParcelboxError::SessionNotActive;
        assert!(err.to_string().contains("No active pairing session"));

        let err = ParcelboxError::InvalidCredential("zz".into());
        assert!(err.to_string().contains("'zz'"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ParcelboxError>();
        assert_sync::<ParcelboxError>();
    }
}
