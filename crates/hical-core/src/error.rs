//! Centralized error types for HiCal.
//!
//! This module provides a typed error hierarchy that:
//! - Separates caller mistakes (`InvalidInput`, `NotFound`) from capability gates
//!   (`PermissionDenied`, `FeatureLocked`) and transport failures
//! - Provides user-friendly messages suitable for UI display
//! - Preserves full error context for debugging/logging

use thiserror::Error;

/// Top-level error type shared by every HiCal service.
///
/// Use `user_message()` to get a UI-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    /// Rejected locally before reaching storage (empty title, non-positive count).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Native calendar or notification permission is absent.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Premium-gated operation without entitlement.
    #[error("Feature locked: {0}")]
    FeatureLocked(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A single-flight operation is already running.
    #[error("Operation already in progress: {0}")]
    Busy(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// A platform service (notifications, native calendar) refused a request.
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn permission_denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    pub fn feature_locked(what: impl Into<String>) -> Self {
        Self::FeatureLocked(what.into())
    }

    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy(what.into())
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform(message.into())
    }

    /// True for the capability gates, which callers treat as a no-op rather than a failure.
    pub fn is_gate(&self) -> bool {
        matches!(self, AppError::PermissionDenied(_) | AppError::FeatureLocked(_))
    }

    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "Please check the event details and try again.",
            AppError::NotFound(_) => "This event no longer exists.",
            AppError::PermissionDenied(_) => "Permission is required. Enable it in Settings.",
            AppError::FeatureLocked(_) => "This feature requires HiCal Premium.",
            AppError::Transport(e) => e.user_message(),
            AppError::Busy(_) => "A sync is already running. Please wait.",
            AppError::Cancelled => "The operation was cancelled.",
            AppError::Platform(_) => "A system service failed. Please try again.",
            AppError::Database(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Io(_) => "A file operation failed. Please try again.",
            AppError::Other(_) => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Result type used across HiCal services.
pub type AppResult<T> = Result<T, AppError>;

/// Network and backend errors raised while talking to the cloud service.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn user_message(&self) -> &'static str {
        match self {
            TransportError::ConnectionFailed(_) => {
                "Unable to connect. Check your internet connection."
            }
            TransportError::Timeout => "The request timed out. Please try again.",
            TransportError::ServerError { status, .. } if *status >= 500 => {
                "The server is experiencing issues. Please try again later."
            }
            TransportError::ServerError { .. } => "The request failed. Please try again.",
            TransportError::Unauthorized => "Your session has expired. Please sign in again.",
            TransportError::Serialization(_) => {
                "Received an unexpected response. Please try again."
            }
            TransportError::Rejected(_) => "The sync service refused the request.",
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

/// Database/storage errors (SQLite, local state).
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Data corruption detected: {0}")]
    Corruption(String),
}

impl DatabaseError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DatabaseError::ConnectionFailed(_) => {
                "Unable to access local data. Try restarting the app."
            }
            DatabaseError::QueryFailed(_) => "A data operation failed. Please try again.",
            DatabaseError::Corruption(_) => {
                "Local data may be corrupted. Consider resetting app data."
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
        }
    }
}

/// Extension trait for converting reqwest errors to our error types.
pub trait ReqwestErrorExt {
    fn into_transport_error(self) -> TransportError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_transport_error(self) -> TransportError {
        if self.is_timeout() {
            TransportError::Timeout
        } else if self.is_decode() {
            TransportError::Serialization(self.to_string())
        } else if let Some(status) = self.status() {
            TransportError::ServerError {
                status: status.as_u16(),
                message: self.to_string(),
            }
        } else {
            TransportError::ConnectionFailed(self.to_string())
        }
    }
}

/// Extension trait for converting rusqlite errors to our error types.
pub trait RusqliteErrorExt {
    fn into_database_error(self) -> DatabaseError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_database_error(self) -> DatabaseError {
        match &self {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("corrupt") => {
                DatabaseError::Corruption(self.to_string())
            }
            _ => DatabaseError::QueryFailed(self.to_string()),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.into_database_error())
    }
}
