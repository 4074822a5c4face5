//! Error types for the tandem bridge.
//!
//! Every failure that can cross the wire is a [`BridgeError`]. Dispatcher
//! failures are rendered to text and shipped back as `error` responses; on
//! the calling side they come back as [`BridgeError::RemoteError`].

use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Resolution errors
    #[error("Property '{key}' does not exist on {repr}")]
    PropertyNotFound { key: String, repr: String },

    #[error("Handle not found: {0}")]
    HandleNotFound(u64),

    #[error("No module named '{0}'")]
    ModuleNotFound(String),

    // Invocation errors
    #[error("Calling {target} failed: {message}")]
    ConstructionFailure { target: String, message: String },

    #[error("Type error: {0}")]
    TypeError(String),

    // Peer errors
    #[error("Access to '{access}' failed:\n{message}")]
    RemoteError { access: String, message: String },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    // Connection and scheduling errors
    #[error("Transport closed")]
    TransportClosed,

    #[error("Blocking wait attempted on the bridge scheduler thread")]
    SchedulerReentry,

    #[error("Bridge runtime is shutting down")]
    Shutdown,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Create an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        BridgeError::InvalidMessage {
            message: message.into(),
        }
    }

    /// Short, stable name of the error category.
    ///
    /// Used as the first word of the origin trace attached to error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::PropertyNotFound { .. } => "PropertyNotFound",
            BridgeError::HandleNotFound(_) => "HandleNotFound",
            BridgeError::ModuleNotFound(_) => "ModuleNotFound",
            BridgeError::ConstructionFailure { .. } => "ConstructionFailure",
            BridgeError::TypeError(_) => "TypeError",
            BridgeError::RemoteError { .. } => "RemoteError",
            BridgeError::InvalidMessage { .. } => "InvalidMessage",
            BridgeError::TransportClosed => "TransportClosed",
            BridgeError::SchedulerReentry => "SchedulerReentry",
            BridgeError::Shutdown => "Shutdown",
            BridgeError::Json { .. } => "Json",
            BridgeError::Io { .. } => "Io",
            BridgeError::Other(_) => "Other",
        }
    }

    /// Check if this error means the connection can no longer be used.
    ///
    /// Application-level failures (missing properties, failing callees,
    /// remote errors) leave the connection usable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportClosed | BridgeError::Shutdown | BridgeError::Io { .. }
        )
    }
}
