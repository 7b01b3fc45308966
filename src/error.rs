use serde::Serialize;
use thiserror::Error;

/// Unified error type for notelet-sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Precondition violations: lifecycle misuse, wrong runtime. Fatal,
    // surfaced to the caller, never retried.
    #[error("provider '{0}' is not connected")]
    NotConnected(String),

    #[error("provider '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    // Transient I/O
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(String),

    // Malformed update bytes from a peer or a store
    #[error("failed to decode update: {0}")]
    Decode(String),

    // Blob store errors during reconciliation are isolated per key
    #[error("blob error for key '{key}': {message}")]
    Blob { key: String, message: String },

    // Terminal state of the retrying effect pipeline
    #[error("operation failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    // Config errors
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl SyncError {
    /// Whether this error is a lifecycle/runtime precondition violation,
    /// as opposed to a transient I/O condition.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::NotConnected(_)
                | SyncError::AlreadyConnected(_)
                | SyncError::Precondition(_)
                | SyncError::Unsupported(_)
        )
    }
}

/// Result type alias for notelet-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// A serializable representation of SyncError for the process-RPC boundary
/// (e.g., the desktop host shell).
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::NotConnected(_) => "NotConnected",
            SyncError::AlreadyConnected(_) => "AlreadyConnected",
            SyncError::Precondition(_) => "Precondition",
            SyncError::Unsupported(_) => "Unsupported",
            SyncError::Io(_) => "Io",
            SyncError::Storage(_) => "Storage",
            SyncError::Transport(_) => "Transport",
            SyncError::Decode(_) => "Decode",
            SyncError::Blob { .. } => "Blob",
            SyncError::RetriesExhausted { .. } => "RetriesExhausted",
            SyncError::ConfigParse(_) => "ConfigParse",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}

impl SyncError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}
