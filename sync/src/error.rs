//! Unified error handling for the sync runtime.

use crate::config::ConfigError;
use crate::gateway::GatewayError;

/// Runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] laguna_engine::Error),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session closed")]
    SessionClosed,

    #[error("Sync engine shut down")]
    ShutDown,
}

impl SyncError {
    /// Whether the error comes from rejected input rather than a broken runtime.
    pub fn is_validation(&self) -> bool {
        use laguna_engine::Error as E;
        matches!(
            self,
            SyncError::Engine(
                E::CollectionNotFound(_)
                    | E::InvalidPayload(_)
                    | E::MissingRequiredField(_)
                    | E::TypeMismatch { .. }
                    | E::RecordNotFound(_)
                    | E::RecordAlreadyExists(_)
                    | E::OperationOnDeleted(_)
            )
        )
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
