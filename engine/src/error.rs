//! Error types for the Laguna engine.

use crate::{CollectionName, OperationId, RecordKey, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Laguna engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Write rule errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordKey),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(RecordKey),

    #[error("operation on deleted record: {0}")]
    OperationOnDeleted(RecordKey),

    #[error("no in-flight operation {0}")]
    UnknownOperation(OperationId),

    // State errors
    #[error("storage corruption in {collection}/{key}: {reason}")]
    StorageCorruption {
        collection: CollectionName,
        key: RecordKey,
        reason: String,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
