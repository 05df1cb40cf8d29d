//! Error types for the event log and projection engine.

use crate::types::Sequence;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Which durable write of a projection step failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStage {
    /// Writing the projected document to its binder.
    Document,
    /// Recording the projection checkpoint.
    Checkpoint,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteStage::Document => write!(f, "document"),
            WriteStage::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid projection definition: {0}")]
    InvalidDefinition(String),

    #[error("Name already registered: {0}")]
    DuplicateName(String),

    #[error("Projection not found: {0}")]
    ProjectionNotFound(String),

    #[error(
        "Projection {projection} failed applying event {sequence:?} (binder {binder}, document {}): {message}",
        .document_id.as_deref().unwrap_or("-")
    )]
    ApplyFailure {
        projection: String,
        binder: String,
        sequence: Sequence,
        document_id: Option<String>,
        message: String,
    },

    #[error(
        "Projection {projection} failed writing {stage} for event {sequence:?} (binder {binder}, document {}): {message}",
        .document_id.as_deref().unwrap_or("-")
    )]
    PartialWriteFailure {
        projection: String,
        binder: String,
        sequence: Sequence,
        document_id: Option<String>,
        stage: WriteStage,
        message: String,
    },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Invalid sequence: {0:?} (next is {1:?})")]
    InvalidSequence(Sequence, Sequence),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch at {sequence:?}: expected {expected:#018x}, got {got:#018x}")]
    ChecksumMismatch {
        sequence: Sequence,
        expected: u64,
        got: u64,
    },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::StoreUnavailable(_) => true,
            EngineError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Collapse I/O failures into `StoreUnavailable`, keeping everything else.
    pub(crate) fn unavailable(self) -> Self {
        match self {
            EngineError::Io(e) => EngineError::StoreUnavailable(e.to_string()),
            other => other,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
