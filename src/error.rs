//! Error types for the synchronization core.

use thiserror::Error;

/// Errors raised while applying, transforming or exchanging edits.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    /// A message that can never be applied as sent: out-of-range positions,
    /// versions from the future, or mismatched transform bases.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The content at `version` does not hash to what the sender expected.
    #[error("divergence detected on {file} at version {version}")]
    DivergenceDetected { file: String, version: u64 },

    /// The channel went away while edits were outstanding.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Inserts need text and deletes need a length.
    #[error("empty edit")]
    EmptyEdit,

    /// No session or hub is open for this file.
    #[error("unknown document: {0}")]
    UnknownDocument(String),

    /// The participant never joined this document.
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    /// A frame that could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether recovery means replacing the document with the authoritative
    /// content.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SyncError::ProtocolViolation(_) | SyncError::DivergenceDetected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
