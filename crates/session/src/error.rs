//! Error types for transfer sessions.

use filexfer_protocol::{CodecError, TransferId};
use filexfer_transfer::TransferError;

use crate::transport::TransportError;

/// Errors that end a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("read failed: {0}")]
    IoRead(String),

    #[error("write failed: {0}")]
    IoWrite(String),

    #[error("chunk {index} not acknowledged after {attempts} attempts")]
    ChunkRetryExhausted { index: u64, attempts: u32 },

    #[error("whole-file integrity check failed: {0}")]
    WholeFileIntegrityFailure(String),

    #[error("negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transfer {0} already in progress")]
    AlreadyInProgress(TransferId),
}

impl From<TransferError> for SessionError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Read(_)
            | TransferError::SourceChanged { .. }
            | TransferError::IndexOutOfRange { .. } => SessionError::IoRead(err.to_string()),
            TransferError::Write(_) => SessionError::IoWrite(err.to_string()),
            TransferError::WholeFileIntegrity { .. } => {
                SessionError::WholeFileIntegrityFailure(err.to_string())
            }
            TransferError::ChunkCorrupt { .. } => SessionError::Protocol(err.to_string()),
            TransferError::Manifest(_) | TransferError::InvalidPath(_) => {
                SessionError::Config(err.to_string())
            }
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
