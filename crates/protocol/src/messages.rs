use serde::{Deserialize, Serialize};

use crate::constants::MAX_CHUNK_SIZE;
use crate::types::{HashAlgorithm, TransferId};

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

/// Describes a file before any data is sent.
///
/// Built once by the sender and never mutated afterwards. The receiver
/// validates it with [`Manifest::validate`] before allocating anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub total_chunks: u64,
    pub file_hash: String,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// When set, an existing destination file is renamed to
    /// `<name><suffix>` before the new file replaces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_suffix: Option<String>,
}

impl Manifest {
    /// Number of chunks a file of `size` bytes splits into.
    pub fn expected_chunk_count(size: u64, chunk_size: u32) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        size.div_ceil(u64::from(chunk_size))
    }

    /// Byte offset of chunk `index` in the file.
    pub fn chunk_offset(&self, index: u64) -> u64 {
        index * u64::from(self.chunk_size)
    }

    /// Payload length of chunk `index`, or `None` if the index is past the end.
    pub fn chunk_len(&self, index: u64) -> Option<usize> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = self.chunk_offset(index);
        let remaining = self.size - offset;
        Some(remaining.min(u64::from(self.chunk_size)) as usize)
    }

    /// Checks internal consistency of the manifest fields.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.file_name.trim().is_empty() {
            return Err(ManifestError::EmptyFileName);
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ManifestError::ChunkSize(self.chunk_size));
        }
        let expected = Self::expected_chunk_count(self.size, self.chunk_size);
        if self.total_chunks != expected {
            return Err(ManifestError::ChunkCount {
                expected,
                got: self.total_chunks,
            });
        }
        let hash_ok = self.file_hash.len() == self.hash_algorithm.hex_len()
            && self.file_hash.bytes().all(|b| b.is_ascii_hexdigit());
        if !hash_ok {
            return Err(ManifestError::FileHash);
        }
        let derived = TransferId::derive(&self.file_hash, self.size, self.chunk_size);
        if derived != self.transfer_id {
            return Err(ManifestError::TransferId);
        }
        Ok(())
    }
}

/// Inconsistencies detected by [`Manifest::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("file name is empty")]
    EmptyFileName,

    #[error("chunk size {0} out of range (1..={max})", max = MAX_CHUNK_SIZE)]
    ChunkSize(u32),

    #[error("total chunk count mismatch: expected {expected}, got {got}")]
    ChunkCount { expected: u64, got: u64 },

    #[error("file hash does not match the declared algorithm")]
    FileHash,

    #[error("transfer id is not derived from the manifest content")]
    TransferId,
}

/// Receiver's answer to a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationAck {
    pub transfer_id: TransferId,
    pub accepted: bool,
    /// Count of chunks already held contiguously from index 0.
    #[serde(default)]
    pub resume_cursor: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl NegotiationAck {
    pub fn accept(transfer_id: TransferId, resume_cursor: u64) -> Self {
        Self {
            transfer_id,
            accepted: true,
            resume_cursor,
            reason: String::new(),
        }
    }

    pub fn reject(transfer_id: TransferId, reason: impl Into<String>) -> Self {
        Self {
            transfer_id,
            accepted: false,
            resume_cursor: 0,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// One chunk of file data.
///
/// The payload travels as raw bytes after the JSON header, never inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChunk {
    pub transfer_id: TransferId,
    pub index: u64,
    pub chunk_checksum: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

/// Positive acknowledgment of a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub transfer_id: TransferId,
    pub index: u64,
    /// Receiver's resumption cursor at the time of the ack.
    pub cursor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    ChecksumMismatch,
    IndexOutOfRange,
}

/// Negative acknowledgment; the sender retransmits immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkNack {
    pub transfer_id: TransferId,
    pub index: u64,
    pub reason: NackReason,
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneOutcome {
    Completed,
    Failed,
}

/// Machine-readable failure category carried by [`TransferDone`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    IoWrite,
    WholeFileIntegrity,
    RetryExhausted,
    Rejected,
    Timeout,
    Internal,
}

/// Final outcome reported by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDone {
    pub transfer_id: TransferId,
    pub outcome: DoneOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl TransferDone {
    pub fn completed(transfer_id: TransferId) -> Self {
        Self {
            transfer_id,
            outcome: DoneOutcome::Completed,
            code: None,
            detail: String::new(),
        }
    }

    pub fn failed(transfer_id: TransferId, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            transfer_id,
            outcome: DoneOutcome::Failed,
            code: Some(code),
            detail: detail.into(),
        }
    }
}

/// Aborts a transfer; may be sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancel {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Every message exchanged between sender and receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Manifest(Manifest),
    NegotiationAck(NegotiationAck),
    DataChunk(DataChunk),
    ChunkAck(ChunkAck),
    ChunkNack(ChunkNack),
    TransferDone(TransferDone),
    Cancel(Cancel),
}

impl Message {
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            Message::Manifest(m) => &m.transfer_id,
            Message::NegotiationAck(m) => &m.transfer_id,
            Message::DataChunk(m) => &m.transfer_id,
            Message::ChunkAck(m) => &m.transfer_id,
            Message::ChunkNack(m) => &m.transfer_id,
            Message::TransferDone(m) => &m.transfer_id,
            Message::Cancel(m) => &m.transfer_id,
        }
    }

    /// Wire name of the message type, as used in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Manifest(_) => "manifest",
            Message::NegotiationAck(_) => "negotiation_ack",
            Message::DataChunk(_) => "data_chunk",
            Message::ChunkAck(_) => "chunk_ack",
            Message::ChunkNack(_) => "chunk_nack",
            Message::TransferDone(_) => "transfer_done",
            Message::Cancel(_) => "cancel",
        }
    }
}
