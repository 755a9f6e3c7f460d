//! Wire protocol for chunked file transfers.
//!
//! Defines the closed set of messages exchanged between a sending client
//! and a receiving server, the transfer identifier, and the binary frame
//! codec used on message-oriented transports.

pub mod codec;
pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use codec::{CodecError, decode, encode};
pub use messages::{
    Cancel, ChunkAck, ChunkNack, DataChunk, DoneOutcome, ErrorCode, Manifest, ManifestError,
    Message, NackReason, NegotiationAck, TransferDone,
};
pub use types::{HashAlgorithm, TransferId};
