//! Reliable chunked file transfer over an unreliable datagram transport.
//!
//! [`TransferClient`] sends files; [`TransferServer`] receives them into
//! a destination directory, resuming interrupted transfers from the
//! records kept by [`ResumeStore`].

pub mod config;
pub mod error;
pub mod phase;
mod receiver;
pub mod registry;
pub mod resume;
mod sender;
mod server;
pub mod transport;
pub mod window;

pub use config::{ClientConfig, RetryPolicy, ServerConfig};
pub use error::SessionError;
pub use phase::{InvalidTransition, Phase, PhaseEvent};
pub use receiver::SessionStatus;
pub use registry::SessionRegistry;
pub use resume::{ResumeRecord, ResumeStore};
pub use sender::{TransferClient, TransferOutcome, TransferReport};
pub use server::TransferServer;
pub use transport::{
    Fault, LinkFilter, MemoryNetwork, MemoryTransport, Transport, TransportError, UdpTransport,
};
pub use window::{FlowController, RetryExhausted};
