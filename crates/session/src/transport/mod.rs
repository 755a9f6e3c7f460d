//! Message-oriented transports.
//!
//! A transport moves whole frames between socket addresses. It may lose,
//! duplicate or reorder them; the session layer makes the transfer
//! reliable on top.

mod memory;
mod udp;

pub use memory::{Fault, LinkFilter, MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

/// A boxed future returned by transport methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Errors produced by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Send/receive contract shared by the client and the server.
///
/// `recv_from` must be cancel-safe: dropping its future before it
/// completes never loses a frame.
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame to `peer`.
    fn send_to<'a>(&'a self, peer: SocketAddr, frame: &'a [u8]) -> TransportFuture<'a, ()>;

    /// Waits for the next frame and returns it with its sender.
    fn recv_from(&self) -> TransportFuture<'_, (Vec<u8>, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}
