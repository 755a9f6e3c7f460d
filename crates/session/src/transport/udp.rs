use std::net::SocketAddr;

use filexfer_protocol::constants::MAX_FRAME_SIZE;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::info;

use super::{Transport, TransportError, TransportFuture};

/// One frame per UDP datagram.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "UDP transport bound");
        Ok(Self { socket })
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send_to<'a>(&'a self, peer: SocketAddr, frame: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if frame.len() > MAX_FRAME_SIZE {
                return Err(TransportError::FrameTooLarge(frame.len()));
            }
            self.socket.send_to(frame, peer).await?;
            Ok(())
        })
    }

    fn recv_from(&self) -> TransportFuture<'_, (Vec<u8>, SocketAddr)> {
        Box::pin(async move {
            // One spare byte detects datagrams larger than a frame.
            let mut buf = vec![0u8; MAX_FRAME_SIZE + 1];
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            buf.truncate(n);
            Ok((buf, peer))
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}
