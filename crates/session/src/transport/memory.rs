use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use filexfer_protocol::{Message, decode};
use tokio::sync::mpsc;
use tracing::trace;

use super::{Transport, TransportError, TransportFuture};

/// What the network does with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Deliver,
    Drop,
    Duplicate,
    /// Flip the last byte of the frame (the payload, for data chunks).
    Corrupt,
}

/// Decides the fate of each frame from its source, destination and
/// decoded message.
pub type LinkFilter = Arc<dyn Fn(SocketAddr, SocketAddr, &Message) -> Fault + Send + Sync>;

type Datagram = (Vec<u8>, SocketAddr);

struct Endpoint {
    id: u64,
    tx: mpsc::UnboundedSender<Datagram>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<SocketAddr, Endpoint>>,
    filter: RwLock<Option<LinkFilter>>,
    next_id: AtomicU64,
}

/// In-process datagram network for tests.
///
/// Frames to an address with no endpoint are silently lost, as with UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an endpoint at `addr`, replacing (and closing) any
    /// previous endpoint bound there.
    pub fn endpoint(&self, addr: SocketAddr) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, Endpoint { id, tx });
        MemoryTransport {
            addr,
            id,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Removes the endpoint at `addr`; its transport reports `Closed`.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr);
    }

    pub fn set_filter(
        &self,
        filter: impl Fn(SocketAddr, SocketAddr, &Message) -> Fault + Send + Sync + 'static,
    ) {
        *self
            .inner
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        *self
            .inner
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn fault_for(&self, from: SocketAddr, to: SocketAddr, frame: &[u8]) -> Fault {
        let filter = self
            .inner
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (filter, decode(frame)) {
            (Some(filter), Ok(msg)) => filter(from, to, &msg),
            _ => Fault::Deliver,
        }
    }

    fn is_bound(&self, addr: SocketAddr, id: u64) -> bool {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .is_some_and(|e| e.id == id)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, frame: Vec<u8>) {
        let endpoints = self
            .inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match endpoints.get(&to) {
            Some(endpoint) => {
                // A closed receiver is indistinguishable from loss.
                let _ = endpoint.tx.send((frame, from));
            }
            None => trace!(%from, %to, "no endpoint, frame lost"),
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: SocketAddr,
    id: u64,
    network: MemoryNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl Transport for MemoryTransport {
    fn send_to<'a>(&'a self, peer: SocketAddr, frame: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if !self.network.is_bound(self.addr, self.id) {
                return Err(TransportError::Closed);
            }
            match self.network.fault_for(self.addr, peer, frame) {
                Fault::Deliver => self.network.deliver(self.addr, peer, frame.to_vec()),
                Fault::Drop => trace!(from = %self.addr, to = %peer, "frame dropped"),
                Fault::Duplicate => {
                    self.network.deliver(self.addr, peer, frame.to_vec());
                    self.network.deliver(self.addr, peer, frame.to_vec());
                }
                Fault::Corrupt => {
                    let mut corrupted = frame.to_vec();
                    if let Some(last) = corrupted.last_mut() {
                        *last ^= 0xff;
                    }
                    self.network.deliver(self.addr, peer, corrupted);
                }
            }
            Ok(())
        })
    }

    fn recv_from(&self) -> TransportFuture<'_, (Vec<u8>, SocketAddr)> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(TransportError::Closed)
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filexfer_protocol::{Cancel, TransferId, encode};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn frame() -> Vec<u8> {
        encode(&Message::Cancel(Cancel {
            transfer_id: TransferId::from_raw("t"),
            reason: "test".into(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_between_endpoints() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(addr(1));
        let b = net.endpoint(addr(2));

        a.send_to(addr(2), &frame()).await.unwrap();
        let (got, from) = b.recv_from().await.unwrap();
        assert_eq!(got, frame());
        assert_eq!(from, addr(1));
    }

    #[tokio::test]
    async fn filter_drops_and_duplicates() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(addr(1));
        let b = net.endpoint(addr(2));

        net.set_filter(|_, _, _| Fault::Drop);
        a.send_to(addr(2), &frame()).await.unwrap();

        net.set_filter(|_, _, _| Fault::Duplicate);
        a.send_to(addr(2), &frame()).await.unwrap();
        net.clear_filter();

        b.recv_from().await.unwrap();
        b.recv_from().await.unwrap();
        let pending = b.rx.lock().await.try_recv();
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn corrupt_flips_last_byte() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(addr(1));
        let b = net.endpoint(addr(2));

        net.set_filter(|_, _, _| Fault::Corrupt);
        a.send_to(addr(2), &frame()).await.unwrap();
        let (got, _) = b.recv_from().await.unwrap();
        let original = frame();
        assert_eq!(got.len(), original.len());
        assert_ne!(got.last(), original.last());
    }

    #[tokio::test]
    async fn unbound_destination_is_loss() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(addr(1));
        assert!(a.send_to(addr(9), &frame()).await.is_ok());
    }

    #[tokio::test]
    async fn replaced_endpoint_is_closed() {
        let net = MemoryNetwork::new();
        let old = net.endpoint(addr(1));
        let _new = net.endpoint(addr(1));

        assert!(matches!(
            old.send_to(addr(2), &frame()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(old.recv_from().await, Err(TransportError::Closed)));
    }
}
