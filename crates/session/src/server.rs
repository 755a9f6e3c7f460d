//! Receiving server.
//!
//! One dispatch loop polls the transport, decodes frames and routes them
//! by transfer identifier to per-session tasks. Finished sessions stay in
//! the registry for the retention period so late or duplicated messages
//! are answered with the recorded outcome.

use std::net::SocketAddr;
use std::sync::Arc;

use filexfer_protocol::{
    Cancel, DataChunk, Manifest, Message, NegotiationAck, TransferId, decode,
};
use filexfer_transfer::validate_file_name;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::phase::Phase;
use crate::receiver::{
    Inbound, ReceiverContext, ReceiverSession, SessionHandle, SessionStatus, send_message,
};
use crate::registry::SessionRegistry;
use crate::resume::ResumeStore;
use crate::transport::{Transport, TransportError};

/// Accepts transfers from any number of clients on one transport.
pub struct TransferServer {
    ctx: ReceiverContext,
    registry: SessionRegistry<SessionHandle>,
    cancel: CancellationToken,
}

impl TransferServer {
    /// Creates the server and its destination and state directories.
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, SessionError> {
        let config = config.sanitized();
        for dir in [&config.destination_dir, &config.state_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| SessionError::Config(format!("{}: {e}", dir.display())))?;
        }
        let registry = SessionRegistry::new(config.registry_shards);
        let store = ResumeStore::new(config.state_dir.clone());
        Ok(Arc::new(Self {
            ctx: ReceiverContext {
                transport,
                store: Arc::new(store),
                config: Arc::new(config),
            },
            registry,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.ctx.transport.local_addr()?)
    }

    /// Stops the dispatch loop and every session. Staging files are kept.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the session for `id`, if known.
    pub fn session_status(&self, id: &TransferId) -> Option<SessionStatus> {
        self.registry.lookup(id).map(|h| h.snapshot())
    }

    /// Snapshots of every known session.
    pub fn sessions(&self) -> Vec<SessionStatus> {
        self.registry.values().iter().map(|h| h.snapshot()).collect()
    }

    /// Cancels an active transfer and tells its sender. Returns `false`
    /// if there is no active session for `id`.
    pub fn cancel_transfer(&self, id: &TransferId) -> bool {
        match self.registry.lookup(id) {
            Some(handle) if !handle.is_terminal() => {
                info!(transfer = %id, "cancelling transfer");
                handle.cancel(true);
                true
            }
            _ => false,
        }
    }

    /// Number of sessions that have not reached a terminal phase.
    pub fn active_sessions(&self) -> usize {
        self.registry.count(|h| !h.is_terminal())
    }

    /// Runs the dispatch loop until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), SessionError> {
        let local_addr = self.ctx.transport.local_addr()?;
        info!(%local_addr, "transfer server running");

        let mut sweep = tokio::time::interval(self.ctx.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("transfer server shutting down");
                    break Ok(());
                }

                _ = sweep.tick() => self.sweep().await,

                result = self.ctx.transport.recv_from() => match result {
                    Ok((frame, peer)) => self.dispatch(&frame, peer).await,
                    Err(TransportError::Closed) => {
                        warn!("transport closed, stopping server");
                        self.cancel.cancel();
                        break Err(TransportError::Closed.into());
                    }
                    Err(e) => warn!(error = %e, "receive error"),
                },
            }
        }
    }

    async fn dispatch(&self, frame: &[u8], peer: SocketAddr) {
        let msg = match decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, error = %e, "dropping undecodable frame");
                return;
            }
        };
        trace!(%peer, kind = msg.kind(), transfer = %msg.transfer_id(), "received");

        match msg {
            Message::Manifest(manifest) => self.on_manifest(manifest, peer).await,
            Message::DataChunk(chunk) => self.on_data_chunk(chunk, peer).await,
            Message::Cancel(cancel) => {
                if let Some(handle) = self.registry.lookup(&cancel.transfer_id) {
                    if !handle.is_terminal() {
                        handle.try_deliver(Inbound {
                            msg: Message::Cancel(cancel),
                            peer,
                        });
                    }
                }
            }
            msg @ (Message::NegotiationAck(_)
            | Message::ChunkAck(_)
            | Message::ChunkNack(_)
            | Message::TransferDone(_)) => {
                debug!(%peer, kind = msg.kind(), "ignoring client-bound message");
            }
        }
    }

    async fn on_manifest(&self, manifest: Manifest, peer: SocketAddr) {
        let id = manifest.transfer_id.clone();

        if let Some(existing) = self.registry.lookup(&id) {
            let same_file = existing.manifest().file_name == manifest.file_name;
            match existing.phase() {
                Phase::Completed if same_file => {
                    debug!(transfer = %id, "manifest for completed transfer, replaying outcome");
                    self.reply(
                        peer,
                        Message::NegotiationAck(NegotiationAck::accept(
                            id.clone(),
                            manifest.total_chunks,
                        )),
                    )
                    .await;
                    if let Some(done) = existing.final_message() {
                        self.reply(peer, done).await;
                    }
                    return;
                }
                phase if !phase.is_terminal() => {
                    if same_file {
                        existing.try_deliver(Inbound {
                            msg: Message::Manifest(manifest),
                            peer,
                        });
                    } else {
                        self.reject(peer, id, "transfer already in progress").await;
                    }
                    return;
                }
                _ => {}
            }
        }

        if let Err(reason) = self.admit(&manifest) {
            warn!(transfer = %id, %peer, %reason, "rejecting manifest");
            self.reject(peer, id, reason).await;
            return;
        }

        let mut rx_slot = None;
        let (handle, created) = self.registry.insert_or_replace_if(
            id.clone(),
            |existing| existing.is_terminal(),
            || {
                let (handle, rx) = SessionHandle::new(
                    manifest,
                    peer,
                    self.ctx.config.inbox_capacity,
                    self.cancel.child_token(),
                );
                rx_slot = Some(rx);
                handle
            },
        );
        match (created, rx_slot) {
            (true, Some(rx)) => {
                debug!(transfer = %id, %peer, "starting receiver session");
                let session = ReceiverSession::new(self.ctx.clone(), handle, rx, peer);
                tokio::spawn(session.run());
            }
            _ => debug!(transfer = %id, "session already registered"),
        }
    }

    /// Checks whether a new session may start for `manifest`.
    fn admit(&self, manifest: &Manifest) -> Result<(), String> {
        manifest
            .validate()
            .map_err(|e| format!("invalid manifest: {e}"))?;
        validate_file_name(&manifest.file_name).map_err(|e| e.to_string())?;
        if manifest.size > self.ctx.config.max_file_size {
            return Err("insufficient storage".into());
        }
        if manifest.total_chunks > self.ctx.config.max_chunks {
            return Err(format!(
                "too many chunks: {} exceeds {}",
                manifest.total_chunks, self.ctx.config.max_chunks
            ));
        }
        if self.active_sessions() >= self.ctx.config.max_sessions {
            return Err("server busy".into());
        }
        Ok(())
    }

    async fn on_data_chunk(&self, chunk: DataChunk, peer: SocketAddr) {
        let id = chunk.transfer_id.clone();
        let Some(handle) = self.registry.lookup(&id) else {
            debug!(transfer = %id, %peer, "chunk for unknown transfer");
            self.reply(
                peer,
                Message::Cancel(Cancel {
                    transfer_id: id,
                    reason: "unknown transfer".into(),
                }),
            )
            .await;
            return;
        };

        if handle.is_terminal() {
            if let Some(done) = handle.final_message() {
                trace!(transfer = %id, kind = done.kind(), "replaying final outcome");
                self.reply(peer, done).await;
            }
            return;
        }

        let index = chunk.index;
        if !handle.try_deliver(Inbound {
            msg: Message::DataChunk(chunk),
            peer,
        }) {
            debug!(transfer = %id, index, "session inbox full, dropping chunk");
        }
    }

    async fn reject(&self, peer: SocketAddr, id: TransferId, reason: impl Into<String>) {
        self.reply(
            peer,
            Message::NegotiationAck(NegotiationAck::reject(id, reason)),
        )
        .await;
    }

    /// Answers a datagram outside any session; failures are only logged
    /// since there is no session to fail.
    async fn reply(&self, peer: SocketAddr, msg: Message) {
        if let Err(e) = send_message(self.ctx.transport.as_ref(), peer, &msg).await {
            warn!(%peer, kind = msg.kind(), error = %e, "failed to send reply");
        }
    }

    /// Forgets expired sessions and prunes stale resume records.
    async fn sweep(&self) {
        let now = Instant::now();
        let retention = self.ctx.config.retention;
        let removed = self
            .registry
            .retain(|_, handle| !(handle.is_terminal() && handle.expired(now, retention)));
        if removed > 0 {
            debug!(removed, "expired finished sessions");
        }

        let active: Vec<TransferId> = self
            .registry
            .values()
            .iter()
            .filter(|h| !h.is_terminal())
            .map(|h| h.manifest().transfer_id.clone())
            .collect();
        let store = Arc::clone(&self.ctx.store);
        let pruned = tokio::task::spawn_blocking(move || {
            store.prune(retention, |id| active.contains(id))
        })
        .await;
        match pruned {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(pruned = n, "pruned stale resume records"),
            Ok(Err(e)) => warn!(error = %e, "failed to prune resume records"),
            Err(e) => warn!(error = %e, "prune task failed"),
        }
    }
}
