//! Receiving side of one transfer: a task per session fed by the server's
//! dispatch loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use filexfer_protocol::{
    Cancel, ChunkAck, ChunkNack, DataChunk, ErrorCode, Manifest, Message, NackReason,
    NegotiationAck, TransferDone, TransferId, encode,
};
use filexfer_transfer::{Accepted, Reassembler, TransferError, staging_path_for};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::phase::{Phase, PhaseEvent};
use crate::resume::{ResumeRecord, ResumeStore};
use crate::transport::Transport;

/// A decoded message and the address it came from.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub msg: Message,
    pub peer: SocketAddr,
}

/// Point-in-time view of a receiver session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub phase: Phase,
    pub cursor: u64,
    pub acked: u64,
    pub total_chunks: u64,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct StatusInner {
    phase: Phase,
    cursor: u64,
    acked: u64,
    peer: SocketAddr,
    updated_at: DateTime<Utc>,
    finished_at: Option<Instant>,
    final_message: Option<Message>,
}

/// Registry entry for one receiver session.
pub(crate) struct SessionHandle {
    manifest: Manifest,
    started_at: DateTime<Utc>,
    inbox: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    notify_peer: AtomicBool,
    status: Mutex<StatusInner>,
}

impl SessionHandle {
    pub(crate) fn new(
        manifest: Manifest,
        peer: SocketAddr,
        inbox_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbox, rx) = mpsc::channel(inbox_capacity);
        let now = Utc::now();
        let handle = Self {
            manifest,
            started_at: now,
            inbox,
            cancel,
            notify_peer: AtomicBool::new(false),
            status: Mutex::new(StatusInner {
                phase: Phase::Init,
                cursor: 0,
                acked: 0,
                peer,
                updated_at: now,
                finished_at: None,
                final_message: None,
            }),
        };
        (handle, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    pub(crate) fn snapshot(&self) -> SessionStatus {
        let s = self.lock();
        SessionStatus {
            transfer_id: self.manifest.transfer_id.clone(),
            file_name: self.manifest.file_name.clone(),
            phase: s.phase,
            cursor: s.cursor,
            acked: s.acked,
            total_chunks: self.manifest.total_chunks,
            peer: s.peer,
            started_at: self.started_at,
            updated_at: s.updated_at,
        }
    }

    /// Message replayed to late arrivals once the session has ended.
    pub(crate) fn final_message(&self) -> Option<Message> {
        self.lock().final_message.clone()
    }

    /// Returns `true` once a finished session outlived `retention`.
    pub(crate) fn expired(&self, now: Instant, retention: Duration) -> bool {
        self.lock()
            .finished_at
            .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }

    /// Queues a message for the session task. Returns `false` if the inbox
    /// is full or the task has ended.
    pub(crate) fn try_deliver(&self, inbound: Inbound) -> bool {
        self.inbox.try_send(inbound).is_ok()
    }

    /// Asks the session task to stop. With `notify_peer` the sender is told
    /// with a `Cancel`.
    pub(crate) fn cancel(&self, notify_peer: bool) {
        self.notify_peer.store(notify_peer, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn update(&self, f: impl FnOnce(&mut StatusInner)) {
        let mut s = self.lock();
        f(&mut s);
        s.updated_at = Utc::now();
    }
}

/// Shared state every receiver task needs.
#[derive(Clone)]
pub(crate) struct ReceiverContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<ResumeStore>,
    pub config: Arc<ServerConfig>,
}

enum Step {
    Continue,
    Done,
}

/// Task state for one receiver session.
pub(crate) struct ReceiverSession {
    ctx: ReceiverContext,
    handle: Arc<SessionHandle>,
    rx: mpsc::Receiver<Inbound>,
    peer: SocketAddr,
    phase: Phase,
    reassembler: Option<Reassembler>,
    /// Last time a chunk was newly stored.
    last_progress: Instant,
    last_checkpoint: Instant,
}

impl ReceiverSession {
    pub(crate) fn new(
        ctx: ReceiverContext,
        handle: Arc<SessionHandle>,
        rx: mpsc::Receiver<Inbound>,
        peer: SocketAddr,
    ) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            handle,
            rx,
            peer,
            phase: Phase::Init,
            reassembler: None,
            last_progress: now,
            last_checkpoint: now,
        }
    }

    fn id(&self) -> &TransferId {
        &self.handle.manifest().transfer_id
    }

    pub(crate) async fn run(mut self) {
        self.transition(PhaseEvent::Negotiate);

        if let Err(reason) = self.open().await {
            warn!(transfer = %self.id(), peer = %self.peer, %reason, "rejecting transfer");
            self.transition(PhaseEvent::Rejected);
            let id = self.id().clone();
            self.send_final(&Message::NegotiationAck(NegotiationAck::reject(
                id.clone(),
                &reason,
            )))
            .await;
            self.conclude(Message::TransferDone(TransferDone::failed(
                id,
                ErrorCode::Rejected,
                reason,
            )));
            return;
        }

        self.transition(PhaseEvent::Accepted);
        let cursor = self.reassembler.as_ref().map_or(0, Reassembler::cursor);
        let accept = Message::NegotiationAck(NegotiationAck::accept(self.id().clone(), cursor));
        if let Step::Done = self.send_or_fail(&accept).await {
            return;
        }

        if self.reassembler.as_ref().is_some_and(Reassembler::is_complete) {
            self.finish().await;
            return;
        }

        let inactivity = self.ctx.config.inactivity_timeout;
        loop {
            let step = tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => {
                    let notify = self.handle.notify_peer.load(Ordering::SeqCst);
                    let reason = if notify { "cancelled by receiver" } else { "receiver shutting down" };
                    self.cancelled(reason, notify).await;
                    Step::Done
                }
                _ = tokio::time::sleep_until(self.last_progress + inactivity) => {
                    warn!(transfer = %self.id(), peer = %self.peer, "no progress, cancelling transfer");
                    self.cancelled("inactivity timeout", true).await;
                    Step::Done
                }
                inbound = self.rx.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound).await,
                    None => {
                        self.cancelled("receiver shutting down", false).await;
                        Step::Done
                    }
                },
            };
            if let Step::Done = step {
                return;
            }
        }
    }

    /// Loads any resume record and opens the staging file.
    async fn open(&mut self) -> Result<(), String> {
        let manifest = self.handle.manifest().clone();
        let dest = self.ctx.config.destination_dir.clone();
        let durable = self.ctx.config.durable_writes;
        let store = Arc::clone(&self.ctx.store);

        let opened = tokio::task::spawn_blocking(move || -> Result<Reassembler, TransferError> {
            let final_path = dest.join(&manifest.file_name);
            let staging = staging_path_for(&dest, &manifest.file_name, &manifest.transfer_id);
            let resume = match store.load(&manifest.transfer_id) {
                Ok(Some(record)) if record.staging_path == staging => record.ack_set(),
                Ok(_) => None,
                Err(e) => {
                    warn!(transfer = %manifest.transfer_id, error = %e, "failed to read resume record");
                    None
                }
            };
            let r = Reassembler::create(manifest, final_path, staging, resume, durable)?;
            checkpoint(&store, &r);
            Ok(r)
        })
        .await;

        let r = match opened {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(format!("storage unavailable: {e}")),
            Err(e) => return Err(format!("storage unavailable: {e}")),
        };

        let (cursor, acked) = (r.cursor(), r.acked().count());
        if acked > 0 {
            info!(transfer = %self.id(), cursor, acked, "resuming transfer");
        } else {
            info!(
                transfer = %self.id(),
                peer = %self.peer,
                file = %r.manifest().file_name,
                size = r.manifest().size,
                chunks = r.manifest().total_chunks,
                "transfer accepted"
            );
        }
        self.handle.update(|s| {
            s.cursor = cursor;
            s.acked = acked;
        });
        self.reassembler = Some(r);
        let now = Instant::now();
        self.last_progress = now;
        self.last_checkpoint = now;
        Ok(())
    }

    async fn handle_inbound(&mut self, inbound: Inbound) -> Step {
        if inbound.peer != self.peer {
            info!(transfer = %self.id(), old = %self.peer, new = %inbound.peer, "peer address changed");
            self.peer = inbound.peer;
            let peer = self.peer;
            self.handle.update(|s| s.peer = peer);
        }

        match inbound.msg {
            Message::Manifest(_) => {
                let cursor = self.reassembler.as_ref().map_or(0, Reassembler::cursor);
                let accept =
                    Message::NegotiationAck(NegotiationAck::accept(self.id().clone(), cursor));
                self.send_or_fail(&accept).await
            }
            Message::DataChunk(chunk) => self.on_chunk(chunk).await,
            Message::Cancel(cancel) => {
                info!(transfer = %self.id(), reason = %cancel.reason, "transfer cancelled by sender");
                self.cancelled(&cancel.reason, false).await;
                Step::Done
            }
            msg @ (Message::NegotiationAck(_)
            | Message::ChunkAck(_)
            | Message::ChunkNack(_)
            | Message::TransferDone(_)) => {
                debug!(transfer = %self.id(), kind = msg.kind(), "ignoring unexpected message");
                Step::Continue
            }
        }
    }

    async fn on_chunk(&mut self, chunk: DataChunk) -> Step {
        let Some(mut r) = self.reassembler.take() else {
            return Step::Continue;
        };
        let store = Arc::clone(&self.ctx.store);
        let index = chunk.index;
        let checkpoint_due =
            self.last_checkpoint.elapsed() >= self.ctx.config.checkpoint_interval;

        let joined = tokio::task::spawn_blocking(move || {
            let result = r.accept(chunk.index, &chunk.payload, &chunk.chunk_checksum);
            let saved = checkpoint_due
                && matches!(result, Ok(Accepted::Stored))
                && !r.is_complete()
                && checkpoint(&store, &r);
            (r, result, saved)
        })
        .await;

        let (r, result, saved) = match joined {
            Ok(v) => v,
            Err(e) => {
                error!(transfer = %self.id(), error = %e, "chunk writer task failed");
                self.fail(ErrorCode::Internal, e.to_string()).await;
                return Step::Done;
            }
        };
        let (cursor, acked, complete) = (r.cursor(), r.acked().count(), r.is_complete());
        self.reassembler = Some(r);
        if saved {
            self.last_checkpoint = Instant::now();
        }

        match result {
            Ok(accepted) => {
                match accepted {
                    Accepted::Stored => self.last_progress = Instant::now(),
                    Accepted::Duplicate => trace!(transfer = %self.id(), index, "duplicate chunk"),
                }
                self.handle.update(|s| {
                    s.cursor = cursor;
                    s.acked = acked;
                });
                let ack = Message::ChunkAck(ChunkAck {
                    transfer_id: self.id().clone(),
                    index,
                    cursor,
                });
                if let Step::Done = self.send_or_fail(&ack).await {
                    return Step::Done;
                }
                if complete {
                    self.finish().await;
                    return Step::Done;
                }
                Step::Continue
            }
            Err(TransferError::ChunkCorrupt { .. }) => {
                debug!(transfer = %self.id(), index, "corrupt chunk, sending nack");
                self.nack(index, NackReason::ChecksumMismatch).await
            }
            Err(TransferError::IndexOutOfRange { .. }) => {
                debug!(transfer = %self.id(), index, "chunk index out of range, sending nack");
                self.nack(index, NackReason::IndexOutOfRange).await
            }
            Err(e) => {
                error!(transfer = %self.id(), index, error = %e, "failed to store chunk");
                self.fail(ErrorCode::IoWrite, e.to_string()).await;
                Step::Done
            }
        }
    }

    /// Verifies the assembled file and reports the outcome.
    ///
    /// Hashing a large file can outlast the sender's probe budget, so
    /// probes that arrive meanwhile are answered with a full cursor.
    async fn finish(&mut self) {
        self.transition(PhaseEvent::AllAcknowledged);
        let Some(r) = self.reassembler.take() else {
            return;
        };
        let store = Arc::clone(&self.ctx.store);
        let id = self.id().clone();

        let mut verifying = tokio::task::spawn_blocking(move || {
            let id = r.manifest().transfer_id.clone();
            let result = r.verify_and_promote();
            if matches!(result, Ok(_) | Err(TransferError::WholeFileIntegrity { .. })) {
                if let Err(e) = store.remove(&id) {
                    warn!(transfer = %id, error = %e, "failed to remove resume record");
                }
            }
            result
        });
        let verified = loop {
            tokio::select! {
                joined = &mut verifying => break joined,
                Some(inbound) = self.rx.recv() => self.answer_while_verifying(inbound).await,
            }
        };

        let done = match verified {
            Ok(Ok(path)) => {
                self.transition(PhaseEvent::HashMatched);
                info!(transfer = %id, path = %path.display(), "transfer completed");
                TransferDone::completed(id)
            }
            Ok(Err(e @ TransferError::WholeFileIntegrity { .. })) => {
                self.transition(PhaseEvent::HashMismatched);
                warn!(transfer = %id, error = %e, "transfer failed integrity check");
                TransferDone::failed(id, ErrorCode::WholeFileIntegrity, e.to_string())
            }
            Ok(Err(e)) => {
                self.transition(PhaseEvent::Fatal);
                error!(transfer = %id, error = %e, "failed to promote staging file");
                TransferDone::failed(id, ErrorCode::IoWrite, e.to_string())
            }
            Err(e) => {
                self.transition(PhaseEvent::Fatal);
                error!(transfer = %id, error = %e, "verification task failed");
                TransferDone::failed(id, ErrorCode::Internal, e.to_string())
            }
        };

        // The outcome is recorded either way; a sender that missed it
        // gets it replayed on its next probe.
        let msg = Message::TransferDone(done);
        self.send_final(&msg).await;
        self.conclude(msg);
    }

    async fn answer_while_verifying(&mut self, inbound: Inbound) {
        let total = self.handle.manifest().total_chunks;
        let id = self.id().clone();
        let reply = match inbound.msg {
            Message::DataChunk(chunk) => Message::ChunkAck(ChunkAck {
                transfer_id: id,
                index: chunk.index,
                cursor: total,
            }),
            Message::Manifest(_) => Message::NegotiationAck(NegotiationAck::accept(id, total)),
            msg => {
                debug!(transfer = %self.id(), kind = msg.kind(), "ignoring message while verifying");
                return;
            }
        };
        trace!(transfer = %self.id(), peer = %inbound.peer, "still verifying");
        if let Err(e) = send_message(self.ctx.transport.as_ref(), inbound.peer, &reply).await {
            warn!(transfer = %self.id(), error = %e, "failed to answer probe while verifying");
        }
    }

    /// Ends the session after an unrecoverable error. The staging file
    /// stays on disk for a later resume.
    async fn fail(&mut self, code: ErrorCode, detail: String) {
        self.park().await;
        self.transition(PhaseEvent::Fatal);
        let msg = Message::TransferDone(TransferDone::failed(self.id().clone(), code, detail));
        self.send_final(&msg).await;
        self.conclude(msg);
    }

    /// Ends the session because replies can no longer be sent.
    async fn transport_failed(&mut self, err: SessionError) {
        error!(transfer = %self.id(), peer = %self.peer, error = %err, "transport unavailable, failing transfer");
        self.park().await;
        self.transition(PhaseEvent::Fatal);
        let id = self.id().clone();
        self.conclude(Message::TransferDone(TransferDone::failed(
            id,
            ErrorCode::Internal,
            err.to_string(),
        )));
    }

    async fn cancelled(&mut self, reason: &str, notify_peer: bool) {
        // Park before the phase turns terminal: a new session for the
        // same id can only start after that and must see the record.
        self.park().await;
        self.transition(PhaseEvent::Cancel);
        let msg = Message::Cancel(Cancel {
            transfer_id: self.id().clone(),
            reason: reason.to_string(),
        });
        if notify_peer {
            self.send_final(&msg).await;
        }
        info!(transfer = %self.id(), %reason, "transfer cancelled");
        self.conclude(msg);
    }

    /// Writes the resume record and closes the staging file, leaving it
    /// on disk for a later resume.
    async fn park(&mut self) {
        let Some(r) = self.reassembler.take() else {
            return;
        };
        let store = Arc::clone(&self.ctx.store);
        let parked = tokio::task::spawn_blocking(move || {
            checkpoint(&store, &r);
            r.release()
        })
        .await;
        match parked {
            Ok(acked) => {
                debug!(transfer = %self.id(), cursor = acked.cursor(), "staging file kept for resume")
            }
            Err(e) => warn!(transfer = %self.id(), error = %e, "failed to park staging file"),
        }
    }

    fn conclude(&mut self, final_message: Message) {
        self.handle.update(|s| {
            s.finished_at = Some(Instant::now());
            s.final_message = Some(final_message);
        });
    }

    fn transition(&mut self, event: PhaseEvent) {
        match self.phase.on(event) {
            Ok(next) => {
                self.phase = next;
                self.handle.update(|s| s.phase = next);
            }
            Err(e) => warn!(transfer = %self.id(), error = %e, "ignoring phase event"),
        }
    }

    async fn nack(&mut self, index: u64, reason: NackReason) -> Step {
        let nack = Message::ChunkNack(ChunkNack {
            transfer_id: self.id().clone(),
            index,
            reason,
        });
        self.send_or_fail(&nack).await
    }

    async fn send(&self, msg: &Message) -> Result<(), SessionError> {
        send_message(self.ctx.transport.as_ref(), self.peer, msg).await
    }

    /// Sends `msg`, failing the session if the transport is unusable.
    async fn send_or_fail(&mut self, msg: &Message) -> Step {
        match self.send(msg).await {
            Ok(()) => Step::Continue,
            Err(e) => {
                self.transport_failed(e).await;
                Step::Done
            }
        }
    }

    /// Sends a message on the way out of the session; the session ends
    /// regardless, so a failure is only logged.
    async fn send_final(&self, msg: &Message) {
        if let Err(e) = self.send(msg).await {
            warn!(transfer = %self.id(), kind = msg.kind(), error = %e, "failed to send final message");
        }
    }
}

/// Writes the resume record for `r`. Returns `false` if the write failed.
fn checkpoint(store: &ResumeStore, r: &Reassembler) -> bool {
    match store.save(&ResumeRecord::new(r.manifest(), r.acked(), r.staging_path())) {
        Ok(()) => true,
        Err(e) => {
            warn!(transfer = %r.manifest().transfer_id, error = %e, "failed to save resume record");
            false
        }
    }
}

/// Encodes and sends `msg` to `peer`.
pub(crate) async fn send_message(
    transport: &dyn Transport,
    peer: SocketAddr,
    msg: &Message,
) -> Result<(), SessionError> {
    let frame = encode(msg)?;
    transport.send_to(peer, &frame).await?;
    Ok(())
}
