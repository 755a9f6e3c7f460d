//! Sending side: a client that pushes files to one server over a shared
//! transport.
//!
//! A receive pump demultiplexes incoming frames by transfer identifier
//! into per-transfer inboxes. Each [`TransferClient::send_file`] call
//! drives its own session on the caller's task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use filexfer_protocol::{
    Cancel, DataChunk, DoneOutcome, ErrorCode, Manifest, Message, TransferDone, TransferId, decode,
    encode,
};
use filexfer_transfer::{Chunk, Chunker, TransferError, build_manifest};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::phase::{Phase, PhaseEvent};
use crate::transport::{Transport, TransportError};
use crate::window::{FlowController, RetryExhausted};

type Routes = Arc<Mutex<HashMap<TransferId, mpsc::Sender<Message>>>>;

/// How a transfer that did not fail ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Completed(TransferReport),
    /// Stopped by either side or by inactivity.
    Cancelled { reason: String },
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub size: u64,
    pub total_chunks: u64,
    /// Resume cursor granted by the server; 0 for a fresh transfer.
    pub resumed_from: u64,
    /// Data chunk frames sent, retransmissions included.
    pub chunks_sent: u64,
    pub retransmissions: u64,
    pub elapsed: Duration,
}

/// Sends files to one server.
pub struct TransferClient {
    transport: Arc<dyn Transport>,
    server: SocketAddr,
    config: ClientConfig,
    routes: Routes,
    shutdown: CancellationToken,
}

impl TransferClient {
    /// Validates `config` and starts the receive pump. Must be called
    /// from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        server: SocketAddr,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let routes: Routes = Arc::default();
        let shutdown = CancellationToken::new();
        tokio::spawn(receive_pump(
            Arc::clone(&transport),
            server,
            Arc::clone(&routes),
            shutdown.clone(),
        ));
        Ok(Self {
            transport,
            server,
            config,
            routes,
            shutdown,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stops the receive pump. Transfers in progress end as cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Hashes the file at `path` and sends it to be stored as `file_name`.
    pub async fn send_file(
        &self,
        path: impl AsRef<Path>,
        file_name: &str,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, SessionError> {
        let path = path.as_ref().to_path_buf();
        let manifest = {
            let path = path.clone();
            let file_name = file_name.to_string();
            let config = self.config.clone();
            tokio::task::spawn_blocking(move || {
                build_manifest(
                    &path,
                    &file_name,
                    config.chunk_size,
                    config.hash_algorithm,
                    config.backup_suffix,
                )
            })
            .await
            .map_err(|e| SessionError::IoRead(e.to_string()))??
        };
        self.send_manifest(manifest, &path, cancel).await
    }

    /// Sends the file at `path` under an already built `manifest`.
    pub async fn send_manifest(
        &self,
        manifest: Manifest,
        path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, SessionError> {
        manifest
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed.into());
        }

        let (route, inbox) = self.register(&manifest.transfer_id)?;
        let chunker = {
            let path: PathBuf = path.as_ref().to_path_buf();
            let manifest = manifest.clone();
            tokio::task::spawn_blocking(move || Chunker::open(&path, &manifest))
                .await
                .map_err(|e| SessionError::IoRead(e.to_string()))??
        };

        info!(
            transfer = %manifest.transfer_id,
            file = %manifest.file_name,
            size = manifest.size,
            chunks = manifest.total_chunks,
            server = %self.server,
            "starting transfer"
        );
        let session = SenderSession {
            transport: Arc::clone(&self.transport),
            server: self.server,
            config: &self.config,
            manifest,
            chunker: Some(chunker),
            inbox,
            cancel,
            shutdown: self.shutdown.clone(),
            phase: Phase::Init,
            done: None,
            chunks_sent: 0,
            started: Instant::now(),
        };
        let outcome = session.run().await;
        drop(route);
        outcome
    }

    fn register(
        &self,
        id: &TransferId,
    ) -> Result<(RouteGuard, mpsc::Receiver<Message>), SessionError> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(id) {
            return Err(SessionError::AlreadyInProgress(id.clone()));
        }
        let (tx, rx) = mpsc::channel(self.config.window_size.saturating_mul(2).max(64));
        routes.insert(id.clone(), tx);
        let guard = RouteGuard {
            id: id.clone(),
            routes: Arc::clone(&self.routes),
        };
        Ok((guard, rx))
    }
}

impl Drop for TransferClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Removes a transfer's inbox from the routing table when dropped.
struct RouteGuard {
    id: TransferId,
    routes: Routes,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

async fn receive_pump(
    transport: Arc<dyn Transport>,
    server: SocketAddr,
    routes: Routes,
    shutdown: CancellationToken,
) {
    loop {
        let (frame, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = transport.recv_from() => match result {
                Ok(received) => received,
                Err(TransportError::Closed) => {
                    warn!("transport closed, stopping receive pump");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "receive error");
                    continue;
                }
            },
        };
        if peer != server {
            debug!(%peer, "ignoring frame from unexpected peer");
            continue;
        }
        let msg = match decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, error = %e, "dropping undecodable frame");
                continue;
            }
        };

        let route = routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg.transfer_id())
            .cloned();
        match route {
            Some(inbox) => {
                if inbox.try_send(msg).is_err() {
                    debug!("transfer inbox full, dropping message");
                }
            }
            None => trace!(kind = msg.kind(), transfer = %msg.transfer_id(), "no active transfer"),
        }
    }
    // Closing every inbox ends the sessions still waiting on them.
    routes.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

/// Why a sender session stopped early.
enum Halt {
    Cancelled(String),
    Failed(SessionError),
}

impl From<SessionError> for Halt {
    fn from(err: SessionError) -> Self {
        Halt::Failed(err)
    }
}

impl From<TransportError> for Halt {
    fn from(err: TransportError) -> Self {
        Halt::Failed(err.into())
    }
}

enum Event {
    Cancelled,
    Inbound(Option<Message>),
    Tick,
}

async fn either_cancelled(a: &CancellationToken, b: &CancellationToken) {
    tokio::select! {
        _ = a.cancelled() => {}
        _ = b.cancelled() => {}
    }
}

struct SenderSession<'a> {
    transport: Arc<dyn Transport>,
    server: SocketAddr,
    config: &'a ClientConfig,
    manifest: Manifest,
    chunker: Option<Chunker>,
    inbox: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    phase: Phase,
    /// Completed outcome received before the session reached verifying.
    done: Option<TransferDone>,
    chunks_sent: u64,
    started: Instant,
}

impl SenderSession<'_> {
    fn id(&self) -> &TransferId {
        &self.manifest.transfer_id
    }

    async fn run(mut self) -> Result<TransferOutcome, SessionError> {
        match self.drive().await {
            Ok(report) => {
                info!(
                    transfer = %report.transfer_id,
                    chunks_sent = report.chunks_sent,
                    retransmissions = report.retransmissions,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "transfer completed"
                );
                Ok(TransferOutcome::Completed(report))
            }
            Err(Halt::Cancelled(reason)) => {
                self.transition(PhaseEvent::Cancel);
                info!(transfer = %self.id(), %reason, "transfer cancelled");
                Ok(TransferOutcome::Cancelled { reason })
            }
            Err(Halt::Failed(err)) => {
                if !self.phase.is_terminal() {
                    self.transition(PhaseEvent::Fatal);
                }
                warn!(transfer = %self.id(), error = %err, "transfer failed");
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<TransferReport, Halt> {
        let resumed_from = self.negotiate().await?;
        let retransmissions = self.transfer(resumed_from).await?;
        self.verify().await?;
        Ok(TransferReport {
            transfer_id: self.id().clone(),
            file_name: self.manifest.file_name.clone(),
            size: self.manifest.size,
            total_chunks: self.manifest.total_chunks,
            resumed_from,
            chunks_sent: self.chunks_sent,
            retransmissions,
            elapsed: self.started.elapsed(),
        })
    }

    /// Sends the manifest until the server answers. Returns the resume
    /// cursor.
    async fn negotiate(&mut self) -> Result<u64, Halt> {
        let manifest = Message::Manifest(self.manifest.clone());
        let total = self.manifest.total_chunks;

        for attempt in 0..=self.config.retry.max_retries {
            if attempt > 0 {
                debug!(transfer = %self.id(), attempt, "no negotiation reply, resending manifest");
            }
            self.transition(PhaseEvent::Negotiate);
            self.send(&manifest).await?;

            let deadline = Instant::now() + self.config.negotiation_timeout;
            loop {
                let msg = match self.next_event(deadline).await {
                    Event::Cancelled => return Err(self.cancel_from_sender().await),
                    Event::Inbound(msg) => msg.ok_or(TransportError::Closed)?,
                    Event::Tick => break,
                };
                match msg {
                    Message::NegotiationAck(ack) if ack.accepted => {
                        let cursor = ack.resume_cursor.min(total);
                        self.transition(PhaseEvent::Accepted);
                        if cursor > 0 {
                            info!(transfer = %self.id(), cursor, "server resumes transfer");
                        } else {
                            debug!(transfer = %self.id(), "transfer accepted");
                        }
                        return Ok(cursor);
                    }
                    Message::NegotiationAck(ack) => {
                        self.transition(PhaseEvent::Rejected);
                        return Err(SessionError::NegotiationRejected(ack.reason).into());
                    }
                    Message::TransferDone(done) => {
                        // The server already holds the whole file.
                        self.on_done(done)?;
                        self.transition(PhaseEvent::Accepted);
                        return Ok(total);
                    }
                    Message::Cancel(cancel) => return Err(Halt::Cancelled(cancel.reason)),
                    Message::ChunkAck(_) | Message::ChunkNack(_) => {
                        trace!(transfer = %self.id(), "stale acknowledgment during negotiation");
                    }
                    Message::Manifest(_) | Message::DataChunk(_) => {
                        debug!(transfer = %self.id(), "ignoring server-bound message");
                    }
                }
            }
        }

        self.transition(PhaseEvent::NegotiationTimeout);
        Err(SessionError::Timeout("negotiating").into())
    }

    /// Sends every chunk from `cursor` until all are acknowledged.
    /// Returns the number of retransmissions.
    async fn transfer(&mut self, cursor: u64) -> Result<u64, Halt> {
        let mut flow = FlowController::new(
            self.manifest.total_chunks,
            cursor,
            self.config.window_size,
            self.config.retry.clone(),
        );
        let mut last_progress = Instant::now();

        while !flow.is_complete() && self.done.is_none() {
            let now = Instant::now();
            let mut batch = Vec::new();
            while let Some(index) = flow.next_to_send(now) {
                batch.push(index);
            }
            self.send_chunks(&batch).await?;

            let tick = now + self.config.tick_interval;
            let wake = flow.next_deadline().map_or(tick, |d| d.min(tick));
            match self.next_event(wake).await {
                Event::Cancelled => return Err(self.cancel_from_sender().await),
                Event::Inbound(None) => return Err(TransportError::Closed.into()),
                Event::Inbound(Some(msg)) => match msg {
                    Message::ChunkAck(ack) => {
                        if flow.on_ack(ack.index, ack.cursor) > 0 {
                            last_progress = Instant::now();
                        }
                        trace!(transfer = %self.id(), index = ack.index, cursor = ack.cursor, "chunk acknowledged");
                    }
                    Message::ChunkNack(nack) => {
                        debug!(transfer = %self.id(), index = nack.index, reason = ?nack.reason, "chunk rejected");
                        match flow.on_nack(nack.index, Instant::now()) {
                            Ok(true) => self.send_chunks(&[nack.index]).await?,
                            Ok(false) => {}
                            Err(e) => return Err(self.exhausted(e).await),
                        }
                    }
                    Message::TransferDone(done) => self.on_done(done)?,
                    Message::Cancel(cancel) => return Err(Halt::Cancelled(cancel.reason)),
                    Message::NegotiationAck(_) => {
                        trace!(transfer = %self.id(), "duplicate negotiation reply");
                    }
                    Message::Manifest(_) | Message::DataChunk(_) => {
                        debug!(transfer = %self.id(), "ignoring server-bound message");
                    }
                },
                Event::Tick => {}
            }

            match flow.poll_expired(Instant::now()) {
                Ok(expired) if !expired.is_empty() => {
                    debug!(transfer = %self.id(), ?expired, "retransmitting");
                    self.send_chunks(&expired).await?;
                }
                Ok(_) => {}
                Err(e) => return Err(self.exhausted(e).await),
            }

            if last_progress.elapsed() >= self.config.inactivity_timeout {
                warn!(transfer = %self.id(), cursor = flow.cursor(), "no progress, cancelling transfer");
                return Err(self.cancel_with("inactivity timeout").await);
            }
        }

        self.transition(PhaseEvent::AllAcknowledged);
        Ok(flow.retransmissions())
    }

    /// Waits for the server's verification result, probing it on timeout.
    ///
    /// A probe costs one retry unless the server answered the previous
    /// one with a full cursor, which it does while still hashing the file.
    async fn verify(&mut self) -> Result<(), Halt> {
        let total = self.manifest.total_chunks;
        let mut attempt = 0;
        loop {
            let deadline = Instant::now() + self.config.retry.timeout_for(attempt);
            let mut alive = false;
            while self.done.is_none() {
                match self.next_event(deadline).await {
                    Event::Cancelled => return Err(self.cancel_from_sender().await),
                    Event::Inbound(None) => return Err(TransportError::Closed.into()),
                    Event::Inbound(Some(msg)) => match msg {
                        Message::TransferDone(done) => self.on_done(done)?,
                        Message::Cancel(cancel) => return Err(Halt::Cancelled(cancel.reason)),
                        Message::ChunkAck(ack) if ack.cursor >= total => alive = true,
                        Message::NegotiationAck(ack) if ack.accepted => alive = true,
                        Message::NegotiationAck(_) | Message::ChunkAck(_) | Message::ChunkNack(_) => {
                            trace!(transfer = %self.id(), "late reply while verifying");
                        }
                        Message::Manifest(_) | Message::DataChunk(_) => {
                            debug!(transfer = %self.id(), "ignoring server-bound message");
                        }
                    },
                    Event::Tick => break,
                }
            }
            if self.done.take().is_some() {
                self.transition(PhaseEvent::HashMatched);
                return Ok(());
            }

            if alive {
                trace!(transfer = %self.id(), "server still verifying");
                attempt = 0;
            } else if attempt >= self.config.retry.max_retries {
                return Err(SessionError::Timeout("verifying").into());
            } else {
                attempt += 1;
            }
            debug!(transfer = %self.id(), attempt, "no transfer result yet, probing server");
            self.probe().await?;
        }
    }

    /// Asks the server to repeat its outcome for this transfer.
    async fn probe(&mut self) -> Result<(), Halt> {
        match self.manifest.total_chunks.checked_sub(1) {
            Some(last) => self.send_chunks(&[last]).await,
            None => {
                let manifest = Message::Manifest(self.manifest.clone());
                self.send(&manifest).await
            }
        }
    }

    /// Records a completed outcome, or turns a failed one into an error.
    fn on_done(&mut self, done: TransferDone) -> Result<(), Halt> {
        match done.outcome {
            DoneOutcome::Completed => {
                self.done = Some(done);
                Ok(())
            }
            DoneOutcome::Failed => {
                if done.code == Some(ErrorCode::WholeFileIntegrity) {
                    if self.phase == Phase::Transferring {
                        self.transition(PhaseEvent::AllAcknowledged);
                    }
                    self.transition(PhaseEvent::HashMismatched);
                }
                Err(failure_from(done).into())
            }
        }
    }

    async fn next_event(&mut self, deadline: Instant) -> Event {
        tokio::select! {
            biased;
            _ = either_cancelled(&self.cancel, &self.shutdown) => Event::Cancelled,
            msg = self.inbox.recv() => Event::Inbound(msg),
            _ = tokio::time::sleep_until(deadline) => Event::Tick,
        }
    }

    async fn send_chunks(&mut self, indices: &[u64]) -> Result<(), Halt> {
        if indices.is_empty() || self.cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return Ok(());
        }
        let Some(mut chunker) = self.chunker.take() else {
            return Err(SessionError::IoRead("chunk reader unavailable".into()).into());
        };
        let wanted = indices.to_vec();
        let (chunker, read) = tokio::task::spawn_blocking(move || {
            let read: Result<Vec<Chunk>, TransferError> =
                wanted.iter().map(|&index| chunker.produce(index)).collect();
            (chunker, read)
        })
        .await
        .map_err(|e| SessionError::IoRead(e.to_string()))?;
        self.chunker = Some(chunker);

        let chunks = match read {
            Ok(chunks) => chunks,
            Err(e) => {
                let err = SessionError::from(e);
                self.notify_cancel(&err.to_string()).await;
                return Err(err.into());
            }
        };
        for chunk in chunks {
            let msg = Message::DataChunk(DataChunk {
                transfer_id: self.id().clone(),
                index: chunk.index,
                chunk_checksum: chunk.checksum,
                payload: chunk.data,
            });
            self.send(&msg).await?;
            self.chunks_sent += 1;
        }
        Ok(())
    }

    async fn send(&self, msg: &Message) -> Result<(), Halt> {
        let frame = encode(msg).map_err(SessionError::from)?;
        self.transport.send_to(self.server, &frame).await?;
        Ok(())
    }

    /// Tells the server to stop; failures are only logged.
    async fn notify_cancel(&self, reason: &str) {
        let msg = Message::Cancel(Cancel {
            transfer_id: self.id().clone(),
            reason: reason.to_string(),
        });
        if let Err(Halt::Failed(e)) = self.send(&msg).await {
            debug!(transfer = %self.id(), error = %e, "failed to send cancel");
        }
    }

    async fn cancel_with(&self, reason: &str) -> Halt {
        self.notify_cancel(reason).await;
        Halt::Cancelled(reason.to_string())
    }

    async fn cancel_from_sender(&self) -> Halt {
        let reason = if self.shutdown.is_cancelled() {
            "client shutting down"
        } else {
            "cancelled by sender"
        };
        self.cancel_with(reason).await
    }

    async fn exhausted(&self, e: RetryExhausted) -> Halt {
        warn!(transfer = %self.id(), index = e.index, attempts = e.attempts, "chunk retry budget exhausted");
        self.notify_cancel(&e.to_string()).await;
        Halt::Failed(SessionError::ChunkRetryExhausted {
            index: e.index,
            attempts: e.attempts,
        })
    }

    fn transition(&mut self, event: PhaseEvent) {
        match self.phase.on(event) {
            Ok(next) => self.phase = next,
            Err(e) => debug!(transfer = %self.id(), error = %e, "ignoring phase event"),
        }
    }
}

fn failure_from(done: TransferDone) -> SessionError {
    let detail = done.detail;
    match done.code {
        Some(ErrorCode::WholeFileIntegrity) => SessionError::WholeFileIntegrityFailure(detail),
        Some(ErrorCode::IoWrite) => SessionError::IoWrite(detail),
        Some(ErrorCode::Rejected) => SessionError::NegotiationRejected(detail),
        Some(ErrorCode::Timeout) => SessionError::Timeout("receiving"),
        Some(ErrorCode::RetryExhausted | ErrorCode::Internal) | None => {
            SessionError::Protocol(format!("receiver failed: {detail}"))
        }
    }
}
