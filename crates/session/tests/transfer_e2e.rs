//! End-to-end transfers between a client and a server over the in-memory
//! network, with loss, duplication and corruption injected per message.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filexfer_protocol::{HashAlgorithm, Message, TransferId};
use filexfer_session::{
    ClientConfig, Fault, MemoryNetwork, Phase, ResumeStore, RetryPolicy, ServerConfig,
    SessionError, TransferClient, TransferOutcome, TransferReport, TransferServer,
};
use filexfer_transfer::{build_manifest, staging_path_for};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn server_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 9000))
}

fn client_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 5000))
}

fn client_config() -> ClientConfig {
    ClientConfig {
        chunk_size: 4096,
        window_size: 8,
        retry: RetryPolicy {
            retransmit_timeout: Duration::from_millis(100),
            max_retries: 5,
            backoff_factor: 1.0,
            max_retransmit_timeout: Duration::from_secs(1),
        },
        tick_interval: Duration::from_millis(20),
        negotiation_timeout: Duration::from_millis(200),
        inactivity_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Client config that keeps retrying long enough for a test to intervene.
fn patient_config() -> ClientConfig {
    let mut config = client_config();
    config.retry.max_retries = 200;
    config
}

fn server_config(root: &Path) -> ServerConfig {
    ServerConfig {
        destination_dir: root.join("dest"),
        state_dir: root.join("state"),
        durable_writes: false,
        sweep_interval: Duration::from_millis(500),
        ..Default::default()
    }
}

fn contents(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_source(root: &Path, name: &str, data: &[u8]) -> PathBuf {
    let dir = root.join("src");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn transfer_id(path: &Path, chunk_size: u32) -> TransferId {
    build_manifest(path, "unused", chunk_size, HashAlgorithm::Sha256, None)
        .unwrap()
        .transfer_id
}

struct Harness {
    root: TempDir,
    net: MemoryNetwork,
    server: Arc<TransferServer>,
    runner: JoinHandle<Result<(), SessionError>>,
}

impl Harness {
    fn start() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        init_tracing();
        let root = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let mut config = server_config(root.path());
        tweak(&mut config);
        let (server, runner) = spawn_server(&net, config);
        Self {
            root,
            net,
            server,
            runner,
        }
    }

    fn client(&self, config: ClientConfig) -> Arc<TransferClient> {
        let transport = Arc::new(self.net.endpoint(client_addr()));
        Arc::new(TransferClient::start(transport, server_addr(), config).unwrap())
    }

    fn dest(&self, name: &str) -> PathBuf {
        self.root.path().join("dest").join(name)
    }

    fn dest_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root.path().join("dest"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn resume_records(&self) -> usize {
        std::fs::read_dir(self.root.path().join("state"))
            .map(|entries| {
                entries
                    .filter(|e| {
                        e.as_ref()
                            .is_ok_and(|e| e.path().extension().is_some_and(|x| x == "json"))
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    async fn stop(self) {
        self.server.shutdown();
        self.runner.await.unwrap().unwrap();
    }
}

fn spawn_server(
    net: &MemoryNetwork,
    config: ServerConfig,
) -> (Arc<TransferServer>, JoinHandle<Result<(), SessionError>>) {
    let server = TransferServer::new(config, Arc::new(net.endpoint(server_addr()))).unwrap();
    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };
    (server, runner)
}

fn completed(outcome: TransferOutcome) -> TransferReport {
    match outcome {
        TransferOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    }
}

/// Polls `check` until it holds or five seconds pass.
async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Records the index of every data chunk the client sends.
fn record_chunks(net: &MemoryNetwork) -> Arc<Mutex<Vec<u64>>> {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&sent);
    net.set_filter(move |_, _, msg| {
        if let Message::DataChunk(chunk) = msg {
            log.lock().unwrap().push(chunk.index);
        }
        Fault::Deliver
    });
    sent
}

/// Drops every data chunk whose index satisfies `pred`.
fn drop_chunks(net: &MemoryNetwork, pred: impl Fn(u64) -> bool + Send + Sync + 'static) {
    net.set_filter(move |_, _, msg| match msg {
        Message::DataChunk(chunk) if pred(chunk.index) => Fault::Drop,
        _ => Fault::Deliver,
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_chunk_file_completes() {
    let h = Harness::start();
    let data = contents(10_000);
    let source = write_source(h.root.path(), "a.bin", &data);

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&sizes);
    h.net.set_filter(move |_, _, msg| {
        if let Message::DataChunk(chunk) = msg {
            log.lock().unwrap().push((chunk.index, chunk.payload.len()));
        }
        Fault::Deliver
    });

    let client = h.client(client_config());
    let report = completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.total_chunks, 3);
    assert_eq!(report.resumed_from, 0);
    assert!(report.chunks_sent >= 3);
    let mut sizes = sizes.lock().unwrap().clone();
    sizes.sort();
    sizes.dedup();
    assert_eq!(sizes, vec![(0, 4096), (1, 4096), (2, 1808)]);

    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    assert_eq!(h.dest_entries(), vec!["a.bin".to_string()]);
    assert_eq!(h.resume_records(), 0);

    let status = h.server.session_status(&report.transfer_id).unwrap();
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.cursor, 3);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_chunk_is_retransmitted() {
    let h = Harness::start();
    let data = contents(10_000);
    let source = write_source(h.root.path(), "a.bin", &data);

    let drops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&drops);
    h.net.set_filter(move |_, _, msg| match msg {
        Message::DataChunk(chunk) if chunk.index == 1 && counter.fetch_add(1, Ordering::SeqCst) < 2 => {
            Fault::Drop
        }
        _ => Fault::Deliver,
    });

    let client = h.client(client_config());
    let report = completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert!(drops.load(Ordering::SeqCst) >= 3);
    assert!(report.retransmissions >= 2);
    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_manifest_hash_fails_integrity() {
    let h = Harness::start();
    let data = contents(10_000);
    let source = write_source(h.root.path(), "a.bin", &data);

    let mut manifest =
        build_manifest(&source, "a.bin", 4096, HashAlgorithm::Sha256, None).unwrap();
    manifest.file_hash = "00".repeat(32);
    manifest.transfer_id = TransferId::derive(&manifest.file_hash, manifest.size, 4096);

    let client = h.client(client_config());
    let result = client
        .send_manifest(manifest, &source, CancellationToken::new())
        .await;

    assert!(
        matches!(result, Err(SessionError::WholeFileIntegrityFailure(_))),
        "got {result:?}"
    );
    assert!(!h.dest("a.bin").exists());
    assert!(h.dest_entries().is_empty());
    assert_eq!(h.resume_records(), 0);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupted_chunk_is_nacked_and_resent() {
    let h = Harness::start();
    let data = contents(10_000);
    let source = write_source(h.root.path(), "a.bin", &data);

    let corrupted = Arc::new(AtomicUsize::new(0));
    let nacks = Arc::new(AtomicUsize::new(0));
    let (c, n) = (Arc::clone(&corrupted), Arc::clone(&nacks));
    h.net.set_filter(move |_, _, msg| match msg {
        Message::DataChunk(chunk) if chunk.index == 0 && c.fetch_add(1, Ordering::SeqCst) == 0 => {
            Fault::Corrupt
        }
        Message::ChunkNack(_) => {
            n.fetch_add(1, Ordering::SeqCst);
            Fault::Deliver
        }
        _ => Fault::Deliver,
    });

    let client = h.client(client_config());
    let report = completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(nacks.load(Ordering::SeqCst), 1);
    assert!(report.retransmissions >= 1);
    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_chunk_fails_then_resumes() {
    let h = Harness::start();
    let data = contents(5 * 4096 - 100);
    let source = write_source(h.root.path(), "a.bin", &data);
    let client = h.client(client_config());

    drop_chunks(&h.net, |index| index == 2);
    let result = client
        .send_file(&source, "a.bin", CancellationToken::new())
        .await;
    assert!(
        matches!(
            result,
            Err(SessionError::ChunkRetryExhausted {
                index: 2,
                attempts: 6
            })
        ),
        "got {result:?}"
    );
    assert!(!h.dest("a.bin").exists());
    assert_eq!(h.resume_records(), 1);

    let id = transfer_id(&source, 4096);
    wait_until(|| {
        h.server
            .session_status(&id)
            .is_some_and(|s| s.phase == Phase::Cancelled)
    })
    .await;
    assert_eq!(h.server.session_status(&id).unwrap().cursor, 2);

    let sent = record_chunks(&h.net);
    let report = completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.resumed_from, 2);
    assert!(sent.lock().unwrap().iter().all(|&index| index >= 2));
    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    assert_eq!(h.resume_records(), 0);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumes_after_server_restart() {
    init_tracing();
    let root = TempDir::new().unwrap();
    let net = MemoryNetwork::new();
    let config = server_config(root.path());
    let data = contents(6 * 4096);
    let source = write_source(root.path(), "big.bin", &data);
    let id = transfer_id(&source, 4096);

    let (server, runner) = spawn_server(&net, config.clone());
    drop_chunks(&net, |index| index >= 2);

    let client = Arc::new(
        TransferClient::start(
            Arc::new(net.endpoint(client_addr())),
            server_addr(),
            patient_config(),
        )
        .unwrap(),
    );
    let cancel = CancellationToken::new();
    let first = {
        let (client, source, cancel) = (Arc::clone(&client), source.clone(), cancel.clone());
        tokio::spawn(async move { client.send_file(&source, "big.bin", cancel).await })
    };

    wait_until(|| server.session_status(&id).is_some_and(|s| s.cursor == 2)).await;
    server.shutdown();
    runner.await.unwrap().unwrap();
    wait_until(|| {
        server
            .session_status(&id)
            .is_some_and(|s| s.phase == Phase::Cancelled)
    })
    .await;
    cancel.cancel();
    assert_eq!(
        first.await.unwrap().unwrap(),
        TransferOutcome::Cancelled {
            reason: "cancelled by sender".into()
        }
    );

    let staging = staging_path_for(&config.destination_dir, "big.bin", &id);
    assert!(staging.exists());
    assert!(!config.destination_dir.join("big.bin").exists());

    let sent = record_chunks(&net);
    let (server, runner) = spawn_server(&net, config.clone());
    let report = completed(
        client
            .send_file(&source, "big.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.resumed_from, 2);
    assert!(sent.lock().unwrap().iter().all(|&index| index >= 2));
    assert_eq!(
        std::fs::read(config.destination_dir.join("big.bin")).unwrap(),
        data
    );
    assert!(!staging.exists());

    server.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_record_catches_up_when_session_stops() {
    let h = Harness::with_config(|c| c.checkpoint_interval = Duration::from_secs(3600));
    let source = write_source(h.root.path(), "a.bin", &contents(20_000));
    let id = transfer_id(&source, 4096);
    let store = ResumeStore::new(h.root.path().join("state"));
    drop_chunks(&h.net, |index| index >= 2);

    let client = h.client(patient_config());
    let cancel = CancellationToken::new();
    let task = {
        let (client, source, cancel) = (Arc::clone(&client), source.clone(), cancel.clone());
        tokio::spawn(async move { client.send_file(&source, "a.bin", cancel).await })
    };

    wait_until(|| h.server.session_status(&id).is_some_and(|s| s.cursor == 2)).await;
    // Only the record written when the session opened exists so far.
    assert_eq!(store.load(&id).unwrap().unwrap().cursor, 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
    wait_until(|| {
        h.server
            .session_status(&id)
            .is_some_and(|s| s.phase == Phase::Cancelled)
    })
    .await;
    let record = store.load(&id).unwrap().unwrap();
    assert_eq!(record.cursor, 2);
    assert_eq!(record.ack_set().unwrap().count(), 2);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verification_slower_than_probe_budget_completes() {
    let h = Harness::start();
    let data = contents(8 * 1024 * 1024);
    let source = write_source(h.root.path(), "large.bin", &data);

    let mut config = client_config();
    config.chunk_size = 60 * 1024;
    config.retry.max_retries = 1;
    let client = h.client(config);
    let report = completed(
        client
            .send_file(&source, "large.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.total_chunks, 137);
    assert_eq!(std::fs::read(h.dest("large.bin")).unwrap(), data);
    let status = h.server.session_status(&report.transfer_id).unwrap();
    assert_eq!(status.phase, Phase::Completed);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_leaves_no_final_file() {
    let h = Harness::start();
    let source = write_source(h.root.path(), "a.bin", &contents(20_000));
    let id = transfer_id(&source, 4096);
    drop_chunks(&h.net, |index| index >= 1);

    let client = h.client(patient_config());
    let cancel = CancellationToken::new();
    let task = {
        let (client, source, cancel) = (Arc::clone(&client), source.clone(), cancel.clone());
        tokio::spawn(async move { client.send_file(&source, "a.bin", cancel).await })
    };

    wait_until(|| h.server.session_status(&id).is_some_and(|s| s.cursor == 1)).await;
    cancel.cancel();
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        TransferOutcome::Cancelled {
            reason: "cancelled by sender".into()
        }
    );

    wait_until(|| {
        h.server
            .session_status(&id)
            .is_some_and(|s| s.phase == Phase::Cancelled)
    })
    .await;
    assert!(!h.dest("a.bin").exists());
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inactivity_cancels_transfer() {
    let h = Harness::start();
    let source = write_source(h.root.path(), "a.bin", &contents(8_000));
    drop_chunks(&h.net, |_| true);

    let mut config = patient_config();
    config.inactivity_timeout = Duration::from_millis(300);
    let client = h.client(config);
    let outcome = client
        .send_file(&source, "a.bin", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TransferOutcome::Cancelled {
            reason: "inactivity timeout".into()
        }
    );
    assert!(!h.dest("a.bin").exists());
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_side_cancel_reaches_client() {
    let h = Harness::start();
    let source = write_source(h.root.path(), "a.bin", &contents(20_000));
    let id = transfer_id(&source, 4096);
    drop_chunks(&h.net, |index| index >= 1);

    let client = h.client(patient_config());
    let task = {
        let (client, source) = (Arc::clone(&client), source.clone());
        tokio::spawn(async move {
            client
                .send_file(&source, "a.bin", CancellationToken::new())
                .await
        })
    };

    wait_until(|| h.server.session_status(&id).is_some_and(|s| s.cursor == 1)).await;
    let status = h.server.session_status(&id).unwrap();
    assert_eq!(status.file_name, "a.bin");
    assert_eq!(status.phase, Phase::Transferring);
    assert_eq!(status.total_chunks, 5);
    assert_eq!(status.acked, 1);
    assert_eq!(status.peer, client_addr());
    assert_eq!(h.server.active_sessions(), 1);

    assert!(h.server.cancel_transfer(&id));
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        TransferOutcome::Cancelled {
            reason: "cancelled by receiver".into()
        }
    );
    assert_eq!(h.server.active_sessions(), 0);
    assert!(!h.dest("a.bin").exists());
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_file_transfers() {
    let h = Harness::start();
    let source = write_source(h.root.path(), "empty.bin", b"");

    let client = h.client(client_config());
    let report = completed(
        client
            .send_file(&source, "empty.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.total_chunks, 0);
    assert_eq!(report.chunks_sent, 0);
    assert_eq!(std::fs::metadata(h.dest("empty.bin")).unwrap().len(), 0);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negotiation_rejections() {
    let h = Harness::with_config(|c| {
        c.max_file_size = 10_000;
        c.max_sessions = 1;
    });
    let client = h.client(patient_config());

    let big = write_source(h.root.path(), "big.bin", &contents(20_000));
    let result = client
        .send_file(&big, "big.bin", CancellationToken::new())
        .await;
    assert!(
        matches!(&result, Err(SessionError::NegotiationRejected(r)) if r == "insufficient storage"),
        "got {result:?}"
    );

    let small = write_source(h.root.path(), "small.bin", &contents(100));
    let result = client
        .send_file(&small, "../escape.bin", CancellationToken::new())
        .await;
    assert!(
        matches!(&result, Err(SessionError::NegotiationRejected(r)) if r.contains("parent directory")),
        "got {result:?}"
    );

    // Occupy the only slot with a stalled transfer.
    let stalled = write_source(h.root.path(), "stalled.bin", &contents(9_000));
    drop_chunks(&h.net, |_| true);
    let cancel = CancellationToken::new();
    let task = {
        let (client, stalled, cancel) = (Arc::clone(&client), stalled.clone(), cancel.clone());
        tokio::spawn(async move { client.send_file(&stalled, "stalled.bin", cancel).await })
    };
    wait_until(|| h.server.active_sessions() == 1).await;

    let result = client
        .send_file(&small, "small.bin", CancellationToken::new())
        .await;
    assert!(
        matches!(&result, Err(SessionError::NegotiationRejected(r)) if r == "server busy"),
        "got {result:?}"
    );

    cancel.cancel();
    assert!(matches!(
        task.await.unwrap().unwrap(),
        TransferOutcome::Cancelled { .. }
    ));
    assert!(h.dest_entries().iter().all(|name| name.starts_with('.')));
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicated_frames_are_harmless() {
    let h = Harness::start();
    let data = contents(30_000);
    let source = write_source(h.root.path(), "a.bin", &data);
    h.net.set_filter(|_, _, _| Fault::Duplicate);

    let client = h.client(client_config());
    let report = completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.total_chunks, 8);
    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_files_share_one_client() {
    let h = Harness::start();
    let first = contents(25_000);
    let second: Vec<u8> = contents(17_000).into_iter().rev().collect();
    let a = write_source(h.root.path(), "a.bin", &first);
    let b = write_source(h.root.path(), "b.bin", &second);

    let client = h.client(client_config());
    let (ra, rb) = tokio::join!(
        client.send_file(&a, "nested/a.bin", CancellationToken::new()),
        client.send_file(&b, "b.bin", CancellationToken::new()),
    );
    completed(ra.unwrap());
    completed(rb.unwrap());

    assert_eq!(std::fs::read(h.dest("nested/a.bin")).unwrap(), first);
    assert_eq!(std::fs::read(h.dest("b.bin")).unwrap(), second);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_file_is_backed_up() {
    let h = Harness::start();
    let data = contents(5_000);
    let source = write_source(h.root.path(), "a.bin", &data);
    std::fs::create_dir_all(h.dest("")).unwrap();
    std::fs::write(h.dest("a.bin"), b"previous").unwrap();

    let mut config = client_config();
    config.backup_suffix = Some(".bak".into());
    let client = h.client(config);
    completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    assert_eq!(std::fs::read(h.dest("a.bin.bak")).unwrap(), b"previous");
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resending_completed_file_replays_outcome() {
    let h = Harness::start();
    let data = contents(9_000);
    let source = write_source(h.root.path(), "a.bin", &data);
    let client = h.client(client_config());

    completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );
    let again = completed(
        client
            .send_file(&source, "a.bin", CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(again.resumed_from, again.total_chunks);
    assert_eq!(again.chunks_sent, 0);
    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), data);
    h.stop().await;
}
