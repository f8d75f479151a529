//! The ingestion loop.
//!
//! One task owns the socket and the database connection and handles one
//! datagram completely before receiving the next:
//!
//! ```text
//! recv -> decode/validate -> authorize sender -> persist -> recv ...
//! ```
//!
//! Every per-datagram failure is counted and dropped; nothing but a shutdown
//! request ends the loop.

use crate::authorizer::{Authorization, Authorizer};
use crate::codec::{self, DecodeError, WIRE_SIZE};
use crate::metrics_defs::{
    DATAGRAMS_FAILED, DATAGRAMS_MALFORMED, DATAGRAMS_RECEIVED, DATAGRAMS_STORED,
    DATAGRAMS_UNAUTHORIZED,
};
use crate::persister::{PersistError, Persister};
use shared::counter;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Running,
    ShutdownRequested,
    Terminated,
}

impl ServerState {
    const fn as_u8(self) -> u8 {
        match self {
            ServerState::Running => 0,
            ServerState::ShutdownRequested => 1,
            ServerState::Terminated => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Running,
            1 => ServerState::ShutdownRequested,
            _ => ServerState::Terminated,
        }
    }
}

struct ShutdownInner {
    state: AtomicU8,
    notify: Notify,
}

/// Cancels a running [`StatServer`] from outside its task.
///
/// `request` only flips an atomic and wakes the loop, so it is safe to call
/// from a signal listener; the loop does all cleanup itself.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        ShutdownHandle {
            inner: Arc::new(ShutdownInner {
                state: AtomicU8::new(ServerState::Running.as_u8()),
                notify: Notify::new(),
            }),
        }
    }

    /// Moves `Running` to `ShutdownRequested`. No effect in any other state.
    pub fn request(&self) {
        let moved = self
            .inner
            .state
            .compare_exchange(
                ServerState::Running.as_u8(),
                ServerState::ShutdownRequested.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if moved {
            // Stores a permit if the loop is not currently waiting
            self.inner.notify.notify_one();
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_requested(&self) -> bool {
        self.state() != ServerState::Running
    }

    async fn requested(&self) {
        if self.is_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }

    fn terminated(&self) {
        self.inner
            .state
            .store(ServerState::Terminated.as_u8(), Ordering::SeqCst);
    }
}

/// Live counters, shared with the watcher.
#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    successful: AtomicU64,
    malformed: AtomicU64,
    unauthorized: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    /// Consistent enough for `successful <= received` to hold even while the
    /// loop is running.
    pub fn snapshot(&self) -> Summary {
        // Outcomes are published with Release after `received` is bumped, so
        // reading `successful` first never observes it ahead of `received`.
        let successful = self.successful.load(Ordering::Acquire);
        Summary {
            received: self.received.load(Ordering::Relaxed),
            successful,
            malformed: self.malformed.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Stored(_) => &self.successful,
            Outcome::Malformed(_) => &self.malformed,
            Outcome::Unauthorized(_) => &self.unauthorized,
            Outcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Release);
    }
}

/// Counter values; `successful <= received` always holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub received: u64,
    pub successful: u64,
    pub malformed: u64,
    pub unauthorized: u64,
    pub failed: u64,
}

/// What happened to a single datagram.
#[derive(Debug)]
pub enum Outcome {
    Stored(i64),
    Malformed(DecodeError),
    Unauthorized(Authorization),
    Failed(PersistError),
}

/// Validate, authorize and persist; stops at the first rejection.
pub struct Pipeline {
    authorizer: Authorizer,
    persister: Persister,
}

impl Pipeline {
    pub fn new(authorizer: Authorizer, persister: Persister) -> Self {
        Pipeline {
            authorizer,
            persister,
        }
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    pub fn process(&mut self, bytes: &[u8], peer: SocketAddr) -> Outcome {
        let datagram = match codec::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "dropping malformed datagram");
                return Outcome::Malformed(e);
            }
        };

        match self.authorizer.authorize(peer.ip()) {
            Authorization::Authorized { .. } => {}
            Authorization::Denied { hostname } => {
                tracing::info!(%peer, %hostname, "client is not authorized");
                return Outcome::Unauthorized(Authorization::Denied { hostname });
            }
            Authorization::Unresolved(e) => {
                tracing::info!(%peer, error = %e, "client hostname is not available");
                return Outcome::Unauthorized(Authorization::Unresolved(e));
            }
        }

        match self.persister.persist(&datagram) {
            Ok(id) => {
                tracing::trace!(
                    id,
                    site = %datagram.site,
                    module = %datagram.module,
                    user = %datagram.user,
                    "stored usage record"
                );
                Outcome::Stored(id)
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "unable to write datagram to database");
                Outcome::Failed(e)
            }
        }
    }
}

pub struct StatServer {
    socket: UdpSocket,
    pipeline: Pipeline,
    counters: Arc<Counters>,
    shutdown: ShutdownHandle,
}

impl StatServer {
    pub async fn bind(
        addr: &str,
        pipeline: Pipeline,
        shutdown: ShutdownHandle,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;

        Ok(StatServer {
            socket,
            pipeline,
            counters: Arc::new(Counters::default()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until shutdown is requested, then releases the socket and the
    /// database and returns the final counters.
    pub async fn run(self) -> Summary {
        let StatServer {
            socket,
            mut pipeline,
            counters,
            shutdown,
        } = self;

        // One spare byte so oversized datagrams are seen as oversized
        let mut buf = [0u8; WIRE_SIZE + 1];

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!(error = %e, "receive failed");
                    continue;
                }
            };

            counters.received.fetch_add(1, Ordering::Relaxed);
            counter!(DATAGRAMS_RECEIVED).increment(1);

            // Reverse DNS and SQLite block this thread; a shutdown request is
            // only seen once the current datagram is done.
            let outcome = pipeline.process(&buf[..len], peer);
            counters.record(&outcome);
            let metric = match outcome {
                Outcome::Stored(_) => DATAGRAMS_STORED,
                Outcome::Malformed(_) => DATAGRAMS_MALFORMED,
                Outcome::Unauthorized(_) => DATAGRAMS_UNAUTHORIZED,
                Outcome::Failed(_) => DATAGRAMS_FAILED,
            };
            counter!(metric).increment(1);
        }

        drop(socket);

        let summary = counters.snapshot();
        tracing::info!(
            received = summary.received,
            successful = summary.successful,
            malformed = summary.malformed,
            unauthorized = summary.unauthorized,
            failed = summary.failed,
            "server terminated"
        );

        if let Err(e) = pipeline.persister.close() {
            tracing::warn!(error = %e, "unable to close statistics database");
        }

        shutdown.terminated();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{DEFAULT_CACHE_CAPACITY, KeyStore};
    use crate::store::{self, load_usage, usage_count};
    use crate::testutils::{SAMPLE_TIMESTAMP, StaticResolver, sample_datagram};
    use std::net::IpAddr;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const LOOPBACK: &str = "127.0.0.1";

    fn pipeline(db: &Path, globs: &[&str], hostname: &str) -> Pipeline {
        let loopback: IpAddr = LOOPBACK.parse().unwrap();
        let resolver = StaticResolver::default().with(loopback, hostname);
        let authorizer = Authorizer::from_globs(globs, Arc::new(resolver)).unwrap();
        let persister = Persister::new(
            store::open(db).unwrap(),
            KeyStore::new(DEFAULT_CACHE_CAPACITY),
        );
        Pipeline::new(authorizer, persister)
    }

    async fn start(pipeline: Pipeline) -> (SocketAddr, ShutdownHandle, Arc<Counters>, tokio::task::JoinHandle<Summary>) {
        let server = StatServer::bind("127.0.0.1:0", pipeline, ShutdownHandle::new())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let counters = server.counters();
        let task = tokio::spawn(server.run());
        (addr, shutdown, counters, task)
    }

    async fn send(addr: SocketAddr, bytes: &[u8]) {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(bytes, addr).await.unwrap();
    }

    async fn wait_for_received(counters: &Counters, received: u64) {
        timeout(Duration::from_secs(5), async {
            while counters.snapshot().received < received {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("datagram was not received in time");
    }

    async fn stop(shutdown: &ShutdownHandle, task: tokio::task::JoinHandle<Summary>) -> Summary {
        shutdown.request();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("server did not stop in time")
            .unwrap()
    }

    fn stored_rows(db: &Path) -> i64 {
        usage_count(&store::open(db).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let (addr, shutdown, counters, task) =
            start(pipeline(&db, &["*.example.org"], "node1.example.org")).await;

        send(addr, &codec::encode(&sample_datagram()).unwrap()).await;
        wait_for_received(&counters, 1).await;

        let summary = stop(&shutdown, task).await;
        assert_eq!(summary.received, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(shutdown.state(), ServerState::Terminated);

        let conn = store::open(&db).unwrap();
        assert_eq!(usage_count(&conn).unwrap(), 1);
        let usage = load_usage(&conn, 1).unwrap().unwrap();
        assert_eq!(usage.site, "site1");
        assert_eq!(
            format!(
                "{}:{}:{}:{}",
                usage.module_name, usage.module_version, usage.module_arch, usage.module_mode
            ),
            "gcc:9.2:x86_64:release"
        );
        assert_eq!(usage.user, "alice");
        assert_eq!(usage.hostname, "node1");
        assert_eq!(
            (usage.ncpus, usage.host_cpus, usage.ngpus, usage.host_gpus, usage.nodes),
            (4, 8, 0, 0, 1)
        );
        assert_eq!(usage.flags, 0);
        assert_eq!(usage.time, SAMPLE_TIMESTAMP);
    }

    #[tokio::test]
    async fn test_corrupted_checksum_only_counts_received() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let (addr, shutdown, counters, task) = start(pipeline(&db, &[], "node1")).await;

        let mut bytes = codec::encode(&sample_datagram()).unwrap();
        bytes[WIRE_SIZE - 1] ^= 0x01;
        send(addr, &bytes).await;
        send(addr, &bytes[..100]).await;
        wait_for_received(&counters, 2).await;

        let summary = stop(&shutdown, task).await;
        assert_eq!(summary.received, 2);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.malformed, 2);
        assert_eq!(stored_rows(&db), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_host_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let (addr, shutdown, counters, task) =
            start(pipeline(&db, &["*.example.org"], "node1.other.org")).await;

        send(addr, &codec::encode(&sample_datagram()).unwrap()).await;
        wait_for_received(&counters, 1).await;

        let summary = stop(&shutdown, task).await;
        assert_eq!(summary.received, 1);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.unauthorized, 1);
        assert_eq!(stored_rows(&db), 0);
    }

    #[tokio::test]
    async fn test_bad_traffic_does_not_stop_server() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let (addr, shutdown, counters, task) = start(pipeline(&db, &[], "node1")).await;

        send(addr, b"garbage").await;
        send(addr, &[0u8; WIRE_SIZE + 40]).await;
        send(addr, &codec::encode(&sample_datagram()).unwrap()).await;
        wait_for_received(&counters, 3).await;

        let summary = stop(&shutdown, task).await;
        assert_eq!(summary.received, 3);
        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(stored_rows(&db), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let (_addr, shutdown, _counters, task) = start(pipeline(&db, &[], "node1")).await;

        sleep(Duration::from_millis(20)).await;
        assert_eq!(shutdown.state(), ServerState::Running);

        let summary = stop(&shutdown, task).await;
        assert_eq!(summary, Summary::default());
        assert!(summary.successful <= summary.received);
        assert_eq!(shutdown.state(), ServerState::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_requested_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let server = StatServer::bind("127.0.0.1:0", pipeline(&db, &[], "node1"), ShutdownHandle::new())
            .await
            .unwrap();
        let shutdown = server.shutdown_handle();
        shutdown.request();
        assert_eq!(shutdown.state(), ServerState::ShutdownRequested);

        let summary = timeout(Duration::from_secs(5), server.run()).await.unwrap();
        assert_eq!(summary.received, 0);
        assert_eq!(shutdown.state(), ServerState::Terminated);

        // No effect once terminated
        shutdown.request();
        assert_eq!(shutdown.state(), ServerState::Terminated);
    }

    #[tokio::test]
    async fn test_independent_servers() {
        let dir = tempfile::tempdir().unwrap();
        let (_, first, _, first_task) = start(pipeline(&dir.path().join("a.db"), &[], "node1")).await;
        let (_, second, _, second_task) = start(pipeline(&dir.path().join("b.db"), &[], "node1")).await;

        stop(&first, first_task).await;
        assert_eq!(first.state(), ServerState::Terminated);
        assert_eq!(second.state(), ServerState::Running);
        stop(&second, second_task).await;
    }

    #[test]
    fn test_snapshot_while_counting() {
        let counters = Arc::new(Counters::default());
        let writer = {
            let counters = counters.clone();
            std::thread::spawn(move || {
                for _ in 0..100_000 {
                    counters.received.fetch_add(1, Ordering::Relaxed);
                    counters.record(&Outcome::Stored(1));
                }
            })
        };

        while !writer.is_finished() {
            let summary = counters.snapshot();
            assert!(summary.successful <= summary.received);
        }
        writer.join().unwrap();
        assert_eq!(counters.snapshot().successful, 100_000);
    }

    #[test]
    fn test_pipeline_failed_persist() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stat.db");
        let mut pipeline = pipeline(&db, &[], "node1");
        pipeline
            .persister()
            .connection()
            .execute_batch(r#"DROP TABLE "STATISTICS""#)
            .unwrap();

        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let bytes = codec::encode(&sample_datagram()).unwrap();
        assert!(matches!(pipeline.process(&bytes, peer), Outcome::Failed(_)));

        let counters = Counters::default();
        counters.record(&pipeline.process(&bytes, peer));
        assert_eq!(counters.snapshot().failed, 1);
    }
}
