//! Background watcher thread.
//!
//! Started before the ingestion loop and terminated after it. Between those
//! points it periodically logs the live counters.

use crate::server::Counters;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Command {
    Terminate,
}

pub struct Watcher {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
    heartbeats: Arc<AtomicU64>,
}

impl Watcher {
    pub fn start(interval: Duration, counters: Arc<Counters>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let heartbeats = Arc::new(AtomicU64::new(0));

        let beats = heartbeats.clone();
        let handle = thread::Builder::new()
            .name("softstat-watcher".into())
            .spawn(move || watch(rx, interval, counters, beats))?;

        Ok(Watcher {
            tx,
            handle,
            heartbeats,
        })
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    /// Asks the thread to stop. Returns immediately.
    pub fn terminate(&self) {
        // The thread also stops when the channel disconnects
        let _ = self.tx.send(Command::Terminate);
    }

    /// Joins the thread.
    pub fn wait(self) {
        if self.handle.join().is_err() {
            tracing::error!("watcher thread panicked");
        }
    }
}

fn watch(
    rx: mpsc::Receiver<Command>,
    interval: Duration,
    counters: Arc<Counters>,
    heartbeats: Arc<AtomicU64>,
) {
    let started = Instant::now();

    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let snapshot = counters.snapshot();
                heartbeats.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    uptime_secs = started.elapsed().as_secs(),
                    received = snapshot.received,
                    successful = snapshot.successful,
                    "server alive"
                );
            }
            Ok(Command::Terminate) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!("watcher stopped");
}
