pub mod authorizer;
pub mod codec;
pub mod config;
pub mod datagram;
pub mod keystore;
pub mod metrics_defs;
pub mod persister;
pub mod server;
pub mod store;
pub mod watcher;

#[cfg(test)]
mod testutils;

use authorizer::{Authorizer, SystemResolver};
use keystore::KeyStore;
use persister::Persister;
use server::{Pipeline, ShutdownHandle, StatServer, Summary};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use store::StoreError;
use watcher::Watcher;

/// Failures that prevent the server from entering its receive loop.
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("invalid client pattern: {0}")]
    ClientPattern(#[from] glob::PatternError),

    #[error("unable to open statistics database {path}: {source}")]
    Database { path: PathBuf, source: StoreError },

    #[error("could not bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("unable to start watcher thread: {0}")]
    Watcher(#[source] io::Error),
}

impl StartupError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::ClientPattern(_) => 2,
            StartupError::Database { .. } => 3,
            StartupError::Bind { .. } => 4,
            StartupError::Watcher(_) => 1,
        }
    }
}

/// Opens the database, binds the socket and serves until `shutdown` is
/// requested.
pub async fn run(config: config::Config, shutdown: ShutdownHandle) -> Result<Summary, StartupError> {
    let authorizer = Authorizer::from_globs(config.clients.as_slice(), Arc::new(SystemResolver))?;

    let conn = store::open(&config.database.path).map_err(|source| StartupError::Database {
        path: config.database.path.clone(),
        source,
    })?;
    let persister = Persister::new(conn, KeyStore::new(config.key_cache.capacity));

    let addr = config.listener.addr();
    let server = StatServer::bind(&addr, Pipeline::new(authorizer.clone(), persister), shutdown)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!(
        listen = %addr,
        database = %config.database.path.display(),
        client_patterns = authorizer.pattern_count(),
        "statistics server started"
    );
    if authorizer.pattern_count() == 0 {
        tracing::warn!("no client patterns configured, every host may submit data");
    }

    let watcher = Watcher::start(config.watcher.interval(), server.counters())
        .map_err(StartupError::Watcher)?;

    let summary = server.run().await;

    watcher.terminate();
    watcher.wait();

    Ok(summary)
}
