use crate::codec::TextField;
use crate::datagram::UsageDatagram;
use crate::keystore::KeyStore;
use crate::metrics_defs::PERSIST_DURATION;
use crate::store::StoreError;
use rusqlite::{Connection, Transaction, params};
use shared::histogram;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error("could not begin transaction: {0}")]
    Begin(#[source] rusqlite::Error),

    #[error("could not resolve {field}: {source}")]
    Key { field: TextField, source: StoreError },

    #[error("could not insert usage record: {0}")]
    Insert(#[source] rusqlite::Error),

    #[error("could not commit transaction: {0}")]
    Commit(#[source] rusqlite::Error),
}

/// Writes one usage record per accepted datagram.
///
/// Each call is its own transaction: either the record and every key it
/// created are committed, or nothing is.
pub struct Persister {
    conn: Connection,
    keys: KeyStore,
}

impl Persister {
    pub fn new(conn: Connection, keys: KeyStore) -> Self {
        Persister { conn, keys }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Stores the datagram and returns the id of the new record.
    ///
    /// Failures are not retried; the caller drops the datagram.
    pub fn persist(&mut self, datagram: &UsageDatagram) -> Result<i64, PersistError> {
        let started = Instant::now();
        let tx = self.conn.transaction().map_err(PersistError::Begin)?;

        match write_record(&tx, &mut self.keys, datagram) {
            Ok(id) => {
                if let Err(e) = tx.commit() {
                    self.keys.rollback();
                    return Err(PersistError::Commit(e));
                }
                self.keys.commit();
                histogram!(PERSIST_DURATION).record(started.elapsed().as_secs_f64());
                Ok(id)
            }
            Err(e) => {
                self.keys.rollback();
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Releases the database connection.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_conn, e)| StoreError::Sqlite(e))
    }
}

fn write_record(
    tx: &Transaction<'_>,
    keys: &mut KeyStore,
    datagram: &UsageDatagram,
) -> Result<i64, PersistError> {
    let mut ids = [0i64; 7];
    for ((slot, field), value) in ids
        .iter_mut()
        .zip(TextField::ALL)
        .zip(datagram.dimensions())
    {
        *slot = keys
            .resolve(tx, value)
            .map_err(|source| PersistError::Key { field, source })?;
    }

    tx.prepare_cached(
        r#"INSERT INTO "STATISTICS" ("Site","ModuleName","ModuleVers","ModuleArch",
            "ModuleMode","User","HostName","NCPUS","NHostCPUS","NGPUS","NHostGPUS",
            "NNODES","Flags","Time") VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"#,
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            ids[0],
            ids[1],
            ids[2],
            ids[3],
            ids[4],
            ids[5],
            ids[6],
            datagram.ncpus,
            datagram.host_cpus,
            datagram.ngpus,
            datagram.host_gpus,
            datagram.nodes,
            datagram.flags,
            datagram.timestamp.timestamp(),
        ])
    })
    .map_err(PersistError::Insert)?;

    Ok(tx.last_insert_rowid())
}
