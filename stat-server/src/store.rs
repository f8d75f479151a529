//! SQLite statistics database: connection setup and schema.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;

pub const SCHEMA_SQL: &str = r#"
-- Surrogate keys for every textual dimension. Ids are assigned by SQLite and
-- never reused or changed.
CREATE TABLE IF NOT EXISTS "KEYS" (
    "ID"  INTEGER PRIMARY KEY AUTOINCREMENT,
    "Key" TEXT NOT NULL UNIQUE
);

-- One row per accepted usage report.
CREATE TABLE IF NOT EXISTS "STATISTICS" (
    "ID"         INTEGER PRIMARY KEY AUTOINCREMENT,
    "Site"       INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "ModuleName" INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "ModuleVers" INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "ModuleArch" INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "ModuleMode" INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "User"       INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "HostName"   INTEGER NOT NULL REFERENCES "KEYS"("ID"),
    "NCPUS"      INTEGER NOT NULL,
    "NHostCPUS"  INTEGER NOT NULL,
    "NGPUS"      INTEGER NOT NULL,
    "NHostGPUS"  INTEGER NOT NULL,
    "NNODES"     INTEGER NOT NULL,
    "Flags"      INTEGER NOT NULL,
    "Time"       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS "IDX_STATISTICS_TIME" ON "STATISTICS"("Time");
"#;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("key {0:?} was inserted but could not be read back")]
    KeyNotCreated(String),
}

/// Opens (creating if needed) the statistics database at `path`.
pub fn open(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "opened statistics database");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    prepare(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    prepare(&conn)?;
    Ok(conn)
}

fn prepare(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// A usage record with its surrogate keys resolved back to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUsage {
    pub site: String,
    pub module_name: String,
    pub module_version: String,
    pub module_arch: String,
    pub module_mode: String,
    pub user: String,
    pub hostname: String,
    pub ncpus: i64,
    pub host_cpus: i64,
    pub ngpus: i64,
    pub host_gpus: i64,
    pub nodes: i64,
    pub flags: i64,
    pub time: i64,
}

pub fn load_usage(conn: &Connection, id: i64) -> Result<Option<StoredUsage>, StoreError> {
    let usage = conn
        .query_row(
            r#"SELECT ks."Key", kn."Key", kv."Key", ka."Key", km."Key", ku."Key", kh."Key",
                      s."NCPUS", s."NHostCPUS", s."NGPUS", s."NHostGPUS", s."NNODES",
                      s."Flags", s."Time"
               FROM "STATISTICS" s
               JOIN "KEYS" ks ON ks."ID" = s."Site"
               JOIN "KEYS" kn ON kn."ID" = s."ModuleName"
               JOIN "KEYS" kv ON kv."ID" = s."ModuleVers"
               JOIN "KEYS" ka ON ka."ID" = s."ModuleArch"
               JOIN "KEYS" km ON km."ID" = s."ModuleMode"
               JOIN "KEYS" ku ON ku."ID" = s."User"
               JOIN "KEYS" kh ON kh."ID" = s."HostName"
               WHERE s."ID" = ?1"#,
            params![id],
            |row| {
                Ok(StoredUsage {
                    site: row.get(0)?,
                    module_name: row.get(1)?,
                    module_version: row.get(2)?,
                    module_arch: row.get(3)?,
                    module_mode: row.get(4)?,
                    user: row.get(5)?,
                    hostname: row.get(6)?,
                    ncpus: row.get(7)?,
                    host_cpus: row.get(8)?,
                    ngpus: row.get(9)?,
                    host_gpus: row.get(10)?,
                    nodes: row.get(11)?,
                    flags: row.get(12)?,
                    time: row.get(13)?,
                })
            },
        )
        .optional()?;
    Ok(usage)
}

pub fn usage_count(conn: &Connection) -> Result<i64, StoreError> {
    let count = conn.query_row(r#"SELECT COUNT(*) FROM "STATISTICS""#, [], |row| row.get(0))?;
    Ok(count)
}

pub fn key_count(conn: &Connection) -> Result<i64, StoreError> {
    let count = conn.query_row(r#"SELECT COUNT(*) FROM "KEYS""#, [], |row| row.get(0))?;
    Ok(count)
}
