//! Get-or-create mapping from text values to surrogate key ids.
//!
//! The lookup, insert and re-query below are not atomic on their own. They are
//! race-free only because a single ingestion loop drives them, one datagram at
//! a time. Any additional writer needs insert-or-ignore or a per-key lock; the
//! UNIQUE constraint on `KEYS` turns a violation into an error rather than a
//! duplicate key.

use crate::metrics_defs::{KEY_CACHE_HIT, KEY_CACHE_MISS, KEYS_CREATED};
use crate::store::StoreError;
use moka::sync::Cache;
use rusqlite::{OptionalExtension, Transaction, params};
use shared::counter;

pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

pub struct KeyStore {
    // Only ever holds ids whose rows are committed.
    cache: Cache<String, i64>,
    // Ids resolved by the open transaction, published on commit.
    staged: Vec<(String, i64)>,
}

impl KeyStore {
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(capacity).build();

        KeyStore {
            cache,
            staged: Vec::new(),
        }
    }

    /// Returns the id for `key`, inserting a new row if the value is unseen.
    pub fn resolve(&mut self, tx: &Transaction<'_>, key: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.cache.get(key) {
            counter!(KEY_CACHE_HIT).increment(1);
            return Ok(id);
        }
        counter!(KEY_CACHE_MISS).increment(1);

        let id = match find_key(tx, key)? {
            Some(id) => id,
            None => {
                tx.prepare_cached(r#"INSERT INTO "KEYS" ("Key") VALUES (?1)"#)?
                    .execute(params![key])?;
                let id = find_key(tx, key)?.ok_or_else(|| StoreError::KeyNotCreated(key.into()))?;
                counter!(KEYS_CREATED).increment(1);
                tracing::debug!(key, id, "created surrogate key");
                id
            }
        };

        self.staged.push((key.to_string(), id));
        Ok(id)
    }

    /// Publishes the ids resolved since the last commit or rollback.
    pub fn commit(&mut self) {
        for (key, id) in self.staged.drain(..) {
            self.cache.insert(key, id);
        }
    }

    /// Forgets the ids resolved since the last commit; their rows may be gone.
    pub fn rollback(&mut self) {
        self.staged.clear();
    }

    pub fn cached(&self, key: &str) -> Option<i64> {
        self.cache.get(key)
    }
}

fn find_key(tx: &Transaction<'_>, key: &str) -> Result<Option<i64>, StoreError> {
    let id = tx
        .prepare_cached(r#"SELECT "ID" FROM "KEYS" WHERE "Key" = ?1"#)?
        .query_row(params![key], |row| row.get(0))
        .optional()?;
    Ok(id)
}
