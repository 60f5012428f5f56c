//! LMDB-backed cache backend.
//!
//! Uses the heed crate (Rust bindings for LMDB) as the durable on-device
//! medium. Every write commits its own transaction, so a value that was
//! written survives a crash or restart of the host process.
//!
//! # Quota
//!
//! The LMDB map size is the storage quota. A write that would grow the map
//! past it fails with `MDB_MAP_FULL`, surfaced as
//! [`StorageError::QuotaExceeded`].

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError};
use taskroom_core::{StorageError, StorageResult};

use super::traits::CacheBackend;

const DATABASE_NAME: &str = "taskroom";

/// Error type for opening the LMDB environment.
#[derive(Debug, thiserror::Error)]
pub enum LmdbOpenError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error while creating the database.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error while preparing the directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbOpenError> for StorageError {
    fn from(e: LmdbOpenError) -> Self {
        StorageError::Backend {
            reason: e.to_string(),
        }
    }
}

fn map_heed(e: heed::Error) -> StorageError {
    match e {
        heed::Error::Mdb(MdbError::MapFull) => StorageError::QuotaExceeded {
            reason: "LMDB map is full".to_string(),
        },
        heed::Error::Mdb(MdbError::Corrupted) => StorageError::Corrupted {
            key: DATABASE_NAME.to_string(),
            reason: "LMDB reported a corrupted page".to_string(),
        },
        other => StorageError::Backend {
            reason: other.to_string(),
        },
    }
}

/// Durable [`CacheBackend`] over a single named LMDB database.
pub struct LmdbBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbBackend {
    /// Open (or create) the environment at `path`.
    ///
    /// `max_size_mb` is the map size and therefore the storage quota.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbOpenError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbOpenError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbOpenError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(DATABASE_NAME))
            .map_err(|e| LmdbOpenError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbOpenError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    fn collect_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtxn = self.env.read_txn().map_err(map_heed)?;
        let iter = self.db.prefix_iter(&rtxn, prefix).map_err(map_heed)?;

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(map_heed)?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }
}

#[async_trait]
impl CacheBackend for LmdbBackend {
    async fn read(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(map_heed)?;
        let value = self.db.get(&rtxn, key).map_err(map_heed)?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut wtxn = self.env.write_txn().map_err(map_heed)?;
        self.db.put(&mut wtxn, key, value).map_err(map_heed)?;
        wtxn.commit().map_err(map_heed)
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(map_heed)?;
        let existed = self.db.delete(&mut wtxn, key).map_err(map_heed)?;
        wtxn.commit().map_err(map_heed)?;
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.collect_prefix(prefix)
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> StorageResult<u64> {
        let keys: Vec<Vec<u8>> = self
            .collect_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn().map_err(map_heed)?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key).map_err(map_heed)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(map_heed)?;
        Ok(deleted)
    }
}
