//! Durable storage for charge records.
//!
//! The charge ledger mirrors every record into a [`ChargeStore`] keyed by
//! block hash, so pending credits survive a restart. [`LmdbChargeStore`] is
//! the production backend; [`MemoryChargeStore`] is used for dry runs and
//! tests.

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::charge::ChargeRecord;
use crate::error::SyncError;
use crate::types::BlockHash;

/// LMDB database holding `block hash (32 bytes) -> bincode(ChargeRecord)`.
pub const CHARGES_DB_NAME: &str = "charge_ledger:records_by_block";

const MAP_SIZE: usize = 256 * 1024 * 1024; // 256MB

/// Key-value persistence for charge records.
pub trait ChargeStore: Send + Sync {
    /// Insert or overwrite the record for `hash`.
    fn put(&self, hash: &BlockHash, record: &ChargeRecord) -> Result<(), SyncError>;

    /// Remove the record for `hash`. Removing an absent record succeeds.
    fn delete(&self, hash: &BlockHash) -> Result<(), SyncError>;

    /// Every stored record, used once at startup.
    fn load_all(&self) -> Result<BTreeMap<BlockHash, ChargeRecord>, SyncError>;
}

/// LMDB-backed charge store.
pub struct LmdbChargeStore {
    env: Environment,
    /// records: block hash -> ChargeRecord
    charges: Database,
}

impl LmdbChargeStore {
    /// Open or create the store in directory `path`.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        fs::create_dir_all(path).map_err(|e| {
            SyncError::Persistence(format!("failed to create {:?}: {}", path, e))
        })?;

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(MAP_SIZE)
            .open(path)?;
        let charges = env.create_db(Some(CHARGES_DB_NAME), DatabaseFlags::empty())?;

        tracing::debug!("Opened charge store at {:?}", path);

        Ok(Self { env, charges })
    }
}

impl ChargeStore for LmdbChargeStore {
    fn put(&self, hash: &BlockHash, record: &ChargeRecord) -> Result<(), SyncError> {
        let bytes = bincode::serialize(record)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.charges, hash.as_bytes(), &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn delete(&self, hash: &BlockHash) -> Result<(), SyncError> {
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.charges, hash.as_bytes(), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }

    fn load_all(&self) -> Result<BTreeMap<BlockHash, ChargeRecord>, SyncError> {
        let txn = self.env.begin_ro_txn()?;
        let mut records = BTreeMap::new();
        {
            let mut cursor = txn.open_ro_cursor(self.charges)?;
            for item in cursor.iter_start() {
                let (key, value) = item?;
                let hash = BlockHash::try_from(key).map_err(SyncError::Persistence)?;
                let record: ChargeRecord = bincode::deserialize(value)?;
                records.insert(hash, record);
            }
        }
        txn.commit()?;
        Ok(records)
    }
}

/// Non-durable store kept entirely in memory.
#[derive(Default)]
pub struct MemoryChargeStore {
    records: Mutex<BTreeMap<BlockHash, ChargeRecord>>,
}

impl MemoryChargeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<BlockHash, ChargeRecord>>, SyncError> {
        self.records
            .lock()
            .map_err(|_| SyncError::Persistence("memory store lock poisoned".to_string()))
    }
}

impl ChargeStore for MemoryChargeStore {
    fn put(&self, hash: &BlockHash, record: &ChargeRecord) -> Result<(), SyncError> {
        self.lock()?.insert(*hash, record.clone());
        Ok(())
    }

    fn delete(&self, hash: &BlockHash) -> Result<(), SyncError> {
        self.lock()?.remove(hash);
        Ok(())
    }

    fn load_all(&self) -> Result<BTreeMap<BlockHash, ChargeRecord>, SyncError> {
        Ok(self.lock()?.clone())
    }
}
