//! In-memory charge ledger mirrored to durable storage.
//!
//! Writes go to the [`ChargeStore`] first and to memory second, so memory
//! never holds a record the store does not, and a restart can always rebuild
//! memory from the store. This is the only mutable state shared between the
//! block-event handlers and the sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::charge::ChargeRecord;
use crate::error::SyncError;
use crate::store::ChargeStore;
use crate::types::BlockHash;

/// Block hash -> charge record, for every block connected at least once and
/// not yet fully disconnected and reconciled.
pub struct ChargeLedger {
    records: BTreeMap<BlockHash, ChargeRecord>,
    store: Arc<dyn ChargeStore>,
}

impl ChargeLedger {
    /// Open the ledger, rebuilding memory from `store`.
    pub fn open(store: Arc<dyn ChargeStore>) -> Result<Self, SyncError> {
        let records = store.load_all()?;
        if !records.is_empty() {
            tracing::info!(
                "Recovered {} pending charge records from durable store",
                records.len()
            );
        }
        Ok(Self { records, store })
    }

    /// Store `record` for `hash`, replacing any previous record.
    ///
    /// Empty records are not stored. Returns whether the record was stored.
    pub fn record_block(
        &mut self,
        hash: &BlockHash,
        record: ChargeRecord,
    ) -> Result<bool, SyncError> {
        if record.is_empty() {
            return Ok(false);
        }
        self.store.put(hash, &record)?;
        self.records.insert(*hash, record);
        Ok(true)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&ChargeRecord> {
        self.records.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.records.contains_key(hash)
    }

    /// Remove the record for `hash` from the store, then from memory.
    pub fn remove(&mut self, hash: &BlockHash) -> Result<Option<ChargeRecord>, SyncError> {
        self.store.delete(hash)?;
        Ok(self.records.remove(hash))
    }

    /// Visit every tracked record in block-hash order.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&BlockHash, &ChargeRecord),
    {
        for (hash, record) in &self.records {
            visitor(hash, record);
        }
    }

    /// Tracked block hashes in iteration order.
    pub fn hashes(&self) -> Vec<BlockHash> {
        let mut hashes = Vec::with_capacity(self.records.len());
        self.for_each(|hash, _| hashes.push(*hash));
        hashes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
