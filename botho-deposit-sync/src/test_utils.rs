//! In-memory collaborators for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::address_index::AddressStore;
use crate::chain::{BlockSource, ChainIndex};
use crate::charge::{ChargeKey, ChargeRecord};
use crate::error::SyncError;
use crate::ledger_client::{HistoryEntry, LedgerService, UpdateRequest};
use crate::script::{p2pkh_script, AddressFingerprint};
use crate::store::{ChargeStore, MemoryChargeStore};
use crate::types::{Block, BlockHash, ChainTip, Transaction, TxOutput, UserId};

/// Fingerprint used as user `user_id`'s deposit address in tests.
pub fn fingerprint_for(user_id: UserId) -> AddressFingerprint {
    let mut fp = [0u8; 20];
    fp[..8].copy_from_slice(&user_id.to_le_bytes());
    fp[19] = 0xd5;
    AddressFingerprint(fp)
}

/// A non-coinbase transaction paying `amount` to `user_id`'s deposit address.
pub fn deposit_tx(txid: &str, user_id: UserId, amount: i64) -> Transaction {
    Transaction {
        txid: txid.to_string(),
        is_coinbase: false,
        outputs: vec![TxOutput {
            value: amount,
            script: p2pkh_script(&fingerprint_for(user_id)),
        }],
    }
}

#[derive(Default)]
struct ChainState {
    /// Main chain, index = height
    main: Vec<BlockHash>,
    /// Every block ever produced, orphans included
    blocks: HashMap<BlockHash, Block>,
    next_id: u64,
}

impl ChainState {
    fn mint_hash(&mut self) -> BlockHash {
        self.next_id += 1;
        let mut bytes = [0x5au8; 32];
        bytes[..8].copy_from_slice(&self.next_id.to_le_bytes());
        BlockHash(bytes)
    }

    fn push(&mut self, transactions: Vec<Transaction>) -> Block {
        let hash = self.mint_hash();
        let (prev_hash, height) = match self.main.last() {
            Some(prev) => (*prev, self.main.len() as u64),
            None => (BlockHash::default(), 0),
        };
        let block = Block {
            hash,
            prev_hash,
            height,
            transactions,
        };
        self.main.push(hash);
        self.blocks.insert(hash, block.clone());
        block
    }
}

/// Scriptable chain engine.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain of empty blocks at heights `0..=height`.
    pub fn with_height(height: u64) -> Self {
        let chain = Self::new();
        chain.extend(height + 1);
        chain
    }

    /// Append a block carrying `transactions` to the main chain.
    pub fn push(&self, transactions: Vec<Transaction>) -> Block {
        self.state.lock().unwrap().push(transactions)
    }

    /// Append `count` empty blocks.
    pub fn extend(&self, count: u64) -> Vec<Block> {
        let mut state = self.state.lock().unwrap();
        (0..count).map(|_| state.push(Vec::new())).collect()
    }

    /// Drop every main-chain block above `height`. The dropped blocks stay
    /// known, so they can still be looked up as orphans.
    pub fn rewind_to(&self, height: u64) -> Vec<BlockHash> {
        let mut state = self.state.lock().unwrap();
        let keep = (height + 1) as usize;
        if state.main.len() <= keep {
            return Vec::new();
        }
        state.main.split_off(keep)
    }

    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.state.lock().unwrap().main.get(height as usize).copied()
    }

    pub fn tip(&self) -> ChainTip {
        let state = self.state.lock().unwrap();
        let height = state.main.len().saturating_sub(1) as u64;
        ChainTip {
            hash: state.main.last().copied().unwrap_or_default(),
            height,
        }
    }
}

#[async_trait]
impl ChainIndex for MockChain {
    async fn best_tip(&self) -> Result<ChainTip, SyncError> {
        Ok(self.tip())
    }

    async fn ancestor_at_depth(
        &self,
        tip: &BlockHash,
        depth: u64,
    ) -> Result<Option<BlockHash>, SyncError> {
        let state = self.state.lock().unwrap();
        let mut current = match state.blocks.get(tip) {
            Some(block) => block,
            None => return Ok(None),
        };
        for _ in 0..depth {
            if current.height == 0 {
                return Ok(None);
            }
            current = match state.blocks.get(&current.prev_hash) {
                Some(block) => block,
                None => return Ok(None),
            };
        }
        Ok(Some(current.hash))
    }

    async fn main_chain_height(&self, hash: &BlockHash) -> Result<Option<u64>, SyncError> {
        let state = self.state.lock().unwrap();
        Ok(state.blocks.get(hash).and_then(|block| {
            (state.main.get(block.height as usize) == Some(hash)).then_some(block.height)
        }))
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn block_at_height(&self, height: u64) -> Result<Option<Block>, SyncError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .main
            .get(height as usize)
            .and_then(|hash| state.blocks.get(hash))
            .cloned())
    }
}

/// Balance ledger that keeps token history the way the real service does.
#[derive(Default)]
pub struct MockLedger {
    history: Mutex<BTreeMap<ChargeKey, Vec<HistoryEntry>>>,
    submitted: Mutex<Vec<UpdateRequest>>,
    failing: Mutex<HashSet<ChargeKey>>,
    submit_attempts: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted update, in order.
    pub fn submitted(&self) -> Vec<UpdateRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn credits(&self) -> Vec<UpdateRequest> {
        self.submitted()
            .into_iter()
            .filter(|r| r.direction == crate::types::Direction::Credit)
            .collect()
    }

    pub fn debits(&self) -> Vec<UpdateRequest> {
        self.submitted()
            .into_iter()
            .filter(|r| r.direction == crate::types::Direction::Debit)
            .collect()
    }

    /// Submit calls made, accepted or not.
    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    /// Reject every update for `key` until [`clear_failures`](Self::clear_failures).
    pub fn fail_submits_for(&self, key: ChargeKey) {
        self.failing.lock().unwrap().insert(key);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Replace the stored history for `key`.
    pub fn seed_history(&self, key: &ChargeKey, entries: Vec<HistoryEntry>) {
        self.history.lock().unwrap().insert(key.clone(), entries);
    }

    pub fn history_for(&self, key: &ChargeKey) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LedgerService for MockLedger {
    async fn query_history(
        &self,
        user_id: UserId,
        tx_id: &str,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        self.maybe_delay().await;
        Ok(self.history_for(&ChargeKey::new(user_id, tx_id)))
    }

    async fn submit_update(&self, request: &UpdateRequest) -> Result<(), SyncError> {
        self.maybe_delay().await;
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);

        let key = ChargeKey::new(request.user_id, request.tx_id.clone());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(SyncError::RetryableSync(format!("injected failure for {}", key)));
        }

        self.history
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(HistoryEntry {
                token: request.token,
                direction: request.direction,
                paired_token: request.paired_token,
            });
        self.submitted.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Charge store whose writes and deletes can be made to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryChargeStore,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

impl ChargeStore for FailingStore {
    fn put(&self, hash: &BlockHash, record: &ChargeRecord) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Persistence("injected write failure".into()));
        }
        self.inner.put(hash, record)
    }

    fn delete(&self, hash: &BlockHash) -> Result<(), SyncError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SyncError::Persistence("injected delete failure".into()));
        }
        self.inner.delete(hash)
    }

    fn load_all(&self) -> Result<BTreeMap<BlockHash, ChargeRecord>, SyncError> {
        self.inner.load_all()
    }
}

/// Address store with a fixed, editable user set.
#[derive(Default)]
pub struct StaticAddressStore {
    addresses: Mutex<HashMap<UserId, AddressFingerprint>>,
    unavailable: AtomicBool,
}

impl StaticAddressStore {
    /// Store where each user owns [`fingerprint_for`] its id.
    pub fn with_users(users: &[UserId]) -> Self {
        let store = Self::default();
        for user in users {
            store.add_user(*user);
        }
        store
    }

    pub fn add_user(&self, user_id: UserId) {
        self.addresses
            .lock()
            .unwrap()
            .insert(user_id, fingerprint_for(user_id));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl AddressStore for StaticAddressStore {
    async fn load_deposit_addresses(
        &self,
    ) -> Result<HashMap<UserId, AddressFingerprint>, SyncError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::RetryableSync("address store unavailable".into()));
        }
        Ok(self.addresses.lock().unwrap().clone())
    }
}
