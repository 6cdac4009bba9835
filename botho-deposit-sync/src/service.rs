//! Deposit sync service.
//!
//! [`DepositSync`] owns the charge ledger and wires the classifier, maturity
//! gate and reconciler together behind the two chain-engine callbacks
//! (`on_block_connected`, `on_block_disconnected`) and the sweeper's
//! [`sweep_once`](DepositSync::sweep_once).
//!
//! A single async mutex guards the charge ledger. Every path that reads
//! chain membership for a tracked block and then reconciles it holds that
//! mutex for the whole step, network calls included, so no block is ever
//! reconciled by two paths at once.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::address_index::{AddressStore, DepositAddressIndex};
use crate::chain::ChainIndex;
use crate::charge_ledger::ChargeLedger;
use crate::classifier::TransactionClassifier;
use crate::error::SyncError;
use crate::maturity::{confirmations, MaturityGate};
use crate::metrics::SyncMetrics;
use crate::reconciler::Reconciler;
use crate::types::{Block, BlockHash};

/// Tunables for crediting and sweeping.
#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    /// Confirmations required before a connect sync (M)
    pub maturity_depth: u64,
    /// Extra depth before the sweeper re-drives a connect (k)
    pub sweep_margin: u64,
    /// Classify coinbase outputs as deposits
    pub include_coinbase: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            maturity_depth: crate::maturity::DEFAULT_MATURITY_DEPTH,
            sweep_margin: 5,
            include_coinbase: false,
        }
    }
}

/// Result of one sweep over the charge ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tracked blocks examined
    pub visited: usize,
    /// Main-chain blocks deep enough to re-drive a connect
    pub connected: usize,
    /// Blocks found off the main chain
    pub disconnected: usize,
    /// Disconnected blocks fully reversed and removed
    pub resolved: usize,
    /// Blocks left with unresolved work
    pub failed: usize,
    /// Main-chain blocks not yet at `M + k` confirmations
    pub skipped_shallow: usize,
}

enum BlockOutcome {
    Resolved,
    Disconnected,
    Connected,
    Shallow,
    Gone,
}

/// Reorg-aware deposit crediting pipeline.
pub struct DepositSync {
    chain: Arc<dyn ChainIndex>,
    ledger: Mutex<ChargeLedger>,
    index: Mutex<DepositAddressIndex>,
    addresses: Arc<dyn AddressStore>,
    classifier: TransactionClassifier,
    gate: MaturityGate,
    reconciler: Reconciler,
    sweep_margin: u64,
    metrics: Option<Arc<SyncMetrics>>,
}

impl DepositSync {
    pub fn new(
        chain: Arc<dyn ChainIndex>,
        ledger: ChargeLedger,
        addresses: Arc<dyn AddressStore>,
        reconciler: Reconciler,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            chain,
            ledger: Mutex::new(ledger),
            index: Mutex::new(DepositAddressIndex::new()),
            addresses,
            classifier: TransactionClassifier::new(policy.include_coinbase),
            gate: MaturityGate::new(policy.maturity_depth),
            reconciler,
            sweep_margin: policy.sweep_margin,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Confirmations the sweeper waits for before re-driving a connect.
    pub fn sweep_depth(&self) -> u64 {
        self.gate.depth() + self.sweep_margin
    }

    /// Number of blocks tracked in the charge ledger.
    pub async fn pending_blocks(&self) -> usize {
        self.ledger.lock().await.len()
    }

    fn update_pending_gauge(&self, ledger: &ChargeLedger) {
        if let Some(metrics) = &self.metrics {
            metrics.pending_blocks.set(ledger.len() as i64);
        }
    }

    fn update_tip_gauge(&self, height: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.tip_height.set(height as i64);
        }
    }

    /// Handle a block joining the main chain.
    ///
    /// The block's deposits are recorded durably, then the block that has
    /// just reached maturity is credited. Only a failure to record the block
    /// is returned; reconciliation failures are left to the sweeper.
    pub async fn on_block_connected(&self, block: &Block) -> Result<(), SyncError> {
        let result = {
            let mut index = self.index.lock().await;
            if let Err(e) = index.refresh(self.addresses.as_ref()).await {
                tracing::warn!(
                    block = %block.hash.short(),
                    "Address refresh failed, classifying with {} cached addresses: {}",
                    index.len(),
                    e
                );
            }
            self.classifier.classify(block, &index)
        };

        let mut ledger = self.ledger.lock().await;

        let deposits = result.deposits_found;
        if ledger.record_block(&block.hash, result.record)? {
            tracing::info!(
                block = %block.hash.short(),
                height = block.height,
                deposits,
                "Recorded charge record"
            );
            if let Some(metrics) = &self.metrics {
                metrics.blocks_recorded.inc();
            }
        }
        self.update_pending_gauge(&ledger);

        let matured = match self.matured_block().await {
            Ok(Some(hash)) => hash,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("Maturity check failed, leaving to sweeper: {}", e);
                return Ok(());
            }
        };

        let Some(record) = ledger.get(&matured).cloned() else {
            return Ok(());
        };

        if let Err(e) = self
            .reconciler
            .reconcile_connect(&mut ledger, &matured, record)
            .await
        {
            tracing::warn!(
                block = %matured.short(),
                "Failed to persist connect progress, leaving to sweeper: {}",
                e
            );
        }
        Ok(())
    }

    async fn matured_block(&self) -> Result<Option<BlockHash>, SyncError> {
        let tip = self.chain.best_tip().await?;
        self.update_tip_gauge(tip.height);
        self.gate.matured_block(self.chain.as_ref(), &tip).await
    }

    /// Handle a block leaving the main chain.
    ///
    /// Every credit the block produced is reversed and the record removed.
    /// If any reversal fails the record stays for the sweeper; only a
    /// failure to remove it from the durable store is returned.
    pub async fn on_block_disconnected(&self, hash: &BlockHash) -> Result<(), SyncError> {
        let mut ledger = self.ledger.lock().await;
        let outcome = self.resolve_disconnected(&mut ledger, hash).await;
        self.update_pending_gauge(&ledger);

        match outcome {
            Ok(_) => Ok(()),
            Err(e @ SyncError::Persistence(_)) => Err(e),
            Err(e) => {
                tracing::warn!(
                    block = %hash.short(),
                    "Disconnect not fully reconciled, leaving to sweeper: {}",
                    e
                );
                Ok(())
            }
        }
    }

    /// Reverse and remove one off-chain block. Returns false if untracked.
    async fn resolve_disconnected(
        &self,
        ledger: &mut ChargeLedger,
        hash: &BlockHash,
    ) -> Result<bool, SyncError> {
        let Some(record) = ledger.get(hash).cloned() else {
            tracing::debug!(block = %hash.short(), "Disconnected block has no charge record");
            return Ok(false);
        };

        let summary = self.reconciler.reconcile_disconnect(ledger, hash, record).await?;
        ledger.remove(hash)?;

        tracing::info!(
            block = %hash.short(),
            debits = summary.applied,
            never_delivered = summary.never_delivered,
            "Disconnected block reconciled and removed"
        );
        Ok(true)
    }

    /// One sweep over every tracked block.
    ///
    /// Off-chain blocks are handled before main-chain ones, so a transaction
    /// that moved to another block during a reorg is reversed before it is
    /// credited again. Stops starting new blocks once `shutdown` is set.
    pub async fn sweep_once(&self, shutdown: &watch::Receiver<bool>) -> SweepReport {
        let mut report = SweepReport::default();
        let hashes = self.ledger.lock().await.hashes();

        let mut on_chain = Vec::new();
        let mut off_chain = Vec::new();
        for hash in hashes {
            report.visited += 1;
            match self.chain.is_on_main_chain(&hash).await {
                Ok(true) => on_chain.push(hash),
                Ok(false) => off_chain.push(hash),
                Err(e) => {
                    tracing::warn!(block = %hash.short(), "Chain membership check failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        for hash in off_chain.into_iter().chain(on_chain) {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested, stopping sweep early");
                break;
            }

            match self.sweep_block(&hash).await {
                Ok(BlockOutcome::Resolved) => {
                    report.disconnected += 1;
                    report.resolved += 1;
                }
                Ok(BlockOutcome::Disconnected) => {
                    report.disconnected += 1;
                    report.failed += 1;
                }
                Ok(BlockOutcome::Connected) => report.connected += 1,
                Ok(BlockOutcome::Shallow) => report.skipped_shallow += 1,
                Ok(BlockOutcome::Gone) => {}
                Err(e) => {
                    tracing::warn!(block = %hash.short(), "Sweep of block failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.pending_blocks.set(self.pending_blocks().await as i64);
        }
        report
    }

    async fn sweep_block(&self, hash: &BlockHash) -> Result<BlockOutcome, SyncError> {
        let mut ledger = self.ledger.lock().await;
        let Some(record) = ledger.get(hash).cloned() else {
            return Ok(BlockOutcome::Gone);
        };

        // Re-read chain state under the ledger lock.
        let tip = self.chain.best_tip().await?;
        self.update_tip_gauge(tip.height);

        let Some(height) = self.chain.main_chain_height(hash).await? else {
            return match self.resolve_disconnected(&mut ledger, hash).await {
                Ok(_) => Ok(BlockOutcome::Resolved),
                Err(e @ SyncError::Persistence(_)) => Err(e),
                Err(e) => {
                    tracing::warn!(block = %hash.short(), "Disconnect still pending: {}", e);
                    Ok(BlockOutcome::Disconnected)
                }
            };
        };

        if confirmations(tip.height, height) < self.sweep_depth() {
            return Ok(BlockOutcome::Shallow);
        }

        let summary = self.reconciler.reconcile_connect(&mut ledger, hash, record).await?;
        if summary.is_complete() {
            Ok(BlockOutcome::Connected)
        } else {
            Err(SyncError::RetryableSync(format!(
                "{} credits still pending",
                summary.failures.len()
            )))
        }
    }
}
