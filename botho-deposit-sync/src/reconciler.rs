//! Connect/disconnect reconciliation against the ledger's token history.
//!
//! Before sending anything, the reconciler asks the ledger which updates it
//! already holds for a `(user_id, tx_id)` pair and pairs every debit with the
//! credit token it names. What is left over decides the action:
//!
//! | unpaired credits | connect          | disconnect          |
//! |------------------|------------------|---------------------|
//! | 0                | send credit      | nothing to reverse  |
//! | 1                | already applied  | send paired debit   |
//! | 2+               | consistency error, entry left unresolved |
//!
//! Per-entry failures never abort the rest of a record.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::charge::{ChargeKey, ChargeRecord};
use crate::charge_ledger::ChargeLedger;
use crate::error::SyncError;
use crate::ledger_client::HistoryEntry;
use crate::metrics::SyncMetrics;
use crate::sync_client::SyncClient;
use crate::types::{BlockHash, BusinessId, Direction};

/// Credit tokens in `history` not reversed by any debit.
pub fn unpaired_credits(history: &[HistoryEntry]) -> Vec<BusinessId> {
    let reversed: BTreeSet<BusinessId> = history
        .iter()
        .filter(|h| h.direction == Direction::Debit)
        .filter_map(|h| h.paired_token)
        .collect();

    history
        .iter()
        .filter(|h| h.direction == Direction::Credit && !reversed.contains(&h.token))
        .map(|h| h.token)
        .collect()
}

/// The single outstanding credit token for `key`, if any.
///
/// More than one outstanding credit means the history is corrupt and is
/// reported as [`SyncError::Consistency`].
pub fn unpaired_credit(
    key: &ChargeKey,
    history: &[HistoryEntry],
) -> Result<Option<BusinessId>, SyncError> {
    let unpaired = unpaired_credits(history);
    match unpaired.as_slice() {
        [] => Ok(None),
        [token] => Ok(Some(*token)),
        _ => Err(SyncError::Consistency {
            key: key.clone(),
            unpaired: unpaired.len(),
        }),
    }
}

/// Outcome of reconciling one record.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    /// Updates sent and acknowledged
    pub applied: usize,
    /// Entries whose credit was found already applied
    pub already_applied: usize,
    /// Disconnect entries whose credit was never delivered
    pub never_delivered: usize,
    /// Entries left unresolved, with the reason
    pub failures: Vec<(ChargeKey, SyncError)>,
}

impl ReconcileSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn consistency_errors(&self) -> usize {
        self.failures.iter().filter(|(_, e)| e.is_consistency()).count()
    }

    fn record_failure(&mut self, key: ChargeKey, direction: Direction, error: SyncError) {
        if error.is_consistency() {
            tracing::error!(
                user_id = key.user_id,
                tx_id = %key.tx_id,
                %direction,
                "Ledger history inconsistent, leaving entry unresolved: {}",
                error
            );
        } else {
            tracing::warn!(
                user_id = key.user_id,
                tx_id = %key.tx_id,
                %direction,
                "Ledger sync failed, will retry: {}",
                error
            );
        }
        self.failures.push((key, error));
    }
}

/// Drives connect- and disconnect-side reconciliation of charge records.
pub struct Reconciler {
    client: SyncClient,
    metrics: Option<Arc<SyncMetrics>>,
}

impl Reconciler {
    pub fn new(client: SyncClient) -> Self {
        Self {
            client,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn observe(&self, direction: Direction, summary: &ReconcileSummary) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(direction, summary);
        }
    }

    async fn outstanding_credit(&self, key: &ChargeKey) -> Result<Option<BusinessId>, SyncError> {
        let history = self.client.history(key).await?;
        unpaired_credit(key, &history)
    }

    /// Credit every unsynced entry of a block on the main chain.
    ///
    /// The updated record is persisted whether or not every entry succeeded;
    /// only a persistence failure is returned as an error.
    pub async fn reconcile_connect(
        &self,
        ledger: &mut ChargeLedger,
        hash: &BlockHash,
        mut record: ChargeRecord,
    ) -> Result<ReconcileSummary, SyncError> {
        let mut summary = ReconcileSummary::default();
        let flipped = record.orient(Direction::Credit);

        for (key, entry) in record.pending_entries() {
            match self.outstanding_credit(&key).await {
                Ok(Some(token)) => {
                    tracing::debug!(
                        block = %hash.short(),
                        user_id = key.user_id,
                        tx_id = %key.tx_id,
                        token,
                        "Credit already applied"
                    );
                    record.mark_synced(&key);
                    summary.already_applied += 1;
                }
                Ok(None) => match self.client.credit(&key, &entry).await {
                    Ok(_) => {
                        record.mark_synced(&key);
                        summary.applied += 1;
                    }
                    Err(e) => summary.record_failure(key, Direction::Credit, e),
                },
                Err(e) => summary.record_failure(key, Direction::Credit, e),
            }
        }

        self.observe(Direction::Credit, &summary);
        if flipped || summary.applied > 0 || summary.already_applied > 0 {
            ledger.record_block(hash, record)?;
        }
        Ok(summary)
    }

    /// Reverse every delivered credit of a block that left the main chain.
    ///
    /// Progress is persisted, but unless every entry is resolved the call
    /// fails and the record stays in the ledger for the next sweep.
    pub async fn reconcile_disconnect(
        &self,
        ledger: &mut ChargeLedger,
        hash: &BlockHash,
        mut record: ChargeRecord,
    ) -> Result<ReconcileSummary, SyncError> {
        let mut summary = ReconcileSummary::default();
        let flipped = record.orient(Direction::Debit);

        for (key, entry) in record.pending_entries() {
            match self.outstanding_credit(&key).await {
                Ok(Some(credit_token)) => {
                    match self.client.debit(&key, &entry, credit_token).await {
                        Ok(_) => {
                            record.mark_synced(&key);
                            summary.applied += 1;
                        }
                        Err(e) => summary.record_failure(key, Direction::Debit, e),
                    }
                }
                Ok(None) => {
                    record.mark_synced(&key);
                    summary.never_delivered += 1;
                }
                Err(e) => summary.record_failure(key, Direction::Debit, e),
            }
        }

        self.observe(Direction::Debit, &summary);
        if flipped || summary.applied > 0 || summary.never_delivered > 0 {
            ledger.record_block(hash, record)?;
        }

        if summary.is_complete() {
            return Ok(summary);
        }

        let unresolved = summary.failures.len();
        match summary.failures.into_iter().find(|(_, e)| e.is_consistency()) {
            Some((_, consistency)) => Err(consistency),
            None => Err(SyncError::RetryableSync(format!(
                "block {}: {} credits not yet reversed",
                hash.short(),
                unresolved
            ))),
        }
    }
}
