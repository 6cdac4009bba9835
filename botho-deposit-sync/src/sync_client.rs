//! Ledger sync client.
//!
//! Sends exactly one update per call to the [`LedgerService`], bounded by a
//! timeout. It never retries: a failed or timed-out call surfaces as
//! [`SyncError::RetryableSync`] and the sweeper tries again on its next tick.
//! Whether a credit was actually applied is decided by the token history,
//! never by the outcome of a call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::charge::{ChargeEntry, ChargeKey};
use crate::error::SyncError;
use crate::ledger_client::{mint_token, HistoryEntry, LedgerService, UpdateRequest};
use crate::types::{BusinessId, Direction};

pub struct SyncClient {
    service: Arc<dyn LedgerService>,
    asset: String,
    timeout: Duration,
}

impl SyncClient {
    pub fn new(service: Arc<dyn LedgerService>, asset: impl Into<String>, timeout: Duration) -> Self {
        Self {
            service,
            asset: asset.into(),
            timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::RetryableSync(format!(
                "{} timed out after {:?}",
                what, self.timeout
            ))),
        }
    }

    /// Updates already applied for `key`.
    pub async fn history(&self, key: &ChargeKey) -> Result<Vec<HistoryEntry>, SyncError> {
        self.bounded(
            "history query",
            self.service.query_history(key.user_id, &key.tx_id),
        )
        .await
    }

    /// Credit `entry.amount` to the user. Returns the token used.
    pub async fn credit(&self, key: &ChargeKey, entry: &ChargeEntry) -> Result<BusinessId, SyncError> {
        self.submit(key, entry, Direction::Credit, None).await
    }

    /// Reverse the credit applied under `credit_token`. Returns the token used.
    pub async fn debit(
        &self,
        key: &ChargeKey,
        entry: &ChargeEntry,
        credit_token: BusinessId,
    ) -> Result<BusinessId, SyncError> {
        self.submit(key, entry, Direction::Debit, Some(credit_token))
            .await
    }

    async fn submit(
        &self,
        key: &ChargeKey,
        entry: &ChargeEntry,
        direction: Direction,
        paired_token: Option<BusinessId>,
    ) -> Result<BusinessId, SyncError> {
        let request = UpdateRequest {
            user_id: key.user_id,
            tx_id: key.tx_id.clone(),
            asset: self.asset.clone(),
            amount: entry.delta(direction),
            direction,
            token: mint_token(),
            paired_token,
        };

        self.bounded("ledger update", self.service.submit_update(&request))
            .await?;

        tracing::info!(
            user_id = key.user_id,
            tx_id = %key.tx_id,
            amount = request.amount,
            %direction,
            token = request.token,
            paired_token = ?paired_token,
            "Ledger update applied"
        );
        Ok(request.token)
    }
}
