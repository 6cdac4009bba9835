//! Balance-ledger service interface.
//!
//! The remote ledger keeps every applied update together with the business
//! token it was submitted under. [`LedgerService`] abstracts the two calls
//! this crate needs; [`JsonRpcLedgerService`] speaks to the service over an
//! authenticated JSON-RPC channel.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::error::SyncError;
use crate::types::{BusinessId, Direction, UserId};

/// One update previously applied by the ledger service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Business token the update was submitted under
    pub token: BusinessId,
    pub direction: Direction,
    /// For debits, the credit token being reversed
    #[serde(default)]
    pub paired_token: Option<BusinessId>,
}

/// A balance update to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub user_id: UserId,
    pub tx_id: String,
    pub asset: String,
    /// Signed delta: positive for credits, negative for debits
    pub amount: i64,
    pub direction: Direction,
    /// Freshly minted token for this call
    pub token: BusinessId,
    /// For debits, the credit token being reversed
    pub paired_token: Option<BusinessId>,
}

/// Remote balance ledger.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Every update applied for `(user_id, tx_id)`.
    async fn query_history(
        &self,
        user_id: UserId,
        tx_id: &str,
    ) -> Result<Vec<HistoryEntry>, SyncError>;

    /// Apply an update. Any failure is retryable.
    async fn submit_update(&self, request: &UpdateRequest) -> Result<(), SyncError>;
}

/// Mint a new business token.
pub fn mint_token() -> BusinessId {
    rand::thread_rng().gen_range(1..=BusinessId::MAX)
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    accepted: bool,
    #[serde(default)]
    message: Option<String>,
}

/// [`LedgerService`] over JSON-RPC (`ledger_queryHistory`, `ledger_submitUpdate`).
pub struct JsonRpcLedgerService {
    rpc: crate::rpc::JsonRpcClient,
}

impl JsonRpcLedgerService {
    pub fn new(url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let rpc = crate::rpc::JsonRpcClient::new(url, auth_token, timeout)
            .map_err(|e| SyncError::RetryableSync(format!("ledger client setup: {}", e)))?;
        tracing::debug!("Ledger service at {}", rpc.url());
        Ok(Self { rpc })
    }
}

#[async_trait]
impl LedgerService for JsonRpcLedgerService {
    async fn query_history(
        &self,
        user_id: UserId,
        tx_id: &str,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        let history: Option<Vec<HistoryEntry>> = self
            .rpc
            .call_optional(
                "ledger_queryHistory",
                json!({ "userId": user_id, "txId": tx_id }),
            )
            .await
            .map_err(|e| SyncError::RetryableSync(format!("ledger_queryHistory: {}", e)))?;
        Ok(history.unwrap_or_default())
    }

    async fn submit_update(&self, request: &UpdateRequest) -> Result<(), SyncError> {
        let params = serde_json::to_value(request)
            .map_err(|e| SyncError::RetryableSync(format!("encode update: {}", e)))?;
        let result: SubmitResult = self
            .rpc
            .call("ledger_submitUpdate", params)
            .await
            .map_err(|e| SyncError::RetryableSync(format!("ledger_submitUpdate: {}", e)))?;

        if !result.accepted {
            return Err(SyncError::RetryableSync(format!(
                "ledger rejected {} for user {} tx {}: {}",
                request.direction,
                request.user_id,
                request.tx_id,
                result.message.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn debit_request() -> UpdateRequest {
        UpdateRequest {
            user_id: 42,
            tx_id: "tx1".into(),
            asset: "BTH".into(),
            amount: -500,
            direction: Direction::Debit,
            token: 2,
            paired_token: Some(1),
        }
    }

    async fn ledger(result: Value) -> (MockServer, JsonRpcLedgerService) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result })),
            )
            .mount(&server)
            .await;
        let service = JsonRpcLedgerService::new(
            &server.uri(),
            Some("secret".into()),
            Duration::from_secs(2),
        )
        .unwrap();
        (server, service)
    }

    #[test]
    fn test_mint_token_is_positive() {
        for _ in 0..100 {
            assert!(mint_token() > 0);
        }
    }

    #[test]
    fn test_history_entry_json() {
        let entries: Vec<HistoryEntry> = serde_json::from_value(json!([
            { "token": 11, "direction": "credit" },
            { "token": 12, "direction": "debit", "pairedToken": 11 }
        ]))
        .unwrap();
        assert_eq!(entries[0].paired_token, None);
        assert_eq!(entries[1].direction, Direction::Debit);
        assert_eq!(entries[1].paired_token, Some(11));
    }

    #[test]
    fn test_update_request_json() {
        let request = UpdateRequest {
            user_id: 42,
            tx_id: "tx1".into(),
            asset: "BTH".into(),
            amount: -500,
            direction: Direction::Debit,
            token: 2,
            paired_token: Some(1),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["userId"], 42);
        assert_eq!(value["direction"], "debit");
        assert_eq!(value["pairedToken"], 1);
    }

    #[tokio::test]
    async fn test_submit_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "ledger_submitUpdate",
                "params": {
                    "userId": 42,
                    "txId": "tx1",
                    "amount": -500,
                    "direction": "debit",
                    "token": 2,
                    "pairedToken": 1
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "accepted": true }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let service = JsonRpcLedgerService::new(&server.uri(), None, Duration::from_secs(2)).unwrap();

        service.submit_update(&debit_request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_rejected_is_retryable() {
        let (_server, service) =
            ledger(json!({ "accepted": false, "message": "insufficient balance" })).await;

        let err = service.submit_update(&debit_request()).await.unwrap_err();
        match &err {
            SyncError::RetryableSync(msg) => assert!(msg.contains("insufficient balance")),
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_submit_without_result_is_retryable() {
        let (_server, service) = ledger(Value::Null).await;
        let err = service.submit_update(&debit_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::RetryableSync(_)));
    }

    #[tokio::test]
    async fn test_submit_http_failure_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let service = JsonRpcLedgerService::new(&server.uri(), None, Duration::from_secs(2)).unwrap();

        let err = service.submit_update(&debit_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::RetryableSync(_)));
    }

    #[tokio::test]
    async fn test_query_history() {
        let (_server, service) = ledger(json!([
            { "token": 11, "direction": "credit" },
            { "token": 12, "direction": "debit", "pairedToken": 11 }
        ]))
        .await;

        let history = service.query_history(42, "tx1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].paired_token, Some(11));
    }

    #[tokio::test]
    async fn test_query_history_null_is_empty() {
        let (_server, service) = ledger(Value::Null).await;
        assert!(service.query_history(42, "tx1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_history_rpc_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "ledger_queryHistory",
                "params": { "userId": 42, "txId": "tx1" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32000, "message": "ledger busy" }
            })))
            .mount(&server)
            .await;
        let service = JsonRpcLedgerService::new(&server.uri(), None, Duration::from_secs(2)).unwrap();

        let err = service.query_history(42, "tx1").await.unwrap_err();
        assert!(matches!(err, SyncError::RetryableSync(ref msg) if msg.contains("ledger busy")));
    }
}
