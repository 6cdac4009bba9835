//! Minimal JSON-RPC 2.0 client shared by the node and ledger clients.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC request ID counter
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Failure of a single JSON-RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Http(reqwest::StatusCode),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("missing result in RPC response")]
    MissingResult,

    #[error("failed to decode result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// JSON-RPC 2.0 request
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// A JSON-RPC endpoint, optionally authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl JsonRpcClient {
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            auth_token,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method`, decoding a non-null result as `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        match self.call_optional(method, params).await? {
            Some(result) => Ok(result),
            None => Err(RpcError::MissingResult),
        }
    }

    /// Call `method`, mapping a null or absent result to `None`.
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(RpcError::Http(response.status()));
        }

        let body: JsonRpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        match body.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }
}
