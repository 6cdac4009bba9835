//! Chain index access.
//!
//! The chain engine owns consensus and block storage; this crate only needs
//! to ask it about the best tip, ancestry, and main-chain membership. The
//! [`RpcChainIndex`] answers those questions over the node's JSON-RPC API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::SyncError;
use crate::rpc::{JsonRpcClient, RpcError};
use crate::types::{Block, BlockHash, ChainTip};

/// Read-only view of the chain engine's block index.
#[async_trait]
pub trait ChainIndex: Send + Sync {
    /// Current best-chain tip.
    async fn best_tip(&self) -> Result<ChainTip, SyncError>;

    /// The block `depth` steps behind `tip`, or `None` if the chain is too short.
    async fn ancestor_at_depth(
        &self,
        tip: &BlockHash,
        depth: u64,
    ) -> Result<Option<BlockHash>, SyncError>;

    /// Height of `hash` if it is on the main chain.
    async fn main_chain_height(&self, hash: &BlockHash) -> Result<Option<u64>, SyncError>;

    /// Whether `hash` is the tip or one of its ancestors.
    async fn is_on_main_chain(&self, hash: &BlockHash) -> Result<bool, SyncError> {
        Ok(self.main_chain_height(hash).await?.is_some())
    }
}

/// Source of full main-chain blocks, used by the chain follower.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn block_at_height(&self, height: u64) -> Result<Option<Block>, SyncError>;
}

#[derive(Debug, Deserialize)]
struct ChainInfo {
    height: u64,
    #[serde(rename = "tipHash")]
    tip_hash: BlockHash,
}

#[derive(Debug, Clone, Deserialize)]
struct BlockHeader {
    height: u64,
    #[serde(rename = "prevHash")]
    prev_hash: BlockHash,
}

/// [`ChainIndex`] backed by a Botho node's JSON-RPC endpoint.
pub struct RpcChainIndex {
    rpc: JsonRpcClient,
}

fn chain_err(method: &str, e: RpcError) -> SyncError {
    SyncError::Chain(format!("{} failed: {}", method, e))
}

impl RpcChainIndex {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let rpc = JsonRpcClient::new(url, None, timeout).map_err(|e| chain_err("connect", e))?;
        Ok(Self { rpc })
    }

    async fn header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>, SyncError> {
        self.rpc
            .call_optional("getBlockHeader", json!({ "hash": hash }))
            .await
            .map_err(|e| chain_err("getBlockHeader", e))
    }

    async fn hash_at_height(&self, height: u64) -> Result<Option<BlockHash>, SyncError> {
        self.rpc
            .call_optional("getBlockHash", json!({ "height": height }))
            .await
            .map_err(|e| chain_err("getBlockHash", e))
    }
}

#[async_trait]
impl ChainIndex for RpcChainIndex {
    async fn best_tip(&self) -> Result<ChainTip, SyncError> {
        let info: ChainInfo = self
            .rpc
            .call("getChainInfo", json!({}))
            .await
            .map_err(|e| chain_err("getChainInfo", e))?;
        Ok(ChainTip {
            hash: info.tip_hash,
            height: info.height,
        })
    }

    async fn ancestor_at_depth(
        &self,
        tip: &BlockHash,
        depth: u64,
    ) -> Result<Option<BlockHash>, SyncError> {
        let Some(mut header) = self.header(tip).await? else {
            return Ok(None);
        };
        if header.height < depth {
            return Ok(None);
        }

        let mut hash = *tip;
        for _ in 0..depth {
            hash = header.prev_hash;
            header = match self.header(&hash).await? {
                Some(h) => h,
                None => return Ok(None),
            };
        }
        Ok(Some(hash))
    }

    async fn main_chain_height(&self, hash: &BlockHash) -> Result<Option<u64>, SyncError> {
        let Some(header) = self.header(hash).await? else {
            return Ok(None);
        };
        let main = self.hash_at_height(header.height).await?;
        Ok((main == Some(*hash)).then_some(header.height))
    }
}

#[async_trait]
impl BlockSource for RpcChainIndex {
    async fn block_at_height(&self, height: u64) -> Result<Option<Block>, SyncError> {
        self.rpc
            .call_optional("getBlockByHeight", json!({ "height": height }))
            .await
            .map_err(|e| chain_err("getBlockByHeight", e))
    }
}
