//! Confirmation-depth policy.
//!
//! A deposit is forwarded to the balance ledger only once `M` blocks (the
//! block itself included) sit on the main chain at or above it. With the
//! default `M = 6`, a block with five confirmations is never synced.

use crate::chain::ChainIndex;
use crate::error::SyncError;
use crate::types::{BlockHash, ChainTip};

/// Default number of confirmations required before crediting.
pub const DEFAULT_MATURITY_DEPTH: u64 = 6;

/// Number of confirmations a block at `block_height` has under `tip_height`.
pub fn confirmations(tip_height: u64, block_height: u64) -> u64 {
    if block_height > tip_height {
        0
    } else {
        tip_height - block_height + 1
    }
}

/// Selects the block that has just reached maturity.
#[derive(Debug, Clone, Copy)]
pub struct MaturityGate {
    depth: u64,
}

impl Default for MaturityGate {
    fn default() -> Self {
        Self::new(DEFAULT_MATURITY_DEPTH)
    }
}

impl MaturityGate {
    /// Create a gate requiring `depth` confirmations (at least one).
    pub fn new(depth: u64) -> Self {
        Self {
            depth: depth.max(1),
        }
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Whether a block with `confirmations` confirmations may be credited.
    pub fn is_mature(&self, confirmations: u64) -> bool {
        confirmations >= self.depth
    }

    /// The block with exactly `depth` confirmations under `tip`.
    ///
    /// Returns `None` while the chain holds fewer than `depth` blocks.
    pub async fn matured_block(
        &self,
        chain: &dyn ChainIndex,
        tip: &ChainTip,
    ) -> Result<Option<BlockHash>, SyncError> {
        // Heights start at zero, so the chain holds tip.height + 1 blocks.
        if tip.height + 1 < self.depth {
            return Ok(None);
        }
        chain.ancestor_at_depth(&tip.hash, self.depth - 1).await
    }
}
