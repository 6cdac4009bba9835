//! Botho Deposit Sync
//!
//! Reorg-aware crediting of custodial deposits into an external balance
//! ledger. This library provides:
//!
//! - Structural decoding of output scripts into deposit address fingerprints
//! - A per-block charge ledger mirrored to LMDB so pending credits survive
//!   restarts
//! - A maturity gate that credits a block once it has enough confirmations
//! - Idempotent credit/debit reconciliation driven by the ledger's token
//!   history, so a credit is never applied twice and every credit from an
//!   orphaned block is reversed
//! - A background sweeper that retries whatever the block-event path could
//!   not finish
//!
//! # Architecture
//!
//! The chain follower polls a Botho node and calls
//! [`DepositSync::on_block_connected`] and
//! [`DepositSync::on_block_disconnected`]. Connected blocks are classified
//! against the deposit address index and recorded; the block that just
//! reached maturity is credited inline. The sweeper walks the charge ledger
//! on a timer, reversing blocks that left the main chain and re-driving
//! credits for deep blocks that are still pending.

pub mod address_index;
pub mod chain;
pub mod charge;
pub mod charge_ledger;
pub mod classifier;
pub mod config;
pub mod cursor;
pub mod error;
pub mod follower;
pub mod ledger_client;
pub mod maturity;
pub mod metrics;
pub mod reconciler;
pub mod rpc;
pub mod script;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod sync_client;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::SyncConfig;
pub use error::SyncError;
pub use service::{DepositSync, SweepReport, SyncPolicy};
pub use types::{Block, BlockHash, Direction, UserId};
