//! Chain follower progress persistence.
//!
//! The follower remembers the hashes of the most recent blocks it delivered,
//! so after a restart it can tell whether the node reorganized past its last
//! position and which blocks to disconnect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::types::BlockHash;

/// Persistent follower state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowerCursor {
    /// Height -> hash of recently delivered main-chain blocks
    recent: BTreeMap<u64, BlockHash>,

    /// Timestamp of last successful poll (Unix timestamp)
    pub last_sync_timestamp: u64,

    /// Blocks delivered via `on_block_connected`
    pub blocks_connected: u64,

    /// Blocks delivered via `on_block_disconnected`
    pub blocks_disconnected: u64,
}

impl FollowerCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cursor from a file.
    ///
    /// Returns an empty cursor if the file doesn't exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No follower cursor found, starting fresh");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let cursor: FollowerCursor = serde_json::from_str(&content)?;

        if let Some((height, hash)) = cursor.tip() {
            tracing::info!(
                "Loaded follower cursor: height={}, hash={}, connected={}",
                height,
                hash.short(),
                cursor.blocks_connected
            );
        }

        Ok(cursor)
    }

    /// Save the cursor to a file.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent corruption.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        tracing::debug!("Saved follower cursor: tip={:?}", self.tip().map(|(h, _)| h));
        Ok(())
    }

    /// Highest delivered block.
    pub fn tip(&self) -> Option<(u64, BlockHash)> {
        self.recent.iter().next_back().map(|(h, hash)| (*h, *hash))
    }

    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.recent.get(&height).copied()
    }

    /// Height of the next block to deliver, if anything was delivered yet.
    pub fn next_height(&self) -> Option<u64> {
        self.tip().map(|(h, _)| h + 1)
    }

    /// Remember a connected block, keeping at most `window` entries.
    pub fn push(&mut self, height: u64, hash: BlockHash, window: usize) {
        self.recent.insert(height, hash);
        while self.recent.len() > window.max(1) {
            self.recent.pop_first();
        }
        self.blocks_connected += 1;
        self.touch();
    }

    /// Forget the highest block after delivering its disconnect.
    pub fn pop(&mut self) -> Option<(u64, BlockHash)> {
        let popped = self.recent.pop_last();
        if popped.is_some() {
            self.blocks_disconnected += 1;
            self.touch();
        }
        popped
    }

    /// Number of remembered blocks.
    pub fn depth(&self) -> usize {
        self.recent.len()
    }

    fn touch(&mut self) {
        self.last_sync_timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }

    /// Format a human-readable summary.
    pub fn summary(&self) -> String {
        let last_sync = if self.last_sync_timestamp > 0 {
            chrono::DateTime::from_timestamp(self.last_sync_timestamp as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "unknown".to_string())
        } else {
            "never".to_string()
        };
        let tip = match self.tip() {
            Some((height, hash)) => format!("{} ({})", height, hash.short()),
            None => "none".to_string(),
        };

        format!(
            "Follower:\n  Tip: {}\n  Last sync: {}\n  Blocks connected: {}\n  Blocks disconnected: {}",
            tip, last_sync, self.blocks_connected, self.blocks_disconnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash(n: u8) -> BlockHash {
        BlockHash([n; 32])
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");

        let mut cursor = FollowerCursor::new();
        cursor.push(100, hash(1), 10);
        cursor.push(101, hash(2), 10);
        cursor.save(&path).unwrap();

        let loaded = FollowerCursor::load(&path).unwrap();
        assert_eq!(loaded.tip(), Some((101, hash(2))));
        assert_eq!(loaded.hash_at(100), Some(hash(1)));
        assert_eq!(loaded.blocks_connected, 2);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let cursor = FollowerCursor::load(&dir.path().join("missing.json")).unwrap();
        assert!(cursor.tip().is_none());
        assert_eq!(cursor.next_height(), None);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut cursor = FollowerCursor::new();
        for h in 0..10u64 {
            cursor.push(h, hash(h as u8), 3);
        }
        assert_eq!(cursor.depth(), 3);
        assert_eq!(cursor.hash_at(6), None);
        assert_eq!(cursor.hash_at(7), Some(hash(7)));
        assert_eq!(cursor.next_height(), Some(10));
    }

    #[test]
    fn test_pop() {
        let mut cursor = FollowerCursor::new();
        cursor.push(5, hash(5), 10);
        cursor.push(6, hash(6), 10);
        assert_eq!(cursor.pop(), Some((6, hash(6))));
        assert_eq!(cursor.tip(), Some((5, hash(5))));
        assert_eq!(cursor.blocks_disconnected, 1);
        assert!(cursor.summary().contains("Tip: 5"));
    }
}
