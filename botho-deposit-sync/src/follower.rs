//! Chain follower.
//!
//! Polls the node and turns its height/hash progress into
//! `on_block_connected` / `on_block_disconnected` calls. A reorg is detected
//! when the hash remembered for a height is no longer on the main chain; the
//! follower then disconnects its remembered blocks from the top down until it
//! reaches one that still is, and connects the new branch from there.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{BlockSource, ChainIndex};
use crate::cursor::FollowerCursor;
use crate::service::DepositSync;

/// Follower tuning.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub poll_interval: Duration,
    /// Recent blocks remembered for reorg detection
    pub reorg_window: usize,
    /// Blocks delivered per poll at most
    pub batch_size: u64,
    /// Height to start at with an empty cursor; defaults to the node's tip
    pub start_height: Option<u64>,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reorg_window: 100,
            batch_size: 100,
            start_height: None,
        }
    }
}

/// Blocks delivered during one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowStep {
    pub connected: u64,
    pub disconnected: u64,
}

/// Drives a [`DepositSync`] from a polled node.
pub struct ChainFollower {
    chain: Arc<dyn ChainIndex>,
    blocks: Arc<dyn BlockSource>,
    sync: Arc<DepositSync>,
    cursor: FollowerCursor,
    cursor_path: Option<PathBuf>,
    config: FollowerConfig,
}

impl ChainFollower {
    pub fn new(
        chain: Arc<dyn ChainIndex>,
        blocks: Arc<dyn BlockSource>,
        sync: Arc<DepositSync>,
        config: FollowerConfig,
    ) -> Self {
        Self {
            chain,
            blocks,
            sync,
            cursor: FollowerCursor::new(),
            cursor_path: None,
            config,
        }
    }

    /// Persist progress to `path`, resuming from it if it exists.
    pub fn with_cursor_file(mut self, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        self.cursor = FollowerCursor::load(&path)?;
        self.cursor_path = Some(path);
        Ok(self)
    }

    pub fn cursor(&self) -> &FollowerCursor {
        &self.cursor
    }

    fn save_cursor(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.cursor_path {
            self.cursor.save(path)?;
        }
        Ok(())
    }

    /// Disconnect remembered blocks that left the main chain.
    ///
    /// Returns the height to resume connecting from, if the whole window was
    /// unwound.
    async fn unwind(
        &mut self,
        step: &mut FollowStep,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<Option<u64>> {
        let mut lowest_popped = None;

        while let Some((height, hash)) = self.cursor.tip() {
            if self.chain.main_chain_height(&hash).await? == Some(height) {
                return Ok(None);
            }
            if *shutdown.borrow() {
                return Ok(None);
            }

            info!(height, block = %hash.short(), "Block left the main chain");
            self.sync.on_block_disconnected(&hash).await?;
            self.cursor.pop();
            step.disconnected += 1;
            lowest_popped = Some(height);
        }

        if let Some(height) = lowest_popped {
            error!(
                "Reorg deeper than the {}-block window, resuming from height {}",
                self.config.reorg_window, height
            );
        }
        Ok(lowest_popped)
    }

    /// Catch up with the node by at most one batch.
    pub async fn poll_once(&mut self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<FollowStep> {
        let mut step = FollowStep::default();
        let tip = self.chain.best_tip().await?;

        let resume = self.unwind(&mut step, shutdown).await?;
        let start = match (self.cursor.next_height(), resume) {
            (Some(next), _) => next,
            (None, Some(height)) => height,
            (None, None) => self.config.start_height.unwrap_or(tip.height),
        };

        if start > tip.height {
            debug!("Already at chain tip ({})", tip.height);
            if step != FollowStep::default() {
                self.save_cursor()?;
            }
            return Ok(step);
        }

        let end = std::cmp::min(start + self.config.batch_size.max(1) - 1, tip.height);
        debug!("Following blocks {} to {} (chain height: {})", start, end, tip.height);

        for height in start..=end {
            if *shutdown.borrow() {
                break;
            }

            let Some(block) = self.blocks.block_at_height(height).await? else {
                break;
            };

            if let Some((prev_height, prev_hash)) = self.cursor.tip() {
                if prev_height + 1 == height && block.prev_hash != prev_hash {
                    warn!(height, "Chain moved during poll, will unwind next time");
                    break;
                }
            }

            self.sync.on_block_connected(&block).await?;
            self.cursor
                .push(height, block.hash, self.config.reorg_window);
            step.connected += 1;
        }

        self.save_cursor()?;
        Ok(step)
    }

    /// Poll until `shutdown` becomes true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            reorg_window = self.config.reorg_window,
            "Starting chain follower"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once(&shutdown).await {
                Ok(step) => {
                    if step.connected > 0 || step.disconnected > 0 {
                        info!(
                            connected = step.connected,
                            disconnected = step.disconnected,
                            tip = ?self.cursor.tip().map(|(h, _)| h),
                            "Followed chain"
                        );
                    }
                }
                Err(e) => {
                    error!("Follow error: {}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Chain follower stopped");
    }
}
