//! Per-block charge records.
//!
//! A [`ChargeRecord`] holds every deposit credit one block produced, keyed by
//! `(user_id, tx_id)`. Keys are ordered so iteration, persistence and test
//! output are deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Direction, UserId};

/// Identifies one deposit credit within one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChargeKey {
    pub user_id: UserId,
    pub tx_id: String,
}

impl ChargeKey {
    pub fn new(user_id: UserId, tx_id: impl Into<String>) -> Self {
        Self {
            user_id,
            tx_id: tx_id.into(),
        }
    }
}

impl fmt::Display for ChargeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.tx_id)
    }
}

/// Amount credited by one transaction to one user, plus delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeEntry {
    /// Net value paid to the user's deposit address
    pub amount: i64,
    /// Whether the ledger has confirmed this entry for the record's
    /// current orientation
    pub synced: bool,
}

impl ChargeEntry {
    pub fn new(amount: i64) -> Self {
        Self {
            amount,
            synced: false,
        }
    }

    /// Signed delta sent to the ledger for the given direction.
    pub fn delta(&self, direction: Direction) -> i64 {
        match direction {
            Direction::Credit => self.amount,
            Direction::Debit => self.amount.saturating_neg(),
        }
    }
}

/// All deposit credits produced by one block.
///
/// `orientation` records which side of the chain the `synced` flags refer
/// to. Flipping it resets every flag, since a disconnect is a distinct
/// operation from the connect that preceded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRecord {
    orientation: Direction,
    entries: BTreeMap<ChargeKey, ChargeEntry>,
}

impl Default for ChargeRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl ChargeRecord {
    /// Create an empty connect-side record.
    pub fn new() -> Self {
        Self {
            orientation: Direction::Credit,
            entries: BTreeMap::new(),
        }
    }

    /// Accumulate `amount` into the entry for `key`.
    pub fn add(&mut self, key: ChargeKey, amount: i64) {
        self.entries
            .entry(key)
            .and_modify(|e| e.amount = e.amount.saturating_add(amount))
            .or_insert_with(|| ChargeEntry::new(amount));
    }

    pub fn orientation(&self) -> Direction {
        self.orientation
    }

    /// Switch to `direction`, clearing all `synced` flags if it changed.
    ///
    /// Returns true when the orientation flipped.
    pub fn orient(&mut self, direction: Direction) -> bool {
        if self.orientation == direction {
            return false;
        }
        self.orientation = direction;
        for entry in self.entries.values_mut() {
            entry.synced = false;
        }
        true
    }

    pub fn get(&self, key: &ChargeKey) -> Option<&ChargeEntry> {
        self.entries.get(key)
    }

    pub fn mark_synced(&mut self, key: &ChargeKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.synced = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChargeKey, &ChargeEntry)> {
        self.entries.iter()
    }

    /// Entries still awaiting confirmation for the current orientation.
    pub fn pending_entries(&self) -> Vec<(ChargeKey, ChargeEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.synced)
            .map(|(k, e)| (k.clone(), *e))
            .collect()
    }

    pub fn is_fully_synced(&self) -> bool {
        self.entries.values().all(|e| e.synced)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all entry amounts, saturating like [`ChargeRecord::add`].
    pub fn total_amount(&self) -> i64 {
        self.entries
            .values()
            .fold(0i64, |total, e| total.saturating_add(e.amount))
    }
}
