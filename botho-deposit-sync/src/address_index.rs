//! Deposit address index.
//!
//! Maps address fingerprints back to the user that owns them. The index is
//! rebuilt from an [`AddressStore`] before each block is classified, so a
//! newly issued deposit address is picked up within one block.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::SyncError;
use crate::script::AddressFingerprint;
use crate::types::UserId;

/// Source of truth for which user owns which deposit address.
#[async_trait]
pub trait AddressStore: Send + Sync {
    /// Load every known deposit address, keyed by user.
    async fn load_deposit_addresses(
        &self,
    ) -> Result<HashMap<UserId, AddressFingerprint>, SyncError>;
}

/// Address store backed by a JSON file of `{"<user_id>": "<fingerprint hex>"}`.
pub struct FileAddressStore {
    path: PathBuf,
}

impl FileAddressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AddressStore for FileAddressStore {
    async fn load_deposit_addresses(
        &self,
    ) -> Result<HashMap<UserId, AddressFingerprint>, SyncError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::RetryableSync(format!(
                "failed to read address file {:?}: {}",
                self.path, e
            ))
        })?;

        let raw: HashMap<String, AddressFingerprint> = serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("invalid address file: {}", e)))?;

        raw.into_iter()
            .map(|(user, fp)| {
                user.parse::<UserId>()
                    .map(|id| (id, fp))
                    .map_err(|_| SyncError::Config(format!("invalid user id {:?}", user)))
            })
            .collect()
    }
}

/// Reverse lookup from address fingerprint to owning user.
#[derive(Debug, Clone, Default)]
pub struct DepositAddressIndex {
    by_fingerprint: HashMap<AddressFingerprint, UserId>,
}

impl DepositAddressIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a user -> address mapping.
    ///
    /// Ownership is 1:1; an address claimed by two users is rejected.
    pub fn from_addresses(
        addresses: HashMap<UserId, AddressFingerprint>,
    ) -> Result<Self, SyncError> {
        let mut by_fingerprint = HashMap::with_capacity(addresses.len());
        for (user_id, fp) in addresses {
            if let Some(existing) = by_fingerprint.insert(fp, user_id) {
                return Err(SyncError::Config(format!(
                    "address {} assigned to both user {} and user {}",
                    fp, existing, user_id
                )));
            }
        }
        Ok(Self { by_fingerprint })
    }

    /// Replace the index contents with the store's current view.
    ///
    /// On failure the previous contents are kept.
    pub async fn refresh(&mut self, store: &dyn AddressStore) -> Result<usize, SyncError> {
        let addresses = store.load_deposit_addresses().await?;
        *self = Self::from_addresses(addresses)?;
        tracing::debug!("Deposit address index refreshed: {} addresses", self.len());
        Ok(self.len())
    }

    pub fn lookup(&self, fingerprint: &AddressFingerprint) -> Option<UserId> {
        self.by_fingerprint.get(fingerprint).copied()
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}
