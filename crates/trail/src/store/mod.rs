//! Version store: the persistence boundary
//!
//! A store appends a version together with its association rows as one unit
//! and assigns the transaction correlation id. Reads are plain history
//! queries; nothing here ever updates a stored version.

mod memory;

pub use memory::{MemoryTransaction, MemoryVersionStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::Result;
use crate::version::{NewVersion, Version, VersionAssociation};
use crate::value::ItemId;

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Append a version and its association rows atomically
    async fn append(&self, version: NewVersion) -> Result<Version>;

    async fn find_version(&self, id: i64) -> Result<Option<Version>>;

    /// All versions of one item, ascending by id
    async fn item_versions(&self, item_type: &str, item_id: &ItemId) -> Result<Vec<Version>>;

    /// All versions sharing a transaction id, ascending by id
    async fn transaction_versions(&self, transaction_id: i64) -> Result<Vec<Version>>;

    async fn version_associations(&self, version_id: i64) -> Result<Vec<VersionAssociation>>;

    /// Delete the item's oldest non-create versions so that at most `keep`
    /// remain, with their association rows. Returns the number deleted.
    async fn prune_item(&self, item_type: &str, item_id: &ItemId, keep: usize) -> Result<usize>;

    /// The version whose `object` holds the item's state at `at`: the
    /// earliest version recorded after it
    async fn version_at(
        &self,
        item_type: &str,
        item_id: &ItemId,
        at: DateTime<Utc>,
    ) -> Result<Option<Version>> {
        let versions = self.item_versions(item_type, item_id).await?;
        Ok(versions.into_iter().find(|v| v.created_at > at))
    }

    async fn previous_version(&self, version: &Version) -> Result<Option<Version>> {
        let versions = self
            .item_versions(&version.item_type, &version.item_id)
            .await?;
        Ok(versions.into_iter().rev().find(|v| v.id < version.id))
    }

    async fn next_version(&self, version: &Version) -> Result<Option<Version>> {
        let versions = self
            .item_versions(&version.item_type, &version.item_id)
            .await?;
        Ok(versions.into_iter().find(|v| v.id > version.id))
    }
}

/// Source of transaction correlation ids when no ambient transaction
/// supplies one
pub trait TransactionIdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Monotonic in-process generator starting at 1
#[derive(Debug)]
pub struct SequentialTransactionIds {
    next: AtomicI64,
}

impl SequentialTransactionIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for SequentialTransactionIds {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionIdGenerator for SequentialTransactionIds {
    fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Ids of the versions `prune_item` removes so that `keep` non-create
/// versions remain; `versions` must be ascending by id
pub fn prunable_ids(versions: &[Version], keep: usize) -> Vec<i64> {
    let candidates: Vec<i64> = versions
        .iter()
        .filter(|v| !v.is_create())
        .map(|v| v.id)
        .collect();
    let excess = candidates.len().saturating_sub(keep);
    candidates.into_iter().take(excess).collect()
}
