//! In-memory version store with explicit transactions

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::{prunable_ids, SequentialTransactionIds, TransactionIdGenerator, VersionStore};
use crate::error::Result;
use crate::value::ItemId;
use crate::version::{NewVersion, Version, VersionAssociation};

#[derive(Debug, Default)]
struct State {
    last_version_id: i64,
    last_association_id: i64,
    versions: Vec<Version>,
    associations: Vec<VersionAssociation>,
}

impl State {
    /// Assign row ids; the caller decides where the rows go
    fn allocate(
        &mut self,
        version: &NewVersion,
        transaction_id: i64,
    ) -> (Version, Vec<VersionAssociation>) {
        self.last_version_id += 1;
        let stored = Version::from_new(self.last_version_id, Some(transaction_id), version);
        let associations = version
            .associations
            .iter()
            .map(|a| {
                self.last_association_id += 1;
                VersionAssociation {
                    id: self.last_association_id,
                    version_id: stored.id,
                    foreign_key_name: a.foreign_key_name.clone(),
                    foreign_key_id: a.foreign_key_id.clone(),
                }
            })
            .collect();
        (stored, associations)
    }

    fn remove_versions(&mut self, ids: &[i64]) {
        self.versions.retain(|v| !ids.contains(&v.id));
        self.associations.retain(|a| !ids.contains(&a.version_id));
    }
}

/// Version store kept in process memory.
///
/// Appends outside a transaction commit immediately and each gets its own
/// transaction id from the injected generator. Use [`MemoryVersionStore::begin`]
/// to group appends under one id.
#[derive(Clone)]
pub struct MemoryVersionStore {
    state: Arc<Mutex<State>>,
    transaction_ids: Arc<dyn TransactionIdGenerator>,
}

impl Default for MemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(SequentialTransactionIds::new()))
    }

    pub fn with_generator(transaction_ids: Arc<dyn TransactionIdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            transaction_ids,
        }
    }

    /// Open a transaction; its appends become visible to others on commit
    pub fn begin(&self) -> MemoryTransaction {
        let transaction_id = self.transaction_ids.next_id();
        debug!("Opened in-memory transaction {}", transaction_id);
        MemoryTransaction {
            store: self.clone(),
            transaction_id,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Number of committed versions
    pub fn len(&self) -> usize {
        self.state.lock().versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every committed version, ascending by id
    pub fn all_versions(&self) -> Vec<Version> {
        self.state.lock().versions.clone()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn append(&self, version: NewVersion) -> Result<Version> {
        let transaction_id = version
            .transaction_id
            .unwrap_or_else(|| self.transaction_ids.next_id());
        let mut state = self.state.lock();
        let (stored, associations) = state.allocate(&version, transaction_id);
        state.versions.push(stored.clone());
        state.associations.extend(associations);
        Ok(stored)
    }

    async fn find_version(&self, id: i64) -> Result<Option<Version>> {
        Ok(self
            .state
            .lock()
            .versions
            .iter()
            .find(|v| v.id == id)
            .cloned())
    }

    async fn item_versions(&self, item_type: &str, item_id: &ItemId) -> Result<Vec<Version>> {
        Ok(self
            .state
            .lock()
            .versions
            .iter()
            .filter(|v| v.item_type == item_type && &v.item_id == item_id)
            .cloned()
            .collect())
    }

    async fn transaction_versions(&self, transaction_id: i64) -> Result<Vec<Version>> {
        Ok(self
            .state
            .lock()
            .versions
            .iter()
            .filter(|v| v.transaction_id == Some(transaction_id))
            .cloned()
            .collect())
    }

    async fn version_associations(&self, version_id: i64) -> Result<Vec<VersionAssociation>> {
        Ok(self
            .state
            .lock()
            .associations
            .iter()
            .filter(|a| a.version_id == version_id)
            .cloned()
            .collect())
    }

    async fn prune_item(&self, item_type: &str, item_id: &ItemId, keep: usize) -> Result<usize> {
        let mut state = self.state.lock();
        let versions: Vec<Version> = state
            .versions
            .iter()
            .filter(|v| v.item_type == item_type && &v.item_id == item_id)
            .cloned()
            .collect();
        let ids = prunable_ids(&versions, keep);
        state.remove_versions(&ids);
        if !ids.is_empty() {
            debug!("Pruned {} versions of {} {}", ids.len(), item_type, item_id);
        }
        Ok(ids.len())
    }
}

#[derive(Debug, Default)]
struct Pending {
    versions: Vec<Version>,
    associations: Vec<VersionAssociation>,
    pruned: Vec<i64>,
}

/// A unit of work over a [`MemoryVersionStore`].
///
/// Every version appended here shares the transaction's id. Reads see
/// committed rows plus this transaction's own pending rows. Dropping the
/// transaction without committing discards everything it buffered.
pub struct MemoryTransaction {
    store: MemoryVersionStore,
    transaction_id: i64,
    pending: Mutex<Pending>,
}

impl MemoryTransaction {
    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    /// Publish buffered versions and deletions; returns the number of
    /// versions published
    pub fn commit(self) -> usize {
        let pending = self.pending.into_inner();
        let mut state = self.store.state.lock();
        state.remove_versions(&pending.pruned);
        let count = pending.versions.len();
        state.versions.extend(pending.versions);
        state.versions.sort_by_key(|v| v.id);
        state.associations.extend(pending.associations);
        debug!(
            "Committed in-memory transaction {} with {} versions",
            self.transaction_id, count
        );
        count
    }

    /// Discard buffered versions and deletions
    pub fn rollback(self) {
        let pending = self.pending.into_inner();
        debug!(
            "Rolled back in-memory transaction {}, discarding {} versions",
            self.transaction_id,
            pending.versions.len()
        );
    }

    fn visible<F>(&self, predicate: F) -> Vec<Version>
    where
        F: Fn(&Version) -> bool,
    {
        let pending = self.pending.lock();
        let state = self.store.state.lock();
        let mut versions: Vec<Version> = state
            .versions
            .iter()
            .chain(pending.versions.iter())
            .filter(|v| !pending.pruned.contains(&v.id) && predicate(v))
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.id);
        versions
    }
}

#[async_trait]
impl VersionStore for MemoryTransaction {
    async fn append(&self, version: NewVersion) -> Result<Version> {
        let transaction_id = version.transaction_id.unwrap_or(self.transaction_id);
        let (stored, associations) = self.store.state.lock().allocate(&version, transaction_id);
        let mut pending = self.pending.lock();
        pending.versions.push(stored.clone());
        pending.associations.extend(associations);
        Ok(stored)
    }

    async fn find_version(&self, id: i64) -> Result<Option<Version>> {
        Ok(self.visible(|v| v.id == id).into_iter().next())
    }

    async fn item_versions(&self, item_type: &str, item_id: &ItemId) -> Result<Vec<Version>> {
        Ok(self.visible(|v| v.item_type == item_type && &v.item_id == item_id))
    }

    async fn transaction_versions(&self, transaction_id: i64) -> Result<Vec<Version>> {
        Ok(self.visible(|v| v.transaction_id == Some(transaction_id)))
    }

    async fn version_associations(&self, version_id: i64) -> Result<Vec<VersionAssociation>> {
        let pending = self.pending.lock();
        let state = self.store.state.lock();
        Ok(state
            .associations
            .iter()
            .chain(pending.associations.iter())
            .filter(|a| a.version_id == version_id && !pending.pruned.contains(&a.version_id))
            .cloned()
            .collect())
    }

    async fn prune_item(&self, item_type: &str, item_id: &ItemId, keep: usize) -> Result<usize> {
        let versions = self.visible(|v| v.item_type == item_type && &v.item_id == item_id);
        let ids = prunable_ids(&versions, keep);
        let mut pending = self.pending.lock();
        pending.versions.retain(|v| !ids.contains(&v.id));
        pending.associations.retain(|a| !ids.contains(&a.version_id));
        pending.pruned.extend(ids.iter().copied());
        Ok(ids.len())
    }
}
