//! SQL-backed version store
//!
//! Outside a transaction every append runs in its own database transaction
//! and takes its own id as transaction id. Inside a [`SeaOrmTransaction`] the
//! first appended version's id becomes the transaction id of every version
//! appended after it.

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::{Map, Value};
use tracing::{debug, error};
use trail::store::prunable_ids;
use trail::{Event, ItemId, NewVersion, Version, VersionAssociation, VersionStore};

use crate::entity::{version_associations, versions};
use crate::error::{DbStoreError, Result};

/// Version store over a Sea-ORM connection
#[derive(Clone)]
pub struct SeaOrmVersionStore {
    connection: DatabaseConnection,
}

impl SeaOrmVersionStore {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Open a transaction that groups every version appended through it
    pub async fn begin(&self) -> Result<SeaOrmTransaction> {
        let txn = self.connection.begin().await?;
        Ok(SeaOrmTransaction {
            txn,
            transaction_id: Mutex::new(None),
        })
    }
}

#[async_trait]
impl VersionStore for SeaOrmVersionStore {
    async fn append(&self, version: NewVersion) -> trail::Result<Version> {
        let txn = self.connection.begin().await.map_err(DbStoreError::from)?;
        let stored = match insert_version(&txn, &version, version.transaction_id).await {
            Ok(stored) => stored,
            Err(e) => {
                error!("Failed to append {} version: {}", version.item_type, e);
                txn.rollback().await.map_err(DbStoreError::from)?;
                return Err(e.into());
            }
        };
        txn.commit().await.map_err(DbStoreError::from)?;
        Ok(stored)
    }

    async fn find_version(&self, id: i64) -> trail::Result<Option<Version>> {
        Ok(find_version(&self.connection, id).await?)
    }

    async fn item_versions(&self, item_type: &str, item_id: &ItemId) -> trail::Result<Vec<Version>> {
        Ok(item_versions(&self.connection, item_type, item_id).await?)
    }

    async fn transaction_versions(&self, transaction_id: i64) -> trail::Result<Vec<Version>> {
        Ok(transaction_versions(&self.connection, transaction_id).await?)
    }

    async fn version_associations(
        &self,
        version_id: i64,
    ) -> trail::Result<Vec<VersionAssociation>> {
        Ok(version_associations(&self.connection, version_id).await?)
    }

    async fn prune_item(
        &self,
        item_type: &str,
        item_id: &ItemId,
        keep: usize,
    ) -> trail::Result<usize> {
        let txn = self.connection.begin().await.map_err(DbStoreError::from)?;
        let pruned = prune_item(&txn, item_type, item_id, keep).await?;
        txn.commit().await.map_err(DbStoreError::from)?;
        Ok(pruned)
    }
}

/// An open database transaction used as a version store
pub struct SeaOrmTransaction {
    txn: DatabaseTransaction,
    transaction_id: Mutex<Option<i64>>,
}

impl SeaOrmTransaction {
    /// Correlation id, known once the first version is appended
    pub fn transaction_id(&self) -> Option<i64> {
        *self.transaction_id.lock()
    }

    /// The underlying transaction, for the host's own writes
    pub fn transaction(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub async fn commit(self) -> Result<()> {
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.txn.rollback().await?;
        debug!("Rolled back version transaction");
        Ok(())
    }
}

#[async_trait]
impl VersionStore for SeaOrmTransaction {
    async fn append(&self, version: NewVersion) -> trail::Result<Version> {
        let current = self.transaction_id();
        let stored = insert_version(&self.txn, &version, version.transaction_id.or(current)).await?;
        if current.is_none() && version.transaction_id.is_none() {
            *self.transaction_id.lock() = stored.transaction_id;
        }
        Ok(stored)
    }

    async fn find_version(&self, id: i64) -> trail::Result<Option<Version>> {
        Ok(find_version(&self.txn, id).await?)
    }

    async fn item_versions(&self, item_type: &str, item_id: &ItemId) -> trail::Result<Vec<Version>> {
        Ok(item_versions(&self.txn, item_type, item_id).await?)
    }

    async fn transaction_versions(&self, transaction_id: i64) -> trail::Result<Vec<Version>> {
        Ok(transaction_versions(&self.txn, transaction_id).await?)
    }

    async fn version_associations(
        &self,
        version_id: i64,
    ) -> trail::Result<Vec<VersionAssociation>> {
        Ok(version_associations(&self.txn, version_id).await?)
    }

    async fn prune_item(
        &self,
        item_type: &str,
        item_id: &ItemId,
        keep: usize,
    ) -> trail::Result<usize> {
        Ok(prune_item(&self.txn, item_type, item_id, keep).await?)
    }
}

/// Insert a version row and its association rows. Without a transaction id
/// the row's own id is used.
pub async fn insert_version<C>(
    conn: &C,
    version: &NewVersion,
    transaction_id: Option<i64>,
) -> Result<Version>
where
    C: ConnectionTrait,
{
    let metadata = if version.metadata.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&version.metadata)?)
    };

    let row = versions::ActiveModel {
        item_type: Set(version.item_type.clone()),
        item_id: Set(version.item_id.as_str().to_string()),
        event: Set(version.event.as_str().to_string()),
        whodunnit: Set(version.whodunnit.clone()),
        object: Set(version.object.clone()),
        object_changes: Set(version.object_changes.clone()),
        transaction_id: Set(transaction_id),
        created_at: Set(version.created_at),
        metadata: Set(metadata),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    let row = if row.transaction_id.is_none() {
        let id = row.id;
        let mut active: versions::ActiveModel = row.into();
        active.transaction_id = Set(Some(id));
        active.update(conn).await?
    } else {
        row
    };

    for association in &version.associations {
        version_associations::ActiveModel {
            version_id: Set(row.id),
            foreign_key_name: Set(association.foreign_key_name.clone()),
            foreign_key_id: Set(association
                .foreign_key_id
                .as_ref()
                .map(|id| id.as_str().to_string())),
            ..Default::default()
        }
        .insert(conn)
        .await?;
    }

    to_version(row)
}

pub async fn find_version<C>(conn: &C, id: i64) -> Result<Option<Version>>
where
    C: ConnectionTrait,
{
    versions::Entity::find_by_id(id)
        .one(conn)
        .await?
        .map(to_version)
        .transpose()
}

pub async fn item_versions<C>(conn: &C, item_type: &str, item_id: &ItemId) -> Result<Vec<Version>>
where
    C: ConnectionTrait,
{
    versions::Entity::find()
        .filter(versions::Column::ItemType.eq(item_type))
        .filter(versions::Column::ItemId.eq(item_id.as_str()))
        .order_by_asc(versions::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .map(to_version)
        .collect()
}

pub async fn transaction_versions<C>(conn: &C, transaction_id: i64) -> Result<Vec<Version>>
where
    C: ConnectionTrait,
{
    versions::Entity::find()
        .filter(versions::Column::TransactionId.eq(transaction_id))
        .order_by_asc(versions::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .map(to_version)
        .collect()
}

pub async fn version_associations<C>(conn: &C, version_id: i64) -> Result<Vec<VersionAssociation>>
where
    C: ConnectionTrait,
{
    let rows = version_associations::Entity::find()
        .filter(version_associations::Column::VersionId.eq(version_id))
        .order_by_asc(version_associations::Column::Id)
        .all(conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| VersionAssociation {
            id: row.id,
            version_id: row.version_id,
            foreign_key_name: row.foreign_key_name,
            foreign_key_id: row.foreign_key_id.map(ItemId::new),
        })
        .collect())
}

/// Delete the oldest non-create versions beyond `keep`, with their
/// association rows
pub async fn prune_item<C>(conn: &C, item_type: &str, item_id: &ItemId, keep: usize) -> Result<usize>
where
    C: ConnectionTrait,
{
    let history = item_versions(conn, item_type, item_id).await?;
    let ids = prunable_ids(&history, keep);
    if ids.is_empty() {
        return Ok(0);
    }

    version_associations::Entity::delete_many()
        .filter(version_associations::Column::VersionId.is_in(ids.clone()))
        .exec(conn)
        .await?;
    let deleted = versions::Entity::delete_many()
        .filter(versions::Column::Id.is_in(ids))
        .exec(conn)
        .await?;

    debug!(
        "Pruned {} versions of {} {}",
        deleted.rows_affected, item_type, item_id
    );
    Ok(deleted.rows_affected as usize)
}

fn to_version(row: versions::Model) -> Result<Version> {
    let event: Event = row.event.parse().map_err(|_| DbStoreError::InvalidEvent {
        version_id: row.id,
        event: row.event.clone(),
    })?;
    let metadata: Map<String, Value> = match row.metadata.as_deref() {
        Some(text) => serde_json::from_str(text)?,
        None => Map::new(),
    };

    Ok(Version {
        id: row.id,
        item_type: row.item_type,
        item_id: ItemId::new(row.item_id),
        event,
        whodunnit: row.whodunnit,
        object: row.object,
        object_changes: row.object_changes,
        transaction_id: row.transaction_id,
        created_at: row.created_at,
        metadata,
    })
}
