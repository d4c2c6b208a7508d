//! Version records
//!
//! A `Version` is append-only: it is produced once by the recorder, read many
//! times, and never updated. Deletion only happens through retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::Event;
use crate::value::ItemId;

/// A version about to be appended to a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVersion {
    pub item_type: String,
    pub item_id: ItemId,
    pub event: Event,
    pub whodunnit: Option<String>,
    /// Serialized attribute state before the event
    pub object: Option<String>,
    /// Serialized mapping of attribute name to `[old, new]`
    pub object_changes: Option<String>,
    /// Explicit correlation id; stores derive one when absent
    pub transaction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub associations: Vec<NewVersionAssociation>,
}

/// A stored, immutable version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: i64,
    pub item_type: String,
    pub item_id: ItemId,
    pub event: Event,
    pub whodunnit: Option<String>,
    pub object: Option<String>,
    pub object_changes: Option<String>,
    pub transaction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Version {
    /// Build the stored form of a pending version
    pub fn from_new(id: i64, transaction_id: Option<i64>, version: &NewVersion) -> Self {
        Self {
            id,
            item_type: version.item_type.clone(),
            item_id: version.item_id.clone(),
            event: version.event,
            whodunnit: version.whodunnit.clone(),
            object: version.object.clone(),
            object_changes: version.object_changes.clone(),
            transaction_id,
            created_at: version.created_at,
            metadata: version.metadata.clone(),
        }
    }

    pub fn is_create(&self) -> bool {
        self.event == Event::Create
    }

    /// Flat row with the recording time under the configured field name
    pub fn to_row(&self, timestamp_field: &str) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("id".into(), Value::from(self.id));
        row.insert("item_type".into(), Value::from(self.item_type.clone()));
        row.insert("item_id".into(), Value::from(self.item_id.as_str()));
        row.insert("event".into(), Value::from(self.event.as_str()));
        row.insert("whodunnit".into(), self.whodunnit.clone().into());
        row.insert("object".into(), self.object.clone().into());
        row.insert("object_changes".into(), self.object_changes.clone().into());
        row.insert("transaction_id".into(), self.transaction_id.into());
        row.insert(
            timestamp_field.to_string(),
            Value::from(self.created_at.to_rfc3339()),
        );
        for (key, value) in &self.metadata {
            row.entry(key.clone()).or_insert_with(|| value.clone());
        }
        row
    }
}

/// Association row captured alongside a pending version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVersionAssociation {
    pub foreign_key_name: String,
    pub foreign_key_id: Option<ItemId>,
}

/// A stored association row, owned by exactly one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAssociation {
    pub id: i64,
    pub version_id: i64,
    pub foreign_key_name: String,
    pub foreign_key_id: Option<ItemId>,
}
