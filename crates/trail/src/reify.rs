//! Reifier: rebuilds a historical instance from a stored version
//!
//! The snapshot is read against the model's current schema. Columns dropped
//! since recording are discarded, columns added since recording are filled
//! per [`MissingAttribute`], and values the current type can no longer hold
//! pass through raw. Reifying never writes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TrailError};
use crate::registry::ModelDescriptor;
use crate::serializer::ObjectSerializer;
use crate::value::{AttributeValue, Attributes, ItemId};
use crate::version::{Version, VersionAssociation};

/// How columns absent from a snapshot are filled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAttribute {
    #[default]
    Null,
    /// The column's declared default
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReifyOptions {
    pub on_missing_attribute: MissingAttribute,
    pub mark_read_only: bool,
    /// Produce a fresh, persistable instance with no link to the history
    pub duplicate: bool,
    /// Attach association handles from the version's association rows
    pub associations: bool,
}

impl Default for ReifyOptions {
    fn default() -> Self {
        Self {
            on_missing_attribute: MissingAttribute::Null,
            mark_read_only: true,
            duplicate: false,
            associations: false,
        }
    }
}

impl ReifyOptions {
    pub fn on_missing_attribute(mut self, policy: MissingAttribute) -> Self {
        self.on_missing_attribute = policy;
        self
    }

    pub fn duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.mark_read_only = false;
        self
    }

    pub fn with_associations(mut self) -> Self {
        self.associations = true;
        self
    }
}

/// A record's related identifier as captured with a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationHandle {
    pub name: String,
    pub foreign_key_name: String,
    pub foreign_key_id: Option<ItemId>,
    /// Item type of the related record
    pub target: String,
}

/// A reconstructed record
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub item_type: String,
    /// Absent for duplicates
    pub item_id: Option<ItemId>,
    pub attributes: Attributes,
    pub read_only: bool,
    /// Version this instance was reified from, absent for duplicates
    pub version_id: Option<i64>,
    pub associations: Vec<AssociationHandle>,
}

impl Instance {
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn association(&self, name: &str) -> impl Iterator<Item = &AssociationHandle> {
        self.associations.iter().filter(move |a| a.name == name)
    }
}

/// State of a record at some point in time
#[derive(Debug, Clone, PartialEq)]
pub enum PointInTime {
    /// Reconstructed from a later version's snapshot
    Historical(Instance),
    /// No later version exists, so the live record is the state
    Live(ItemId),
    /// The record did not exist yet
    Missing,
}

pub struct Reifier<'a> {
    descriptor: &'a ModelDescriptor,
    serializer: &'a dyn ObjectSerializer,
}

impl<'a> Reifier<'a> {
    pub fn new(descriptor: &'a ModelDescriptor, serializer: &'a dyn ObjectSerializer) -> Self {
        Self {
            descriptor,
            serializer,
        }
    }

    /// Reconstruct the state stored in `version.object`.
    ///
    /// Returns `None` for versions without a snapshot (a create recorded
    /// without `snapshot_on_create`). `rows` are the version's association
    /// rows, used only when `options.associations` is set.
    pub fn reify(
        &self,
        version: &Version,
        rows: &[VersionAssociation],
        options: &ReifyOptions,
    ) -> Result<Option<Instance>> {
        let Some(text) = version.object.as_deref() else {
            return Ok(None);
        };

        let stored = self
            .serializer
            .load(text)
            .map_err(|e| TrailError::CorruptSnapshot {
                version_id: version.id,
                field: "object",
                message: e.to_string(),
            })?;
        let snapshot = self.descriptor.codec().deserialize(&stored);

        let schema = self.descriptor.schema();
        for name in snapshot.names().filter(|n| !schema.has_column(n)) {
            debug!(
                "Dropping {} from version {}, no longer in {}",
                name,
                version.id,
                self.descriptor.name()
            );
        }

        let mut attributes = Attributes::new();
        for column in schema.columns() {
            let value = match snapshot.get(&column.name) {
                Some(raw) => match column.column_type.cast(raw.clone()) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            "Cannot cast {} of version {}: {}, keeping raw value",
                            column.name, version.id, e
                        );
                        raw.clone()
                    }
                },
                None => match options.on_missing_attribute {
                    MissingAttribute::Null => AttributeValue::Null,
                    MissingAttribute::Default => column.default.clone(),
                },
            };
            attributes.insert(column.name.clone(), value);
        }

        let primary_key = schema.primary_key();
        if options.duplicate {
            if attributes.contains(primary_key) {
                attributes.insert(primary_key, AttributeValue::Null);
            }
        } else if schema.has_column(primary_key) {
            let id = version.item_id.to_attribute();
            let id = schema
                .column_type(primary_key)
                .and_then(|t| t.cast(id.clone()).ok())
                .unwrap_or(id);
            attributes.insert(primary_key, id);
        }

        let associations = if options.associations {
            self.handles(rows)
        } else {
            Vec::new()
        };

        Ok(Some(Instance {
            item_type: version.item_type.clone(),
            item_id: (!options.duplicate).then(|| version.item_id.clone()),
            attributes,
            read_only: options.mark_read_only && !options.duplicate,
            version_id: (!options.duplicate).then_some(version.id),
            associations,
        }))
    }

    fn handles(&self, rows: &[VersionAssociation]) -> Vec<AssociationHandle> {
        rows.iter()
            .filter_map(|row| {
                let Some(config) = self.descriptor.association_by_key(&row.foreign_key_name) else {
                    debug!(
                        "Association row {} names undeclared key {}",
                        row.id, row.foreign_key_name
                    );
                    return None;
                };
                Some(AssociationHandle {
                    name: config.name().to_string(),
                    foreign_key_name: row.foreign_key_name.clone(),
                    foreign_key_id: row.foreign_key_id.clone(),
                    target: config.target().to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationConfig;
    use crate::config::ModelConfig;
    use crate::event::Event;
    use crate::registry::ModelRegistry;
    use crate::schema::{ColumnType, Schema};
    use crate::serializer::JsonSerializer;
    use chrono::Utc;
    use std::sync::Arc;

    fn descriptor(schema: Schema) -> Arc<ModelDescriptor> {
        ModelRegistry::new(true)
            .register(
                ModelConfig::new("Widget", schema)
                    .associate(AssociationConfig::collection("tags", "tag_ids", "Tag")),
            )
            .unwrap()
    }

    fn version(object: Option<&str>) -> Version {
        Version {
            id: 4,
            item_type: "Widget".into(),
            item_id: ItemId::from(1),
            event: Event::Destroy,
            whodunnit: None,
            object: object.map(str::to_string),
            object_changes: None,
            transaction_id: Some(4),
            created_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    fn current_schema() -> Schema {
        Schema::new()
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::String)
            .column("price", ColumnType::Integer)
    }

    #[test]
    fn test_reify_destroy_snapshot_exactly() {
        let descriptor = descriptor(current_schema());
        let reifier = Reifier::new(&descriptor, &JsonSerializer);
        let version = version(Some(r#"{"id":1,"name":"gone","price":3}"#));

        let instance = reifier
            .reify(&version, &[], &ReifyOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(
            instance.attributes,
            Attributes::new().with("id", 1).with("name", "gone").with("price", 3)
        );
        assert!(instance.read_only);
        assert_eq!(instance.version_id, Some(4));
    }

    #[test]
    fn test_schema_drift_drops_and_fills() {
        let schema = current_schema()
            .column_with_default("colour", ColumnType::String, "blue");
        let descriptor = descriptor(schema);
        let reifier = Reifier::new(&descriptor, &JsonSerializer);
        let version = version(Some(r#"{"id":1,"name":"a","price":3,"legacy":true}"#));

        let nulls = reifier
            .reify(&version, &[], &ReifyOptions::default())
            .unwrap()
            .unwrap();
        assert!(!nulls.attributes.contains("legacy"));
        assert_eq!(nulls.get("colour"), Some(&AttributeValue::Null));

        let defaults = reifier
            .reify(
                &version,
                &[],
                &ReifyOptions::default().on_missing_attribute(MissingAttribute::Default),
            )
            .unwrap()
            .unwrap();
        assert_eq!(defaults.get("colour"), Some(&AttributeValue::from("blue")));
    }

    #[test]
    fn test_cast_failure_keeps_raw_value() {
        let schema = Schema::new()
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::String)
            .column("price", ColumnType::Boolean);
        let descriptor = descriptor(schema);
        let reifier = Reifier::new(&descriptor, &JsonSerializer);
        let version = version(Some(r#"{"id":1,"name":"a","price":"cheap"}"#));

        let instance = reifier
            .reify(&version, &[], &ReifyOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(instance.get("price"), Some(&AttributeValue::from("cheap")));
        assert_eq!(instance.get("name"), Some(&AttributeValue::from("a")));
    }

    #[test]
    fn test_duplicate_is_detached() {
        let descriptor = descriptor(current_schema());
        let reifier = Reifier::new(&descriptor, &JsonSerializer);
        let version = version(Some(r#"{"id":1,"name":"a","price":3}"#));

        let copy = reifier
            .reify(&version, &[], &ReifyOptions::default().duplicate())
            .unwrap()
            .unwrap();
        assert!(!copy.read_only);
        assert_eq!(copy.item_id, None);
        assert_eq!(copy.version_id, None);
        assert_eq!(copy.get("id"), Some(&AttributeValue::Null));
    }

    #[test]
    fn test_missing_object_and_corrupt_object() {
        let descriptor = descriptor(current_schema());
        let reifier = Reifier::new(&descriptor, &JsonSerializer);

        assert!(reifier
            .reify(&version(None), &[], &ReifyOptions::default())
            .unwrap()
            .is_none());

        let err = reifier
            .reify(&version(Some("{not json")), &[], &ReifyOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            TrailError::CorruptSnapshot {
                version_id: 4,
                field: "object",
                ..
            }
        ));
    }

    #[test]
    fn test_association_handles_from_rows() {
        let descriptor = descriptor(current_schema());
        let reifier = Reifier::new(&descriptor, &JsonSerializer);
        let version = version(Some(r#"{"id":1,"name":"a","price":3}"#));
        let rows = vec![
            VersionAssociation {
                id: 1,
                version_id: 4,
                foreign_key_name: "tag_ids".into(),
                foreign_key_id: Some(ItemId::from(9)),
            },
            VersionAssociation {
                id: 2,
                version_id: 4,
                foreign_key_name: "unknown_ids".into(),
                foreign_key_id: None,
            },
        ];

        let instance = reifier
            .reify(&version, &rows, &ReifyOptions::default().with_associations())
            .unwrap()
            .unwrap();
        let tags: Vec<_> = instance.association("tags").collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].foreign_key_id, Some(ItemId::from(9)));
        assert_eq!(tags[0].target, "Tag");
        assert_eq!(instance.associations.len(), 1);
    }
}
