//! Event recorder: decides whether a mutation is recorded and builds the
//! pending version for it
//!
//! Building is pure. Persisting the result is up to the caller, which keeps
//! the same logic usable from the synchronous and deferred paths.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::association::AssociationTracker;
use crate::changeset::ChangesetBuilder;
use crate::config::{MetadataSource, RecordView};
use crate::context::RequestContext;
use crate::error::Result;
use crate::event::{LifecycleEvent, Mutation};
use crate::registry::ModelDescriptor;
use crate::serializer::ObjectSerializer;
use crate::value::Attributes;
use crate::version::NewVersion;

pub struct EventRecorder<'a> {
    descriptor: &'a ModelDescriptor,
    serializer: &'a dyn ObjectSerializer,
}

impl<'a> EventRecorder<'a> {
    pub fn new(descriptor: &'a ModelDescriptor, serializer: &'a dyn ObjectSerializer) -> Self {
        Self {
            descriptor,
            serializer,
        }
    }

    /// Build the version for `mutation`, or `None` when nothing is recorded.
    ///
    /// The caller is responsible for the enabled check.
    pub fn build(&self, ctx: &RequestContext, mutation: &Mutation) -> Result<Option<NewVersion>> {
        let model = self.descriptor.name();
        let event = mutation.event();

        if !self.descriptor.records(event) {
            debug!("{} events are not recorded for {}", event, model);
            return Ok(None);
        }

        let view = RecordView {
            item_type: model,
            item_id: &mutation.item_id,
            event,
            attributes: mutation.lifecycle.live_attributes(),
            previous: mutation.lifecycle.previous_attributes(),
        };
        if !self.descriptor.conditions_allow(&view) {
            debug!(
                "Recording conditions rejected {} of {} {}",
                event, model, mutation.item_id
            );
            return Ok(None);
        }

        let (object, object_changes) = match &mutation.lifecycle {
            LifecycleEvent::Create { after } => {
                let object = if self.descriptor.snapshot_on_create() {
                    Some(self.snapshot(after)?)
                } else {
                    None
                };
                (object, None)
            }
            LifecycleEvent::Update {
                before,
                after,
                force,
            } => {
                let builder = self.changeset_builder();
                if !*force && !builder.save_version(before, after) {
                    debug!(
                        "No notable changes on {} {}, skipping update",
                        model, mutation.item_id
                    );
                    return Ok(None);
                }
                (Some(self.snapshot(before)?), self.changes(before, after)?)
            }
            // A touch records even when no attribute differs
            LifecycleEvent::Touch { before, after } => {
                (Some(self.snapshot(before)?), self.changes(before, after)?)
            }
            LifecycleEvent::Destroy { before, .. } => (Some(self.snapshot(before)?), None),
        };

        let associations = AssociationTracker::new(self.descriptor.associations())
            .capture(mutation.lifecycle.live_attributes(), &mutation.associations);

        Ok(Some(NewVersion {
            item_type: model.to_string(),
            item_id: mutation.item_id.clone(),
            event,
            whodunnit: ctx.whodunnit().map(str::to_string),
            object,
            object_changes,
            transaction_id: ctx.transaction_id(),
            created_at: mutation.occurred_at,
            metadata: self.metadata(ctx, &view),
            associations,
        }))
    }

    fn changeset_builder(&self) -> ChangesetBuilder<'a> {
        ChangesetBuilder::new(self.descriptor.codec(), self.descriptor.policy())
    }

    fn snapshot(&self, attributes: &Attributes) -> Result<String> {
        let kept = self.descriptor.policy().snapshot_attributes(attributes);
        self.serializer.dump(&self.descriptor.codec().serialize(&kept))
    }

    /// Serialized diff, absent when empty or when the target has no column
    /// for it
    fn changes(&self, before: &Attributes, after: &Attributes) -> Result<Option<String>> {
        if !self.descriptor.target().has_object_changes() {
            return Ok(None);
        }
        let tracked = self.descriptor.policy().tracked_names(after);
        let changes = self.changeset_builder().diff(before, after, &tracked);
        if changes.is_empty() {
            return Ok(None);
        }
        let stored = changes.to_stored(&self.descriptor.codec());
        Ok(Some(self.serializer.dump(&stored)?))
    }

    /// Model metadata first, then controller info, which wins on collision
    fn metadata(&self, ctx: &RequestContext, view: &RecordView<'_>) -> Map<String, Value> {
        let codec = self.descriptor.codec();
        let mut metadata = Map::new();

        for (key, source) in self.descriptor.metadata() {
            let value = match source {
                MetadataSource::Static(value) => value.clone(),
                MetadataSource::Attribute(name) => view
                    .previous
                    .and_then(|previous| previous.get(name))
                    .or_else(|| view.attributes.get(name))
                    .map(|value| codec.serialize_value(name, value))
                    .unwrap_or(Value::Null),
                MetadataSource::Computed(f) => f(view),
            };
            metadata.insert(key.clone(), value);
        }
        for (key, value) in ctx.controller_info() {
            metadata.insert(key.clone(), value.clone());
        }

        let target = self.descriptor.target();
        metadata.retain(|key, _| {
            let accepted = target.accepts_metadata(key);
            if !accepted {
                warn!(
                    "Version target {} has no column {}, dropping metadata",
                    target.name(),
                    key
                );
            }
            accepted
        });
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationConfig;
    use crate::config::{ModelConfig, VersionTarget};
    use crate::event::{DestroyOrder, Event};
    use crate::registry::ModelRegistry;
    use crate::schema::{ColumnType, Schema};
    use crate::serializer::JsonSerializer;
    use crate::value::AttributeValue;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::new()
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::String)
            .column("price", ColumnType::Integer)
            .column("owner_id", ColumnType::Integer)
            .column("updated_at", ColumnType::Timestamp)
    }

    fn register(config: ModelConfig) -> Arc<ModelDescriptor> {
        let registry = ModelRegistry::new(true);
        registry
            .register_version_target(
                VersionTarget::new("SlimVersion")
                    .without_object_changes()
                    .metadata_columns(["ip"]),
            )
            .unwrap();
        registry.register(config).unwrap()
    }

    fn widget(name: &str, price: i64) -> Attributes {
        Attributes::new()
            .with("id", 1)
            .with("name", name)
            .with("price", price)
            .with("owner_id", 7)
    }

    fn build(descriptor: &ModelDescriptor, mutation: &Mutation) -> Option<NewVersion> {
        EventRecorder::new(descriptor, &JsonSerializer)
            .build(&RequestContext::for_actor("alice"), mutation)
            .unwrap()
    }

    #[test]
    fn test_create_has_no_object_unless_configured() {
        let plain = register(ModelConfig::new("Widget", schema()));
        let version = build(&plain, &Mutation::create(1, widget("a", 1))).unwrap();
        assert_eq!(version.event, Event::Create);
        assert_eq!(version.object, None);
        assert_eq!(version.object_changes, None);
        assert_eq!(version.whodunnit.as_deref(), Some("alice"));

        let snapshotting = register(ModelConfig::new("Widget", schema()).snapshot_on_create());
        let version = build(&snapshotting, &Mutation::create(1, widget("a", 1))).unwrap();
        assert!(version.object.unwrap().contains("\"name\":\"a\""));
    }

    #[test]
    fn test_update_stores_before_state_and_diff() {
        let descriptor = register(ModelConfig::new("Widget", schema()));
        let mutation = Mutation::update(1, widget("Widget", 10), widget("Widget", 12));
        let version = build(&descriptor, &mutation).unwrap();

        let object: Value = serde_json::from_str(version.object.as_deref().unwrap()).unwrap();
        assert_eq!(object["price"], json!(10));
        let changes: Value =
            serde_json::from_str(version.object_changes.as_deref().unwrap()).unwrap();
        assert_eq!(changes, json!({"price": [10, 12]}));
    }

    #[test]
    fn test_update_without_changes_is_skipped_unless_forced() {
        let descriptor = register(ModelConfig::new("Widget", schema()));
        let same = Mutation::update(1, widget("a", 1), widget("a", 1));
        assert!(build(&descriptor, &same).is_none());

        let forced = build(&descriptor, &same.forced()).unwrap();
        assert!(forced.object.is_some());
        assert_eq!(forced.object_changes, None);
    }

    #[test]
    fn test_touch_records_without_changes() {
        let descriptor = register(ModelConfig::new("Widget", schema()));
        let touch = Mutation::touch(1, widget("a", 1), widget("a", 1));
        let version = build(&descriptor, &touch).unwrap();
        assert_eq!(version.event, Event::Touch);
        assert_eq!(version.object_changes, None);

        let changed = Mutation::touch(1, widget("a", 1), widget("b", 1));
        let version = build(&descriptor, &changed).unwrap();
        assert!(version.object_changes.unwrap().contains("\"name\""));

        let untracked = register(ModelConfig::new("Widget", schema()).track_touch(false));
        assert!(build(&untracked, &touch).is_none());
    }

    #[test]
    fn test_destroy_snapshot_is_pre_destroy_state_for_both_orders() {
        let descriptor = register(ModelConfig::new("Widget", schema()));
        for order in [DestroyOrder::Before, DestroyOrder::After] {
            let version =
                build(&descriptor, &Mutation::destroy(1, widget("gone", 3), order)).unwrap();
            let object: Value = serde_json::from_str(version.object.as_deref().unwrap()).unwrap();
            assert_eq!(object, json!({"id": 1, "name": "gone", "price": 3, "owner_id": 7}));
        }
    }

    #[test]
    fn test_skip_left_out_of_object_and_ignore_kept() {
        let descriptor = register(
            ModelConfig::new("Widget", schema())
                .skip(["owner_id"])
                .ignore(["price"]),
        );
        let mutation = Mutation::update(1, widget("a", 1), widget("b", 2));
        let version = build(&descriptor, &mutation).unwrap();

        let object: Value = serde_json::from_str(version.object.as_deref().unwrap()).unwrap();
        assert!(object.get("owner_id").is_none());
        assert_eq!(object["price"], json!(1));
        let changes: Value =
            serde_json::from_str(version.object_changes.as_deref().unwrap()).unwrap();
        assert_eq!(changes, json!({"name": ["a", "b"]}));
    }

    #[test]
    fn test_event_selection_and_conditions() {
        let updates_only = register(ModelConfig::new("Widget", schema()).on([Event::Update]));
        assert!(build(&updates_only, &Mutation::create(1, widget("a", 1))).is_none());

        let cheap_only = register(
            ModelConfig::new("Widget", schema())
                .record_if(|view| view.attributes.get("price").and_then(AttributeValue::as_i64) < Some(100)),
        );
        assert!(build(&cheap_only, &Mutation::create(1, widget("a", 1))).is_some());
        assert!(build(&cheap_only, &Mutation::create(1, widget("a", 500))).is_none());

        let never_drafts = register(
            ModelConfig::new("Widget", schema())
                .record_unless(|view| view.attributes.get("name") == Some(&AttributeValue::from("draft"))),
        );
        assert!(build(&never_drafts, &Mutation::create(1, widget("draft", 1))).is_none());
    }

    #[test]
    fn test_metadata_merge_and_target_filtering() {
        let descriptor = register(
            ModelConfig::new("Widget", schema())
                .metadata("answer", MetadataSource::Static(json!(42)))
                .metadata("old_name", MetadataSource::Attribute("name".into()))
                .metadata(
                    "label",
                    MetadataSource::computed(|view| json!(format!("{}#{}", view.item_type, view.item_id))),
                ),
        );
        let mut ctx = RequestContext::new();
        ctx.insert_controller_info("ip", "10.0.0.1");
        ctx.insert_controller_info("answer", 7);

        let version = EventRecorder::new(&descriptor, &JsonSerializer)
            .build(&ctx, &Mutation::update(1, widget("a", 1), widget("b", 1)))
            .unwrap()
            .unwrap();
        assert_eq!(version.metadata["answer"], json!(7));
        assert_eq!(version.metadata["old_name"], json!("a"));
        assert_eq!(version.metadata["label"], json!("Widget#1"));
        assert_eq!(version.metadata["ip"], json!("10.0.0.1"));

        let slim = register(
            ModelConfig::new("Widget", schema())
                .version_target("SlimVersion")
                .metadata("answer", MetadataSource::Static(json!(42))),
        );
        let version = EventRecorder::new(&slim, &JsonSerializer)
            .build(&ctx, &Mutation::update(1, widget("a", 1), widget("b", 1)))
            .unwrap()
            .unwrap();
        assert_eq!(version.metadata.len(), 1);
        assert_eq!(version.metadata["ip"], json!("10.0.0.1"));
        assert_eq!(version.object_changes, None);
    }

    #[test]
    fn test_associations_and_transaction_id_are_carried() {
        let descriptor = register(
            ModelConfig::new("Widget", schema())
                .associate(AssociationConfig::belongs_to("owner", "owner_id", "User")),
        );
        let mut ctx = RequestContext::new();
        ctx.set_transaction_id(Some(99));

        let version = EventRecorder::new(&descriptor, &JsonSerializer)
            .build(&ctx, &Mutation::create(1, widget("a", 1)))
            .unwrap()
            .unwrap();
        assert_eq!(version.transaction_id, Some(99));
        assert_eq!(version.associations.len(), 1);
        assert_eq!(version.associations[0].foreign_key_name, "owner_id");
    }
}
