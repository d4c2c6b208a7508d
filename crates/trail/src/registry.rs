//! Model registry: validated, immutable per-model descriptors
//!
//! Registration is the only place configuration errors surface. Once a
//! `ModelConfig` passes validation it is frozen into an `Arc<ModelDescriptor>`
//! and never mutated again.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::association::AssociationConfig;
use crate::changeset::FilterPolicy;
use crate::codec::AttributeCodec;
use crate::config::{
    Condition, MetadataSource, ModelConfig, RecordView, VersionTarget, DEFAULT_VERSION_TARGET,
};
use crate::error::{ConfigError, Result, TrailError};
use crate::event::{DestroyOrder, Event};
use crate::schema::Schema;

/// Frozen configuration of one tracked model
pub struct ModelDescriptor {
    name: String,
    schema: Schema,
    policy: FilterPolicy,
    target: VersionTarget,
    track_touch: bool,
    events: Vec<Event>,
    destroy_order: DestroyOrder,
    associations: Vec<AssociationConfig>,
    metadata: Vec<(String, MetadataSource)>,
    snapshot_on_create: bool,
    if_condition: Option<Condition>,
    unless_condition: Option<Condition>,
}

impl ModelDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn policy(&self) -> &FilterPolicy {
        &self.policy
    }

    pub fn target(&self) -> &VersionTarget {
        &self.target
    }

    pub fn track_touch(&self) -> bool {
        self.track_touch
    }

    pub fn destroy_order(&self) -> DestroyOrder {
        self.destroy_order
    }

    pub fn associations(&self) -> &[AssociationConfig] {
        &self.associations
    }

    pub fn metadata(&self) -> &[(String, MetadataSource)] {
        &self.metadata
    }

    pub fn snapshot_on_create(&self) -> bool {
        self.snapshot_on_create
    }

    pub fn codec(&self) -> AttributeCodec<'_> {
        AttributeCodec::new(&self.schema)
    }

    /// Whether `event` is in the model's recorded event set
    pub fn records(&self, event: Event) -> bool {
        if event == Event::Touch && !self.track_touch {
            return false;
        }
        self.events.contains(&event)
    }

    /// Evaluate the `if` and `unless` conditions
    pub fn conditions_allow(&self, view: &RecordView<'_>) -> bool {
        let if_ok = self.if_condition.as_ref().is_none_or(|cond| cond(view));
        let unless_ok = self.unless_condition.as_ref().is_none_or(|cond| !cond(view));
        if_ok && unless_ok
    }

    /// Association declared with the given foreign key name
    pub fn association_by_key(&self, foreign_key_name: &str) -> Option<&AssociationConfig> {
        self.associations
            .iter()
            .find(|a| a.foreign_key_name() == foreign_key_name)
    }
}

impl std::fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("track_touch", &self.track_touch)
            .field("events", &self.events)
            .field("destroy_order", &self.destroy_order)
            .finish_non_exhaustive()
    }
}

/// Version targets and model descriptors known to one `Trail`
pub struct ModelRegistry {
    targets: RwLock<HashMap<String, VersionTarget>>,
    models: RwLock<HashMap<String, Arc<ModelDescriptor>>>,
    default_track_touch: bool,
}

impl ModelRegistry {
    /// Registry with the default concrete `Version` target
    pub fn new(default_track_touch: bool) -> Self {
        let mut targets = HashMap::new();
        targets.insert(
            DEFAULT_VERSION_TARGET.to_string(),
            VersionTarget::new(DEFAULT_VERSION_TARGET),
        );
        Self {
            targets: RwLock::new(targets),
            models: RwLock::new(HashMap::new()),
            default_track_touch,
        }
    }

    pub fn register_version_target(&self, target: VersionTarget) -> std::result::Result<(), ConfigError> {
        let mut targets = self.targets.write();
        if targets.contains_key(target.name()) {
            return Err(ConfigError::DuplicateVersionTarget {
                target: target.name().to_string(),
            });
        }
        debug!("Registered version target {}", target.name());
        targets.insert(target.name().to_string(), target);
        Ok(())
    }

    pub fn version_target(&self, name: &str) -> Option<VersionTarget> {
        self.targets.read().get(name).cloned()
    }

    /// Validate and freeze a model configuration
    pub fn register(
        &self,
        config: ModelConfig,
    ) -> std::result::Result<Arc<ModelDescriptor>, ConfigError> {
        if self.models.read().contains_key(&config.name) {
            return Err(ConfigError::DuplicateModel { model: config.name });
        }

        let target = self
            .version_target(&config.version_target)
            .ok_or_else(|| ConfigError::UnknownVersionTarget {
                model: config.name.clone(),
                target: config.version_target.clone(),
            })?;
        if !target.is_concrete() {
            return Err(ConfigError::AbstractVersionTarget {
                model: config.name.clone(),
                target: config.version_target.clone(),
            });
        }

        if config.destroy_order == DestroyOrder::After && config.requires_parent {
            return Err(ConfigError::CannotRecordAfterDestroy { model: config.name });
        }

        validate_attributes(&config)?;

        let descriptor = Arc::new(ModelDescriptor {
            policy: FilterPolicy::new(
                config.ignore,
                config.skip,
                config.only,
                config.update_timestamps,
            ),
            target,
            track_touch: config.track_touch.unwrap_or(self.default_track_touch),
            events: config.events,
            destroy_order: config.destroy_order,
            associations: config.associations,
            metadata: config.metadata,
            snapshot_on_create: config.snapshot_on_create,
            if_condition: config.if_condition,
            unless_condition: config.unless_condition,
            schema: config.schema,
            name: config.name,
        });

        let mut models = self.models.write();
        if models.contains_key(&descriptor.name) {
            return Err(ConfigError::DuplicateModel {
                model: descriptor.name.clone(),
            });
        }
        models.insert(descriptor.name.clone(), descriptor.clone());
        info!(
            "Registered model {} recording into {}",
            descriptor.name,
            descriptor.target.name()
        );
        Ok(descriptor)
    }

    pub fn lookup(&self, item_type: &str) -> Option<Arc<ModelDescriptor>> {
        self.models.read().get(item_type).cloned()
    }

    /// Like `lookup`, but an unregistered item type is an error
    pub fn get(&self, item_type: &str) -> Result<Arc<ModelDescriptor>> {
        self.lookup(item_type)
            .ok_or_else(|| TrailError::unknown_model(item_type))
    }

    /// Registered model names, sorted
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn validate_attributes(config: &ModelConfig) -> std::result::Result<(), ConfigError> {
    let lists: [(&'static str, &Vec<String>); 3] = [
        ("ignore", &config.ignore),
        ("skip", &config.skip),
        ("only", &config.only),
    ];
    for (list, names) in lists {
        if let Some(unknown) = names.iter().find(|n| !config.schema.has_column(n)) {
            return Err(ConfigError::UnknownAttribute {
                model: config.name.clone(),
                attribute: unknown.clone(),
                list,
            });
        }
    }

    for association in &config.associations {
        if let AssociationConfig::BelongsTo { foreign_key, .. } = association {
            if !config.schema.has_column(foreign_key) {
                return Err(ConfigError::UnknownAttribute {
                    model: config.name.clone(),
                    attribute: foreign_key.clone(),
                    list: "associations",
                });
            }
        }
    }

    for (_, source) in &config.metadata {
        if let MetadataSource::Attribute(name) = source {
            if !config.schema.has_column(name) {
                return Err(ConfigError::UnknownAttribute {
                    model: config.name.clone(),
                    attribute: name.clone(),
                    list: "metadata",
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn widget() -> ModelConfig {
        model("Widget")
    }

    fn model(name: &str) -> ModelConfig {
        ModelConfig::new(
            name,
            Schema::new()
                .column("id", ColumnType::Integer)
                .column("name", ColumnType::String)
                .column("price", ColumnType::Integer),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ModelRegistry::new(true);
        let descriptor = registry.register(widget().ignore(["price"])).unwrap();
        assert_eq!(descriptor.target().name(), DEFAULT_VERSION_TARGET);
        assert!(descriptor.policy().is_ignored("price"));
        assert!(registry.lookup("Widget").is_some());
        assert!(matches!(
            registry.get("Gadget"),
            Err(TrailError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_abstract_target_is_rejected() {
        let registry = ModelRegistry::new(true);
        registry
            .register_version_target(VersionTarget::new("BaseVersion").abstract_target())
            .unwrap();

        let err = registry
            .register(widget().version_target("BaseVersion"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::AbstractVersionTarget { .. }));
        assert!(registry.lookup("Widget").is_none());
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let registry = ModelRegistry::new(true);
        let err = registry
            .register(widget().version_target("Missing"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVersionTarget { .. }));
    }

    #[test]
    fn test_after_destroy_with_mandatory_parent_is_rejected() {
        let registry = ModelRegistry::new(true);
        let err = registry
            .register(widget().destroy_order(DestroyOrder::After).requires_parent())
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::CannotRecordAfterDestroy {
                model: "Widget".into()
            }
        );

        // Either setting alone is fine
        registry
            .register(widget().destroy_order(DestroyOrder::After))
            .unwrap();
    }

    #[test]
    fn test_unknown_attributes_are_rejected() {
        let registry = ModelRegistry::new(true);
        let err = registry.register(widget().skip(["colour"])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownAttribute {
                model: "Widget".into(),
                attribute: "colour".into(),
                list: "skip",
            }
        );

        let err = registry
            .register(widget().associate(AssociationConfig::belongs_to(
                "owner", "owner_id", "User",
            )))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownAttribute {
                list: "associations",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = ModelRegistry::new(true);
        registry.register(widget()).unwrap();
        assert!(matches!(
            registry.register(widget()),
            Err(ConfigError::DuplicateModel { .. })
        ));
        assert!(matches!(
            registry.register_version_target(VersionTarget::new(DEFAULT_VERSION_TARGET)),
            Err(ConfigError::DuplicateVersionTarget { .. })
        ));
    }

    #[test]
    fn test_touch_tracking_falls_back_to_registry_default() {
        let registry = ModelRegistry::new(false);
        let inherited = registry.register(widget()).unwrap();
        assert!(!inherited.records(Event::Touch));
        assert!(inherited.records(Event::Update));

        let explicit = registry
            .register(model("Gadget").track_touch(true))
            .unwrap();
        assert!(explicit.records(Event::Touch));
    }
}
