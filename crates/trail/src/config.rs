//! Configuration: process-wide settings, version targets and per-model options

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::association::AssociationConfig;
use crate::error::ConfigError;
use crate::event::{DestroyOrder, Event};
use crate::schema::Schema;
use crate::value::{Attributes, ItemId};

/// Name of the version target every model uses unless told otherwise
pub const DEFAULT_VERSION_TARGET: &str = "Version";

/// Process-wide versioning settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailConfig {
    /// Initial value of the process-wide enabled flag
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Field name under which a version's recording time is exported
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,

    /// Keep at most this many non-create versions per item
    #[serde(default)]
    pub version_limit: Option<usize>,

    /// Default for models that do not say whether touches are recorded
    #[serde(default = "default_track_touch")]
    pub track_touch: bool,

    /// Hand mutations to a deferred queue instead of writing synchronously
    #[serde(default)]
    pub async_recording: bool,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            timestamp_field: default_timestamp_field(),
            version_limit: None,
            track_touch: default_track_touch(),
            async_recording: false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_timestamp_field() -> String {
    "created_at".to_string()
}

fn default_track_touch() -> bool {
    true
}

impl TrailConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `TRAIL_*` environment variables, falling back
    /// to defaults for anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("TRAIL_ENABLED") {
            config.enabled = parse_env_bool("TRAIL_ENABLED", &value)?;
        }
        if let Ok(value) = std::env::var("TRAIL_TIMESTAMP_FIELD") {
            config.timestamp_field = value;
        }
        if let Ok(value) = std::env::var("TRAIL_VERSION_LIMIT") {
            let limit = value.parse().map_err(|e| ConfigError::InvalidSetting {
                key: "TRAIL_VERSION_LIMIT".to_string(),
                message: format!("{}", e),
            })?;
            config.version_limit = Some(limit);
        }
        if let Ok(value) = std::env::var("TRAIL_TRACK_TOUCH") {
            config.track_touch = parse_env_bool("TRAIL_TRACK_TOUCH", &value)?;
        }
        if let Ok(value) = std::env::var("TRAIL_ASYNC") {
            config.async_recording = parse_env_bool("TRAIL_ASYNC", &value)?;
        }

        Ok(config)
    }
}

fn parse_env_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    crate::schema::parse_boolean(value).ok_or_else(|| ConfigError::InvalidSetting {
        key: key.to_string(),
        message: format!("expected a boolean, got {:?}", value),
    })
}

/// A destination table/class for version rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTarget {
    name: String,
    concrete: bool,
    object_changes: bool,
    metadata_columns: Option<Vec<String>>,
}

impl VersionTarget {
    /// Concrete target with an `object_changes` column that accepts any
    /// metadata key
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concrete: true,
            object_changes: true,
            metadata_columns: None,
        }
    }

    /// Mark the target as a base that cannot hold rows itself
    pub fn abstract_target(mut self) -> Self {
        self.concrete = false;
        self
    }

    pub fn without_object_changes(mut self) -> Self {
        self.object_changes = false;
        self
    }

    /// Restrict metadata to the listed columns
    pub fn metadata_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete
    }

    pub fn has_object_changes(&self) -> bool {
        self.object_changes
    }

    pub fn accepts_metadata(&self, key: &str) -> bool {
        match &self.metadata_columns {
            Some(columns) => columns.iter().any(|c| c == key),
            None => true,
        }
    }
}

/// Read-only view of a record handed to metadata functions and conditions
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub item_type: &'a str,
    pub item_id: &'a ItemId,
    pub event: Event,
    /// State after the event (last state for a destroy)
    pub attributes: &'a Attributes,
    /// State before the event, absent for a create
    pub previous: Option<&'a Attributes>,
}

pub type MetadataFn = Arc<dyn Fn(&RecordView<'_>) -> Value + Send + Sync>;
pub type Condition = Arc<dyn Fn(&RecordView<'_>) -> bool + Send + Sync>;

/// Where a metadata value comes from
#[derive(Clone)]
pub enum MetadataSource {
    Static(Value),
    /// A record attribute; the pre-event value when there is one
    Attribute(String),
    Computed(MetadataFn),
}

impl MetadataSource {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&RecordView<'_>) -> Value + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }
}

impl fmt::Debug for MetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Attribute(name) => f.debug_tuple("Attribute").field(name).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Per-model versioning options, frozen at registration
#[derive(Clone)]
pub struct ModelConfig {
    pub(crate) name: String,
    pub(crate) schema: Schema,
    pub(crate) ignore: Vec<String>,
    pub(crate) skip: Vec<String>,
    pub(crate) only: Vec<String>,
    pub(crate) metadata: Vec<(String, MetadataSource)>,
    pub(crate) track_touch: Option<bool>,
    pub(crate) version_target: String,
    pub(crate) events: Vec<Event>,
    pub(crate) destroy_order: DestroyOrder,
    pub(crate) requires_parent: bool,
    pub(crate) associations: Vec<AssociationConfig>,
    pub(crate) snapshot_on_create: bool,
    pub(crate) update_timestamps: Vec<String>,
    pub(crate) if_condition: Option<Condition>,
    pub(crate) unless_condition: Option<Condition>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            ignore: Vec::new(),
            skip: Vec::new(),
            only: Vec::new(),
            metadata: Vec::new(),
            track_touch: None,
            version_target: DEFAULT_VERSION_TARGET.to_string(),
            events: Event::ALL.to_vec(),
            destroy_order: DestroyOrder::Before,
            requires_parent: false,
            associations: Vec::new(),
            snapshot_on_create: false,
            update_timestamps: vec!["updated_at".to_string(), "updated_on".to_string()],
            if_condition: None,
            unless_condition: None,
        }
    }

    /// Attributes that never influence recording
    pub fn ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(names.into_iter().map(Into::into));
        self
    }

    /// Attributes left out of stored snapshots and diffs
    pub fn skip<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restrict tracked attributes to exactly these
    pub fn only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, source: MetadataSource) -> Self {
        self.metadata.push((key.into(), source));
        self
    }

    pub fn track_touch(mut self, enabled: bool) -> Self {
        self.track_touch = Some(enabled);
        self
    }

    pub fn version_target(mut self, name: impl Into<String>) -> Self {
        self.version_target = name.into();
        self
    }

    /// Events that produce versions
    pub fn on(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn destroy_order(mut self, order: DestroyOrder) -> Self {
        self.destroy_order = order;
        self
    }

    /// The model holds a mandatory reference to a parent record
    pub fn requires_parent(mut self) -> Self {
        self.requires_parent = true;
        self
    }

    pub fn associate(mut self, association: AssociationConfig) -> Self {
        self.associations.push(association);
        self
    }

    /// Store the created state in `object` for create events
    pub fn snapshot_on_create(mut self) -> Self {
        self.snapshot_on_create = true;
        self
    }

    /// Attributes the host bumps automatically on every update
    pub fn update_timestamps<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_timestamps = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn record_if<F>(mut self, condition: F) -> Self
    where
        F: Fn(&RecordView<'_>) -> bool + Send + Sync + 'static,
    {
        self.if_condition = Some(Arc::new(condition));
        self
    }

    pub fn record_unless<F>(mut self, condition: F) -> Self
    where
        F: Fn(&RecordView<'_>) -> bool + Send + Sync + 'static,
    {
        self.unless_condition = Some(Arc::new(condition));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("ignore", &self.ignore)
            .field("skip", &self.skip)
            .field("only", &self.only)
            .field("metadata", &self.metadata)
            .field("version_target", &self.version_target)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
