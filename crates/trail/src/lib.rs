//! Versioning engine for mutable records
//!
//! On each lifecycle event (create, update, destroy, touch) of a tracked
//! record, `trail` decides whether the change is worth recording, captures a
//! storage-safe snapshot and changeset, and appends an immutable [`Version`]
//! through a [`VersionStore`]. Stored versions can later be reified back into
//! point-in-time instances, tolerant of schema changes made since.
//!
//! # Architecture
//! - [`codec`]: typed attribute values to storage-safe JSON and back
//! - [`changeset`]: ignore/skip/only filtering and attribute diffs
//! - [`recorder`]: per-event recording decisions
//! - [`association`]: related-record identifiers captured at event time
//! - [`store`]: persistence boundary and an in-memory implementation
//! - [`reify`]: historical reconstruction against the current schema
//! - [`context`]: scoped actor identity and recording switches
//! - [`deferred`]: frozen jobs for asynchronous recording

pub mod association;
pub mod changeset;
pub mod codec;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod event;
pub mod recorder;
pub mod registry;
pub mod reify;
pub mod schema;
pub mod serializer;
pub mod store;
pub mod trail;
pub mod value;
pub mod version;

pub use association::{AssociationConfig, AssociationTracker, LiveAssociations};
pub use changeset::{Change, Changeset, ChangesetBuilder, FilterPolicy};
pub use codec::{AttributeCodec, StoredObject};
pub use config::{
    MetadataSource, ModelConfig, RecordView, TrailConfig, VersionTarget, DEFAULT_VERSION_TARGET,
};
pub use context::{ContextGuard, RequestContext};
pub use deferred::{ChannelQueue, DeferredJob, DeferredQueue, DeferredWorker};
pub use error::{ConfigError, Result, TrailError};
pub use event::{DestroyOrder, Event, LifecycleEvent, Mutation};
pub use recorder::EventRecorder;
pub use registry::{ModelDescriptor, ModelRegistry};
pub use reify::{
    AssociationHandle, Instance, MissingAttribute, PointInTime, Reifier, ReifyOptions,
};
pub use schema::{Column, ColumnType, Schema};
pub use serializer::{JsonSerializer, ObjectSerializer};
pub use store::{
    MemoryTransaction, MemoryVersionStore, SequentialTransactionIds, TransactionIdGenerator,
    VersionStore,
};
pub use trail::{Recorded, Trail};
pub use value::{AttributeValue, Attributes, ItemId};
pub use version::{NewVersion, NewVersionAssociation, Version, VersionAssociation};
