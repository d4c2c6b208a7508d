//! The `Trail` facade: registration, recording, history and reification

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::changeset::Changeset;
use crate::config::{ModelConfig, TrailConfig, VersionTarget};
use crate::context::RequestContext;
use crate::deferred::{DeferredJob, DeferredQueue};
use crate::error::{Result, TrailError};
use crate::event::{DestroyOrder, Event, Mutation};
use crate::recorder::EventRecorder;
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::reify::{AssociationHandle, Instance, PointInTime, Reifier, ReifyOptions};
use crate::serializer::{JsonSerializer, ObjectSerializer};
use crate::store::VersionStore;
use crate::value::{Attributes, ItemId};
use crate::version::Version;

/// Outcome of [`Trail::handle`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Version(Version),
    Enqueued(Uuid),
    Skipped,
}

/// Versioning engine for a set of registered models
pub struct Trail {
    config: TrailConfig,
    enabled: AtomicBool,
    registry: ModelRegistry,
    serializer: Arc<dyn ObjectSerializer>,
}

impl Trail {
    pub fn new(config: TrailConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            registry: ModelRegistry::new(config.track_touch),
            serializer: Arc::new(JsonSerializer),
            config,
        }
    }

    /// Replace the outer snapshot serializer
    pub fn with_serializer(mut self, serializer: Arc<dyn ObjectSerializer>) -> Self {
        debug!("Using {} snapshot serializer", serializer.name());
        self.serializer = serializer;
        self
    }

    pub fn config(&self) -> &TrailConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn serializer(&self) -> &dyn ObjectSerializer {
        self.serializer.as_ref()
    }

    pub fn is_enabled_globally(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the process-wide switch. Every context sees the change.
    pub fn set_enabled_globally(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether a mutation of `model` in `ctx` is recorded: the process-wide,
    /// scoped and per-model switches must all be on
    pub fn enabled_for(&self, ctx: &RequestContext, model: &str) -> bool {
        self.is_enabled_globally() && ctx.is_enabled() && ctx.is_enabled_for_model(model)
    }

    pub fn register_version_target(&self, target: VersionTarget) -> Result<()> {
        Ok(self.registry.register_version_target(target)?)
    }

    pub fn register(&self, config: ModelConfig) -> Result<Arc<ModelDescriptor>> {
        Ok(self.registry.register(config)?)
    }

    pub fn descriptor(&self, model: &str) -> Result<Arc<ModelDescriptor>> {
        self.registry.get(model)
    }

    /// Record `mutation` synchronously into `store`.
    ///
    /// Pass a transaction as the store to make the version part of the
    /// mutation's own unit of work.
    pub async fn record(
        &self,
        store: &dyn VersionStore,
        ctx: &RequestContext,
        model: &str,
        mutation: Mutation,
    ) -> Result<Option<Version>> {
        if !self.enabled_for(ctx, model) {
            debug!("Versioning disabled for {}, not recording", model);
            return Ok(None);
        }
        let descriptor = self.registry.get(model)?;
        self.write(store, &descriptor, ctx, &mutation).await
    }

    pub async fn record_create(
        &self,
        store: &dyn VersionStore,
        ctx: &RequestContext,
        model: &str,
        item_id: impl Into<ItemId>,
        after: Attributes,
    ) -> Result<Option<Version>> {
        self.record(store, ctx, model, Mutation::create(item_id, after))
            .await
    }

    pub async fn record_update(
        &self,
        store: &dyn VersionStore,
        ctx: &RequestContext,
        model: &str,
        item_id: impl Into<ItemId>,
        before: Attributes,
        after: Attributes,
    ) -> Result<Option<Version>> {
        self.record(store, ctx, model, Mutation::update(item_id, before, after))
            .await
    }

    pub async fn record_touch(
        &self,
        store: &dyn VersionStore,
        ctx: &RequestContext,
        model: &str,
        item_id: impl Into<ItemId>,
        before: Attributes,
        after: Attributes,
    ) -> Result<Option<Version>> {
        self.record(store, ctx, model, Mutation::touch(item_id, before, after))
            .await
    }

    pub async fn record_destroy(
        &self,
        store: &dyn VersionStore,
        ctx: &RequestContext,
        model: &str,
        item_id: impl Into<ItemId>,
        before: Attributes,
        order: DestroyOrder,
    ) -> Result<Option<Version>> {
        self.record(store, ctx, model, Mutation::destroy(item_id, before, order))
            .await
    }

    /// Freeze `mutation` and hand it to `queue`. The enabled check happens
    /// now, not when the job runs.
    pub async fn enqueue(
        &self,
        queue: &dyn DeferredQueue,
        ctx: &RequestContext,
        model: &str,
        mutation: &Mutation,
    ) -> Result<Option<Uuid>> {
        if !self.enabled_for(ctx, model) {
            debug!("Versioning disabled for {}, not enqueueing", model);
            return Ok(None);
        }
        let descriptor = self.registry.get(model)?;
        let job = DeferredJob::freeze(&descriptor, ctx, mutation);
        let id = job.id;
        queue.enqueue(job).await?;
        Ok(Some(id))
    }

    /// Record a job produced by [`Trail::enqueue`]
    pub async fn process_deferred(
        &self,
        store: &dyn VersionStore,
        job: &DeferredJob,
    ) -> Result<Option<Version>> {
        let descriptor = self.registry.get(&job.item_type)?;
        let (ctx, mutation) = job.thaw(&descriptor)?;
        self.write(store, &descriptor, &ctx, &mutation).await
    }

    /// Record or enqueue according to `async_recording`.
    ///
    /// Store and queue failures are logged and reported as `Skipped` so the
    /// host's mutation can still go through. Configuration and unknown-model
    /// errors are returned.
    pub async fn handle(
        &self,
        store: &dyn VersionStore,
        queue: &dyn DeferredQueue,
        ctx: &RequestContext,
        model: &str,
        mutation: Mutation,
    ) -> Result<Recorded> {
        let outcome = if self.config.async_recording {
            self.enqueue(queue, ctx, model, &mutation)
                .await
                .map(|id| id.map_or(Recorded::Skipped, Recorded::Enqueued))
        } else {
            self.record(store, ctx, model, mutation)
                .await
                .map(|version| version.map_or(Recorded::Skipped, Recorded::Version))
        };

        match outcome {
            Err(e @ (TrailError::Config(_) | TrailError::UnknownModel { .. })) => Err(e),
            Err(e) => {
                error!("Failed to record {} version: {}", model, e);
                Ok(Recorded::Skipped)
            }
            Ok(recorded) => Ok(recorded),
        }
    }

    async fn write(
        &self,
        store: &dyn VersionStore,
        descriptor: &ModelDescriptor,
        ctx: &RequestContext,
        mutation: &Mutation,
    ) -> Result<Option<Version>> {
        let recorder = EventRecorder::new(descriptor, self.serializer.as_ref());
        let Some(new_version) = recorder.build(ctx, mutation)? else {
            return Ok(None);
        };

        let version = store.append(new_version).await?;
        debug!(
            "Recorded {} version {} of {} {}",
            version.event, version.id, version.item_type, version.item_id
        );

        // A failed prune leaves the version recorded
        if let Some(limit) = self.config.version_limit {
            if version.event != Event::Create {
                match store
                    .prune_item(&version.item_type, &version.item_id, limit)
                    .await
                {
                    Ok(0) => {}
                    Ok(pruned) => debug!(
                        "Pruned {} old versions of {} {}",
                        pruned, version.item_type, version.item_id
                    ),
                    Err(e) => error!(
                        "Failed to prune versions of {} {}: {}",
                        version.item_type, version.item_id, e
                    ),
                }
            }
        }
        Ok(Some(version))
    }

    /// Reconstruct the state stored in `version`
    pub async fn reify(
        &self,
        store: &dyn VersionStore,
        version: &Version,
        options: &ReifyOptions,
    ) -> Result<Option<Instance>> {
        let descriptor = self.registry.get(&version.item_type)?;
        let rows = if options.associations {
            store.version_associations(version.id).await?
        } else {
            Vec::new()
        };
        Reifier::new(&descriptor, self.serializer.as_ref()).reify(version, &rows, options)
    }

    /// Item state at `at`: reified from the first version recorded after it,
    /// live when there is none, missing when that version is its create
    pub async fn state_at(
        &self,
        store: &dyn VersionStore,
        model: &str,
        item_id: &ItemId,
        at: DateTime<Utc>,
        options: &ReifyOptions,
    ) -> Result<PointInTime> {
        match store.version_at(model, item_id, at).await? {
            Some(version) => self.point_in_time(store, &version, options).await,
            None => Ok(PointInTime::Live(item_id.clone())),
        }
    }

    /// State of an associated record when `parent` was recorded.
    ///
    /// The associated record's first version in the same transaction as the
    /// parent, or else recorded after it, holds the state that was current
    /// then.
    pub async fn resolve_association(
        &self,
        store: &dyn VersionStore,
        handle: &AssociationHandle,
        parent: &Version,
        options: &ReifyOptions,
    ) -> Result<PointInTime> {
        let Some(id) = &handle.foreign_key_id else {
            return Ok(PointInTime::Missing);
        };
        let versions = store.item_versions(&handle.target, id).await?;
        let candidate = versions.into_iter().find(|v| {
            v.id > parent.id
                || (parent.transaction_id.is_some() && v.transaction_id == parent.transaction_id)
        });
        match candidate {
            Some(version) => self.point_in_time(store, &version, options).await,
            None => Ok(PointInTime::Live(id.clone())),
        }
    }

    async fn point_in_time(
        &self,
        store: &dyn VersionStore,
        version: &Version,
        options: &ReifyOptions,
    ) -> Result<PointInTime> {
        if version.is_create() {
            return Ok(PointInTime::Missing);
        }
        match self.reify(store, version, options).await? {
            Some(instance) => Ok(PointInTime::Historical(instance)),
            None => {
                warn!("Version {} has no snapshot to reify", version.id);
                Ok(PointInTime::Missing)
            }
        }
    }

    /// Decode `object_changes` into a typed changeset
    pub fn changeset(&self, version: &Version) -> Result<Option<Changeset>> {
        let Some(text) = version.object_changes.as_deref() else {
            return Ok(None);
        };
        let descriptor = self.registry.get(&version.item_type)?;
        let stored = self
            .serializer
            .load(text)
            .map_err(|e| TrailError::CorruptSnapshot {
                version_id: version.id,
                field: "object_changes",
                message: e.to_string(),
            })?;
        Ok(Some(Changeset::from_stored(&stored, &descriptor.codec())))
    }
}

impl Default for Trail {
    fn default() -> Self {
        Self::new(TrailConfig::default())
    }
}
