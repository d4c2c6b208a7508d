//! Deferred recording
//!
//! A `DeferredJob` carries a frozen, storage-form copy of the attribute
//! snapshots taken when the mutation happened, so later changes to the live
//! record cannot leak into the recorded version. Replaying a job runs the same
//! recorder as the synchronous path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::association::LiveAssociations;
use crate::codec::StoredObject;
use crate::context::RequestContext;
use crate::error::{Result, TrailError};
use crate::event::{DestroyOrder, Event, LifecycleEvent, Mutation};
use crate::registry::ModelDescriptor;
use crate::store::VersionStore;
use crate::trail::Trail;
use crate::value::ItemId;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A mutation waiting to be recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredJob {
    pub id: Uuid,
    pub event: Event,
    pub item_type: String,
    pub item_id: ItemId,
    /// State after the event, or the last state for a destroy
    pub attributes: StoredObject,
    /// State before an update or touch
    pub previous: Option<StoredObject>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub order: DestroyOrder,
    pub whodunnit: Option<String>,
    #[serde(default)]
    pub controller_info: Map<String, Value>,
    pub transaction_id: Option<i64>,
    #[serde(default)]
    pub associations: LiveAssociations,
    pub occurred_at: DateTime<Utc>,
}

impl DeferredJob {
    /// Freeze a mutation and the context it happened in
    pub fn freeze(descriptor: &ModelDescriptor, ctx: &RequestContext, mutation: &Mutation) -> Self {
        let codec = descriptor.codec();
        let (previous, force, order) = match &mutation.lifecycle {
            LifecycleEvent::Create { .. } => (None, false, DestroyOrder::default()),
            LifecycleEvent::Update { before, force, .. } => {
                (Some(codec.serialize(before)), *force, DestroyOrder::default())
            }
            LifecycleEvent::Touch { before, .. } => {
                (Some(codec.serialize(before)), false, DestroyOrder::default())
            }
            LifecycleEvent::Destroy { order, .. } => (None, false, *order),
        };

        Self {
            id: Uuid::new_v4(),
            event: mutation.event(),
            item_type: descriptor.name().to_string(),
            item_id: mutation.item_id.clone(),
            attributes: codec.serialize(mutation.lifecycle.live_attributes()),
            previous,
            force,
            order,
            whodunnit: ctx.whodunnit().map(str::to_string),
            controller_info: ctx.controller_info().clone(),
            transaction_id: ctx.transaction_id(),
            associations: mutation.associations.clone(),
            occurred_at: mutation.occurred_at,
        }
    }

    /// Rebuild the context and mutation for replay
    pub fn thaw(&self, descriptor: &ModelDescriptor) -> Result<(RequestContext, Mutation)> {
        let codec = descriptor.codec();
        let attributes = codec.deserialize(&self.attributes);
        let previous = || {
            self.previous
                .as_ref()
                .map(|stored| codec.deserialize(stored))
                .ok_or_else(|| {
                    TrailError::queue(format!(
                        "Job {} for {} is missing its previous state",
                        self.id, self.event
                    ))
                })
        };

        let lifecycle = match self.event {
            Event::Create => LifecycleEvent::Create { after: attributes },
            Event::Update => LifecycleEvent::Update {
                before: previous()?,
                after: attributes,
                force: self.force,
            },
            Event::Touch => LifecycleEvent::Touch {
                before: previous()?,
                after: attributes,
            },
            Event::Destroy => LifecycleEvent::Destroy {
                before: attributes,
                order: self.order,
            },
        };

        let mut ctx = RequestContext::new();
        ctx.set_whodunnit(self.whodunnit.clone());
        ctx.set_controller_info(self.controller_info.clone());
        ctx.set_transaction_id(self.transaction_id);

        let mutation = Mutation {
            item_id: self.item_id.clone(),
            lifecycle,
            associations: self.associations.clone(),
            occurred_at: self.occurred_at,
        };
        Ok((ctx, mutation))
    }
}

/// Destination for deferred jobs
#[async_trait]
pub trait DeferredQueue: Send + Sync {
    async fn enqueue(&self, job: DeferredJob) -> Result<()>;
}

/// Queue backed by a bounded tokio channel
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<DeferredJob>,
}

impl ChannelQueue {
    pub fn new() -> (Self, DeferredWorker) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// A zero capacity is raised to one; tokio channels need room for a job
    pub fn with_capacity(capacity: usize) -> (Self, DeferredWorker) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, DeferredWorker { receiver })
    }
}

#[async_trait]
impl DeferredQueue for ChannelQueue {
    async fn enqueue(&self, job: DeferredJob) -> Result<()> {
        let id = job.id;
        self.sender
            .send(job)
            .await
            .map_err(|_| TrailError::queue(format!("Worker is gone, dropping job {}", id)))?;
        debug!("Enqueued deferred job {}", id);
        Ok(())
    }
}

/// Drains a [`ChannelQueue`] and records each job
pub struct DeferredWorker {
    receiver: mpsc::Receiver<DeferredJob>,
}

impl DeferredWorker {
    pub async fn next(&mut self) -> Option<DeferredJob> {
        self.receiver.recv().await
    }

    /// Process jobs until every queue handle is dropped. Failed jobs are
    /// logged and skipped. Returns the number of versions written.
    pub async fn run(mut self, trail: Arc<Trail>, store: Arc<dyn VersionStore>) -> usize {
        info!("Deferred recording worker started");
        let mut written = 0;
        while let Some(job) = self.next().await {
            match trail.process_deferred(store.as_ref(), &job).await {
                Ok(Some(version)) => {
                    debug!("Job {} recorded as version {}", job.id, version.id);
                    written += 1;
                }
                Ok(None) => debug!("Job {} produced no version", job.id),
                Err(e) => error!("Failed to record deferred job {}: {}", job.id, e),
            }
        }
        info!("Deferred recording worker stopped after {} versions", written);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::registry::ModelRegistry;
    use crate::schema::{ColumnType, Schema};
    use crate::value::Attributes;

    fn descriptor() -> Arc<ModelDescriptor> {
        ModelRegistry::new(true)
            .register(ModelConfig::new(
                "Widget",
                Schema::new()
                    .column("id", ColumnType::Integer)
                    .column("name", ColumnType::String),
            ))
            .unwrap()
    }

    #[test]
    fn test_freeze_and_thaw_keep_snapshots_and_actor() {
        let descriptor = descriptor();
        let mut ctx = RequestContext::for_actor("alice");
        ctx.insert_controller_info("ip", "10.0.0.1");
        let before = Attributes::new().with("id", 1).with("name", "a");
        let after = Attributes::new().with("id", 1).with("name", "b");
        let mutation = Mutation::update(1, before.clone(), after.clone()).forced();

        let job = DeferredJob::freeze(&descriptor, &ctx, &mutation);
        let json = serde_json::to_string(&job).unwrap();
        let job: DeferredJob = serde_json::from_str(&json).unwrap();

        let (thawed_ctx, thawed) = job.thaw(&descriptor).unwrap();
        assert_eq!(thawed_ctx.whodunnit(), Some("alice"));
        assert_eq!(thawed_ctx.controller_info()["ip"], Value::from("10.0.0.1"));
        assert_eq!(thawed, mutation);
    }

    #[test]
    fn test_thaw_update_without_previous_state_fails() {
        let descriptor = descriptor();
        let mut job = DeferredJob::freeze(
            &descriptor,
            &RequestContext::new(),
            &Mutation::touch(1, Attributes::new(), Attributes::new()),
        );
        job.previous = None;
        assert!(matches!(job.thaw(&descriptor), Err(TrailError::Queue { .. })));
    }

    #[tokio::test]
    async fn test_channel_queue_delivers_jobs() {
        let descriptor = descriptor();
        let (queue, mut worker) = ChannelQueue::with_capacity(4);
        let job = DeferredJob::freeze(
            &descriptor,
            &RequestContext::new(),
            &Mutation::create(1, Attributes::new().with("id", 1)),
        );
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(worker.next().await, Some(job));

        drop(worker);
        let orphan = DeferredJob::freeze(
            &descriptor,
            &RequestContext::new(),
            &Mutation::create(2, Attributes::new()),
        );
        assert!(queue.enqueue(orphan).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_capacity_queue_still_accepts_jobs() {
        let descriptor = descriptor();
        let (queue, mut worker) = ChannelQueue::with_capacity(0);
        let job = DeferredJob::freeze(
            &descriptor,
            &RequestContext::new(),
            &Mutation::create(1, Attributes::new().with("id", 1)),
        );
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(worker.next().await, Some(job));
    }
}
