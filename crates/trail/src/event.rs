//! Lifecycle events delivered by the host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::association::LiveAssociations;
use crate::value::{Attributes, ItemId};

/// Event recorded on a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Create,
    Update,
    Destroy,
    Touch,
}

impl Event {
    pub const ALL: [Event; 4] = [Event::Create, Event::Update, Event::Destroy, Event::Touch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Touch => "touch",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Event {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "destroy" => Ok(Self::Destroy),
            "touch" => Ok(Self::Touch),
            other => Err(format!("unknown event: {}", other)),
        }
    }
}

/// When a destroy version is written relative to the delete statement.
///
/// Only the timing differs; the stored snapshot is always the pre-destroy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestroyOrder {
    #[default]
    Before,
    After,
}

/// Attribute snapshots for one lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Create {
        after: Attributes,
    },
    Update {
        before: Attributes,
        after: Attributes,
        force: bool,
    },
    Touch {
        before: Attributes,
        after: Attributes,
    },
    Destroy {
        before: Attributes,
        order: DestroyOrder,
    },
}

impl LifecycleEvent {
    pub fn event(&self) -> Event {
        match self {
            Self::Create { .. } => Event::Create,
            Self::Update { .. } => Event::Update,
            Self::Touch { .. } => Event::Touch,
            Self::Destroy { .. } => Event::Destroy,
        }
    }

    /// Attribute state of the record as it stands once the event completes,
    /// or its last state for a destroy
    pub fn live_attributes(&self) -> &Attributes {
        match self {
            Self::Create { after } => after,
            Self::Update { after, .. } | Self::Touch { after, .. } => after,
            Self::Destroy { before, .. } => before,
        }
    }

    /// Attribute state before the event, absent for a create
    pub fn previous_attributes(&self) -> Option<&Attributes> {
        match self {
            Self::Create { .. } => None,
            Self::Update { before, .. } | Self::Touch { before, .. } => Some(before),
            Self::Destroy { before, .. } => Some(before),
        }
    }
}

/// One mutation of a tracked record, as reported by the host
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub item_id: ItemId,
    pub lifecycle: LifecycleEvent,
    pub associations: LiveAssociations,
    pub occurred_at: DateTime<Utc>,
}

impl Mutation {
    pub fn new(item_id: impl Into<ItemId>, lifecycle: LifecycleEvent) -> Self {
        Self {
            item_id: item_id.into(),
            lifecycle,
            associations: LiveAssociations::default(),
            occurred_at: Utc::now(),
        }
    }

    pub fn create(item_id: impl Into<ItemId>, after: Attributes) -> Self {
        Self::new(item_id, LifecycleEvent::Create { after })
    }

    pub fn update(item_id: impl Into<ItemId>, before: Attributes, after: Attributes) -> Self {
        Self::new(
            item_id,
            LifecycleEvent::Update {
                before,
                after,
                force: false,
            },
        )
    }

    pub fn touch(item_id: impl Into<ItemId>, before: Attributes, after: Attributes) -> Self {
        Self::new(item_id, LifecycleEvent::Touch { before, after })
    }

    pub fn destroy(item_id: impl Into<ItemId>, before: Attributes, order: DestroyOrder) -> Self {
        Self::new(item_id, LifecycleEvent::Destroy { before, order })
    }

    /// Record an update even when nothing notable changed
    pub fn forced(mut self) -> Self {
        if let LifecycleEvent::Update { force, .. } = &mut self.lifecycle {
            *force = true;
        }
        self
    }

    pub fn with_associations(mut self, associations: LiveAssociations) -> Self {
        self.associations = associations;
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn event(&self) -> Event {
        self.lifecycle.event()
    }
}
