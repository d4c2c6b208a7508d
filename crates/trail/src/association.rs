//! Association tracking: identifiers of related records at event time

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::value::{Attributes, ItemId};
use crate::version::NewVersionAssociation;

/// An association declared for recording on a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationConfig {
    /// Parent reference held in a foreign key attribute of the record
    BelongsTo {
        name: String,
        foreign_key: String,
        target: String,
    },
    /// Related records whose identifiers the host supplies at event time
    Collection {
        name: String,
        foreign_key_name: String,
        target: String,
    },
}

impl AssociationConfig {
    pub fn belongs_to(
        name: impl Into<String>,
        foreign_key: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::BelongsTo {
            name: name.into(),
            foreign_key: foreign_key.into(),
            target: target.into(),
        }
    }

    pub fn collection(
        name: impl Into<String>,
        foreign_key_name: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::Collection {
            name: name.into(),
            foreign_key_name: foreign_key_name.into(),
            target: target.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::BelongsTo { name, .. } | Self::Collection { name, .. } => name,
        }
    }

    /// Item type of the related record
    pub fn target(&self) -> &str {
        match self {
            Self::BelongsTo { target, .. } | Self::Collection { target, .. } => target,
        }
    }

    /// Key name written to the association rows
    pub fn foreign_key_name(&self) -> &str {
        match self {
            Self::BelongsTo { foreign_key, .. } => foreign_key,
            Self::Collection {
                foreign_key_name, ..
            } => foreign_key_name,
        }
    }
}

/// Live identifiers of collection associations, supplied by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveAssociations {
    collections: Vec<(String, Vec<ItemId>)>,
}

impl LiveAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, T>(mut self, association: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ItemId>,
    {
        let association = association.into();
        let ids: Vec<ItemId> = ids.into_iter().map(Into::into).collect();
        match self.collections.iter_mut().find(|(n, _)| *n == association) {
            Some(entry) => entry.1 = ids,
            None => self.collections.push((association, ids)),
        }
        self
    }

    pub fn ids(&self, association: &str) -> Option<&[ItemId]> {
        self.collections
            .iter()
            .find(|(n, _)| n == association)
            .map(|(_, ids)| ids.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Captures association rows for one version
pub struct AssociationTracker<'a> {
    associations: &'a [AssociationConfig],
}

impl<'a> AssociationTracker<'a> {
    pub fn new(associations: &'a [AssociationConfig]) -> Self {
        Self { associations }
    }

    /// One row per captured foreign key, resolved from live state
    pub fn capture(
        &self,
        live_attributes: &Attributes,
        live: &LiveAssociations,
    ) -> Vec<NewVersionAssociation> {
        let mut rows = Vec::new();
        for association in self.associations {
            match association {
                AssociationConfig::BelongsTo { foreign_key, .. } => {
                    let id = live_attributes
                        .get(foreign_key)
                        .and_then(ItemId::from_attribute);
                    rows.push(NewVersionAssociation {
                        foreign_key_name: foreign_key.clone(),
                        foreign_key_id: id,
                    });
                }
                AssociationConfig::Collection {
                    name,
                    foreign_key_name,
                    ..
                } => match live.ids(name) {
                    Some(ids) => rows.extend(ids.iter().map(|id| NewVersionAssociation {
                        foreign_key_name: foreign_key_name.clone(),
                        foreign_key_id: Some(id.clone()),
                    })),
                    None => debug!(
                        "No live identifiers supplied for association {}, nothing captured",
                        name
                    ),
                },
            }
        }
        rows
    }
}
