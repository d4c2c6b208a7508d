//! versions entity
//! Append-only audit records, one per recorded lifecycle event

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "versions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub item_type: String,
    pub item_id: String, // Canonical text form of the record's primary key
    pub event: String,   // create, update, destroy or touch
    pub whodunnit: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub object: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub object_changes: Option<String>,
    pub transaction_id: Option<i64>,
    pub created_at: DateTimeUtc,
    #[sea_orm(column_type = "Text", nullable)]
    pub metadata: Option<String>, // JSON object of extra columns
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::version_associations::Entity")]
    VersionAssociations,
}

impl Related<super::version_associations::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VersionAssociations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
