//! Sea-ORM entities for version tables

pub mod version_associations;
pub mod versions;

pub use version_associations::Entity as VersionAssociations;
pub use versions::Entity as Versions;
