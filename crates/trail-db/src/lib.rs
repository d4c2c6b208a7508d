//! SQL persistence for `trail`
//!
//! Sea-ORM entities for the `versions` and `version_associations` tables,
//! schema setup, and a [`trail::VersionStore`] implementation that works on
//! MySQL-compatible databases and SQLite.

pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod store;

pub use config::DbConfig;
pub use database::Database;
pub use error::{DbStoreError, Result};
pub use store::{SeaOrmTransaction, SeaOrmVersionStore};
