//! Database connection and schema setup for version tables

use anyhow::{anyhow, Result};
use sea_orm::sea_query::Index;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database as SeaOrmDatabase, DatabaseConnection, DbBackend, DbErr,
    Schema,
};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::DbConfig;
use crate::entity::{version_associations, versions};

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Version database connection wrapper
pub struct Database {
    connection: DatabaseConnection,
}

impl Database {
    /// Wrap an existing connection
    pub fn from_connection(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Connect with retries
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        info!("Connecting to version database...");

        let mut attempts = 0;
        loop {
            attempts += 1;

            let mut opt = ConnectOptions::new(config.database_url.clone());
            opt.max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .connect_timeout(config.connect_timeout())
                .sqlx_logging(config.sqlx_logging);

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    info!(
                        "Connected to version database (max connections: {})",
                        config.max_connections
                    );
                    return Ok(Self { connection });
                }
                Err(e) if attempts < config.max_attempts => {
                    warn!(
                        "Failed to connect to version database (attempt {}/{}): {}",
                        attempts, config.max_attempts, e
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to version database after {} attempts",
                        attempts
                    );
                    return Err(anyhow!("Database connection failed: {}", e));
                }
            }
        }
    }

    /// Create `versions` and `version_associations` with their indexes when
    /// they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        let backend = self.connection.get_database_backend();
        let schema = Schema::new(backend);

        let mut create_versions = schema.create_table_from_entity(versions::Entity);
        create_versions.if_not_exists();
        self.connection.execute(backend.build(&create_versions)).await?;

        let mut create_associations = schema.create_table_from_entity(version_associations::Entity);
        create_associations.if_not_exists();
        self.connection
            .execute(backend.build(&create_associations))
            .await?;

        let indexes = [
            Index::create()
                .name("index_versions_on_item_type_and_item_id")
                .table(versions::Entity)
                .col(versions::Column::ItemType)
                .col(versions::Column::ItemId)
                .to_owned(),
            Index::create()
                .name("index_versions_on_transaction_id")
                .table(versions::Entity)
                .col(versions::Column::TransactionId)
                .to_owned(),
            Index::create()
                .name("index_version_associations_on_version_id")
                .table(version_associations::Entity)
                .col(version_associations::Column::VersionId)
                .to_owned(),
            Index::create()
                .name("index_version_associations_on_foreign_key")
                .table(version_associations::Entity)
                .col(version_associations::Column::ForeignKeyName)
                .col(version_associations::Column::ForeignKeyId)
                .to_owned(),
        ];
        for mut index in indexes {
            // MySQL has no IF NOT EXISTS for indexes
            if backend != DbBackend::MySql {
                index.if_not_exists();
            }
            match self.connection.execute(backend.build(&index)).await {
                Ok(_) => {}
                Err(e) if is_existing_index(&e) => warn!("Index already exists: {}", e),
                Err(e) => {
                    error!("Failed to create index: {}", e);
                    return Err(e.into());
                }
            }
        }

        info!("Version tables ready");
        Ok(())
    }

    /// Simple query to check the connection
    pub async fn health_check(&self) -> Result<()> {
        use sea_orm::{EntityTrait, PaginatorTrait};
        versions::Entity::find()
            .paginate(&self.connection, 1)
            .fetch_page(0)
            .await
            .map_err(|e| anyhow!("Health check failed: {}", e))?;
        Ok(())
    }
}

/// Duplicate index errors: MySQL 1061, SQLite and Postgres "already exists"
fn is_existing_index(err: &DbErr) -> bool {
    let message = err.to_string();
    message.contains("Duplicate key name") || message.contains("already exists")
}
