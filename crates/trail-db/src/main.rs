//! Operator CLI for version tables

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde_json::Value;
use trail::{ItemId, JsonSerializer, ObjectSerializer, TrailConfig, Version, VersionStore};
use trail_db::{Database, DbConfig, SeaOrmVersionStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "trail-db")]
#[clap(about = "Inspect and maintain version history tables")]
struct Args {
    /// Database connection URL (can also be set via TRAIL_DATABASE_URL env var)
    #[clap(long, env = "TRAIL_DATABASE_URL")]
    database_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Trail settings file (TOML); TRAIL_* env vars are used when absent
    #[clap(long, env = "TRAIL_CONFIG")]
    config: Option<String>,

    /// Print versions as JSON rows instead of one-line summaries
    #[clap(long)]
    json: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create version tables and indexes
    Setup,

    /// List an item's versions, oldest first
    History {
        #[clap(long)]
        item_type: String,
        #[clap(long)]
        item_id: String,
    },

    /// List versions sharing a transaction id
    Transaction {
        #[clap(long)]
        id: i64,
    },

    /// Show one version with its snapshot, changes and associations
    Show {
        #[clap(long)]
        id: i64,
    },

    /// Keep only the newest non-create versions of an item
    Prune {
        #[clap(long)]
        item_type: String,
        #[clap(long)]
        item_id: String,
        #[clap(long)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("trail={0},trail_db={0}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Database URL: {}", mask_url(&args.database_url));

    let config = match &args.config {
        Some(path) => TrailConfig::from_file(path)?,
        None => TrailConfig::from_env()?,
    };

    let database = Database::connect(&DbConfig::new(args.database_url.clone())).await?;
    let store = SeaOrmVersionStore::new(database.connection().clone());

    match args.command {
        Command::Setup => {
            database.ensure_schema().await?;
            println!("Version tables ready");
        }
        Command::History { item_type, item_id } => {
            let versions = store
                .item_versions(&item_type, &ItemId::new(item_id))
                .await?;
            if versions.is_empty() && !args.json {
                println!("No versions");
            }
            print_versions(&versions, &config, args.json)?;
        }
        Command::Transaction { id } => {
            let versions = store.transaction_versions(id).await?;
            if versions.is_empty() && !args.json {
                println!("No versions in transaction {}", id);
            }
            print_versions(&versions, &config, args.json)?;
        }
        Command::Show { id } => {
            let version = store
                .find_version(id)
                .await?
                .ok_or_else(|| anyhow!("Version not found: {}", id))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&export_rows(&[version], &config))?);
                return Ok(());
            }
            println!("{}", summary(&version, &config.timestamp_field));
            print_document("object", version.object.as_deref())?;
            print_document("object_changes", version.object_changes.as_deref())?;
            if !version.metadata.is_empty() {
                println!(
                    "metadata:\n{}",
                    serde_json::to_string_pretty(&Value::Object(version.metadata.clone()))?
                );
            }
            for association in store.version_associations(id).await? {
                println!(
                    "association {} = {}",
                    association.foreign_key_name,
                    association
                        .foreign_key_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "null".to_string())
                );
            }
        }
        Command::Prune {
            item_type,
            item_id,
            keep,
        } => {
            let pruned = store
                .prune_item(&item_type, &ItemId::new(item_id), keep)
                .await?;
            println!("Pruned {} versions", pruned);
        }
    }

    Ok(())
}

fn print_versions(versions: &[Version], config: &TrailConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&export_rows(versions, config))?);
    } else {
        for version in versions {
            println!("{}", summary(version, &config.timestamp_field));
        }
    }
    Ok(())
}

/// Versions as flat rows, recording time under the configured field name
fn export_rows(versions: &[Version], config: &TrailConfig) -> Value {
    Value::Array(
        versions
            .iter()
            .map(|version| Value::Object(version.to_row(&config.timestamp_field)))
            .collect(),
    )
}

fn summary(version: &Version, timestamp_field: &str) -> String {
    format!(
        "#{} {} {} {} by {} {} {} (transaction {})",
        version.id,
        version.event,
        version.item_type,
        version.item_id,
        version.whodunnit.as_deref().unwrap_or("-"),
        timestamp_field,
        version.created_at.to_rfc3339(),
        version
            .transaction_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    )
}

fn print_document(label: &str, text: Option<&str>) -> Result<()> {
    let Some(text) = text else {
        println!("{}: null", label);
        return Ok(());
    };
    match JsonSerializer.load(text) {
        Ok(document) => println!(
            "{}:\n{}",
            label,
            serde_json::to_string_pretty(&Value::Object(document))?
        ),
        Err(e) => println!("{} (undecodable, {}):\n{}", label, e, text),
    }
    Ok(())
}

/// Hide the password part of a connection URL
fn mask_url(url: &str) -> String {
    let Some(at_pos) = url.find('@') else {
        return url.to_string();
    };
    let before_at = &url[..at_pos];
    let after_at = &url[at_pos..];
    let scheme_end = before_at.find("://").map(|i| i + 3).unwrap_or(0);
    match before_at[scheme_end..].find(':') {
        Some(colon) => format!("{}:****{}", &before_at[..scheme_end + colon], after_at),
        None => url.to_string(),
    }
}
