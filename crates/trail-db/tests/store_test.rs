use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use trail::{
    AssociationConfig, AttributeValue, Attributes, ColumnType, DestroyOrder, Event, ItemId,
    ModelConfig, NewVersion, NewVersionAssociation, ReifyOptions, RequestContext, Schema, Trail,
    TrailConfig, VersionStore,
};
use trail_db::{Database, DbConfig, SeaOrmVersionStore};

/// One pooled connection: every SQLite in-memory connection is its own database
async fn setup() -> Result<(Database, SeaOrmVersionStore)> {
    let mut config = DbConfig::new("sqlite::memory:");
    config.max_connections = 1;
    config.min_connections = 1;

    let database = Database::connect(&config).await?;
    database.ensure_schema().await?;
    // Running setup twice is harmless
    database.ensure_schema().await?;

    let store = SeaOrmVersionStore::new(database.connection().clone());
    Ok((database, store))
}

fn new_version(item_id: i64, event: Event) -> NewVersion {
    let mut metadata = serde_json::Map::new();
    metadata.insert("ip".into(), json!("10.0.0.1"));
    NewVersion {
        item_type: "Widget".into(),
        item_id: ItemId::from(item_id),
        event,
        whodunnit: Some("alice".into()),
        object: Some(r#"{"name":"a"}"#.into()),
        object_changes: None,
        transaction_id: None,
        created_at: Utc::now(),
        metadata,
        associations: vec![NewVersionAssociation {
            foreign_key_name: "owner_id".into(),
            foreign_key_id: Some(ItemId::from(7)),
        }],
    }
}

#[tokio::test]
async fn test_append_and_read_back() -> Result<()> {
    let (database, store) = setup().await?;
    database.health_check().await?;

    let appended = store.append(new_version(1, Event::Update)).await?;
    assert_eq!(appended.transaction_id, Some(appended.id));

    let found = store.find_version(appended.id).await?.expect("stored");
    assert_eq!(found.event, Event::Update);
    assert_eq!(found.whodunnit.as_deref(), Some("alice"));
    assert_eq!(found.metadata["ip"], json!("10.0.0.1"));
    assert_eq!(found.item_id, ItemId::from(1));

    let rows = store.version_associations(appended.id).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].foreign_key_id, Some(ItemId::from(7)));

    assert!(store.find_version(appended.id + 100).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_transaction_shares_first_version_id() -> Result<()> {
    let (_database, store) = setup().await?;

    let tx = store.begin().await?;
    let first = tx.append(new_version(1, Event::Create)).await?;
    let second = tx.append(new_version(2, Event::Create)).await?;
    assert_eq!(first.transaction_id, Some(first.id));
    assert_eq!(second.transaction_id, Some(first.id));
    assert_eq!(tx.transaction_id(), Some(first.id));
    tx.commit().await?;

    let other = store.append(new_version(3, Event::Create)).await?;
    assert_ne!(other.transaction_id, first.transaction_id);

    let grouped = store.transaction_versions(first.id).await?;
    let ids: Vec<i64> = grouped.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    Ok(())
}

#[tokio::test]
async fn test_rollback_discards_versions() -> Result<()> {
    let (_database, store) = setup().await?;

    let tx = store.begin().await?;
    tx.append(new_version(1, Event::Create)).await?;
    tx.rollback().await?;

    assert!(store.item_versions("Widget", &ItemId::from(1)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_prune_keeps_create_and_newest() -> Result<()> {
    let (_database, store) = setup().await?;

    let create = store.append(new_version(1, Event::Create)).await?;
    let mut updates = Vec::new();
    for _ in 0..3 {
        updates.push(store.append(new_version(1, Event::Update)).await?);
    }

    let pruned = store.prune_item("Widget", &ItemId::from(1), 1).await?;
    assert_eq!(pruned, 2);

    let ids: Vec<i64> = store
        .item_versions("Widget", &ItemId::from(1))
        .await?
        .iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(ids, vec![create.id, updates[2].id]);
    assert!(store.version_associations(updates[0].id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_engine_round_trip_through_sql() -> Result<()> {
    let (_database, store) = setup().await?;
    let trail = Trail::new(TrailConfig::default());
    trail.register(
        ModelConfig::new(
            "Widget",
            Schema::new()
                .column("id", ColumnType::Integer)
                .column("owner_id", ColumnType::Integer)
                .column("name", ColumnType::String)
                .column("tag_ids", ColumnType::array_of(ColumnType::Integer)),
        )
        .associate(AssociationConfig::belongs_to("owner", "owner_id", "Owner")),
    )?;
    let ctx = RequestContext::for_actor("alice");

    let live = Attributes::new()
        .with("id", 1)
        .with("owner_id", 7)
        .with("name", "Widget")
        .with("tag_ids", vec![1, 2, 3]);
    trail
        .record_create(&store, &ctx, "Widget", 1, live.clone())
        .await?;
    let destroy = trail
        .record_destroy(&store, &ctx, "Widget", 1, live.clone(), DestroyOrder::Before)
        .await?
        .expect("destroy recorded");

    let instance = trail
        .reify(&store, &destroy, &ReifyOptions::default().with_associations())
        .await?
        .expect("snapshot present");
    assert_eq!(instance.attributes, live);
    assert!(instance.read_only);
    let owner = instance.association("owner").next().expect("owner captured");
    assert_eq!(owner.foreign_key_id, Some(ItemId::from(7)));
    assert_eq!(
        instance.get("tag_ids"),
        Some(&AttributeValue::Array(vec![
            AttributeValue::Integer(1),
            AttributeValue::Integer(2),
            AttributeValue::Integer(3),
        ]))
    );
    Ok(())
}
