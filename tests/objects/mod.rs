use std::collections::HashMap;
use std::sync::Arc;

use rstest::rstest;
use serde_json::json;

use lakeward::catalog::memory::FILESET_LOCATION_KEY;
use lakeward::catalog::{ExternalObject, ObjectChange};
use lakeward::error::ErrorKind;
use lakeward::identifier::{NameIdentifier, Namespace, StringIdentifier, ID_KEY};
use lakeward::meta::EntityType;
use lakeward::principal::with_principal;

use crate::{impersonating_lake, test_lake, TestLake, CATALOG, METALAKE, OWNER, SCHEMA};

fn external(name: &str, properties: HashMap<String, String>) -> ExternalObject {
    ExternalObject {
        name: name.to_string(),
        comment: Some("made outside".to_string()),
        properties,
        details: json!({"columns": [{"name": "id", "type": "bigint"}]}),
        audit: None,
    }
}

#[rstest]
#[tokio::test]
async fn test_create_then_load(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let ident = TestLake::leaf("orders");

    let created = with_principal(
        OWNER,
        lake.context.tables.create(
            &ident,
            Some("all orders"),
            json!({"columns": []}),
            HashMap::from([("format".to_string(), "parquet".to_string())]),
        ),
    )
    .await
    .unwrap();
    assert!(created.is_managed());
    assert_eq!(created.comment(), Some("all orders"));
    assert_eq!(
        created.properties(),
        &HashMap::from([("format".to_string(), "parquet".to_string())])
    );

    // The correlation key lives in the external system only
    let stored_externally = lake.state.get_external(EntityType::Table, &ident).unwrap();
    assert_eq!(
        StringIdentifier::parse(&stored_externally.properties[ID_KEY])
            .ok()
            .map(|id| id.id()),
        created.id()
    );

    let loaded = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert_eq!(loaded.id(), created.id());
    assert_eq!(loaded.details(), &json!({"columns": []}));
    assert!(!loaded.properties().contains_key(ID_KEY));

    let err = with_principal(
        OWNER,
        lake.context
            .tables
            .create(&ident, None, json!({}), HashMap::new()),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[rstest]
#[tokio::test]
async fn test_load_imports_unmanaged_objects_once(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let ident = TestLake::leaf("legacy");
    lake.state
        .insert_external(EntityType::Table, &ident, external("legacy", HashMap::new()));
    assert!(!lake
        .context
        .store
        .exists(&ident, EntityType::Table)
        .await
        .unwrap());

    let first = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert!(first.is_managed());
    assert_eq!(first.comment(), Some("made outside"));
    assert_eq!(first.audit().unwrap().creator, OWNER);

    let second = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert_eq!(second.id(), first.id());
    let entity = lake
        .context
        .store
        .get(&ident, EntityType::Table)
        .await
        .unwrap();
    assert_eq!(Some(entity.id()), first.id());
}

#[rstest]
#[tokio::test]
async fn test_embedded_id_is_reused_on_import(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let ident = TestLake::leaf("migrated");
    lake.state.insert_external(
        EntityType::Table,
        &ident,
        external(
            "migrated",
            HashMap::from([(
                ID_KEY.to_string(),
                StringIdentifier::from_id(424242).to_string(),
            )]),
        ),
    );

    let loaded = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert_eq!(loaded.id(), Some(424242));
    assert!(loaded.properties().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_restored_objects_are_imported_again(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let ident = TestLake::leaf("restored");
    let created = with_principal(
        OWNER,
        lake.context
            .tables
            .create(&ident, None, json!({}), HashMap::new()),
    )
    .await
    .unwrap();
    let backup = lake.state.get_external(EntityType::Table, &ident).unwrap();
    assert!(with_principal(OWNER, lake.context.tables.drop(&ident))
        .await
        .unwrap());

    // Restored from a backup that still carries the key of the deleted record
    lake.state.insert_external(EntityType::Table, &ident, backup);
    let loaded = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert!(loaded.is_managed());
    assert_ne!(loaded.id(), created.id());

    let restored = lake.state.get_external(EntityType::Table, &ident).unwrap();
    assert_eq!(
        StringIdentifier::parse(&restored.properties[ID_KEY])
            .ok()
            .map(|id| id.id()),
        loaded.id()
    );
    let again = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert_eq!(again.id(), loaded.id());
}

#[rstest]
#[tokio::test]
async fn test_missing_objects(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    with_principal(OWNER, async {
        let err = lake
            .context
            .tables
            .load(&TestLake::leaf("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // Leaves need their schema
        let err = lake
            .context
            .tables
            .create(
                &NameIdentifier::of_leaf(METALAKE, CATALOG, "other", "t"),
                None,
                json!({}),
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // Names at the wrong depth
        let err = lake
            .context
            .tables
            .list(&Namespace::of(&[METALAKE, CATALOG]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    })
    .await;
}

#[rstest]
#[tokio::test]
async fn test_alter_updates_both_sides(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let ident = TestLake::leaf("events");
    with_principal(OWNER, async {
        lake.context
            .filesets
            .create(
                &ident,
                None,
                json!({}),
                HashMap::from([(FILESET_LOCATION_KEY.to_string(), "s3://bucket/events".to_string())]),
            )
            .await
            .unwrap();

        let altered = lake
            .context
            .filesets
            .alter(
                &ident,
                &[
                    ObjectChange::UpdateComment("raw events".to_string()),
                    ObjectChange::SetProperty {
                        key: "owner".to_string(),
                        value: "ingest".to_string(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(altered.comment(), Some("raw events"));
        assert_eq!(altered.properties()["owner"], "ingest");
        let entity = altered.entity().unwrap();
        assert_eq!(entity.comment.as_deref(), Some("raw events"));
        assert_eq!(entity.audit.last_modifier.as_deref(), Some(OWNER));

        // Clearing the comment reaches the store too
        let cleared = lake
            .context
            .filesets
            .alter(&ident, &[ObjectChange::UpdateComment(String::new())])
            .await
            .unwrap();
        assert_eq!(
            cleared.entity().unwrap().comment.as_deref(),
            cleared.comment()
        );

        for forbidden in [
            ObjectChange::SetProperty {
                key: FILESET_LOCATION_KEY.to_string(),
                value: "s3://elsewhere".to_string(),
            },
            ObjectChange::RemoveProperty(ID_KEY.to_string()),
        ] {
            let err = lake
                .context
                .filesets
                .alter(&ident, &[forbidden])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        // Filesets need a location
        let err = lake
            .context
            .filesets
            .create(&TestLake::leaf("nowhere"), None, json!({}), HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    })
    .await;
}

#[rstest]
#[tokio::test]
async fn test_drop_reports_the_authoritative_side(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let topic = TestLake::leaf("clicks");
    let table = TestLake::leaf("clicks_archive");
    with_principal(OWNER, async {
        lake.context
            .topics
            .create(&topic, None, json!({"partitions": 3}), HashMap::new())
            .await
            .unwrap();
    })
    .await;
    // Gone from the external system, still recorded
    assert!(lake.state.remove_external(EntityType::Topic, &topic));
    // Present in the external system, never recorded
    lake.state
        .insert_external(EntityType::Table, &table, external("clicks_archive", HashMap::new()));

    with_principal(OWNER, async {
        // Topics are managed storage, so the store record decides
        assert!(lake.context.topics.drop(&topic).await.unwrap());
        assert!(!lake.context.topics.drop(&topic).await.unwrap());

        // Tables aren't, so the external system decides
        assert!(lake.context.tables.drop(&table).await.unwrap());
        assert!(!lake.context.tables.drop(&table).await.unwrap());
    })
    .await;
    assert!(!lake
        .context
        .store
        .exists(&topic, EntityType::Topic)
        .await
        .unwrap());
}

#[rstest]
#[tokio::test]
async fn test_dropping_a_schema_takes_its_contents(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let table = TestLake::leaf("orders");
    with_principal(OWNER, async {
        lake.context
            .tables
            .create(&table, None, json!({}), HashMap::new())
            .await
            .unwrap();
        assert!(lake.context.schemas.drop(&TestLake::schema()).await.unwrap());
        assert!(lake.context.tables.load(&table).await.unwrap_err().is_not_found());
    })
    .await;
    assert!(!lake
        .context
        .store
        .exists(&table, EntityType::Table)
        .await
        .unwrap());
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_and_loads(#[future] test_lake: TestLake) {
    let lake = Arc::new(test_lake.await);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let lake = lake.clone();
            tokio::spawn(with_principal(OWNER, async move {
                let ident = TestLake::leaf(&format!("t{i}"));
                let created = lake
                    .context
                    .tables
                    .create(&ident, None, json!({}), HashMap::new())
                    .await
                    .unwrap();
                // Loads of a sibling may race with its creation
                let sibling = TestLake::leaf(&format!("t{}", (i + 1) % 8));
                match lake.context.tables.load(&sibling).await {
                    Ok(object) => assert!(object.is_managed()),
                    Err(e) => assert!(e.is_not_found(), "{e}"),
                }
                created.id()
            }))
        })
        .collect();

    let mut ids = vec![];
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);

    let listed = with_principal(
        OWNER,
        lake.context
            .tables
            .list(&Namespace::of(&[METALAKE, CATALOG, SCHEMA])),
    )
    .await
    .unwrap();
    assert_eq!(listed.len(), 8);
    assert_eq!(lake.context.tree_lock.node_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_impersonated_calls_carry_the_caller(#[future] impersonating_lake: TestLake) {
    let lake = impersonating_lake.await;
    with_principal(OWNER, async {
        lake.context
            .tables
            .create(&TestLake::leaf("orders"), None, json!({}), HashMap::new())
            .await
            .unwrap();
    })
    .await;

    let calls = lake.state.calls();
    assert!(!calls.is_empty());
    assert!(calls
        .iter()
        .all(|(_, principal)| principal == "alice@EXAMPLE.COM"));
}

#[rstest]
#[tokio::test]
async fn test_catalog_and_metalake_teardown(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    with_principal(OWNER, async {
        let err = lake.context.metalakes.drop_metalake(METALAKE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert!(lake.context.catalogs.drop_catalog(METALAKE, CATALOG).await.unwrap());
        assert!(!lake.context.catalogs.drop_catalog(METALAKE, CATALOG).await.unwrap());
        assert!(lake
            .context
            .schemas
            .load(&TestLake::schema())
            .await
            .unwrap_err()
            .is_not_found());

        assert!(lake.context.metalakes.drop_metalake(METALAKE).await.unwrap());
    })
    .await;

    // Tombstones are kept for the retention period
    let counts = lake.context.reclaimer.run_once().await.unwrap();
    assert_eq!(counts.values().sum::<u64>(), 0);
}
