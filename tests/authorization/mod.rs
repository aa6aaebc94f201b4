use std::collections::HashMap;

use rstest::rstest;
use serde_json::json;

use lakeward::authorization::privilege::{MetadataObject, Privilege, PrivilegeName};
use lakeward::error::ErrorKind;
use lakeward::identifier::{Namespace, StringIdentifier, ID_KEY};
use lakeward::meta::EntityType;
use lakeward::principal::with_principal;

use crate::{securable, test_lake, TestLake, CATALOG, METALAKE, OWNER, SCHEMA};

fn table(name: &str) -> MetadataObject {
    MetadataObject::table(METALAKE, CATALOG, SCHEMA, name)
}

async fn create_table(lake: &TestLake, name: &str) {
    with_principal(OWNER, async {
        lake.context
            .tables
            .create(&TestLake::leaf(name), None, json!({}), HashMap::new())
            .await
            .unwrap();
    })
    .await
}

#[rstest]
#[tokio::test]
async fn test_default_closed(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    create_table(&lake, "orders").await;

    // Not even a user of the metalake
    let err = with_principal("mallory", lake.context.tables.load(&TestLake::leaf("orders")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    // A user without any role
    with_principal(OWNER, lake.context.access_control.add_user(METALAKE, "mallory"))
        .await
        .unwrap();
    let err = with_principal("mallory", lake.context.tables.load(&TestLake::leaf("orders")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(!with_principal(
        "mallory",
        lake.context
            .guard
            .can(&table("orders"), PrivilegeName::ReadTable)
    )
    .await
    .unwrap());
}

#[rstest]
#[tokio::test]
async fn test_catalog_grant_covers_descendants(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    create_table(&lake, "orders").await;
    lake.grant(
        "catalog_reader",
        "dave",
        vec![securable(
            MetadataObject::catalog(METALAKE, CATALOG),
            vec![Privilege::allow(PrivilegeName::ReadTable)],
        )],
    )
    .await;

    with_principal("dave", async {
        let orders = lake
            .context
            .tables
            .load(&TestLake::leaf("orders"))
            .await
            .unwrap();
        assert_eq!(orders.name(), "orders");

        // Reading doesn't extend to writing
        let err = lake
            .context
            .tables
            .drop(&TestLake::leaf("orders"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    })
    .await;
}

#[rstest]
#[tokio::test]
async fn test_deny_from_a_group_overrides_a_user_allow(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    create_table(&lake, "orders").await;
    create_table(&lake, "secrets").await;

    // bob reads the whole catalog
    lake.grant(
        "catalog_reader",
        "bob",
        vec![securable(
            MetadataObject::catalog(METALAKE, CATALOG),
            vec![Privilege::allow(PrivilegeName::ReadTable)],
        )],
    )
    .await;
    // but bob's analysts group may not read one table
    with_principal(OWNER, async {
        let acm = &lake.context.access_control;
        acm.add_group(METALAKE, "analysts").await.unwrap();
        acm.create_role(
            METALAKE,
            "no_secrets",
            HashMap::new(),
            vec![securable(
                table("secrets"),
                vec![Privilege::deny(PrivilegeName::ReadTable)],
            )],
        )
        .await
        .unwrap();
        acm.grant_roles_to_group(METALAKE, &["no_secrets".to_string()], "analysts")
            .await
            .unwrap();
    })
    .await;

    with_principal("bob", async {
        lake.context
            .tables
            .load(&TestLake::leaf("orders"))
            .await
            .unwrap();
        let err = lake
            .context
            .tables
            .load(&TestLake::leaf("secrets"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let visible = lake
            .context
            .tables
            .list(&Namespace::of(&[METALAKE, CATALOG, SCHEMA]))
            .await
            .unwrap();
        assert_eq!(visible, vec![TestLake::leaf("orders")]);
    })
    .await;
}

#[rstest]
#[tokio::test]
async fn test_deny_outlives_a_reimport(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let ident = TestLake::leaf("ledger");
    create_table(&lake, "ledger").await;
    lake.grant(
        "no_ledger",
        "erin",
        vec![
            securable(
                MetadataObject::schema(METALAKE, CATALOG, SCHEMA),
                vec![Privilege::allow(PrivilegeName::ReadTable)],
            ),
            securable(
                table("ledger"),
                vec![Privilege::deny(PrivilegeName::ReadTable)],
            ),
        ],
    )
    .await;
    let before = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();

    // Recreated outside lakeward under a key of its own
    let mut recreated = lake.state.get_external(EntityType::Table, &ident).unwrap();
    recreated.properties.insert(
        ID_KEY.to_string(),
        StringIdentifier::from_id(31337).to_string(),
    );
    lake.state
        .insert_external(EntityType::Table, &ident, recreated);

    let after = with_principal(OWNER, lake.context.tables.load(&ident))
        .await
        .unwrap();
    assert!(after.is_managed());
    assert_eq!(after.id(), before.id());

    let err = with_principal("erin", lake.context.tables.load(&ident))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[rstest]
#[tokio::test]
async fn test_dropping_a_role_revokes_what_it_granted(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    lake.grant(
        "r1",
        "carol",
        vec![securable(
            MetadataObject::schema(METALAKE, CATALOG, SCHEMA),
            vec![Privilege::allow(PrivilegeName::CreateTable)],
        )],
    )
    .await;

    let created = with_principal(
        "carol",
        lake.context
            .tables
            .create(&TestLake::leaf("t1"), None, json!({}), HashMap::new()),
    )
    .await
    .unwrap();
    assert_eq!(created.audit().unwrap().creator, "carol");

    // Creating doesn't imply reading
    let err = with_principal("carol", lake.context.tables.load(&TestLake::leaf("t1")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    assert!(with_principal(OWNER, lake.context.access_control.drop_role(METALAKE, "r1"))
        .await
        .unwrap());
    let err = with_principal(
        "carol",
        lake.context
            .tables
            .create(&TestLake::leaf("t2"), None, json!({}), HashMap::new()),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    // The creator keeps managing what they created
    assert!(
        with_principal("carol", lake.context.tables.drop(&TestLake::leaf("t1")))
            .await
            .unwrap()
    );
}

#[rstest]
#[tokio::test]
async fn test_listings_are_filtered(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    for name in ["orders", "customers", "payments"] {
        create_table(&lake, name).await;
    }
    with_principal(OWNER, async {
        lake.context
            .catalogs
            .create_catalog(METALAKE, "kafka", "memory", None, HashMap::new())
            .await
            .unwrap();
    })
    .await;

    lake.grant(
        "narrow",
        "dave",
        vec![
            securable(
                MetadataObject::catalog(METALAKE, CATALOG),
                vec![Privilege::allow(PrivilegeName::UseCatalog)],
            ),
            securable(
                table("orders"),
                vec![Privilege::allow(PrivilegeName::ReadTable)],
            ),
            securable(
                table("payments"),
                vec![Privilege::allow(PrivilegeName::ReadTable)],
            ),
        ],
    )
    .await;

    with_principal("dave", async {
        let catalogs: Vec<String> = lake
            .context
            .catalogs
            .list_catalogs(METALAKE)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(catalogs, vec![CATALOG.to_string()]);

        let mut tables = lake
            .context
            .tables
            .list(&Namespace::of(&[METALAKE, CATALOG, SCHEMA]))
            .await
            .unwrap();
        tables.sort();
        assert_eq!(
            tables,
            vec![TestLake::leaf("orders"), TestLake::leaf("payments")]
        );
    })
    .await;

    // The owner sees everything
    let tables = with_principal(
        OWNER,
        lake.context
            .tables
            .list(&Namespace::of(&[METALAKE, CATALOG, SCHEMA])),
    )
    .await
    .unwrap();
    assert_eq!(tables.len(), 3);
}

#[rstest]
#[tokio::test]
async fn test_metalake_admins_and_membership(#[future] test_lake: TestLake) {
    let lake = test_lake.await;
    let acm = &lake.context.access_control;

    // Only service admins manage metalake admins
    let err = with_principal(OWNER, acm.add_metalake_admin("eve"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(acm.is_metalake_admin(OWNER).await.unwrap());
    assert!(!acm.is_metalake_admin("eve").await.unwrap());

    assert!(!acm.is_user_in_metalake("eve", METALAKE).await.unwrap());
    with_principal(OWNER, acm.add_user(METALAKE, "eve")).await.unwrap();
    assert!(acm.is_user_in_metalake("eve", METALAKE).await.unwrap());
    let metalake = with_principal("eve", lake.context.metalakes.load_metalake(METALAKE))
        .await
        .unwrap();
    assert_eq!(metalake.audit.creator, OWNER);

    let roles: Vec<String> = acm
        .roles_of_user(METALAKE, OWNER)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(roles, vec!["owner".to_string()]);
}
