// Single main.rs for all integration tests
// https://endler.dev/2020/rust-compile-times/#combine-all-integration-tests-in-a-single-binary

use std::collections::HashMap;
use std::sync::Arc;

use rstest::fixture;
use serde_json::json;
use sqlx::sqlite::SqliteJournalMode;

use lakeward::authorization::privilege::{
    MetadataObject, Privilege, PrivilegeName, SecurableObject,
};
use lakeward::catalog::impersonation::{PrincipalRunAs, RunAs};
use lakeward::catalog::memory::{memory_connector, MemoryState};
use lakeward::config::context::build_context;
use lakeward::config::schema::load_config_from_string;
use lakeward::context::GovernanceContext;
use lakeward::identifier::NameIdentifier;
use lakeward::meta::CatalogEntity;
use lakeward::principal::with_principal;
use lakeward::repository::sqlite::SqliteRepository;
use lakeward::store::RandomIdGenerator;

mod authorization;
mod objects;

const TEST_CONFIG: &str = r#"
[store]
type = "sqlite"
dsn = "sqlite::memory:"

[authorization]
enabled = true
service_admins = ["admin"]
group_mapping = "static"

[authorization.static_groups]
bob = ["analysts"]

[reclamation]
interval_secs = 0
"#;

pub const SERVICE_ADMIN: &str = "admin";
pub const OWNER: &str = "alice";
pub const METALAKE: &str = "lake";
pub const CATALOG: &str = "hive";
pub const SCHEMA: &str = "db";
// Memory connector whose state the tests can reach, to stand in for changes made
// directly in the external system
pub const SEEDED_PROVIDER: &str = "seeded";

pub struct TestLake {
    pub context: Arc<GovernanceContext>,
    pub state: Arc<MemoryState>,
}

impl TestLake {
    pub fn schema() -> NameIdentifier {
        NameIdentifier::of_schema(METALAKE, CATALOG, SCHEMA)
    }

    pub fn leaf(name: &str) -> NameIdentifier {
        NameIdentifier::of_leaf(METALAKE, CATALOG, SCHEMA, name)
    }

    /// Adds `user` to the metalake and grants them a new role carrying `grants`.
    pub async fn grant(&self, role: &str, user: &str, grants: Vec<SecurableObject>) {
        let acm = &self.context.access_control;
        with_principal(OWNER, async {
            if let Err(e) = acm.add_user(METALAKE, user).await {
                assert!(e.is_already_exists(), "{e}");
            }
            acm.create_role(METALAKE, role, HashMap::new(), grants)
                .await
                .unwrap();
            acm.grant_roles_to_user(METALAKE, &[role.to_string()], user)
                .await
                .unwrap();
        })
        .await
    }
}

pub fn securable(object: MetadataObject, privileges: Vec<Privilege>) -> SecurableObject {
    SecurableObject::new(object, privileges).unwrap()
}

/// A metalake owned by `OWNER`, who may create and read anything in it, with one
/// catalog holding one schema.
async fn bootstrap(context: GovernanceContext, catalog_properties: HashMap<String, String>) -> TestLake {
    let context = Arc::new(context);
    let state = MemoryState::new();
    let seeded = state.clone();
    context.catalogs.register_provider(
        SEEDED_PROVIDER,
        Arc::new(move |catalog: &CatalogEntity| memory_connector(catalog, seeded.clone())),
    );

    with_principal(
        SERVICE_ADMIN,
        context.access_control.add_metalake_admin(OWNER),
    )
    .await
    .unwrap();

    with_principal(OWNER, async {
        context
            .metalakes
            .create_metalake(METALAKE, Some("test lake"), HashMap::new())
            .await
            .unwrap();
    })
    .await;

    use PrivilegeName::*;
    let lake = TestLake { context, state };
    lake.grant(
        "owner",
        OWNER,
        vec![securable(
            MetadataObject::metalake(METALAKE),
            [
                CreateCatalog,
                UseCatalog,
                DropCatalog,
                CreateSchema,
                UseSchema,
                CreateTable,
                ReadTable,
                DropTable,
                CreateTopic,
                ReadTopic,
                DropTopic,
                CreateFileset,
                ReadFileset,
            ]
            .into_iter()
            .map(Privilege::allow)
            .collect(),
        )],
    )
    .await;

    with_principal(OWNER, async {
        lake.context
            .catalogs
            .create_catalog(METALAKE, CATALOG, SEEDED_PROVIDER, None, catalog_properties)
            .await
            .unwrap();
        lake.context
            .schemas
            .create(&TestLake::schema(), Some("main schema"), json!({}), HashMap::new())
            .await
            .unwrap();
    })
    .await;
    lake
}

#[fixture]
pub async fn test_lake() -> TestLake {
    let config = load_config_from_string(TEST_CONFIG, false).unwrap();
    let context = build_context(config).await.unwrap();
    bootstrap(context, HashMap::new()).await
}

/// Like `test_lake`, but the catalog runs connector calls as the caller, qualified
/// with a realm.
#[fixture]
pub async fn impersonating_lake() -> TestLake {
    let config = load_config_from_string(TEST_CONFIG, false).unwrap();
    let repository =
        SqliteRepository::try_new("sqlite::memory:".to_string(), SqliteJournalMode::Wal)
            .await
            .unwrap();
    let run_as: Arc<dyn RunAs> = Arc::new(PrincipalRunAs::with_realm("EXAMPLE.COM"));
    let context = GovernanceContext::new(
        config,
        Arc::new(repository),
        Arc::new(RandomIdGenerator),
        run_as,
    )
    .unwrap();
    bootstrap(
        context,
        HashMap::from([(
            lakeward::catalog::IMPERSONATION_ENABLE.to_string(),
            "true".to_string(),
        )]),
    )
    .await
}
