use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use moka::future::{Cache, CacheBuilder};
use tracing::{debug, info, warn};

use crate::authorization::privilege::{MetadataObject, PrivilegeName};
use crate::authorization::AccessGuard;
use crate::catalog::impersonation::RunAs;
use crate::catalog::memory::{memory_connector, MemoryState, MEMORY_PROVIDER};
use crate::catalog::{CatalogConnector, IMPERSONATION_ENABLE};
use crate::data_types::CatalogId;
use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace, ID_KEY};
use crate::lock::{LockType, TreeLock};
use crate::meta::{AuditInfo, CatalogEntity, EntityType, SYSTEM_METALAKE};
use crate::principal::current_principal;
use crate::store::{EntityStore, IdGenerator};

const CONNECTOR_CACHE_CAPACITY: u64 = 1024;

/// Builds a connector for a catalog from its stored definition.
pub type ConnectorFactory =
    Arc<dyn Fn(&CatalogEntity) -> Result<CatalogConnector> + Send + Sync>;

/// Keeps every memory catalog's objects for the lifetime of the process, so that a
/// rebuilt connector sees what the previous one created.
fn memory_factory() -> ConnectorFactory {
    let states: Arc<DashMap<CatalogId, Arc<MemoryState>>> = Arc::new(DashMap::new());
    Arc::new(move |catalog: &CatalogEntity| {
        let state = states
            .entry(catalog.id)
            .or_insert_with(MemoryState::new)
            .clone();
        memory_connector(catalog, state)
    })
}

/// Catalog lifecycle plus the connectors serving each catalog's objects.
pub struct CatalogManager {
    store: Arc<dyn EntityStore>,
    id_generator: Arc<dyn IdGenerator>,
    tree_lock: Arc<TreeLock>,
    guard: AccessGuard,
    run_as: Arc<dyn RunAs>,
    providers: DashMap<String, ConnectorFactory>,
    connectors: Cache<NameIdentifier, Arc<CatalogConnector>>,
}

impl CatalogManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        id_generator: Arc<dyn IdGenerator>,
        tree_lock: Arc<TreeLock>,
        guard: AccessGuard,
        run_as: Arc<dyn RunAs>,
    ) -> Self {
        let providers = DashMap::new();
        providers.insert(MEMORY_PROVIDER.to_string(), memory_factory());
        Self {
            store,
            id_generator,
            tree_lock,
            guard,
            run_as,
            providers,
            connectors: CacheBuilder::new(CONNECTOR_CACHE_CAPACITY).build(),
        }
    }

    pub fn register_provider(&self, provider: &str, factory: ConnectorFactory) {
        self.providers.insert(provider.to_string(), factory);
    }

    fn build_connector(&self, catalog: &CatalogEntity) -> Result<CatalogConnector> {
        let factory = self
            .providers
            .get(&catalog.provider)
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "Unknown catalog provider {:?}",
                    catalog.provider
                ))
            })?;
        let connector = factory(catalog)?;

        let impersonate = catalog
            .properties
            .get(IMPERSONATION_ENABLE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        Ok(if impersonate {
            connector.with_impersonation(self.run_as.clone())
        } else {
            connector
        })
    }

    /// The connector serving `catalog`, built on first use after a start or a drop.
    pub async fn connector(&self, catalog: &NameIdentifier) -> Result<Arc<CatalogConnector>> {
        Ok(self
            .connectors
            .try_get_with(catalog.clone(), async {
                let entity = self
                    .store
                    .get(catalog, EntityType::Catalog)
                    .await?
                    .into_catalog()
                    .ok_or_else(|| Error::internal(format!("{catalog} is not a catalog")))?;
                debug!(%catalog, provider = %entity.provider, "Building catalog connector");
                self.build_connector(&entity).map(Arc::new)
            })
            .await?)
    }

    /// Forgets every built connector. Used when metalake names change.
    pub fn invalidate_connectors(&self) {
        self.connectors.invalidate_all();
    }

    pub async fn create_catalog(
        &self,
        metalake: &str,
        name: &str,
        provider: &str,
        comment: Option<&str>,
        properties: HashMap<String, String>,
    ) -> Result<CatalogEntity> {
        if metalake == SYSTEM_METALAKE {
            return Err(Error::invalid_argument(
                "Catalogs cannot be created in the system metalake",
            ));
        }
        if properties.contains_key(ID_KEY) {
            return Err(Error::invalid_argument(format!(
                "Property {ID_KEY:?} is reserved and cannot be set"
            )));
        }
        self.guard
            .check(&MetadataObject::metalake(metalake), PrivilegeName::CreateCatalog)
            .await?;

        let catalog = CatalogEntity {
            id: self.id_generator.next_id(),
            metalake: metalake.to_string(),
            name: name.to_string(),
            provider: provider.to_string(),
            comment: comment.map(str::to_string),
            properties,
            audit: AuditInfo::created_by(&current_principal()),
        };
        let connector = Arc::new(self.build_connector(&catalog)?);

        let ident = NameIdentifier::of_metalake(metalake);
        self.tree_lock
            .with_lock(&ident, LockType::Write, || async {
                self.store.put(catalog.clone().into(), false).await
            })
            .await?;
        self.connectors
            .insert(NameIdentifier::of_catalog(metalake, name), connector)
            .await;
        info!(metalake, catalog = name, provider, "Created catalog");
        Ok(catalog)
    }

    pub async fn load_catalog(&self, metalake: &str, name: &str) -> Result<CatalogEntity> {
        self.guard
            .check(&MetadataObject::catalog(metalake, name), PrivilegeName::UseCatalog)
            .await?;
        let ident = NameIdentifier::of_catalog(metalake, name);
        self.tree_lock
            .with_lock(&ident, LockType::Read, || async {
                self.store
                    .get(&ident, EntityType::Catalog)
                    .await?
                    .into_catalog()
                    .ok_or_else(|| Error::internal(format!("{ident} is not a catalog")))
            })
            .await
    }

    /// Catalogs of the metalake that the principal may use.
    pub async fn list_catalogs(&self, metalake: &str) -> Result<Vec<CatalogEntity>> {
        let ident = NameIdentifier::of_metalake(metalake);
        let catalogs = self
            .tree_lock
            .with_lock(&ident, LockType::Read, || async {
                self.store
                    .list(&Namespace::of(&[metalake]), EntityType::Catalog)
                    .await
            })
            .await?;

        let mut visible = Vec::with_capacity(catalogs.len());
        for catalog in catalogs.into_iter().filter_map(|e| e.into_catalog()) {
            let object = MetadataObject::catalog(metalake, &catalog.name);
            if self.guard.can(&object, PrivilegeName::UseCatalog).await? {
                visible.push(catalog);
            }
        }
        Ok(visible)
    }

    /// Drops the catalog record and everything recorded beneath it. Objects in the
    /// external system are left alone.
    pub async fn drop_catalog(&self, metalake: &str, name: &str) -> Result<bool> {
        self.guard
            .check(&MetadataObject::catalog(metalake, name), PrivilegeName::DropCatalog)
            .await?;
        let catalog = NameIdentifier::of_catalog(metalake, name);
        let dropped = self
            .tree_lock
            .with_lock(&NameIdentifier::of_metalake(metalake), LockType::Write, || async {
                match self.store.delete(&catalog, EntityType::Catalog).await {
                    Err(e) if e.is_not_found() => {
                        warn!(%catalog, "No catalog to drop");
                        Ok(false)
                    }
                    other => other,
                }
            })
            .await?;
        self.connectors.invalidate(&catalog).await;
        info!(%catalog, dropped, "Dropped catalog");
        Ok(dropped)
    }
}
