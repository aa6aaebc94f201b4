use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::authorization::privilege::MetadataObject;
use crate::authorization::AccessGuard;
use crate::catalog::CatalogManager;
use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace, ID_KEY};
use crate::lock::{LockType, TreeLock};
use crate::meta::{AuditInfo, Entity, EntityType, MetalakeEntity, SYSTEM_METALAKE};
use crate::principal::current_principal;
use crate::store::{EntityStore, IdGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetalakeChange {
    Rename(String),
    UpdateComment(String),
    SetProperty { key: String, value: String },
    RemoveProperty(String),
}

fn check_name(name: &str) -> Result<()> {
    if name == SYSTEM_METALAKE {
        return Err(Error::invalid_argument(format!(
            "Metalake name {SYSTEM_METALAKE:?} is reserved"
        )));
    }
    if name.is_empty() || name.contains('.') {
        return Err(Error::invalid_argument(format!(
            "Invalid metalake name {name:?}"
        )));
    }
    Ok(())
}

fn apply_changes(mut metalake: MetalakeEntity, changes: &[MetalakeChange]) -> Result<MetalakeEntity> {
    for change in changes {
        match change {
            MetalakeChange::Rename(name) => {
                check_name(name)?;
                metalake.name = name.clone();
            }
            MetalakeChange::UpdateComment(comment) => metalake.comment = Some(comment.clone()),
            MetalakeChange::SetProperty { key, value } => {
                if key == ID_KEY {
                    return Err(Error::invalid_argument(format!(
                        "Property {ID_KEY:?} is reserved"
                    )));
                }
                metalake.properties.insert(key.clone(), value.clone());
            }
            MetalakeChange::RemoveProperty(key) => {
                metalake.properties.remove(key);
            }
        }
    }
    Ok(metalake)
}

/// Lifecycle of metalakes. Structural changes hold the root tree lock, so they
/// exclude every other tree-locked operation.
pub struct MetalakeManager {
    store: Arc<dyn EntityStore>,
    id_generator: Arc<dyn IdGenerator>,
    tree_lock: Arc<TreeLock>,
    guard: AccessGuard,
    catalogs: Arc<CatalogManager>,
}

impl MetalakeManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        id_generator: Arc<dyn IdGenerator>,
        tree_lock: Arc<TreeLock>,
        guard: AccessGuard,
        catalogs: Arc<CatalogManager>,
    ) -> Self {
        Self {
            store,
            id_generator,
            tree_lock,
            guard,
            catalogs,
        }
    }

    pub async fn create_metalake(
        &self,
        name: &str,
        comment: Option<&str>,
        properties: HashMap<String, String>,
    ) -> Result<MetalakeEntity> {
        check_name(name)?;
        if properties.contains_key(ID_KEY) {
            return Err(Error::invalid_argument(format!(
                "Property {ID_KEY:?} is reserved"
            )));
        }
        self.guard.require_metalake_admin().await?;

        let metalake = MetalakeEntity {
            id: self.id_generator.next_id(),
            name: name.to_string(),
            comment: comment.map(str::to_string),
            properties,
            audit: AuditInfo::created_by(&current_principal()),
        };
        self.tree_lock
            .with_root_lock(LockType::Write, || async {
                self.store.put(metalake.clone().into(), false).await
            })
            .await?;
        info!(metalake = name, "Created metalake");
        Ok(metalake)
    }

    pub async fn load_metalake(&self, name: &str) -> Result<MetalakeEntity> {
        if name == SYSTEM_METALAKE {
            return Err(Error::not_found(EntityType::Metalake, name));
        }
        self.guard
            .require_creator_or_user(&MetadataObject::metalake(name))
            .await?;
        let ident = NameIdentifier::of_metalake(name);
        self.tree_lock
            .with_lock(&ident, LockType::Read, || async {
                self.store
                    .get(&ident, EntityType::Metalake)
                    .await?
                    .into_metalake()
                    .ok_or_else(|| Error::internal(format!("{ident} is not a metalake")))
            })
            .await
    }

    pub async fn list_metalakes(&self) -> Result<Vec<MetalakeEntity>> {
        self.guard.require_metalake_admin().await?;
        let metalakes = self
            .tree_lock
            .with_root_lock(LockType::Read, || async {
                self.store
                    .list(&Namespace::empty(), EntityType::Metalake)
                    .await
            })
            .await?;
        Ok(metalakes
            .into_iter()
            .filter_map(Entity::into_metalake)
            .filter(|m| m.name != SYSTEM_METALAKE)
            .collect())
    }

    /// Applies `changes` in order. A rename to a taken name is `AlreadyExists`.
    pub async fn alter_metalake(
        &self,
        name: &str,
        changes: Vec<MetalakeChange>,
    ) -> Result<MetalakeEntity> {
        if name == SYSTEM_METALAKE {
            return Err(Error::not_found(EntityType::Metalake, name));
        }
        self.guard
            .require_creator(&MetadataObject::metalake(name))
            .await?;

        let ident = NameIdentifier::of_metalake(name);
        let renames = changes
            .iter()
            .any(|c| matches!(c, MetalakeChange::Rename(_)));
        let principal = current_principal();
        let altered = self
            .tree_lock
            .with_root_lock(LockType::Write, || async {
                self.store
                    .update(
                        &ident,
                        EntityType::Metalake,
                        Box::new(move |entity: Entity| {
                            let metalake = entity.into_metalake().ok_or_else(|| {
                                Error::internal("store returned a different kind of entity")
                            })?;
                            let mut metalake = apply_changes(metalake, &changes)?;
                            metalake.audit = metalake.audit.modified_by(&principal);
                            Ok(metalake.into())
                        }),
                    )
                    .await
            })
            .await?
            .into_metalake()
            .ok_or_else(|| Error::internal(format!("{ident} is not a metalake")))?;

        if renames {
            // Connectors are cached by catalog name, which includes the metalake.
            self.catalogs.invalidate_connectors();
            info!(from = name, to = %altered.name, "Renamed metalake");
        }
        Ok(altered)
    }

    /// Drops an empty metalake. Missing metalakes are reported as `false`.
    pub async fn drop_metalake(&self, name: &str) -> Result<bool> {
        if name == SYSTEM_METALAKE {
            return Err(Error::invalid_argument("The system metalake cannot be dropped"));
        }
        self.guard
            .require_creator(&MetadataObject::metalake(name))
            .await?;

        let ident = NameIdentifier::of_metalake(name);
        let dropped = self
            .tree_lock
            .with_root_lock(LockType::Write, || async {
                let catalogs = match self
                    .store
                    .list(&Namespace::of(&[name]), EntityType::Catalog)
                    .await
                {
                    Ok(catalogs) => catalogs,
                    Err(e) if e.is_not_found() => return Ok(false),
                    Err(e) => return Err(e),
                };
                if !catalogs.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "Metalake {name:?} still has {} catalog(s)",
                        catalogs.len()
                    )));
                }
                match self.store.delete(&ident, EntityType::Metalake).await {
                    Err(e) if e.is_not_found() => Ok(false),
                    other => other,
                }
            })
            .await?;
        if dropped {
            self.catalogs.invalidate_connectors();
            info!(metalake = name, "Dropped metalake");
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use sqlx::sqlite::SqliteJournalMode;

    use super::*;
    use crate::authorization::group_mapping::NoneGroupMapping;
    use crate::authorization::{AccessControlManager, PassThroughAuthorizer, RoleBasedAuthorizer};
    use crate::catalog::impersonation::PrincipalRunAs;
    use crate::catalog::memory::MEMORY_PROVIDER;
    use crate::error::ErrorKind;
    use crate::principal::with_principal;
    use crate::repository::sqlite::SqliteRepository;
    use crate::store::{RandomIdGenerator, RelationalEntityStore};

    struct Fixture {
        metalakes: MetalakeManager,
        catalogs: Arc<CatalogManager>,
        access_control: Arc<AccessControlManager>,
    }

    async fn fixture(enforce: bool) -> Fixture {
        let repository =
            SqliteRepository::try_new("sqlite::memory:".to_string(), SqliteJournalMode::Wal)
                .await
                .unwrap();
        let store: Arc<dyn EntityStore> =
            Arc::new(RelationalEntityStore::new(Arc::new(repository)));
        let id_generator: Arc<dyn IdGenerator> = Arc::new(RandomIdGenerator);
        let tree_lock = Arc::new(TreeLock::new());
        let access_control = Arc::new(AccessControlManager::new(
            store.clone(),
            id_generator.clone(),
            Arc::new(NoneGroupMapping),
            HashSet::from(["root".to_string()]),
            enforce,
        ));
        let guard = if enforce {
            AccessGuard::new(Arc::new(RoleBasedAuthorizer::new(
                access_control.clone(),
                store.clone(),
            )))
        } else {
            AccessGuard::new(Arc::new(PassThroughAuthorizer))
        };
        let catalogs = Arc::new(CatalogManager::new(
            store.clone(),
            id_generator.clone(),
            tree_lock.clone(),
            guard.clone(),
            Arc::new(PrincipalRunAs::default()),
        ));
        Fixture {
            metalakes: MetalakeManager::new(store, id_generator, tree_lock, guard, catalogs.clone()),
            catalogs,
            access_control,
        }
    }

    #[tokio::test]
    async fn test_metalake_lifecycle() {
        let f = fixture(false).await;
        f.metalakes
            .create_metalake("m", Some("lake"), HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            f.metalakes
                .create_metalake("m", None, HashMap::new())
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::AlreadyExists
        );
        f.metalakes
            .create_metalake("other", None, HashMap::new())
            .await
            .unwrap();

        let altered = f
            .metalakes
            .alter_metalake(
                "m",
                vec![
                    MetalakeChange::SetProperty {
                        key: "owner".to_string(),
                        value: "data".to_string(),
                    },
                    MetalakeChange::UpdateComment("renamed lake".to_string()),
                    MetalakeChange::Rename("m2".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(altered.name, "m2");
        assert_eq!(altered.properties["owner"], "data");
        assert!(altered.audit.last_modifier.is_some());
        assert!(f.metalakes.load_metalake("m").await.unwrap_err().is_not_found());

        let err = f
            .metalakes
            .alter_metalake("m2", vec![MetalakeChange::Rename("other".to_string())])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let mut names: Vec<String> = f
            .metalakes
            .list_metalakes()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["m2".to_string(), "other".to_string()]);

        f.catalogs
            .create_catalog("m2", "c1", MEMORY_PROVIDER, None, HashMap::new())
            .await
            .unwrap();
        let err = f.metalakes.drop_metalake("m2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert!(f.catalogs.drop_catalog("m2", "c1").await.unwrap());
        assert!(f.metalakes.drop_metalake("m2").await.unwrap());
        assert!(!f.metalakes.drop_metalake("m2").await.unwrap());
    }

    #[tokio::test]
    async fn test_system_metalake_is_reserved() {
        let f = fixture(false).await;
        for err in [
            f.metalakes
                .create_metalake(SYSTEM_METALAKE, None, HashMap::new())
                .await
                .unwrap_err(),
            f.metalakes.drop_metalake(SYSTEM_METALAKE).await.unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert!(f
            .metalakes
            .load_metalake(SYSTEM_METALAKE)
            .await
            .unwrap_err()
            .is_not_found());

        f.metalakes
            .create_metalake("m", None, HashMap::new())
            .await
            .unwrap();
        let err = f
            .metalakes
            .alter_metalake("m", vec![MetalakeChange::Rename(SYSTEM_METALAKE.to_string())])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_metalake_privileges() {
        let f = fixture(true).await;

        let err = with_principal("alice", f.metalakes.create_metalake("m", None, HashMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        with_principal("root", f.access_control.add_metalake_admin("alice"))
            .await
            .unwrap();
        with_principal("alice", async {
            f.metalakes
                .create_metalake("m", None, HashMap::new())
                .await
                .unwrap();
            assert_eq!(f.metalakes.list_metalakes().await.unwrap().len(), 1);
        })
        .await;

        // Neither the creator nor a user of the metalake.
        let err = with_principal("bob", f.metalakes.load_metalake("m"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        with_principal("alice", f.access_control.add_user("m", "bob"))
            .await
            .unwrap();
        with_principal("bob", f.metalakes.load_metalake("m"))
            .await
            .unwrap();

        let err = with_principal("bob", f.metalakes.drop_metalake("m"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
