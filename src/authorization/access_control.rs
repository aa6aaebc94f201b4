//! User, group, role and metalake-admin management.
//!
//! Admin operations are serialized by one coarse lock and every other operation by a
//! second, independent one. Locks keyed by metalake name would have to follow metalake
//! renames and outlive the metalakes they guard, so both are global. Read-only queries
//! take the same locks to observe a consistent view.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::data_types::RoleId;
use crate::error::{Error, Result};
use crate::identifier::NameIdentifier;
use crate::meta::{
    AuditInfo, Entity, EntityType, GroupEntity, MetalakeEntity, RoleEntity, UserEntity,
    SYSTEM_METALAKE,
};
use crate::principal::current_principal;
use crate::store::{EntityStore, IdGenerator};

use super::group_mapping::GroupMappingProvider;
use super::privilege::SecurableObject;

pub struct AccessControlManager {
    store: Arc<dyn EntityStore>,
    id_generator: Arc<dyn IdGenerator>,
    group_mapping: Arc<dyn GroupMappingProvider>,
    service_admins: HashSet<String>,
    /// Whether metalake-admin changes are restricted to service admins.
    enforce_admin_checks: bool,
    admin_lock: Mutex<()>,
    non_admin_lock: Mutex<()>,
}

/// Grant or revoke, applied to the role list of a user or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleChange {
    Grant,
    Revoke,
}

fn apply_role_change(
    role_ids: &mut Vec<RoleId>,
    role_names: &mut Vec<String>,
    roles: &[RoleEntity],
    change: RoleChange,
) {
    for role in roles {
        let position = role_ids.iter().position(|id| *id == role.id);
        match (change, position) {
            (RoleChange::Grant, None) => {
                role_ids.push(role.id);
                role_names.push(role.name.clone());
            }
            (RoleChange::Revoke, Some(pos)) => {
                role_ids.remove(pos);
                role_names.remove(pos);
            }
            _ => {}
        }
    }
}

impl AccessControlManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        id_generator: Arc<dyn IdGenerator>,
        group_mapping: Arc<dyn GroupMappingProvider>,
        service_admins: HashSet<String>,
        enforce_admin_checks: bool,
    ) -> Self {
        Self {
            store,
            id_generator,
            group_mapping,
            service_admins,
            enforce_admin_checks,
            admin_lock: Mutex::new(()),
            non_admin_lock: Mutex::new(()),
        }
    }

    async fn with_non_admin_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.non_admin_lock.lock().await;
        f().await
    }

    async fn with_admin_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.admin_lock.lock().await;
        f().await
    }

    async fn check_metalake(&self, metalake: &str) -> Result<()> {
        if metalake == SYSTEM_METALAKE {
            return Err(Error::invalid_argument(format!(
                "Metalake {SYSTEM_METALAKE:?} is reserved"
            )));
        }
        if !self
            .store
            .exists(&NameIdentifier::of_metalake(metalake), EntityType::Metalake)
            .await?
        {
            return Err(Error::not_found(EntityType::Metalake, metalake));
        }
        Ok(())
    }

    /// Deleting an absent entity answers `false`; a missing metalake is still `NotFound`.
    async fn delete_if_present(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool> {
        match self.store.delete(ident, entity_type).await {
            Ok(deleted) => Ok(deleted),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn add_user(&self, metalake: &str, user: &str) -> Result<UserEntity> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            let entity = UserEntity {
                id: self.id_generator.next_id(),
                metalake: metalake.to_string(),
                name: user.to_string(),
                role_names: vec![],
                role_ids: vec![],
                audit: AuditInfo::created_by(&current_principal()),
            };
            self.store.put(entity.clone().into(), false).await?;
            info!(metalake, user, "Added user");
            Ok(entity)
        })
        .await
    }

    pub async fn remove_user(&self, metalake: &str, user: &str) -> Result<bool> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            self.delete_if_present(&NameIdentifier::of_user(metalake, user), EntityType::User)
                .await
        })
        .await
    }

    pub async fn get_user(&self, metalake: &str, user: &str) -> Result<UserEntity> {
        self.with_non_admin_lock(|| self.get_user_unlocked(metalake, user))
            .await
    }

    async fn get_user_unlocked(&self, metalake: &str, user: &str) -> Result<UserEntity> {
        self.check_metalake(metalake).await?;
        self.store
            .get(&NameIdentifier::of_user(metalake, user), EntityType::User)
            .await?
            .into_user()
            .ok_or_else(|| Error::internal("stored user has the wrong type"))
    }

    pub async fn is_user_in_metalake(&self, user: &str, metalake: &str) -> Result<bool> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            self.store
                .exists(&NameIdentifier::of_user(metalake, user), EntityType::User)
                .await
        })
        .await
    }

    pub async fn add_group(&self, metalake: &str, group: &str) -> Result<GroupEntity> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            let entity = GroupEntity {
                id: self.id_generator.next_id(),
                metalake: metalake.to_string(),
                name: group.to_string(),
                role_names: vec![],
                role_ids: vec![],
                audit: AuditInfo::created_by(&current_principal()),
            };
            self.store.put(entity.clone().into(), false).await?;
            info!(metalake, group, "Added group");
            Ok(entity)
        })
        .await
    }

    pub async fn remove_group(&self, metalake: &str, group: &str) -> Result<bool> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            self.delete_if_present(
                &NameIdentifier::of_group(metalake, group),
                EntityType::Group,
            )
            .await
        })
        .await
    }

    pub async fn get_group(&self, metalake: &str, group: &str) -> Result<GroupEntity> {
        self.with_non_admin_lock(|| self.get_group_unlocked(metalake, group))
            .await
    }

    async fn get_group_unlocked(&self, metalake: &str, group: &str) -> Result<GroupEntity> {
        self.check_metalake(metalake).await?;
        self.store
            .get(&NameIdentifier::of_group(metalake, group), EntityType::Group)
            .await?
            .into_group()
            .ok_or_else(|| Error::internal("stored group has the wrong type"))
    }

    pub async fn create_role(
        &self,
        metalake: &str,
        role: &str,
        properties: HashMap<String, String>,
        securable_objects: Vec<SecurableObject>,
    ) -> Result<RoleEntity> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            let entity = RoleEntity {
                id: self.id_generator.next_id(),
                metalake: metalake.to_string(),
                name: role.to_string(),
                properties,
                securable_objects,
                audit: AuditInfo::created_by(&current_principal()),
            };
            self.store.put(entity.clone().into(), false).await?;
            info!(metalake, role, "Created role");
            Ok(entity)
        })
        .await
    }

    pub async fn load_role(&self, metalake: &str, role: &str) -> Result<RoleEntity> {
        self.with_non_admin_lock(|| self.load_role_unlocked(metalake, role))
            .await
    }

    async fn load_role_unlocked(&self, metalake: &str, role: &str) -> Result<RoleEntity> {
        self.check_metalake(metalake).await?;
        self.store
            .get(&NameIdentifier::of_role(metalake, role), EntityType::Role)
            .await?
            .into_role()
            .ok_or_else(|| Error::internal("stored role has the wrong type"))
    }

    pub async fn drop_role(&self, metalake: &str, role: &str) -> Result<bool> {
        self.with_non_admin_lock(|| async {
            self.check_metalake(metalake).await?;
            self.delete_if_present(&NameIdentifier::of_role(metalake, role), EntityType::Role)
                .await
        })
        .await
    }

    async fn change_principal_roles(
        &self,
        metalake: &str,
        roles: &[String],
        ident: NameIdentifier,
        entity_type: EntityType,
        change: RoleChange,
    ) -> Result<Entity> {
        self.check_metalake(metalake).await?;
        let mut resolved = Vec::with_capacity(roles.len());
        for role in roles {
            resolved.push(self.load_role_unlocked(metalake, role).await?);
        }

        let modifier = current_principal();
        let updated = self
            .store
            .update(
                &ident,
                entity_type,
                Box::new(move |entity| match entity {
                    Entity::User(mut user) => {
                        apply_role_change(
                            &mut user.role_ids,
                            &mut user.role_names,
                            &resolved,
                            change,
                        );
                        user.audit = user.audit.modified_by(&modifier);
                        Ok(Entity::User(user))
                    }
                    Entity::Group(mut group) => {
                        apply_role_change(
                            &mut group.role_ids,
                            &mut group.role_names,
                            &resolved,
                            change,
                        );
                        group.audit = group.audit.modified_by(&modifier);
                        Ok(Entity::Group(group))
                    }
                    other => Err(Error::internal(format!(
                        "Cannot change the roles of a {}",
                        other.entity_type()
                    ))),
                }),
            )
            .await?;
        debug!(%ident, ?roles, ?change, "Changed role memberships");
        Ok(updated)
    }

    pub async fn grant_roles_to_user(
        &self,
        metalake: &str,
        roles: &[String],
        user: &str,
    ) -> Result<UserEntity> {
        self.with_non_admin_lock(|| async {
            self.change_principal_roles(
                metalake,
                roles,
                NameIdentifier::of_user(metalake, user),
                EntityType::User,
                RoleChange::Grant,
            )
            .await?
            .into_user()
            .ok_or_else(|| Error::internal("stored user has the wrong type"))
        })
        .await
    }

    pub async fn revoke_roles_from_user(
        &self,
        metalake: &str,
        roles: &[String],
        user: &str,
    ) -> Result<UserEntity> {
        self.with_non_admin_lock(|| async {
            self.change_principal_roles(
                metalake,
                roles,
                NameIdentifier::of_user(metalake, user),
                EntityType::User,
                RoleChange::Revoke,
            )
            .await?
            .into_user()
            .ok_or_else(|| Error::internal("stored user has the wrong type"))
        })
        .await
    }

    pub async fn grant_roles_to_group(
        &self,
        metalake: &str,
        roles: &[String],
        group: &str,
    ) -> Result<GroupEntity> {
        self.with_non_admin_lock(|| async {
            self.change_principal_roles(
                metalake,
                roles,
                NameIdentifier::of_group(metalake, group),
                EntityType::Group,
                RoleChange::Grant,
            )
            .await?
            .into_group()
            .ok_or_else(|| Error::internal("stored group has the wrong type"))
        })
        .await
    }

    pub async fn revoke_roles_from_group(
        &self,
        metalake: &str,
        roles: &[String],
        group: &str,
    ) -> Result<GroupEntity> {
        self.with_non_admin_lock(|| async {
            self.change_principal_roles(
                metalake,
                roles,
                NameIdentifier::of_group(metalake, group),
                EntityType::Group,
                RoleChange::Revoke,
            )
            .await?
            .into_group()
            .ok_or_else(|| Error::internal("stored group has the wrong type"))
        })
        .await
    }

    /// Roles granted directly to the user.
    pub async fn roles_of_user(&self, metalake: &str, user: &str) -> Result<Vec<RoleEntity>> {
        self.with_non_admin_lock(|| async {
            let user = self.get_user_unlocked(metalake, user).await?;
            self.load_roles(metalake, &user.role_names).await
        })
        .await
    }

    pub async fn roles_of_group(&self, metalake: &str, group: &str) -> Result<Vec<RoleEntity>> {
        self.with_non_admin_lock(|| async {
            let group = self.get_group_unlocked(metalake, group).await?;
            self.load_roles(metalake, &group.role_names).await
        })
        .await
    }

    async fn load_roles(&self, metalake: &str, names: &[String]) -> Result<Vec<RoleEntity>> {
        let mut roles = Vec::with_capacity(names.len());
        for name in names {
            roles.push(self.load_role_unlocked(metalake, name).await?);
        }
        Ok(roles)
    }

    pub async fn groups_of_user(&self, user: &str) -> Result<HashSet<String>> {
        self.group_mapping.groups_of(user).await
    }

    /// Service admins are configured, not stored.
    pub fn is_service_admin(&self, user: &str) -> bool {
        self.service_admins.contains(user)
    }

    fn check_service_admin(&self) -> Result<()> {
        let principal = current_principal();
        if self.enforce_admin_checks && !self.is_service_admin(&principal) {
            return Err(Error::forbidden(format!(
                "{principal} is not a service admin and cannot manage metalake admins"
            )));
        }
        Ok(())
    }

    /// The reserved metalake holding admin records is created on first use.
    async fn ensure_system_metalake(&self) -> Result<()> {
        let ident = NameIdentifier::of_metalake(SYSTEM_METALAKE);
        if self.store.exists(&ident, EntityType::Metalake).await? {
            return Ok(());
        }
        let system = MetalakeEntity {
            id: self.id_generator.next_id(),
            name: SYSTEM_METALAKE.to_string(),
            comment: Some("Reserved metalake for metalake admins".to_string()),
            properties: HashMap::new(),
            audit: AuditInfo::created_by(&current_principal()),
        };
        match self.store.put(system.into(), false).await {
            Err(e) if !e.is_already_exists() => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn add_metalake_admin(&self, user: &str) -> Result<UserEntity> {
        self.with_admin_lock(|| async {
            self.check_service_admin()?;
            self.ensure_system_metalake().await?;
            let entity = UserEntity {
                id: self.id_generator.next_id(),
                metalake: SYSTEM_METALAKE.to_string(),
                name: user.to_string(),
                role_names: vec![],
                role_ids: vec![],
                audit: AuditInfo::created_by(&current_principal()),
            };
            self.store.put(entity.clone().into(), false).await?;
            info!(user, "Added metalake admin");
            Ok(entity)
        })
        .await
    }

    pub async fn remove_metalake_admin(&self, user: &str) -> Result<bool> {
        self.with_admin_lock(|| async {
            self.check_service_admin()?;
            self.delete_if_present(
                &NameIdentifier::of_user(SYSTEM_METALAKE, user),
                EntityType::User,
            )
            .await
        })
        .await
    }

    pub async fn is_metalake_admin(&self, user: &str) -> Result<bool> {
        self.with_admin_lock(|| async {
            self.store
                .exists(
                    &NameIdentifier::of_user(SYSTEM_METALAKE, user),
                    EntityType::User,
                )
                .await
        })
        .await
    }
}
