use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::authorization::privilege::{
    Condition, MetadataObject, MetadataObjectType, Privilege, PrivilegeName, SecurableObject,
};
use crate::data_types::{EntityId, RoleId, Timestamp};
use crate::error::{Error, Result};
use crate::identifier::NameIdentifier;
use crate::meta::{AuditInfo, EntityType, RoleEntity};
use crate::repository::interface::{
    PrincipalKind, Repository, RoleRecord, SecurableObjectRecord, StoreTable,
};

use super::{interpret, storage_failure, IdResolver};

/// Maps roles and their grants onto relational rows. Grants reference their
/// objects by surrogate id, resolved from the dotted full name on write and back
/// on read.
#[derive(Debug, Clone)]
pub struct RoleMetaService {
    repository: Arc<dyn Repository>,
    resolver: IdResolver,
}

fn to_securable_object_record(
    entity_id: EntityId,
    object: &SecurableObject,
) -> Result<SecurableObjectRecord> {
    let (names, conditions): (Vec<_>, Vec<_>) = object
        .privileges()
        .iter()
        .map(|p| (p.name, p.condition))
        .unzip();
    Ok(SecurableObjectRecord {
        entity_id,
        object_type: object.object().object_type().to_string(),
        privilege_names: serde_json::to_string(&names)?,
        privilege_conditions: serde_json::to_string(&conditions)?,
    })
}

fn privileges_of(record: &SecurableObjectRecord) -> Result<Vec<Privilege>> {
    let names: Vec<PrivilegeName> = serde_json::from_str(&record.privilege_names)?;
    let conditions: Vec<Condition> = serde_json::from_str(&record.privilege_conditions)?;
    if names.len() != conditions.len() {
        return Err(Error::internal(format!(
            "Grant on {} id {} has {} privileges but {} conditions",
            record.object_type,
            record.entity_id,
            names.len(),
            conditions.len()
        )));
    }
    Ok(names
        .into_iter()
        .zip(conditions)
        .map(|(name, condition)| Privilege { name, condition })
        .collect())
}

impl RoleMetaService {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            resolver: IdResolver::new(repository.clone()),
            repository,
        }
    }

    /// Writes the role and its grants as one unit. Every grant's object must exist;
    /// ids are resolved before anything is written.
    pub async fn insert_role(&self, role: &RoleEntity, overwrite: bool) -> Result<RoleId> {
        let ident = NameIdentifier::of_role(&role.metalake, &role.name);
        let metalake_id = self.resolver.metalake_id(&role.metalake).await?;

        let mut objects = Vec::with_capacity(role.securable_objects.len());
        for object in &role.securable_objects {
            if let Some(metalake) = object.object().metalake_name() {
                if metalake != role.metalake {
                    return Err(Error::invalid_argument(format!(
                        "Role {ident} cannot grant on {} outside its metalake",
                        object.object()
                    )));
                }
            }
            let entity_id = self.resolver.securable_object_id(object.object()).await?;
            objects.push(to_securable_object_record(entity_id, object)?);
        }

        let record = RoleRecord {
            id: role.id,
            metalake_id,
            name: role.name.clone(),
            properties: serde_json::to_string(&role.properties)?,
            audit_info: serde_json::to_string(&role.audit)?,
            current_version: 1,
        };

        let role_id = self
            .repository
            .insert_role(&record, &objects, overwrite)
            .await
            .map_err(interpret("insert", EntityType::Role, &ident))?;
        debug!(%ident, role_id, grants = objects.len(), overwrite, "Stored role");
        Ok(role_id)
    }

    async fn role_from_record(&self, metalake: &str, record: RoleRecord) -> Result<RoleEntity> {
        let grants = self
            .repository
            .list_securable_objects(record.id)
            .await
            .map_err(interpret(
                "list grants of",
                EntityType::Role,
                &NameIdentifier::of_role(metalake, &record.name),
            ))?;

        let mut securable_objects = Vec::with_capacity(grants.len());
        for grant in grants {
            let Ok(object_type) = MetadataObjectType::from_str(&grant.object_type) else {
                warn!(
                    role = %record.name,
                    object_type = %grant.object_type,
                    "Skipping grant with unknown object type"
                );
                continue;
            };
            let Some(full_name) = self
                .resolver
                .full_name_of(object_type, grant.entity_id)
                .await?
            else {
                debug!(
                    role = %record.name,
                    %object_type,
                    entity_id = grant.entity_id,
                    "Omitting grant on an object that no longer exists"
                );
                continue;
            };

            let object = MetadataObject::new(object_type, full_name)
                .and_then(|object| SecurableObject::new(object, privileges_of(&grant)?));
            match object {
                Ok(object) => securable_objects.push(object),
                Err(e) => warn!(role = %record.name, error = %e, "Skipping invalid stored grant"),
            }
        }

        Ok(RoleEntity {
            id: record.id,
            metalake: metalake.to_string(),
            name: record.name,
            properties: serde_json::from_str(&record.properties)?,
            securable_objects,
            audit: serde_json::from_str::<AuditInfo>(&record.audit_info)?,
        })
    }

    pub async fn get_role(&self, metalake: &str, name: &str) -> Result<RoleEntity> {
        let ident = NameIdentifier::of_role(metalake, name);
        let metalake_id = self.resolver.metalake_id(metalake).await?;
        let record = self
            .repository
            .get_role(metalake_id, name)
            .await
            .map_err(interpret("get", EntityType::Role, &ident))?;
        self.role_from_record(metalake, record).await
    }

    /// Tombstones the role together with its memberships and grants.
    pub async fn delete_role(&self, metalake: &str, name: &str) -> Result<bool> {
        let ident = NameIdentifier::of_role(metalake, name);
        let metalake_id = self.resolver.metalake_id(metalake).await?;
        let record = self
            .repository
            .get_role(metalake_id, name)
            .await
            .map_err(interpret("delete", EntityType::Role, &ident))?;
        let deleted = self
            .repository
            .soft_delete_role(record.id)
            .await
            .map_err(interpret("delete", EntityType::Role, &ident))?;
        Ok(deleted > 0)
    }

    async fn list_roles_by_principal(
        &self,
        kind: PrincipalKind,
        principal_id: EntityId,
        metalake: &str,
    ) -> Result<Vec<RoleEntity>> {
        let records = self
            .repository
            .list_roles_by_principal(kind, principal_id)
            .await
            .map_err(storage_failure(
                "list roles",
                format!("{kind} id {principal_id}"),
            ))?;

        let mut roles = Vec::with_capacity(records.len());
        for record in records {
            roles.push(self.role_from_record(metalake, record).await?);
        }
        Ok(roles)
    }

    pub async fn list_roles_by_user_id(
        &self,
        user_id: EntityId,
        metalake: &str,
    ) -> Result<Vec<RoleEntity>> {
        self.list_roles_by_principal(PrincipalKind::User, user_id, metalake)
            .await
    }

    pub async fn list_roles_by_group_id(
        &self,
        group_id: EntityId,
        metalake: &str,
    ) -> Result<Vec<RoleEntity>> {
        self.list_roles_by_principal(PrincipalKind::Group, group_id, metalake)
            .await
    }

    /// Physically removes role rows tombstoned before `cutoff`, at most `limit` per table.
    pub async fn delete_role_metas_by_legacy_timeline(
        &self,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<HashMap<StoreTable, u64>> {
        let mut counts = HashMap::new();
        for table in StoreTable::iter().filter(StoreTable::is_role_table) {
            let removed = self
                .repository
                .hard_delete_legacy(table, cutoff, limit)
                .await
                .map_err(storage_failure("reclaim", table))?;
            if removed > 0 {
                info!(%table, removed, "Reclaimed soft-deleted rows");
            }
            counts.insert(table, removed);
        }
        Ok(counts)
    }
}
