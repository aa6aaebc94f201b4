use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace};
use crate::meta::{
    AuditInfo, CatalogEntity, Entity, EntityType, GroupEntity, MetalakeEntity, ObjectEntity,
    UserEntity,
};
use crate::repository::interface::{
    MetaRecord, PrincipalKind, PrincipalRecord, Repository, RoleRecord,
};

use super::resolver::meta_table;
use super::{concurrent_modification, interpret, EntityMutator, EntityStore, IdResolver};
use super::RoleMetaService;

#[derive(Serialize, Deserialize)]
struct CatalogDetails {
    provider: String,
}

/// The relational metadata store: entities mapped onto the repository's tables.
pub struct RelationalEntityStore {
    repository: Arc<dyn Repository>,
    resolver: IdResolver,
    roles: RoleMetaService,
}

fn principal_kind(entity_type: EntityType) -> Option<PrincipalKind> {
    match entity_type {
        EntityType::User => Some(PrincipalKind::User),
        EntityType::Group => Some(PrincipalKind::Group),
        _ => None,
    }
}

fn to_meta_record(entity: &Entity, parent_id: i64) -> Result<MetaRecord> {
    let (id, name, comment, properties, audit, details) = match entity {
        Entity::Metalake(e) => (
            e.id,
            &e.name,
            &e.comment,
            Some(&e.properties),
            &e.audit,
            serde_json::Value::Null,
        ),
        Entity::Catalog(e) => (
            e.id,
            &e.name,
            &e.comment,
            Some(&e.properties),
            &e.audit,
            serde_json::to_value(CatalogDetails {
                provider: e.provider.clone(),
            })?,
        ),
        Entity::Object(e) => (e.id, &e.name, &e.comment, None, &e.audit, e.details.clone()),
        _ => {
            return Err(Error::internal(format!(
                "{} is not stored as a metadata object",
                entity.entity_type()
            )))
        }
    };

    Ok(MetaRecord {
        id,
        parent_id,
        name: name.clone(),
        comment: comment.clone(),
        properties: serde_json::to_string(&properties.cloned().unwrap_or_default())?,
        audit_info: serde_json::to_string(audit)?,
        details: serde_json::to_string(&details)?,
        current_version: 1,
    })
}

fn from_meta_record(
    record: MetaRecord,
    entity_type: EntityType,
    namespace: &Namespace,
) -> Result<Entity> {
    let properties: HashMap<String, String> = serde_json::from_str(&record.properties)?;
    let audit: AuditInfo = serde_json::from_str(&record.audit_info)?;

    let entity = match entity_type {
        EntityType::Metalake => Entity::Metalake(MetalakeEntity {
            id: record.id,
            name: record.name,
            comment: record.comment,
            properties,
            audit,
        }),
        EntityType::Catalog => {
            let details: CatalogDetails = serde_json::from_str(&record.details)?;
            Entity::Catalog(CatalogEntity {
                id: record.id,
                metalake: namespace.level(0).unwrap_or_default().to_string(),
                name: record.name,
                provider: details.provider,
                comment: record.comment,
                properties,
                audit,
            })
        }
        _ => Entity::Object(ObjectEntity {
            id: record.id,
            entity_type,
            namespace: namespace.clone(),
            name: record.name,
            comment: record.comment,
            audit,
            details: serde_json::from_str(&record.details)?,
        }),
    };
    Ok(entity)
}

impl RelationalEntityStore {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        let resolver = IdResolver::new(repository.clone());
        Self {
            roles: RoleMetaService::new(repository.clone()),
            repository,
            resolver,
        }
    }

    pub fn role_service(&self) -> &RoleMetaService {
        &self.roles
    }

    pub fn resolver(&self) -> &IdResolver {
        &self.resolver
    }

    async fn get_meta_with_record(
        &self,
        ident: &NameIdentifier,
        entity_type: EntityType,
    ) -> Result<(MetaRecord, Entity)> {
        let table = meta_table(entity_type).ok_or_else(|| {
            Error::internal(format!("{entity_type} is not stored as a metadata object"))
        })?;
        let parent_id = self.resolver.parent_id(ident.namespace(), entity_type).await?;
        let record = self
            .repository
            .get_meta(table, parent_id, ident.name())
            .await
            .map_err(interpret("get", entity_type, ident))?;
        let entity = from_meta_record(record.clone(), entity_type, ident.namespace())?;
        Ok((record, entity))
    }

    async fn get_principal_with_record(
        &self,
        ident: &NameIdentifier,
        kind: PrincipalKind,
        entity_type: EntityType,
    ) -> Result<(PrincipalRecord, Vec<RoleRecord>)> {
        let metalake_id = self.resolver.metalake_id(ident.metalake()).await?;
        let record = self
            .repository
            .get_principal(kind, metalake_id, ident.name())
            .await
            .map_err(interpret("get", entity_type, ident))?;
        let roles = self
            .repository
            .list_roles_by_principal(kind, record.id)
            .await
            .map_err(interpret("list roles of", entity_type, ident))?;
        Ok((record, roles))
    }

    fn principal_entity(
        metalake: &str,
        entity_type: EntityType,
        record: PrincipalRecord,
        roles: Vec<RoleRecord>,
    ) -> Result<Entity> {
        let audit: AuditInfo = serde_json::from_str(&record.audit_info)?;
        let (role_ids, role_names) = roles.into_iter().map(|r| (r.id, r.name)).unzip();
        Ok(match entity_type {
            EntityType::Group => Entity::Group(GroupEntity {
                id: record.id,
                metalake: metalake.to_string(),
                name: record.name,
                role_names,
                role_ids,
                audit,
            }),
            _ => Entity::User(UserEntity {
                id: record.id,
                metalake: metalake.to_string(),
                name: record.name,
                role_names,
                role_ids,
                audit,
            }),
        })
    }

    async fn put_principal(&self, entity: Entity, overwrite: bool) -> Result<()> {
        let ident = entity.ident();
        let entity_type = entity.entity_type();
        let (id, name, role_ids, audit) = match &entity {
            Entity::User(e) => (e.id, &e.name, &e.role_ids, &e.audit),
            Entity::Group(e) => (e.id, &e.name, &e.role_ids, &e.audit),
            _ => return Err(Error::internal("not a principal")),
        };
        let kind = principal_kind(entity_type)
            .ok_or_else(|| Error::internal("not a principal"))?;

        let metalake_id = self.resolver.metalake_id(ident.metalake()).await?;
        if overwrite {
            if let Ok(existing) = self
                .repository
                .get_principal(kind, metalake_id, name)
                .await
            {
                self.repository
                    .soft_delete_principal(kind, existing.id)
                    .await
                    .map_err(interpret("overwrite", entity_type, &ident))?;
            }
        }

        let audit_info = serde_json::to_string(audit)?;
        let record = PrincipalRecord {
            id,
            metalake_id,
            name: name.clone(),
            audit_info: audit_info.clone(),
            current_version: 1,
        };
        self.repository
            .insert_principal(kind, &record)
            .await
            .map_err(interpret("put", entity_type, &ident))?;

        if !role_ids.is_empty() {
            self.repository
                .update_principal_roles(kind, id, 1, &audit_info, role_ids, &[])
                .await
                .map_err(interpret("put", entity_type, &ident))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for RelationalEntityStore {
    async fn get(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<Entity> {
        match entity_type {
            EntityType::Role => Ok(Entity::Role(
                self.roles.get_role(ident.metalake(), ident.name()).await?,
            )),
            EntityType::User | EntityType::Group => {
                let kind = principal_kind(entity_type)
                    .ok_or_else(|| Error::internal("not a principal"))?;
                let (record, roles) =
                    self.get_principal_with_record(ident, kind, entity_type).await?;
                Self::principal_entity(ident.metalake(), entity_type, record, roles)
            }
            _ => Ok(self.get_meta_with_record(ident, entity_type).await?.1),
        }
    }

    async fn put(&self, entity: Entity, overwrite: bool) -> Result<()> {
        let ident = entity.ident();
        let entity_type = entity.entity_type();
        debug!(%ident, %entity_type, overwrite, "Putting entity");

        match entity {
            Entity::Role(role) => {
                self.roles.insert_role(&role, overwrite).await?;
                Ok(())
            }
            Entity::User(_) | Entity::Group(_) => self.put_principal(entity, overwrite).await,
            _ => {
                let table = meta_table(entity_type)
                    .ok_or_else(|| Error::internal("not a metadata object"))?;
                let parent_id = self.resolver.parent_id(ident.namespace(), entity_type).await?;
                let record = to_meta_record(&entity, parent_id)?;
                let written = if overwrite {
                    self.repository.upsert_meta(table, &record).await
                } else {
                    self.repository.insert_meta(table, &record).await
                };
                written.map_err(interpret("put", entity_type, &ident))
            }
        }
    }

    async fn update(
        &self,
        ident: &NameIdentifier,
        entity_type: EntityType,
        mutator: EntityMutator,
    ) -> Result<Entity> {
        match entity_type {
            EntityType::Role => Err(Error::invalid_argument(
                "Roles are redefined by overwriting, not updated in place",
            )),
            EntityType::User | EntityType::Group => {
                let kind = principal_kind(entity_type)
                    .ok_or_else(|| Error::internal("not a principal"))?;
                let (record, roles) =
                    self.get_principal_with_record(ident, kind, entity_type).await?;
                let (id, version) = (record.id, record.current_version);
                let current =
                    Self::principal_entity(ident.metalake(), entity_type, record, roles)?;
                let current_role_ids = match &current {
                    Entity::User(e) => e.role_ids.clone(),
                    Entity::Group(e) => e.role_ids.clone(),
                    _ => vec![],
                };

                let updated = mutator(current)?;
                let (new_id, new_role_ids, audit) = match &updated {
                    Entity::User(e) => (e.id, &e.role_ids, &e.audit),
                    Entity::Group(e) => (e.id, &e.role_ids, &e.audit),
                    _ => return Err(Error::internal("mutator changed the entity type")),
                };
                if new_id != id {
                    return Err(Error::internal("mutator changed the entity id"));
                }

                let add: Vec<_> = new_role_ids
                    .iter()
                    .filter(|r| !current_role_ids.contains(r))
                    .copied()
                    .collect();
                let remove: Vec<_> = current_role_ids
                    .iter()
                    .filter(|r| !new_role_ids.contains(r))
                    .copied()
                    .collect();

                self.repository
                    .update_principal_roles(
                        kind,
                        id,
                        version,
                        &serde_json::to_string(audit)?,
                        &add,
                        &remove,
                    )
                    .await
                    .map_err(|e| {
                        if e.is_row_not_found() {
                            concurrent_modification("update", entity_type, ident)
                        } else {
                            interpret("update", entity_type, ident)(e)
                        }
                    })?;

                self.get(ident, entity_type).await
            }
            _ => {
                let table = meta_table(entity_type)
                    .ok_or_else(|| Error::internal("not a metadata object"))?;
                let (record, current) = self.get_meta_with_record(ident, entity_type).await?;

                let updated = mutator(current)?;
                if updated.id() != record.id || updated.entity_type() != entity_type {
                    return Err(Error::internal(
                        "mutator changed the entity id or type",
                    ));
                }

                let mut new_record = to_meta_record(&updated, record.parent_id)?;
                new_record.current_version = record.current_version + 1;
                let changed = self
                    .repository
                    .update_meta(table, &new_record, record.current_version)
                    .await
                    .map_err(interpret("update", entity_type, ident))?;
                if changed == 0 {
                    return Err(concurrent_modification("update", entity_type, ident));
                }
                Ok(updated)
            }
        }
    }

    async fn delete(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool> {
        debug!(%ident, %entity_type, "Deleting entity");
        match entity_type {
            EntityType::Role => self.roles.delete_role(ident.metalake(), ident.name()).await,
            EntityType::User | EntityType::Group => {
                let kind = principal_kind(entity_type)
                    .ok_or_else(|| Error::internal("not a principal"))?;
                let metalake_id = self.resolver.metalake_id(ident.metalake()).await?;
                let record = self
                    .repository
                    .get_principal(kind, metalake_id, ident.name())
                    .await
                    .map_err(interpret("delete", entity_type, ident))?;
                let deleted = self
                    .repository
                    .soft_delete_principal(kind, record.id)
                    .await
                    .map_err(interpret("delete", entity_type, ident))?;
                Ok(deleted > 0)
            }
            _ => {
                let table = meta_table(entity_type)
                    .ok_or_else(|| Error::internal("not a metadata object"))?;
                let id = self.resolver.object_id(ident, entity_type).await?;
                let deleted = self
                    .repository
                    .soft_delete_meta(table, id)
                    .await
                    .map_err(interpret("delete", entity_type, ident))?;
                Ok(deleted > 0)
            }
        }
    }

    async fn list(&self, namespace: &Namespace, entity_type: EntityType) -> Result<Vec<Entity>> {
        let ns_ident = NameIdentifier::of(namespace.levels())
            .unwrap_or_else(|| NameIdentifier::of_metalake(""));
        match entity_type {
            EntityType::Role => Err(Error::invalid_argument("Roles cannot be listed")),
            EntityType::User | EntityType::Group => {
                let kind = principal_kind(entity_type)
                    .ok_or_else(|| Error::internal("not a principal"))?;
                let metalake = namespace.level(0).unwrap_or_default();
                let metalake_id = self.resolver.parent_id(namespace, entity_type).await?;
                let records = self
                    .repository
                    .list_principals(kind, metalake_id)
                    .await
                    .map_err(interpret("list", entity_type, &ns_ident))?;

                let mut entities = Vec::with_capacity(records.len());
                for record in records {
                    let roles = self
                        .repository
                        .list_roles_by_principal(kind, record.id)
                        .await
                        .map_err(interpret("list", entity_type, &ns_ident))?;
                    entities.push(Self::principal_entity(metalake, entity_type, record, roles)?);
                }
                Ok(entities)
            }
            _ => {
                let table = meta_table(entity_type)
                    .ok_or_else(|| Error::internal("not a metadata object"))?;
                let parent_id = self.resolver.parent_id(namespace, entity_type).await?;
                self.repository
                    .list_meta(table, parent_id)
                    .await
                    .map_err(interpret("list", entity_type, &ns_ident))?
                    .into_iter()
                    .map(|record| from_meta_record(record, entity_type, namespace))
                    .collect()
            }
        }
    }
}
