use std::sync::Arc;

use crate::authorization::privilege::{MetadataObject, MetadataObjectType, ROOT_FULL_NAME};
use crate::data_types::{EntityId, NO_PARENT_ID, ROOT_ENTITY_ID};
use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace};
use crate::meta::EntityType;
use crate::repository::interface::{MetaTable, Repository};

use super::{interpret, storage_failure};

/// Resolves hierarchical names to surrogate ids and back by walking
/// metalake → catalog → schema → leaf on every call. Nothing is cached.
#[derive(Debug, Clone)]
pub struct IdResolver {
    repository: Arc<dyn Repository>,
}

pub(crate) fn meta_table(entity_type: EntityType) -> Option<MetaTable> {
    match entity_type {
        EntityType::Metalake => Some(MetaTable::Metalake),
        EntityType::Catalog => Some(MetaTable::Catalog),
        EntityType::Schema => Some(MetaTable::Schema),
        EntityType::Table => Some(MetaTable::Table),
        EntityType::Topic => Some(MetaTable::Topic),
        EntityType::Fileset => Some(MetaTable::Fileset),
        EntityType::User | EntityType::Group | EntityType::Role => None,
    }
}

fn metadata_object_table(object_type: MetadataObjectType) -> Option<MetaTable> {
    match object_type {
        MetadataObjectType::Root => None,
        MetadataObjectType::Metalake => Some(MetaTable::Metalake),
        MetadataObjectType::Catalog => Some(MetaTable::Catalog),
        MetadataObjectType::Schema => Some(MetaTable::Schema),
        MetadataObjectType::Table => Some(MetaTable::Table),
        MetadataObjectType::Topic => Some(MetaTable::Topic),
        MetadataObjectType::Fileset => Some(MetaTable::Fileset),
    }
}

impl IdResolver {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    pub async fn metalake_id(&self, metalake: &str) -> Result<EntityId> {
        let ident = NameIdentifier::of_metalake(metalake);
        let record = self
            .repository
            .get_meta(MetaTable::Metalake, NO_PARENT_ID, metalake)
            .await
            .map_err(interpret("get", EntityType::Metalake, &ident))?;
        Ok(record.id)
    }

    /// Id of the row that entities of `entity_type` in `namespace` hang off.
    pub async fn parent_id(&self, namespace: &Namespace, entity_type: EntityType) -> Result<EntityId> {
        let expected_levels = match entity_type {
            EntityType::Metalake => 0,
            EntityType::Catalog => 1,
            EntityType::Schema => 2,
            EntityType::Table | EntityType::Topic | EntityType::Fileset => 3,
            EntityType::User | EntityType::Group | EntityType::Role => {
                return match namespace.level(0) {
                    Some(metalake) => self.metalake_id(metalake).await,
                    None => Err(Error::invalid_argument(format!(
                        "{entity_type} namespace must name a metalake"
                    ))),
                };
            }
        };
        if namespace.len() != expected_levels {
            return Err(Error::invalid_argument(format!(
                "Namespace \"{namespace}\" is not a valid {entity_type} namespace"
            )));
        }

        let mut parent_id = NO_PARENT_ID;
        let chain = [MetaTable::Metalake, MetaTable::Catalog, MetaTable::Schema];
        let chain_types = [EntityType::Metalake, EntityType::Catalog, EntityType::Schema];
        for (i, level) in namespace.levels().iter().enumerate() {
            let ident = NameIdentifier::of(&namespace.levels()[..=i])
                .ok_or_else(|| Error::internal("empty parent identifier"))?;
            parent_id = self
                .repository
                .get_meta(chain[i], parent_id, level)
                .await
                .map_err(interpret("get", chain_types[i], &ident))?
                .id;
        }
        Ok(parent_id)
    }

    /// Id of a metadata object (metalake, catalog, schema or leaf).
    pub async fn object_id(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<EntityId> {
        let table = meta_table(entity_type).ok_or_else(|| {
            Error::invalid_argument(format!("{entity_type} is not a metadata object"))
        })?;
        let parent_id = self.parent_id(ident.namespace(), entity_type).await?;
        let record = self
            .repository
            .get_meta(table, parent_id, ident.name())
            .await
            .map_err(interpret("get", entity_type, ident))?;
        Ok(record.id)
    }

    /// Id a securable object is stored under; the root maps to a sentinel.
    pub async fn securable_object_id(&self, object: &MetadataObject) -> Result<EntityId> {
        let Some((ident, entity_type)) = crate::meta::entity_of(object) else {
            return Ok(ROOT_ENTITY_ID);
        };
        self.object_id(&ident, entity_type).await
    }

    /// Inverse of [`Self::securable_object_id`]. `None` when the object, or one of its
    /// parents, no longer exists.
    pub async fn full_name_of(
        &self,
        object_type: MetadataObjectType,
        entity_id: EntityId,
    ) -> Result<Option<String>> {
        let Some(table) = metadata_object_table(object_type) else {
            return Ok(Some(ROOT_FULL_NAME.to_string()));
        };

        // Tables to walk, leaf first
        let walk = match table {
            MetaTable::Metalake => vec![MetaTable::Metalake],
            MetaTable::Catalog => vec![MetaTable::Catalog, MetaTable::Metalake],
            MetaTable::Schema => vec![MetaTable::Schema, MetaTable::Catalog, MetaTable::Metalake],
            MetaTable::Table | MetaTable::Topic | MetaTable::Fileset => {
                vec![table, MetaTable::Schema, MetaTable::Catalog, MetaTable::Metalake]
            }
        };

        let mut names = Vec::with_capacity(walk.len());
        let mut id = entity_id;
        for table in walk {
            match self.repository.get_meta_by_id(table, id).await {
                Ok(record) => {
                    names.push(record.name);
                    id = record.parent_id;
                }
                Err(e) if e.is_row_not_found() => return Ok(None),
                Err(e) => return Err(storage_failure("get", format!("{table} id {id}"))(e)),
            }
        }

        names.reverse();
        Ok(Some(names.join(".")))
    }
}
