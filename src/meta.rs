use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::authorization::privilege::{MetadataObject, MetadataObjectType, SecurableObject};
use crate::data_types::{CatalogId, EntityId, GroupId, MetalakeId, RoleId, UserId};
use crate::identifier::{NameIdentifier, Namespace};

/// Name of the reserved metalake that holds metalake-admin records.
pub const SYSTEM_METALAKE: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub creator: String,
    pub create_time: DateTime<Utc>,
    pub last_modifier: Option<String>,
    pub last_modified_time: Option<DateTime<Utc>>,
}

impl AuditInfo {
    pub fn created_by(creator: &str) -> Self {
        Self {
            creator: creator.to_string(),
            create_time: Utc::now(),
            last_modifier: None,
            last_modified_time: None,
        }
    }

    /// Copy with the modifier fields stamped; creation fields are kept.
    pub fn modified_by(&self, modifier: &str) -> Self {
        Self {
            creator: self.creator.clone(),
            create_time: self.create_time,
            last_modifier: Some(modifier.to_string()),
            last_modified_time: Some(Utc::now()),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Metalake,
    Catalog,
    Schema,
    Table,
    Topic,
    Fileset,
    User,
    Group,
    Role,
}

impl EntityType {
    /// Securable object type of entities that privileges can be granted against.
    pub fn metadata_object_type(&self) -> Option<MetadataObjectType> {
        match self {
            EntityType::Metalake => Some(MetadataObjectType::Metalake),
            EntityType::Catalog => Some(MetadataObjectType::Catalog),
            EntityType::Schema => Some(MetadataObjectType::Schema),
            EntityType::Table => Some(MetadataObjectType::Table),
            EntityType::Topic => Some(MetadataObjectType::Topic),
            EntityType::Fileset => Some(MetadataObjectType::Fileset),
            EntityType::User | EntityType::Group | EntityType::Role => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetalakeEntity {
    pub id: MetalakeId,
    pub name: String,
    pub comment: Option<String>,
    pub properties: HashMap<String, String>,
    pub audit: AuditInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntity {
    pub id: CatalogId,
    pub metalake: String,
    pub name: String,
    /// Key of the registered connector factory that serves this catalog.
    pub provider: String,
    pub comment: Option<String>,
    pub properties: HashMap<String, String>,
    pub audit: AuditInfo,
}

/// Store record of a schema, table, topic or fileset. Kind-specific data the
/// connector reports is kept as an opaque JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntity {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub namespace: Namespace,
    pub name: String,
    pub comment: Option<String>,
    pub audit: AuditInfo,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntity {
    pub id: UserId,
    pub metalake: String,
    pub name: String,
    pub role_names: Vec<String>,
    pub role_ids: Vec<RoleId>,
    pub audit: AuditInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntity {
    pub id: GroupId,
    pub metalake: String,
    pub name: String,
    pub role_names: Vec<String>,
    pub role_ids: Vec<RoleId>,
    pub audit: AuditInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleEntity {
    pub id: RoleId,
    pub metalake: String,
    pub name: String,
    pub properties: HashMap<String, String>,
    pub securable_objects: Vec<SecurableObject>,
    pub audit: AuditInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Metalake(MetalakeEntity),
    Catalog(CatalogEntity),
    Object(ObjectEntity),
    User(UserEntity),
    Group(GroupEntity),
    Role(RoleEntity),
}

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Metalake(_) => EntityType::Metalake,
            Entity::Catalog(_) => EntityType::Catalog,
            Entity::Object(o) => o.entity_type,
            Entity::User(_) => EntityType::User,
            Entity::Group(_) => EntityType::Group,
            Entity::Role(_) => EntityType::Role,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Entity::Metalake(e) => e.id,
            Entity::Catalog(e) => e.id,
            Entity::Object(e) => e.id,
            Entity::User(e) => e.id,
            Entity::Group(e) => e.id,
            Entity::Role(e) => e.id,
        }
    }

    pub fn ident(&self) -> NameIdentifier {
        match self {
            Entity::Metalake(e) => NameIdentifier::of_metalake(&e.name),
            Entity::Catalog(e) => NameIdentifier::of_catalog(&e.metalake, &e.name),
            Entity::Object(e) => NameIdentifier::new(e.namespace.clone(), &e.name),
            Entity::User(e) => NameIdentifier::of_user(&e.metalake, &e.name),
            Entity::Group(e) => NameIdentifier::of_group(&e.metalake, &e.name),
            Entity::Role(e) => NameIdentifier::of_role(&e.metalake, &e.name),
        }
    }

    pub fn audit(&self) -> &AuditInfo {
        match self {
            Entity::Metalake(e) => &e.audit,
            Entity::Catalog(e) => &e.audit,
            Entity::Object(e) => &e.audit,
            Entity::User(e) => &e.audit,
            Entity::Group(e) => &e.audit,
            Entity::Role(e) => &e.audit,
        }
    }
}

macro_rules! entity_accessors {
    ($($variant:ident => $ty:ident, $into:ident);* $(;)?) => {
        impl Entity {
            $(
                pub fn $into(self) -> Option<$ty> {
                    match self {
                        Entity::$variant(e) => Some(e),
                        _ => None,
                    }
                }
            )*
        }

        $(
            impl From<$ty> for Entity {
                fn from(e: $ty) -> Self {
                    Entity::$variant(e)
                }
            }
        )*
    };
}

entity_accessors!(
    Metalake => MetalakeEntity, into_metalake;
    Catalog => CatalogEntity, into_catalog;
    Object => ObjectEntity, into_object;
    User => UserEntity, into_user;
    Group => GroupEntity, into_group;
    Role => RoleEntity, into_role;
);

/// Maps a securable object onto the store identifier and type of the entity it names.
/// The all-metalakes root has no backing entity.
pub fn entity_of(object: &MetadataObject) -> Option<(NameIdentifier, EntityType)> {
    let entity_type = match object.object_type() {
        MetadataObjectType::Root => return None,
        MetadataObjectType::Metalake => EntityType::Metalake,
        MetadataObjectType::Catalog => EntityType::Catalog,
        MetadataObjectType::Schema => EntityType::Schema,
        MetadataObjectType::Table => EntityType::Table,
        MetadataObjectType::Topic => EntityType::Topic,
        MetadataObjectType::Fileset => EntityType::Fileset,
    };
    Some((NameIdentifier::parse(object.full_name())?, entity_type))
}
