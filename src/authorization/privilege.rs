use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::{Error, Result};
use crate::identifier::NameIdentifier;

/// Full name of the all-metalakes root securable object.
pub const ROOT_FULL_NAME: &str = "*";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataObjectType {
    Root,
    Metalake,
    Catalog,
    Schema,
    Table,
    Topic,
    Fileset,
}

impl MetadataObjectType {
    /// Number of levels between the root and objects of this type.
    pub fn depth(&self) -> usize {
        match self {
            MetadataObjectType::Root => 0,
            MetadataObjectType::Metalake => 1,
            MetadataObjectType::Catalog => 2,
            MetadataObjectType::Schema => 3,
            MetadataObjectType::Table
            | MetadataObjectType::Topic
            | MetadataObjectType::Fileset => 4,
        }
    }
}

/// A (type, full dotted name) pair. Full names are rooted at the metalake:
/// `m`, `m.c1`, `m.c1.s1`, `m.c1.s1.t1`; the root is `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataObject {
    object_type: MetadataObjectType,
    full_name: String,
}

impl MetadataObject {
    pub fn root() -> Self {
        Self {
            object_type: MetadataObjectType::Root,
            full_name: ROOT_FULL_NAME.to_string(),
        }
    }

    pub fn new(object_type: MetadataObjectType, full_name: impl Into<String>) -> Result<Self> {
        let full_name = full_name.into();
        let valid = match object_type {
            MetadataObjectType::Root => full_name == ROOT_FULL_NAME,
            _ => NameIdentifier::parse(&full_name)
                .map(|ident| ident.levels().len() == object_type.depth())
                .unwrap_or(false),
        };
        if !valid {
            return Err(Error::invalid_argument(format!(
                "{full_name:?} is not a valid {object_type} name"
            )));
        }
        Ok(Self {
            object_type,
            full_name,
        })
    }

    pub fn metalake(name: &str) -> Self {
        Self::from_ident(MetadataObjectType::Metalake, &NameIdentifier::of_metalake(name))
    }

    pub fn catalog(metalake: &str, catalog: &str) -> Self {
        Self::from_ident(
            MetadataObjectType::Catalog,
            &NameIdentifier::of_catalog(metalake, catalog),
        )
    }

    pub fn schema(metalake: &str, catalog: &str, schema: &str) -> Self {
        Self::from_ident(
            MetadataObjectType::Schema,
            &NameIdentifier::of_schema(metalake, catalog, schema),
        )
    }

    pub fn table(metalake: &str, catalog: &str, schema: &str, table: &str) -> Self {
        Self::from_ident(
            MetadataObjectType::Table,
            &NameIdentifier::of_leaf(metalake, catalog, schema, table),
        )
    }

    /// Trusts the caller that `ident` has the depth `object_type` requires.
    pub fn from_ident(object_type: MetadataObjectType, ident: &NameIdentifier) -> Self {
        Self {
            object_type,
            full_name: ident.to_string(),
        }
    }

    pub fn object_type(&self) -> MetadataObjectType {
        self.object_type
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Metalake the object belongs to; `None` for the root.
    pub fn metalake_name(&self) -> Option<&str> {
        match self.object_type {
            MetadataObjectType::Root => None,
            _ => self.full_name.split('.').next(),
        }
    }

    /// This object followed by all of its ancestors up to and including the root.
    pub fn self_and_ancestors(&self) -> Vec<MetadataObject> {
        let mut chain = vec![self.clone()];
        if self.object_type == MetadataObjectType::Root {
            return chain;
        }

        let levels: Vec<&str> = self.full_name.split('.').collect();
        let ancestor_types = [
            MetadataObjectType::Schema,
            MetadataObjectType::Catalog,
            MetadataObjectType::Metalake,
        ];
        for ancestor_type in ancestor_types {
            let depth = ancestor_type.depth();
            if depth < levels.len() {
                chain.push(MetadataObject {
                    object_type: ancestor_type,
                    full_name: levels[..depth].join("."),
                });
            }
        }
        chain.push(MetadataObject::root());
        chain
    }
}

impl fmt::Display for MetadataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.object_type, self.full_name)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivilegeName {
    UseMetalake,
    ManageMetalake,
    CreateCatalog,
    AddUser,
    RemoveUser,
    GetUser,
    AddGroup,
    RemoveGroup,
    GetGroup,
    CreateRole,
    DeleteRole,
    GetRole,
    GrantRole,
    RevokeRole,

    UseCatalog,
    AlterCatalog,
    DropCatalog,
    CreateSchema,

    UseSchema,
    AlterSchema,
    DropSchema,
    CreateTable,
    CreateTopic,
    CreateFileset,

    ReadTable,
    WriteTable,
    DropTable,

    ReadTopic,
    WriteTopic,
    DropTopic,

    ReadFileset,
    WriteFileset,
    DropFileset,
}

impl PrivilegeName {
    /// The most specific securable object type this privilege can be bound to.
    pub fn scope(&self) -> MetadataObjectType {
        use PrivilegeName::*;
        match self {
            UseMetalake | ManageMetalake | CreateCatalog | AddUser | RemoveUser | GetUser
            | AddGroup | RemoveGroup | GetGroup | CreateRole | DeleteRole | GetRole
            | GrantRole | RevokeRole => MetadataObjectType::Metalake,
            UseCatalog | AlterCatalog | DropCatalog | CreateSchema => {
                MetadataObjectType::Catalog
            }
            UseSchema | AlterSchema | DropSchema | CreateTable | CreateTopic
            | CreateFileset => MetadataObjectType::Schema,
            ReadTable | WriteTable | DropTable => MetadataObjectType::Table,
            ReadTopic | WriteTopic | DropTopic => MetadataObjectType::Topic,
            ReadFileset | WriteFileset | DropFileset => MetadataObjectType::Fileset,
        }
    }

    /// Privileges that the creator of an object holds on it regardless of grants.
    pub fn is_manage(&self) -> bool {
        use PrivilegeName::*;
        matches!(
            self,
            ManageMetalake
                | AlterCatalog
                | DropCatalog
                | AlterSchema
                | DropSchema
                | WriteTable
                | DropTable
                | WriteTopic
                | DropTopic
                | WriteFileset
                | DropFileset
        )
    }

    /// Whether the privilege may be bound to an object of `object_type`: any type above
    /// its scope, or exactly its scope.
    pub fn binds_to(&self, object_type: MetadataObjectType) -> bool {
        let scope = self.scope();
        object_type.depth() < scope.depth() || object_type == scope
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Privilege {
    pub name: PrivilegeName,
    pub condition: Condition,
}

impl Privilege {
    pub fn allow(name: PrivilegeName) -> Self {
        Self {
            name,
            condition: Condition::Allow,
        }
    }

    pub fn deny(name: PrivilegeName) -> Self {
        Self {
            name,
            condition: Condition::Deny,
        }
    }
}

/// A metadata object together with the privileges a role grants on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurableObject {
    object: MetadataObject,
    privileges: Vec<Privilege>,
}

impl SecurableObject {
    pub fn new(object: MetadataObject, privileges: Vec<Privilege>) -> Result<Self> {
        if privileges.is_empty() {
            return Err(Error::invalid_argument(format!(
                "Securable object {object} carries no privileges"
            )));
        }
        if let Some(bad) = privileges
            .iter()
            .find(|p| !p.name.binds_to(object.object_type()))
        {
            return Err(Error::invalid_argument(format!(
                "Privilege {} cannot be bound to {}",
                bad.name, object
            )));
        }
        Ok(Self { object, privileges })
    }

    pub fn object(&self) -> &MetadataObject {
        &self.object
    }

    pub fn privileges(&self) -> &[Privilege] {
        &self.privileges
    }

    /// Condition this grant carries for `name`, DENY first if both are present.
    pub fn condition_for(&self, name: PrivilegeName) -> Option<Condition> {
        let mut found = None;
        for privilege in self.privileges.iter().filter(|p| p.name == name) {
            if privilege.condition == Condition::Deny {
                return Some(Condition::Deny);
            }
            found = Some(privilege.condition);
        }
        found
    }
}
