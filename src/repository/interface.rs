use std::fmt::Debug;

use async_trait::async_trait;
use strum_macros::{AsRefStr, Display, EnumIter};

use crate::data_types::{EntityId, RoleId, Timestamp, Version};

/// Tables holding metadata object rows, which all share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display)]
pub enum MetaTable {
    #[strum(serialize = "metalake_meta")]
    Metalake,
    #[strum(serialize = "catalog_meta")]
    Catalog,
    #[strum(serialize = "schema_meta")]
    Schema,
    #[strum(serialize = "table_meta")]
    Table,
    #[strum(serialize = "topic_meta")]
    Topic,
    #[strum(serialize = "fileset_meta")]
    Fileset,
}

impl MetaTable {
    pub const LEAVES: [MetaTable; 3] = [MetaTable::Table, MetaTable::Topic, MetaTable::Fileset];
}

/// Users and groups: principals that roles are granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PrincipalKind {
    User,
    Group,
}

impl PrincipalKind {
    pub fn meta_table(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user_meta",
            PrincipalKind::Group => "group_meta",
        }
    }

    pub fn rel_table(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user_role_rel",
            PrincipalKind::Group => "group_role_rel",
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user_id",
            PrincipalKind::Group => "group_id",
        }
    }
}

/// Every table carrying a `deleted_at` tombstone, in the order reclamation visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum StoreTable {
    MetalakeMeta,
    CatalogMeta,
    SchemaMeta,
    TableMeta,
    TopicMeta,
    FilesetMeta,
    UserMeta,
    GroupMeta,
    RoleMeta,
    UserRoleRel,
    GroupRoleRel,
    RoleMetaSecurableObject,
}

impl StoreTable {
    pub fn is_role_table(&self) -> bool {
        matches!(
            self,
            StoreTable::RoleMeta
                | StoreTable::UserRoleRel
                | StoreTable::GroupRoleRel
                | StoreTable::RoleMetaSecurableObject
        )
    }
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub id: EntityId,
    pub parent_id: EntityId,
    pub name: String,
    pub comment: Option<String>,
    pub properties: String,
    pub audit_info: String,
    pub details: String,
    pub current_version: Version,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct PrincipalRecord {
    pub id: EntityId,
    pub metalake_id: EntityId,
    pub name: String,
    pub audit_info: String,
    pub current_version: Version,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
    pub id: RoleId,
    pub metalake_id: EntityId,
    pub name: String,
    pub properties: String,
    pub audit_info: String,
    pub current_version: Version,
}

/// One grant row of a role. `entity_id` is the surrogate id of the object the grant
/// targets, or the root id for the all-metalakes root.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct SecurableObjectRecord {
    pub entity_id: EntityId,
    pub object_type: String,
    pub privilege_names: String,
    pub privilege_conditions: String,
}

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug)]
pub enum Error {
    UniqueConstraintViolation(sqlx::Error),
    FKConstraintViolation(sqlx::Error),

    // All other errors
    SqlxError(sqlx::Error),
}

impl Error {
    pub fn is_row_not_found(&self) -> bool {
        matches!(self, Error::SqlxError(sqlx::Error::RowNotFound))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait Repository: Send + Sync + Debug {
    async fn setup(&self);

    async fn get_meta(
        &self,
        table: MetaTable,
        parent_id: EntityId,
        name: &str,
    ) -> Result<MetaRecord, Error>;

    async fn get_meta_by_id(&self, table: MetaTable, id: EntityId) -> Result<MetaRecord, Error>;

    async fn list_meta(
        &self,
        table: MetaTable,
        parent_id: EntityId,
    ) -> Result<Vec<MetaRecord>, Error>;

    async fn insert_meta(&self, table: MetaTable, record: &MetaRecord) -> Result<(), Error>;

    /// Inserts the row or, if a live row with the same parent and name exists,
    /// replaces its contents and bumps its version. The live row keeps its id.
    async fn upsert_meta(&self, table: MetaTable, record: &MetaRecord) -> Result<(), Error>;

    /// Writes `record` over the live row with the same id, provided the row is still at
    /// `expected_version`. Returns the number of rows changed.
    async fn update_meta(
        &self,
        table: MetaTable,
        record: &MetaRecord,
        expected_version: Version,
    ) -> Result<u64, Error>;

    /// Tombstones the row and everything beneath it (including, for a metalake, its
    /// users, groups and roles) in one transaction. Returns the number of rows
    /// tombstoned in `table` itself.
    async fn soft_delete_meta(&self, table: MetaTable, id: EntityId) -> Result<u64, Error>;

    async fn get_principal(
        &self,
        kind: PrincipalKind,
        metalake_id: EntityId,
        name: &str,
    ) -> Result<PrincipalRecord, Error>;

    async fn list_principals(
        &self,
        kind: PrincipalKind,
        metalake_id: EntityId,
    ) -> Result<Vec<PrincipalRecord>, Error>;

    async fn insert_principal(
        &self,
        kind: PrincipalKind,
        record: &PrincipalRecord,
    ) -> Result<(), Error>;

    /// Tombstones the principal and its role memberships.
    async fn soft_delete_principal(
        &self,
        kind: PrincipalKind,
        id: EntityId,
    ) -> Result<u64, Error>;

    /// Adds and removes role memberships and bumps the principal's version, in one
    /// transaction guarded by `expected_version`.
    async fn update_principal_roles(
        &self,
        kind: PrincipalKind,
        id: EntityId,
        expected_version: Version,
        audit_info: &str,
        add: &[RoleId],
        remove: &[RoleId],
    ) -> Result<(), Error>;

    async fn get_role(&self, metalake_id: EntityId, name: &str) -> Result<RoleRecord, Error>;

    async fn list_roles_by_principal(
        &self,
        kind: PrincipalKind,
        principal_id: EntityId,
    ) -> Result<Vec<RoleRecord>, Error>;

    async fn list_securable_objects(
        &self,
        role_id: RoleId,
    ) -> Result<Vec<SecurableObjectRecord>, Error>;

    /// Writes the role row and its grant rows as one unit. With `overwrite`, a live
    /// role of the same name keeps its id, its previous grants are tombstoned and
    /// replaced. Returns the id the role is stored under.
    async fn insert_role(
        &self,
        role: &RoleRecord,
        objects: &[SecurableObjectRecord],
        overwrite: bool,
    ) -> Result<RoleId, Error>;

    /// Tombstones the role, its membership rows and its grant rows.
    async fn soft_delete_role(&self, role_id: RoleId) -> Result<u64, Error>;

    /// Physically removes at most `limit` rows of `table` tombstoned before `cutoff`.
    async fn hard_delete_legacy(
        &self,
        table: StoreTable,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<u64, Error>;
}
