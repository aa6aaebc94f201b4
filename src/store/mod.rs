use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace};
use crate::meta::{Entity, EntityType};
use crate::repository::interface::Error as RepositoryError;

pub mod id;
pub mod relational;
mod resolver;
pub mod role;

pub use id::{IdGenerator, RandomIdGenerator};
pub use relational::RelationalEntityStore;
pub use resolver::IdResolver;
pub use role::RoleMetaService;

/// Transforms a stored entity into its updated version. Must keep the id and type.
pub type EntityMutator = Box<dyn FnOnce(Entity) -> Result<Entity> + Send>;

/// Durable, versioned, soft-deleting persistence for every entity, addressed by
/// hierarchical name.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn exists(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool> {
        match self.get(ident, entity_type).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<Entity>;

    /// Writes the entity. Without `overwrite`, an existing live entity with the same
    /// name is `AlreadyExists`; with it, that entity is replaced.
    async fn put(&self, entity: Entity, overwrite: bool) -> Result<()>;

    /// Reads the entity, applies `mutator` and writes the result back guarded by the
    /// version that was read. A concurrent writer makes this fail instead of being
    /// silently overwritten.
    async fn update(
        &self,
        ident: &NameIdentifier,
        entity_type: EntityType,
        mutator: EntityMutator,
    ) -> Result<Entity>;

    /// `NotFound` if the entity (or one of its parents) doesn't exist.
    async fn delete(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool>;

    async fn list(&self, namespace: &Namespace, entity_type: EntityType) -> Result<Vec<Entity>>;
}

/// Interprets a repository error for an operation on a known entity.
pub(crate) fn interpret<'a>(
    operation: &'static str,
    entity_type: EntityType,
    ident: &'a NameIdentifier,
) -> impl FnOnce(RepositoryError) -> Error + 'a {
    move |err| match err {
        RepositoryError::UniqueConstraintViolation(_) => {
            Error::already_exists(entity_type, ident)
        }
        RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
            Error::not_found(entity_type, ident)
        }
        RepositoryError::FKConstraintViolation(e) | RepositoryError::SqlxError(e) => {
            Error::storage(operation, ident, e)
        }
    }
}

/// Error for a guarded write that found the row at a different version.
pub(crate) fn concurrent_modification(
    operation: &str,
    entity_type: EntityType,
    ident: &NameIdentifier,
) -> Error {
    Error::storage(
        operation,
        ident,
        format!("{entity_type} was concurrently modified or removed"),
    )
}

/// Wraps a repository error for an operation whose target has no entity name.
pub(crate) fn storage_failure(
    operation: &'static str,
    target: impl ToString,
) -> impl FnOnce(RepositoryError) -> Error {
    move |err| match err {
        RepositoryError::UniqueConstraintViolation(e)
        | RepositoryError::FKConstraintViolation(e)
        | RepositoryError::SqlxError(e) => Error::storage(operation, target, e),
    }
}
