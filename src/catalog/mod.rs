use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::identifier::{NameIdentifier, Namespace};
use crate::meta::{AuditInfo, EntityType};

pub mod authorized;
pub mod dispatcher;
pub mod impersonation;
pub mod kind;
pub mod manager;
pub mod memory;
pub mod properties;

pub use authorized::AuthorizedDispatcher;
pub use dispatcher::{CombinedObject, DispatchContext, OperationDispatcher};
pub use kind::{FilesetKind, ObjectKind, SchemaKind, TableKind, TopicKind};
pub use manager::CatalogManager;
pub use properties::{PropertyEntry, PropertySchema};

/// Catalog property that routes every connector call through the run-as strategy.
pub const IMPERSONATION_ENABLE: &str = "impersonation-enable";

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("{kind} {name:?} doesn't exist in the external catalog")]
    NoSuchObject { kind: EntityType, name: String },

    #[error("Namespace {name:?} doesn't exist in the external catalog")]
    NoSuchNamespace { name: String },

    #[error("{kind} {name:?} already exists in the external catalog")]
    AlreadyExists { kind: EntityType, name: String },

    #[error("{reason}")]
    InvalidArgument { reason: String },

    #[error("Connector method not supported: {reason}")]
    Unsupported { reason: String },

    #[error("External catalog unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl From<ConnectorError> for Error {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NoSuchObject { kind, name } => Error::not_found(kind, name),
            ConnectorError::NoSuchNamespace { name } => Error::not_found("namespace", name),
            ConnectorError::AlreadyExists { kind, name } => Error::already_exists(kind, name),
            ConnectorError::InvalidArgument { reason } => Error::invalid_argument(reason),
            e @ ConnectorError::Unsupported { .. } => Error::invalid_argument(e.to_string()),
            e @ ConnectorError::Unavailable { .. } => Error::storage("connector call", "external catalog", e),
        }
    }
}

fn not_impl<T>() -> ConnectorResult<T> {
    Err(ConnectorError::Unsupported {
        reason: "this catalog doesn't serve objects of this kind".to_string(),
    })
}

/// An object as the external system reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalObject {
    pub name: String,
    pub comment: Option<String>,
    pub properties: HashMap<String, String>,
    /// Kind-specific layout (columns, partitions, storage location...).
    pub details: serde_json::Value,
    /// Audit data the external system keeps, if any.
    pub audit: Option<AuditInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectChange {
    UpdateComment(String),
    SetProperty { key: String, value: String },
    RemoveProperty(String),
}

impl ObjectChange {
    pub fn property_key(&self) -> Option<&str> {
        match self {
            ObjectChange::UpdateComment(_) => None,
            ObjectChange::SetProperty { key, .. } | ObjectChange::RemoveProperty(key) => {
                Some(key)
            }
        }
    }
}

/// Operations a connector offers for one kind of object.
#[async_trait]
pub trait ObjectOperations: Sync + Send {
    async fn list(&self, _namespace: &Namespace) -> ConnectorResult<Vec<NameIdentifier>> {
        not_impl()
    }

    async fn create(
        &self,
        _ident: &NameIdentifier,
        _comment: Option<&str>,
        _details: &serde_json::Value,
        _properties: &HashMap<String, String>,
    ) -> ConnectorResult<ExternalObject> {
        not_impl()
    }

    async fn load(&self, _ident: &NameIdentifier) -> ConnectorResult<ExternalObject> {
        not_impl()
    }

    async fn alter(
        &self,
        _ident: &NameIdentifier,
        _changes: &[ObjectChange],
    ) -> ConnectorResult<ExternalObject> {
        not_impl()
    }

    async fn drop_object(&self, _ident: &NameIdentifier) -> ConnectorResult<bool> {
        not_impl()
    }
}

/// Stand-in for kinds a connector doesn't serve.
#[derive(Debug, Clone, Default)]
pub struct UnsupportedOperations {}

#[async_trait]
impl ObjectOperations for UnsupportedOperations {}

/// A live connection to one external catalog: its per-kind operations and the
/// property schemas and capabilities it declares.
#[derive(Clone)]
pub struct CatalogConnector {
    operations: HashMap<EntityType, Arc<dyn ObjectOperations>>,
    property_schemas: HashMap<EntityType, PropertySchema>,
    /// Kinds whose existence only the metadata store tracks meaningfully.
    managed_storage: HashSet<EntityType>,
    default_schema: PropertySchema,
}

impl std::fmt::Debug for CatalogConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogConnector")
            .field("kinds", &self.operations.keys().collect::<Vec<_>>())
            .field("managed_storage", &self.managed_storage)
            .finish()
    }
}

impl Default for CatalogConnector {
    fn default() -> Self {
        Self {
            operations: HashMap::new(),
            property_schemas: HashMap::new(),
            managed_storage: HashSet::new(),
            default_schema: PropertySchema::default(),
        }
    }
}

impl CatalogConnector {
    pub fn with_operations(
        mut self,
        kind: EntityType,
        operations: Arc<dyn ObjectOperations>,
    ) -> Self {
        self.operations.insert(kind, operations);
        self
    }

    pub fn with_property_schema(mut self, kind: EntityType, schema: PropertySchema) -> Self {
        self.property_schemas.insert(kind, schema);
        self
    }

    pub fn with_managed_storage(mut self, kind: EntityType) -> Self {
        self.managed_storage.insert(kind);
        self
    }

    pub fn operations(&self, kind: EntityType) -> Arc<dyn ObjectOperations> {
        self.operations
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(UnsupportedOperations::default()))
    }

    pub fn property_schema(&self, kind: EntityType) -> &PropertySchema {
        self.property_schemas
            .get(&kind)
            .unwrap_or(&self.default_schema)
    }

    pub fn is_managed_storage(&self, kind: EntityType) -> bool {
        self.managed_storage.contains(&kind)
    }

    /// Wraps every kind's operations so that they run as the calling principal.
    pub fn with_impersonation(mut self, run_as: Arc<dyn impersonation::RunAs>) -> Self {
        self.operations = self
            .operations
            .into_iter()
            .map(|(kind, ops)| {
                let wrapped: Arc<dyn ObjectOperations> = Arc::new(
                    impersonation::ImpersonatingOperations::new(ops, run_as.clone()),
                );
                (kind, wrapped)
            })
            .collect();
        self
    }
}
