//! Connector backed by process memory, serving schemas, tables, topics and filesets.
//!
//! All kinds of one catalog share a [`MemoryState`], so leaves need their schema to exist
//! and dropping a schema drops everything in it. Objects can be seeded directly into the
//! state to stand in for objects created outside of lakeward.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::catalog::{
    CatalogConnector, ConnectorError, ConnectorResult, ExternalObject, ObjectChange,
    ObjectOperations, PropertyEntry, PropertySchema,
};
use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace};
use crate::meta::{CatalogEntity, EntityType};
use crate::principal::current_principal;

pub const MEMORY_PROVIDER: &str = "memory";

/// Catalog property listing the kinds (comma-separated) whose existence the metadata
/// store is authoritative for.
pub const MANAGED_STORAGE_KEY: &str = "managed-storage";
const DEFAULT_MANAGED_STORAGE: &str = "topic";

/// Fileset property naming its storage location, fixed at creation.
pub const FILESET_LOCATION_KEY: &str = "location";

const SERVED_KINDS: [EntityType; 4] = [
    EntityType::Schema,
    EntityType::Table,
    EntityType::Topic,
    EntityType::Fileset,
];

type ObjectKey = (EntityType, String);

#[derive(Debug, Default)]
pub struct MemoryState {
    objects: RwLock<BTreeMap<ObjectKey, (NameIdentifier, ExternalObject)>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MemoryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Places an object into the external system without going through lakeward.
    pub fn insert_external(&self, kind: EntityType, ident: &NameIdentifier, object: ExternalObject) {
        self.objects
            .write()
            .insert((kind, ident.to_string()), (ident.clone(), object));
    }

    pub fn get_external(&self, kind: EntityType, ident: &NameIdentifier) -> Option<ExternalObject> {
        self.objects
            .read()
            .get(&(kind, ident.to_string()))
            .map(|(_, o)| o.clone())
    }

    /// Removes an object from the external system without going through lakeward.
    pub fn remove_external(&self, kind: EntityType, ident: &NameIdentifier) -> bool {
        self.objects
            .write()
            .remove(&(kind, ident.to_string()))
            .is_some()
    }

    /// (operation, principal) of every connector call so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    fn record_call(&self, operation: &str) {
        self.calls
            .lock()
            .push((operation.to_string(), current_principal()));
    }

    fn contains(&self, kind: EntityType, ident: &NameIdentifier) -> bool {
        self.objects.read().contains_key(&(kind, ident.to_string()))
    }
}

pub struct MemoryOperations {
    kind: EntityType,
    state: Arc<MemoryState>,
}

impl MemoryOperations {
    pub fn new(kind: EntityType, state: Arc<MemoryState>) -> Self {
        Self { kind, state }
    }

    fn no_such_object(&self, ident: &NameIdentifier) -> ConnectorError {
        ConnectorError::NoSuchObject {
            kind: self.kind,
            name: ident.to_string(),
        }
    }

    fn check_parent(&self, namespace: &Namespace) -> ConnectorResult<()> {
        if self.kind == EntityType::Schema {
            return Ok(());
        }
        let schema = NameIdentifier::of(namespace.levels()).filter(|_| namespace.len() == 3);
        match schema {
            Some(schema) if self.state.contains(EntityType::Schema, &schema) => Ok(()),
            _ => Err(ConnectorError::NoSuchNamespace {
                name: namespace.to_string(),
            }),
        }
    }
}

fn apply_changes(object: &mut ExternalObject, changes: &[ObjectChange]) {
    for change in changes {
        match change {
            ObjectChange::UpdateComment(comment) => object.comment = Some(comment.clone()),
            ObjectChange::SetProperty { key, value } => {
                object.properties.insert(key.clone(), value.clone());
            }
            ObjectChange::RemoveProperty(key) => {
                object.properties.remove(key);
            }
        }
    }
}

#[async_trait]
impl ObjectOperations for MemoryOperations {
    async fn list(&self, namespace: &Namespace) -> ConnectorResult<Vec<NameIdentifier>> {
        self.state.record_call("list");
        self.check_parent(namespace)?;
        Ok(self
            .state
            .objects
            .read()
            .iter()
            .filter(|((kind, _), (ident, _))| *kind == self.kind && ident.namespace() == namespace)
            .map(|(_, (ident, _))| ident.clone())
            .collect())
    }

    async fn create(
        &self,
        ident: &NameIdentifier,
        comment: Option<&str>,
        details: &serde_json::Value,
        properties: &HashMap<String, String>,
    ) -> ConnectorResult<ExternalObject> {
        self.state.record_call("create");
        self.check_parent(ident.namespace())?;

        let mut objects = self.state.objects.write();
        let key = (self.kind, ident.to_string());
        if objects.contains_key(&key) {
            return Err(ConnectorError::AlreadyExists {
                kind: self.kind,
                name: ident.to_string(),
            });
        }
        let object = ExternalObject {
            name: ident.name().to_string(),
            comment: comment.map(str::to_string),
            properties: properties.clone(),
            details: details.clone(),
            audit: None,
        };
        objects.insert(key, (ident.clone(), object.clone()));
        Ok(object)
    }

    async fn load(&self, ident: &NameIdentifier) -> ConnectorResult<ExternalObject> {
        self.state.record_call("load");
        self.state
            .get_external(self.kind, ident)
            .ok_or_else(|| self.no_such_object(ident))
    }

    async fn alter(
        &self,
        ident: &NameIdentifier,
        changes: &[ObjectChange],
    ) -> ConnectorResult<ExternalObject> {
        self.state.record_call("alter");
        let mut objects = self.state.objects.write();
        let (_, object) = objects
            .get_mut(&(self.kind, ident.to_string()))
            .ok_or_else(|| self.no_such_object(ident))?;
        apply_changes(object, changes);
        Ok(object.clone())
    }

    async fn drop_object(&self, ident: &NameIdentifier) -> ConnectorResult<bool> {
        self.state.record_call("drop");
        let mut objects = self.state.objects.write();
        let dropped = objects.remove(&(self.kind, ident.to_string())).is_some();
        if dropped && self.kind == EntityType::Schema {
            let children = Namespace::of(&ident.levels());
            objects.retain(|_, (child, _)| child.namespace() != &children);
        }
        Ok(dropped)
    }
}

fn parse_managed_storage(catalog: &CatalogEntity) -> Result<Vec<EntityType>> {
    let value = catalog
        .properties
        .get(MANAGED_STORAGE_KEY)
        .map(String::as_str)
        .unwrap_or(DEFAULT_MANAGED_STORAGE);
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<EntityType>()
                .ok()
                .filter(|kind| SERVED_KINDS.contains(kind))
                .ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "Catalog {}: {s:?} in {MANAGED_STORAGE_KEY} is not an object kind",
                        catalog.name
                    ))
                })
        })
        .collect()
}

/// Builds a connector over `state` for `catalog`.
pub fn memory_connector(catalog: &CatalogEntity, state: Arc<MemoryState>) -> Result<CatalogConnector> {
    let mut connector = SERVED_KINDS.iter().fold(CatalogConnector::default(), |c, kind| {
        c.with_operations(*kind, Arc::new(MemoryOperations::new(*kind, state.clone())))
    });
    connector = connector.with_property_schema(
        EntityType::Fileset,
        PropertySchema::new(vec![PropertyEntry::optional(
            FILESET_LOCATION_KEY,
            "Storage location of the fileset",
        )
        .required()
        .immutable()]),
    );
    for kind in parse_managed_storage(catalog)? {
        connector = connector.with_managed_storage(kind);
    }
    Ok(connector)
}
