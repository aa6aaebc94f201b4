//! Keeps the metadata store in step with external catalogs for one kind of object.
//!
//! The external system decides whether an object exists. The store record, tied to the
//! external object by the [`StringIdentifier`] embedded in its properties, carries what
//! lakeward adds on top (surrogate id, audit). Objects without a matching record are
//! imported on load when their parent is managed.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use metrics::{counter, describe_counter};
use tracing::{debug, error, info, warn};

use crate::authorization::privilege::MetadataObjectType;
use crate::catalog::{
    CatalogConnector, CatalogManager, ExternalObject, ObjectChange, ObjectKind, ObjectOperations,
};
use crate::data_types::EntityId;
use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace, StringIdentifier, ID_KEY};
use crate::lock::{LockType, TreeLock};
use crate::meta::{AuditInfo, Entity, EntityType, ObjectEntity};
use crate::principal::current_principal;
use crate::store::{EntityStore, IdGenerator};

const RECONCILIATION_EVENTS: &str = "lakeward_reconciliation_events_total";

/// What every dispatcher shares.
pub struct DispatchContext {
    pub catalogs: Arc<CatalogManager>,
    pub store: Arc<dyn EntityStore>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub tree_lock: Arc<TreeLock>,
}

struct ReconciliationMetrics {}

impl ReconciliationMetrics {
    fn new() -> Self {
        describe_counter!(
            RECONCILIATION_EVENTS,
            "Differences found and repaired between external catalogs and the metadata store"
        );
        Self {}
    }

    fn record(&self, kind: EntityType, event: &'static str) {
        counter!(
            RECONCILIATION_EVENTS,
            "kind" => kind.to_string(),
            "event" => event
        )
        .increment(1);
    }
}

/// An external object together with its store record, if it's managed.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedObject {
    object: ExternalObject,
    entity: Option<ObjectEntity>,
}

impl CombinedObject {
    fn new(
        connector: &CatalogConnector,
        kind: EntityType,
        object: ExternalObject,
        entity: Option<ObjectEntity>,
    ) -> Self {
        let properties = connector
            .property_schema(kind)
            .strip_hidden(&object.properties);
        Self {
            object: ExternalObject { properties, ..object },
            entity,
        }
    }

    pub fn name(&self) -> &str {
        &self.object.name
    }

    pub fn comment(&self) -> Option<&str> {
        self.object.comment.as_deref()
    }

    /// Properties with the keys the connector declares hidden removed.
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.object.properties
    }

    pub fn details(&self) -> &serde_json::Value {
        &self.object.details
    }

    pub fn id(&self) -> Option<EntityId> {
        self.entity.as_ref().map(|e| e.id)
    }

    pub fn audit(&self) -> Option<&AuditInfo> {
        self.entity
            .as_ref()
            .map(|e| &e.audit)
            .or(self.object.audit.as_ref())
    }

    pub fn is_managed(&self) -> bool {
        self.entity.is_some()
    }

    pub fn entity(&self) -> Option<&ObjectEntity> {
        self.entity.as_ref()
    }
}

/// The reconciliation steps for one kind of object. Not generic over the kind, so
/// that loading a leaf can import its schema.
struct Reconciler {
    context: Arc<DispatchContext>,
    kind: EntityType,
    parent: MetadataObjectType,
    metrics: ReconciliationMetrics,
}

impl Reconciler {
    fn new(context: Arc<DispatchContext>, kind: EntityType, parent: MetadataObjectType) -> Self {
        Self {
            context,
            kind,
            parent,
            metrics: ReconciliationMetrics::new(),
        }
    }

    /// Identifier of the object that owns `namespace`, checked against this kind.
    fn owner_of(&self, namespace: &Namespace) -> Result<NameIdentifier> {
        if namespace.len() != self.parent.depth() {
            return Err(Error::invalid_argument(format!(
                "{} names need a {}-level namespace, got \"{namespace}\"",
                self.kind,
                self.parent.depth()
            )));
        }
        NameIdentifier::of(namespace.levels())
            .ok_or_else(|| Error::invalid_argument("Empty namespace"))
    }

    /// Resolved without holding any tree lock; the catalog manager takes its own.
    async fn connector(&self, ident: &NameIdentifier) -> Result<Arc<CatalogConnector>> {
        let catalog = ident.catalog_identifier().ok_or_else(|| {
            Error::invalid_argument(format!("{ident} is not within a catalog"))
        })?;
        self.context.catalogs.connector(&catalog).await
    }

    fn embedded_id(
        &self,
        ident: &NameIdentifier,
        object: &ExternalObject,
    ) -> Option<StringIdentifier> {
        match StringIdentifier::from_properties(&object.properties) {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    %ident,
                    kind = %self.kind,
                    error = %e,
                    "Ignoring malformed correlation key"
                );
                None
            }
        }
    }

    /// The live store record at `ident`, whichever object it was written for.
    async fn stored_entity(&self, ident: &NameIdentifier) -> Result<Option<ObjectEntity>> {
        let entity = match self.context.store.get(ident, self.kind).await {
            Ok(entity) => entity,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        entity
            .into_object()
            .map(Some)
            .ok_or_else(|| Error::internal(format!("{ident} is not a metadata object")))
    }

    fn matches(
        &self,
        ident: &NameIdentifier,
        entity: &ObjectEntity,
        embedded: Option<StringIdentifier>,
    ) -> bool {
        match embedded {
            Some(id) if id.id() != entity.id => {
                warn!(
                    %ident,
                    kind = %self.kind,
                    store_id = entity.id,
                    external_id = id.id(),
                    "Store record doesn't match the external object"
                );
                self.metrics.record(self.kind, "id_mismatch");
                false
            }
            _ => true,
        }
    }

    /// The store record matching the external object, if there is one.
    async fn managed_entity(
        &self,
        ident: &NameIdentifier,
        embedded: Option<StringIdentifier>,
    ) -> Result<Option<ObjectEntity>> {
        Ok(self
            .stored_entity(ident)
            .await?
            .filter(|entity| self.matches(ident, entity, embedded)))
    }

    /// The external object and its matching store record, under a READ lock.
    async fn read(
        &self,
        ident: &NameIdentifier,
        ops: &dyn ObjectOperations,
    ) -> Result<(ExternalObject, Option<ObjectEntity>)> {
        self.context
            .tree_lock
            .with_lock(ident, LockType::Read, || async {
                let object = ops.load(ident).await?;
                let embedded = self.embedded_id(ident, &object);
                let entity = self.managed_entity(ident, embedded).await?;
                Ok((object, entity))
            })
            .await
    }

    /// Points the external object's correlation key at `id`.
    async fn stamp(&self, ident: &NameIdentifier, ops: &dyn ObjectOperations, id: EntityId) {
        let change = ObjectChange::SetProperty {
            key: ID_KEY.to_string(),
            value: StringIdentifier::from_id(id).to_string(),
        };
        if let Err(e) = ops.alter(ident, &[change]).await {
            warn!(%ident, kind = %self.kind, id, error = %e, "Failed to update the correlation key");
        }
    }

    /// Writes a store record for an unmanaged object, under a WRITE lock on its owner.
    ///
    /// A live record already at the name keeps its id, so grants made against it still
    /// apply. Otherwise the embedded id is reused unless another row, live or deleted,
    /// holds it.
    async fn import(
        &self,
        ident: &NameIdentifier,
        connector: &CatalogConnector,
    ) -> Result<Option<ObjectEntity>> {
        let owner = self.owner_of(ident.namespace())?;
        let ops = connector.operations(self.kind);
        self.context
            .tree_lock
            .with_lock(&owner, LockType::Write, || async {
                let object = ops.load(ident).await?;
                let embedded = self.embedded_id(ident, &object);
                let stored = self.stored_entity(ident).await?;
                if let Some(entity) = stored.as_ref() {
                    if self.matches(ident, entity, embedded) {
                        return Ok(stored);
                    }
                }

                let id = match (&stored, embedded) {
                    (Some(entity), _) => entity.id,
                    (None, Some(embedded)) => embedded.id(),
                    (None, None) => self.context.id_generator.next_id(),
                };
                let mut entity = ObjectEntity {
                    id,
                    entity_type: self.kind,
                    namespace: ident.namespace().clone(),
                    name: ident.name().to_string(),
                    comment: object.comment.clone(),
                    audit: object
                        .audit
                        .clone()
                        .unwrap_or_else(|| AuditInfo::created_by(&current_principal())),
                    details: object.details.clone(),
                };
                match self.context.store.put(entity.clone().into(), true).await {
                    Ok(()) => {}
                    Err(e) if e.is_already_exists() && stored.is_none() => {
                        entity.id = self.context.id_generator.next_id();
                        debug!(
                            %ident,
                            kind = %self.kind,
                            taken = id,
                            id = entity.id,
                            "Embedded id is taken, importing under a new one"
                        );
                        self.context.store.put(entity.clone().into(), true).await?;
                    }
                    Err(e) => return Err(e),
                }
                if embedded.map(|e| e.id()) != Some(entity.id) {
                    self.stamp(ident, ops.as_ref(), entity.id).await;
                }

                info!(%ident, kind = %self.kind, id = entity.id, "Imported external object");
                self.metrics.record(self.kind, "import");
                Ok(Some(entity))
            })
            .await
    }

    /// Imports an unmanaged object. Failures other than the object going missing leave
    /// it unmanaged.
    async fn try_import(
        &self,
        ident: &NameIdentifier,
        connector: &CatalogConnector,
    ) -> Result<Option<ObjectEntity>> {
        match self.import(ident, connector).await {
            Ok(entity) => Ok(entity),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                warn!(%ident, kind = %self.kind, error = %e, "Import failed");
                self.metrics.record(self.kind, "import_failed");
                Ok(None)
            }
        }
    }

    /// Whether a schema has a store record, importing it when its catalog is managed.
    async fn schema_is_managed(&self, schema: &NameIdentifier) -> Result<bool> {
        let schemas = Reconciler::new(
            self.context.clone(),
            EntityType::Schema,
            MetadataObjectType::Catalog,
        );
        let connector = schemas.connector(schema).await?;
        let ops = connector.operations(EntityType::Schema);
        if schemas.read(schema, ops.as_ref()).await?.1.is_some() {
            return Ok(true);
        }
        let catalog = schemas.owner_of(schema.namespace())?;
        if !self.context.store.exists(&catalog, EntityType::Catalog).await? {
            return Ok(false);
        }
        Ok(schemas.try_import(schema, &connector).await?.is_some())
    }

    /// Whether the owner of the object's namespace has a store record, importing an
    /// unmanaged schema on the way.
    async fn owner_is_managed(&self, ident: &NameIdentifier) -> Result<bool> {
        let owner = self.owner_of(ident.namespace())?;
        if self.kind == EntityType::Schema {
            return self.context.store.exists(&owner, EntityType::Catalog).await;
        }
        self.schema_is_managed(&owner).await
    }
}

pub struct OperationDispatcher<K: ObjectKind> {
    context: Arc<DispatchContext>,
    reconciler: Reconciler,
    kind: PhantomData<K>,
}

impl<K: ObjectKind> OperationDispatcher<K> {
    pub fn new(context: Arc<DispatchContext>) -> Self {
        Self {
            reconciler: Reconciler::new(context.clone(), K::ENTITY_TYPE, K::PARENT_TYPE),
            context,
            kind: PhantomData,
        }
    }

    fn combine(
        &self,
        connector: &CatalogConnector,
        object: ExternalObject,
        entity: Option<ObjectEntity>,
    ) -> CombinedObject {
        CombinedObject::new(connector, K::ENTITY_TYPE, object, entity)
    }

    pub async fn list(&self, namespace: &Namespace) -> Result<Vec<NameIdentifier>> {
        let owner = self.reconciler.owner_of(namespace)?;
        let connector = self.reconciler.connector(&owner).await?;
        let ops = connector.operations(K::ENTITY_TYPE);
        self.context
            .tree_lock
            .with_lock(&owner, LockType::Read, || async {
                Ok(ops.list(namespace).await?)
            })
            .await
    }

    pub async fn create(
        &self,
        ident: &NameIdentifier,
        comment: Option<&str>,
        details: serde_json::Value,
        properties: HashMap<String, String>,
    ) -> Result<CombinedObject> {
        let owner = self.reconciler.owner_of(ident.namespace())?;
        let connector = self.reconciler.connector(ident).await?;
        connector
            .property_schema(K::ENTITY_TYPE)
            .validate_for_create(&properties)?;
        if K::ENTITY_TYPE != EntityType::Schema && !self.reconciler.owner_is_managed(ident).await? {
            warn!(%ident, kind = %K::ENTITY_TYPE, "Creating under an unmanaged schema");
        }

        let ops = connector.operations(K::ENTITY_TYPE);
        self.context
            .tree_lock
            .with_lock(&owner, LockType::Write, || async {
                // A record left behind by an object dropped outside lakeward keeps its id
                let id = match self.reconciler.stored_entity(ident).await? {
                    Some(stale) => {
                        debug!(%ident, kind = %K::ENTITY_TYPE, id = stale.id, "Reusing a stale record");
                        stale.id
                    }
                    None => self.context.id_generator.next_id(),
                };
                let properties = StringIdentifier::from_id(id).with_properties(&properties);
                ops.create(ident, comment, &details, &properties).await?;
                let object = ops.load(ident).await?;

                let entity = ObjectEntity {
                    id,
                    entity_type: K::ENTITY_TYPE,
                    namespace: ident.namespace().clone(),
                    name: ident.name().to_string(),
                    comment: object.comment.clone(),
                    audit: AuditInfo::created_by(&current_principal()),
                    details: object.details.clone(),
                };
                match self.context.store.put(entity.clone().into(), true).await {
                    Ok(()) => Ok(self.combine(&connector, object, Some(entity))),
                    Err(e) => {
                        error!(
                            %ident,
                            kind = %K::ENTITY_TYPE,
                            id,
                            error = %e,
                            "Created externally but failed to write the store record"
                        );
                        self.reconciler
                            .metrics
                            .record(K::ENTITY_TYPE, "store_write_failed");
                        Ok(self.combine(&connector, object, None))
                    }
                }
            })
            .await
    }

    pub async fn load(&self, ident: &NameIdentifier) -> Result<CombinedObject> {
        self.reconciler.owner_of(ident.namespace())?;
        let connector = self.reconciler.connector(ident).await?;
        let ops = connector.operations(K::ENTITY_TYPE);

        let (object, entity) = self.reconciler.read(ident, ops.as_ref()).await?;
        if entity.is_some() {
            return Ok(self.combine(&connector, object, entity));
        }

        // Importing needs a WRITE lock on the owner, so the READ lock is released first.
        let imported = if self.reconciler.owner_is_managed(ident).await? {
            self.reconciler.try_import(ident, &connector).await?
        } else {
            debug!(%ident, kind = %K::ENTITY_TYPE, "Owner is unmanaged, not importing");
            None
        };
        match imported {
            Some(entity) => {
                // Reflect what was imported, which may be newer than the first read.
                let object = ops.load(ident).await.unwrap_or(object);
                Ok(self.combine(&connector, object, Some(entity)))
            }
            None => Ok(self.combine(&connector, object, None)),
        }
    }

    pub async fn alter(
        &self,
        ident: &NameIdentifier,
        changes: &[ObjectChange],
    ) -> Result<CombinedObject> {
        self.reconciler.owner_of(ident.namespace())?;
        let connector = self.reconciler.connector(ident).await?;
        connector
            .property_schema(K::ENTITY_TYPE)
            .validate_for_alter(changes)?;

        let ops = connector.operations(K::ENTITY_TYPE);
        self.context
            .tree_lock
            .with_lock(ident, LockType::Write, || async {
                ops.alter(ident, changes).await?;
                let object = ops.load(ident).await?;

                let Some(embedded) = self.reconciler.embedded_id(ident, &object) else {
                    debug!(%ident, kind = %K::ENTITY_TYPE, "Altered an unmanaged object");
                    return Ok(self.combine(&connector, object, None));
                };
                if self
                    .reconciler
                    .managed_entity(ident, Some(embedded))
                    .await?
                    .is_none()
                {
                    return Ok(self.combine(&connector, object, None));
                }

                let comment = object.comment.clone();
                let details = object.details.clone();
                let principal = current_principal();
                let updated = self
                    .context
                    .store
                    .update(
                        ident,
                        K::ENTITY_TYPE,
                        Box::new(move |entity: Entity| {
                            let mut entity = entity.into_object().ok_or_else(|| {
                                Error::internal("store returned a different kind of entity")
                            })?;
                            entity.comment = comment;
                            entity.details = details;
                            entity.audit = entity.audit.modified_by(&principal);
                            Ok(entity.into())
                        }),
                    )
                    .await;
                match updated {
                    Ok(entity) => Ok(self.combine(&connector, object, entity.into_object())),
                    Err(e) if e.is_not_found() => {
                        warn!(%ident, kind = %K::ENTITY_TYPE, "Store record vanished during alter");
                        Ok(self.combine(&connector, object, None))
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Drops the object from the external system and its record from the store. Kinds
    /// with managed storage report whether the record existed; the others report
    /// whether the external object existed.
    pub async fn drop(&self, ident: &NameIdentifier) -> Result<bool> {
        self.reconciler.owner_of(ident.namespace())?;
        let connector = self.reconciler.connector(ident).await?;
        let ops = connector.operations(K::ENTITY_TYPE);
        self.context
            .tree_lock
            .with_lock(ident, LockType::Write, || async {
                let dropped_external = ops.drop_object(ident).await?;
                let dropped_record = match self.context.store.delete(ident, K::ENTITY_TYPE).await {
                    Ok(dropped) => dropped,
                    Err(e) if e.is_not_found() => {
                        warn!(%ident, kind = %K::ENTITY_TYPE, "No store record to drop");
                        false
                    }
                    Err(e) => return Err(e),
                };
                debug!(%ident, kind = %K::ENTITY_TYPE, dropped_external, dropped_record, "Dropped");

                if connector.is_managed_storage(K::ENTITY_TYPE) {
                    Ok(dropped_record)
                } else {
                    Ok(dropped_external)
                }
            })
            .await
    }
}
