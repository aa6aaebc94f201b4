use std::collections::HashMap;
use std::sync::Arc;

use crate::authorization::privilege::MetadataObject;
use crate::authorization::AccessGuard;
use crate::catalog::{
    CombinedObject, DispatchContext, ObjectChange, ObjectKind, OperationDispatcher,
};
use crate::error::{Error, Result};
use crate::identifier::{NameIdentifier, Namespace};

/// Checks the principal's privileges before handing operations to the dispatcher.
pub struct AuthorizedDispatcher<K: ObjectKind> {
    inner: OperationDispatcher<K>,
    guard: AccessGuard,
}

impl<K: ObjectKind> AuthorizedDispatcher<K> {
    pub fn new(context: Arc<DispatchContext>, guard: AccessGuard) -> Self {
        Self {
            inner: OperationDispatcher::new(context),
            guard,
        }
    }

    pub fn inner(&self) -> &OperationDispatcher<K> {
        &self.inner
    }

    fn object(ident: &NameIdentifier) -> Result<MetadataObject> {
        Self::owner(ident.namespace())?;
        Ok(MetadataObject::from_ident(K::OBJECT_TYPE, ident))
    }

    fn owner(namespace: &Namespace) -> Result<MetadataObject> {
        if namespace.len() != K::PARENT_TYPE.depth() {
            return Err(Error::invalid_argument(format!(
                "{} names need a {}-level namespace, got \"{namespace}\"",
                K::ENTITY_TYPE,
                K::PARENT_TYPE.depth()
            )));
        }
        let owner = NameIdentifier::of(namespace.levels())
            .ok_or_else(|| Error::invalid_argument("Empty namespace"))?;
        Ok(MetadataObject::from_ident(K::PARENT_TYPE, &owner))
    }

    pub async fn list(&self, namespace: &Namespace) -> Result<Vec<NameIdentifier>> {
        let listed = self.inner.list(namespace).await?;
        let mut visible = Vec::with_capacity(listed.len());
        for ident in listed {
            if self.guard.can(&Self::object(&ident)?, K::READ).await? {
                visible.push(ident);
            }
        }
        Ok(visible)
    }

    pub async fn create(
        &self,
        ident: &NameIdentifier,
        comment: Option<&str>,
        details: serde_json::Value,
        properties: HashMap<String, String>,
    ) -> Result<CombinedObject> {
        self.guard
            .check(&Self::owner(ident.namespace())?, K::CREATE)
            .await?;
        self.inner.create(ident, comment, details, properties).await
    }

    pub async fn load(&self, ident: &NameIdentifier) -> Result<CombinedObject> {
        self.guard.check(&Self::object(ident)?, K::READ).await?;
        self.inner.load(ident).await
    }

    pub async fn alter(
        &self,
        ident: &NameIdentifier,
        changes: &[ObjectChange],
    ) -> Result<CombinedObject> {
        self.guard.check(&Self::object(ident)?, K::ALTER).await?;
        self.inner.alter(ident, changes).await
    }

    pub async fn drop(&self, ident: &NameIdentifier) -> Result<bool> {
        self.guard.check(&Self::object(ident)?, K::DROP).await?;
        self.inner.drop(ident).await
    }
}
