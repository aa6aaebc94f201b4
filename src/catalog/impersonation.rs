use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::catalog::{ConnectorError, ConnectorResult, ExternalObject, ObjectChange, ObjectOperations};
use crate::identifier::{NameIdentifier, Namespace};
use crate::principal::{current_principal, with_principal};

/// Runs a connector call on behalf of a principal.
#[async_trait]
pub trait RunAs: Send + Sync + Debug {
    async fn run_as<'a>(&'a self, principal: &'a str, call: BoxFuture<'a, ()>);
}

/// Makes the principal (optionally qualified with a realm) the current principal of
/// the call.
#[derive(Debug, Default, Clone)]
pub struct PrincipalRunAs {
    realm: Option<String>,
}

impl PrincipalRunAs {
    pub fn with_realm(realm: impl Into<String>) -> Self {
        Self {
            realm: Some(realm.into()),
        }
    }

    fn proxy_user(&self, principal: &str) -> String {
        match &self.realm {
            Some(realm) => format!("{principal}@{realm}"),
            None => principal.to_string(),
        }
    }
}

#[async_trait]
impl RunAs for PrincipalRunAs {
    async fn run_as<'a>(&'a self, principal: &'a str, call: BoxFuture<'a, ()>) {
        with_principal(self.proxy_user(principal), call).await
    }
}

/// Decorates the operations of a connector so that every call goes through `run_as`
/// with the calling principal.
pub struct ImpersonatingOperations {
    inner: Arc<dyn ObjectOperations>,
    run_as: Arc<dyn RunAs>,
}

impl ImpersonatingOperations {
    pub fn new(inner: Arc<dyn ObjectOperations>, run_as: Arc<dyn RunAs>) -> Self {
        Self { inner, run_as }
    }

    async fn call<T, F>(&self, call: F) -> ConnectorResult<T>
    where
        T: Send,
        F: Future<Output = ConnectorResult<T>> + Send,
    {
        let principal = current_principal();
        let mut result = None;
        self.run_as
            .run_as(
                &principal,
                Box::pin(async {
                    result = Some(call.await);
                }),
            )
            .await;
        result.unwrap_or_else(|| {
            Err(ConnectorError::Unavailable {
                reason: format!("run-as strategy dropped the call for {principal}"),
            })
        })
    }
}

#[async_trait]
impl ObjectOperations for ImpersonatingOperations {
    async fn list(&self, namespace: &Namespace) -> ConnectorResult<Vec<NameIdentifier>> {
        self.call(self.inner.list(namespace)).await
    }

    async fn create(
        &self,
        ident: &NameIdentifier,
        comment: Option<&str>,
        details: &serde_json::Value,
        properties: &HashMap<String, String>,
    ) -> ConnectorResult<ExternalObject> {
        self.call(self.inner.create(ident, comment, details, properties))
            .await
    }

    async fn load(&self, ident: &NameIdentifier) -> ConnectorResult<ExternalObject> {
        self.call(self.inner.load(ident)).await
    }

    async fn alter(
        &self,
        ident: &NameIdentifier,
        changes: &[ObjectChange],
    ) -> ConnectorResult<ExternalObject> {
        self.call(self.inner.alter(ident, changes)).await
    }

    async fn drop_object(&self, ident: &NameIdentifier) -> ConnectorResult<bool> {
        self.call(self.inner.drop_object(ident)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::{MemoryOperations, MemoryState};
    use crate::meta::EntityType;

    #[derive(Debug)]
    struct Refuse;

    #[async_trait]
    impl RunAs for Refuse {
        async fn run_as<'a>(&'a self, _principal: &'a str, _call: BoxFuture<'a, ()>) {}
    }

    #[tokio::test]
    async fn test_calls_run_as_the_proxy_user() {
        let state = MemoryState::new();
        let ops = ImpersonatingOperations::new(
            Arc::new(MemoryOperations::new(EntityType::Schema, state.clone())),
            Arc::new(PrincipalRunAs::with_realm("EXAMPLE.COM")),
        );

        with_principal("alice", async {
            ops.create(
                &NameIdentifier::of_schema("m", "c1", "s1"),
                None,
                &serde_json::Value::Null,
                &HashMap::new(),
            )
            .await
            .unwrap();
            // The caller's own principal is untouched.
            assert_eq!(current_principal(), "alice");
        })
        .await;

        assert_eq!(
            state.calls(),
            vec![("create".to_string(), "alice@EXAMPLE.COM".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dropped_calls_fail() {
        let ops = ImpersonatingOperations::new(
            Arc::new(MemoryOperations::new(EntityType::Schema, MemoryState::new())),
            Arc::new(Refuse),
        );
        let err = ops
            .load(&NameIdentifier::of_schema("m", "c1", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable { .. }));
    }
}
