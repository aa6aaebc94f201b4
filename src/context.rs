use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::authorization::group_mapping::GroupMappingRegistry;
use crate::authorization::{
    AccessControlManager, AccessGuard, Authorizer, PassThroughAuthorizer, RoleBasedAuthorizer,
};
use crate::catalog::impersonation::RunAs;
use crate::catalog::{
    AuthorizedDispatcher, CatalogManager, DispatchContext, FilesetKind, SchemaKind, TableKind,
    TopicKind,
};
use crate::config::schema::LakewardConfig;
use crate::error::Result;
use crate::gc::Reclaimer;
use crate::lock::TreeLock;
use crate::metalake::MetalakeManager;
use crate::repository::interface::Repository;
use crate::store::{EntityStore, IdGenerator, RelationalEntityStore};

/// Every component of the governance core, constructed once and shared by reference.
pub struct GovernanceContext {
    pub config: LakewardConfig,
    pub store: Arc<dyn EntityStore>,
    pub tree_lock: Arc<TreeLock>,
    pub access_control: Arc<AccessControlManager>,
    pub guard: AccessGuard,
    pub metalakes: MetalakeManager,
    pub catalogs: Arc<CatalogManager>,
    pub schemas: AuthorizedDispatcher<SchemaKind>,
    pub tables: AuthorizedDispatcher<TableKind>,
    pub topics: AuthorizedDispatcher<TopicKind>,
    pub filesets: AuthorizedDispatcher<FilesetKind>,
    pub reclaimer: Arc<Reclaimer>,
}

impl GovernanceContext {
    pub fn new(
        config: LakewardConfig,
        repository: Arc<dyn Repository>,
        id_generator: Arc<dyn IdGenerator>,
        run_as: Arc<dyn RunAs>,
    ) -> Result<Self> {
        let relational = RelationalEntityStore::new(repository.clone());
        let reclaimer = Arc::new(Reclaimer::new(
            repository,
            relational.role_service().clone(),
            Duration::from_secs(config.reclamation.retention_secs),
            config.reclamation.batch_size,
        ));
        let store: Arc<dyn EntityStore> = Arc::new(relational);
        let tree_lock = Arc::new(TreeLock::new());

        let authorization = &config.authorization;
        let group_mapping = GroupMappingRegistry::default()
            .build(&authorization.group_mapping, &authorization.static_groups)?;
        let access_control = Arc::new(AccessControlManager::new(
            store.clone(),
            id_generator.clone(),
            group_mapping,
            authorization.service_admins.iter().cloned().collect::<HashSet<_>>(),
            authorization.enabled,
        ));
        let authorizer: Arc<dyn Authorizer> = if authorization.enabled {
            Arc::new(RoleBasedAuthorizer::new(access_control.clone(), store.clone()))
        } else {
            Arc::new(PassThroughAuthorizer)
        };
        let guard = AccessGuard::new(authorizer);
        info!(
            authorization = authorization.enabled,
            group_mapping = %authorization.group_mapping,
            "Building governance context"
        );

        let catalogs = Arc::new(CatalogManager::new(
            store.clone(),
            id_generator.clone(),
            tree_lock.clone(),
            guard.clone(),
            run_as,
        ));
        let dispatch = Arc::new(DispatchContext {
            catalogs: catalogs.clone(),
            store: store.clone(),
            id_generator: id_generator.clone(),
            tree_lock: tree_lock.clone(),
        });

        Ok(Self {
            metalakes: MetalakeManager::new(
                store.clone(),
                id_generator,
                tree_lock.clone(),
                guard.clone(),
                catalogs.clone(),
            ),
            schemas: AuthorizedDispatcher::new(dispatch.clone(), guard.clone()),
            tables: AuthorizedDispatcher::new(dispatch.clone(), guard.clone()),
            topics: AuthorizedDispatcher::new(dispatch.clone(), guard.clone()),
            filesets: AuthorizedDispatcher::new(dispatch, guard.clone()),
            config,
            store,
            tree_lock,
            access_control,
            guard,
            catalogs,
            reclaimer,
        })
    }

    /// Starts scheduled reclamation, unless its interval is 0.
    pub fn spawn_reclamation(&self) -> Option<JoinHandle<()>> {
        match self.config.reclamation.interval_secs {
            0 => None,
            secs => Some(self.reclaimer.clone().spawn(Duration::from_secs(secs))),
        }
    }
}
