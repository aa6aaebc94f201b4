use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, describe_counter};
use tracing::debug;

use crate::error::{Error, Result};
use crate::meta::entity_of;
use crate::principal::current_principal;
use crate::store::EntityStore;

use super::access_control::AccessControlManager;
use super::privilege::{Condition, MetadataObject, PrivilegeName};

const AUTHORIZATION_DECISIONS: &str = "lakeward_authorization_decisions_total";

/// Answers whether a principal may exercise a privilege on a metadata object.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        principal: &str,
        metalake: &str,
        object: &MetadataObject,
        privilege: PrivilegeName,
    ) -> Result<bool>;

    fn is_service_admin(&self, principal: &str) -> bool;

    async fn is_metalake_admin(&self, principal: &str) -> Result<bool>;

    /// Whether `principal` created the object, according to its audit record.
    async fn is_creator(&self, principal: &str, object: &MetadataObject) -> Result<bool>;

    async fn is_metalake_user(&self, principal: &str, metalake: &str) -> Result<bool>;
}

/// Used when authorization is disabled: everything is allowed.
#[derive(Debug, Default)]
pub struct PassThroughAuthorizer;

#[async_trait]
impl Authorizer for PassThroughAuthorizer {
    async fn authorize(
        &self,
        _principal: &str,
        _metalake: &str,
        _object: &MetadataObject,
        _privilege: PrivilegeName,
    ) -> Result<bool> {
        Ok(true)
    }

    fn is_service_admin(&self, _principal: &str) -> bool {
        true
    }

    async fn is_metalake_admin(&self, _principal: &str) -> Result<bool> {
        Ok(true)
    }

    async fn is_creator(&self, _principal: &str, _object: &MetadataObject) -> Result<bool> {
        Ok(true)
    }

    async fn is_metalake_user(&self, _principal: &str, _metalake: &str) -> Result<bool> {
        Ok(true)
    }
}

struct AuthorizationMetrics {}

impl AuthorizationMetrics {
    fn new() -> Self {
        describe_counter!(
            AUTHORIZATION_DECISIONS,
            "Privilege checks answered by the role-based authorizer"
        );
        Self {}
    }

    fn record(&self, privilege: PrivilegeName, allowed: bool, reason: &'static str) {
        let result = if allowed { "allow" } else { "deny" };
        counter!(
            AUTHORIZATION_DECISIONS,
            "privilege" => privilege.to_string(),
            "result" => result,
            "reason" => reason
        )
        .increment(1);
    }
}

/// Resolves privileges from the roles granted to the principal directly and through
/// its groups. Grants on an object or any of its ancestors apply, and a matching DENY
/// wins over every ALLOW no matter which path it came from.
pub struct RoleBasedAuthorizer {
    access_control: Arc<AccessControlManager>,
    store: Arc<dyn EntityStore>,
    metrics: AuthorizationMetrics,
}

impl RoleBasedAuthorizer {
    pub fn new(access_control: Arc<AccessControlManager>, store: Arc<dyn EntityStore>) -> Self {
        Self {
            access_control,
            store,
            metrics: AuthorizationMetrics::new(),
        }
    }

    async fn candidate_roles(
        &self,
        principal: &str,
        metalake: &str,
    ) -> Result<Vec<crate::meta::RoleEntity>> {
        let mut roles = match self.access_control.roles_of_user(metalake, principal).await {
            Ok(roles) => roles,
            Err(e) if e.is_not_found() => vec![],
            Err(e) => return Err(e),
        };

        for group in self.access_control.groups_of_user(principal).await? {
            match self.access_control.roles_of_group(metalake, &group).await {
                Ok(group_roles) => roles.extend(group_roles),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(roles)
    }
}

#[async_trait]
impl Authorizer for RoleBasedAuthorizer {
    async fn authorize(
        &self,
        principal: &str,
        metalake: &str,
        object: &MetadataObject,
        privilege: PrivilegeName,
    ) -> Result<bool> {
        if privilege.is_manage() && self.is_creator(principal, object).await? {
            self.metrics.record(privilege, true, "creator");
            return Ok(true);
        }

        let scopes = object.self_and_ancestors();
        let mut allowed = false;
        for role in self.candidate_roles(principal, metalake).await? {
            for grant in role
                .securable_objects
                .iter()
                .filter(|grant| scopes.contains(grant.object()))
            {
                match grant.condition_for(privilege) {
                    Some(Condition::Deny) => {
                        debug!(
                            principal,
                            %object,
                            %privilege,
                            role = %role.name,
                            grant = %grant.object(),
                            "Denied by explicit grant"
                        );
                        self.metrics.record(privilege, false, "deny");
                        return Ok(false);
                    }
                    Some(Condition::Allow) => allowed = true,
                    None => {}
                }
            }
        }

        self.metrics
            .record(privilege, allowed, if allowed { "allow" } else { "no_grant" });
        Ok(allowed)
    }

    fn is_service_admin(&self, principal: &str) -> bool {
        self.access_control.is_service_admin(principal)
    }

    async fn is_metalake_admin(&self, principal: &str) -> Result<bool> {
        self.access_control.is_metalake_admin(principal).await
    }

    async fn is_creator(&self, principal: &str, object: &MetadataObject) -> Result<bool> {
        let Some((ident, entity_type)) = entity_of(object) else {
            return Ok(false);
        };
        match self.store.get(&ident, entity_type).await {
            Ok(entity) => Ok(entity.audit().creator == principal),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_metalake_user(&self, principal: &str, metalake: &str) -> Result<bool> {
        match self
            .access_control
            .is_user_in_metalake(principal, metalake)
            .await
        {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }
}

/// The boundary where authorization answers turn into `Forbidden` errors for the
/// principal of the current task.
#[derive(Clone)]
pub struct AccessGuard {
    authorizer: Arc<dyn Authorizer>,
}

impl AccessGuard {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    pub async fn can(&self, object: &MetadataObject, privilege: PrivilegeName) -> Result<bool> {
        let Some(metalake) = object.metalake_name() else {
            return Err(Error::invalid_argument(
                "Privileges are checked against objects within a metalake",
            ));
        };
        self.authorizer
            .authorize(&current_principal(), metalake, object, privilege)
            .await
    }

    pub async fn check(&self, object: &MetadataObject, privilege: PrivilegeName) -> Result<()> {
        if self.can(object, privilege).await? {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "{} doesn't have privilege {privilege} on {object}",
                current_principal()
            )))
        }
    }

    pub async fn require_metalake_admin(&self) -> Result<()> {
        let principal = current_principal();
        if self.authorizer.is_metalake_admin(&principal).await? {
            Ok(())
        } else {
            Err(Error::forbidden(format!("{principal} is not a metalake admin")))
        }
    }

    pub async fn require_creator(&self, object: &MetadataObject) -> Result<()> {
        let principal = current_principal();
        if self.authorizer.is_creator(&principal, object).await? {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "{principal} is not the creator of {object}"
            )))
        }
    }

    /// The creator, or any user added to the object's metalake.
    pub async fn require_creator_or_user(&self, object: &MetadataObject) -> Result<()> {
        let principal = current_principal();
        if self.authorizer.is_creator(&principal, object).await? {
            return Ok(());
        }
        let metalake = object.metalake_name().unwrap_or_default();
        if self.authorizer.is_metalake_user(&principal, metalake).await? {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "{principal} is neither the creator of {object} nor a user of metalake {metalake}"
            )))
        }
    }
}
