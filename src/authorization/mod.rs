pub mod access_control;
pub mod authorizer;
pub mod group_mapping;
pub mod privilege;

pub use access_control::AccessControlManager;
pub use authorizer::{AccessGuard, Authorizer, PassThroughAuthorizer, RoleBasedAuthorizer};
