use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

pub const NONE_GROUP_MAPPING: &str = "none";
pub const STATIC_GROUP_MAPPING: &str = "static";

/// Resolves the groups a principal belongs to in some external directory.
#[async_trait]
pub trait GroupMappingProvider: Send + Sync + Debug {
    async fn groups_of(&self, principal: &str) -> Result<HashSet<String>>;
}

/// Nobody belongs to any group.
#[derive(Debug, Default)]
pub struct NoneGroupMapping;

#[async_trait]
impl GroupMappingProvider for NoneGroupMapping {
    async fn groups_of(&self, _principal: &str) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }
}

/// Memberships listed in the configuration file.
#[derive(Debug, Default)]
pub struct StaticGroupMapping {
    groups: HashMap<String, HashSet<String>>,
}

impl StaticGroupMapping {
    pub fn new(groups: &HashMap<String, Vec<String>>) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|(principal, groups)| {
                    (principal.clone(), groups.iter().cloned().collect())
                })
                .collect(),
        }
    }
}

#[async_trait]
impl GroupMappingProvider for StaticGroupMapping {
    async fn groups_of(&self, principal: &str) -> Result<HashSet<String>> {
        Ok(self.groups.get(principal).cloned().unwrap_or_default())
    }
}

/// Builds a provider from the `static_groups` configuration table.
pub type GroupMappingFactory =
    fn(&HashMap<String, Vec<String>>) -> Arc<dyn GroupMappingProvider>;

fn build_none_mapping(_: &HashMap<String, Vec<String>>) -> Arc<dyn GroupMappingProvider> {
    Arc::new(NoneGroupMapping)
}

fn build_static_mapping(groups: &HashMap<String, Vec<String>>) -> Arc<dyn GroupMappingProvider> {
    Arc::new(StaticGroupMapping::new(groups))
}

/// Group mapping providers selectable by configuration key.
#[derive(Clone)]
pub struct GroupMappingRegistry {
    factories: HashMap<String, GroupMappingFactory>,
}

impl Default for GroupMappingRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(NONE_GROUP_MAPPING, build_none_mapping);
        registry.register(STATIC_GROUP_MAPPING, build_static_mapping);
        registry
    }
}

impl GroupMappingRegistry {
    pub fn register(&mut self, key: &str, factory: GroupMappingFactory) {
        self.factories.insert(key.to_string(), factory);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn build(
        &self,
        key: &str,
        static_groups: &HashMap<String, Vec<String>>,
    ) -> Result<Arc<dyn GroupMappingProvider>> {
        let factory = self.factories.get(key).ok_or_else(|| {
            Error::invalid_argument(format!("Unknown group mapping provider {key:?}"))
        })?;
        Ok(factory(static_groups))
    }
}
