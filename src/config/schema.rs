use std::collections::HashMap;
use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::authorization::group_mapping::{GroupMappingRegistry, NONE_GROUP_MAPPING};

pub const ENV_PREFIX: &str = "LAKEWARD";

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct LakewardConfig {
    pub store: Store,
    #[serde(default)]
    pub authorization: Authorization,
    #[serde(default)]
    pub reclamation: Reclamation,
    #[serde(default)]
    pub misc: Misc,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Store {
    #[cfg(feature = "catalog-postgres")]
    Postgres(Postgres),
    Sqlite(Sqlite),
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Postgres {
    pub dsn: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Sqlite {
    pub dsn: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Authorization {
    /// When off, every privilege check passes.
    pub enabled: bool,
    pub service_admins: Vec<String>,
    /// Key of a registered group mapping provider.
    pub group_mapping: String,
    /// Group memberships for the `static` provider.
    pub static_groups: HashMap<String, Vec<String>>,
}

impl Default for Authorization {
    fn default() -> Self {
        Self {
            enabled: false,
            service_admins: vec![],
            group_mapping: NONE_GROUP_MAPPING.to_string(),
            static_groups: HashMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Reclamation {
    /// 0 disables the scheduled task.
    pub interval_secs: u64,
    pub retention_secs: u64,
    pub batch_size: u32,
}

impl Default for Reclamation {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retention_secs: 7 * 24 * 3600,
            batch_size: 10000,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Default, Clone)]
pub struct Misc {
    pub metrics: Option<Metrics>,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Metrics {
    pub host: String,
    pub port: u16,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

pub fn validate_config(config: LakewardConfig) -> Result<LakewardConfig, ConfigError> {
    if config.authorization.enabled && config.authorization.service_admins.is_empty() {
        return Err(ConfigError::Message(
            "Authorization is enabled but no service admins are configured, \
            so nobody could ever create a metalake admin."
                .to_string(),
        ));
    }

    if !GroupMappingRegistry::default().contains(&config.authorization.group_mapping) {
        return Err(ConfigError::Message(format!(
            "Unknown group mapping provider {:?}",
            config.authorization.group_mapping
        )));
    }

    if config.reclamation.batch_size == 0 {
        return Err(ConfigError::Message(
            "reclamation.batch_size must be positive".to_string(),
        ));
    }

    if matches!(
        config.store,
        Store::Sqlite(Sqlite { ref dsn, read_only: true }) if dsn.contains(":memory:")
    ) {
        return Err(ConfigError::Message(
            "A read-only in-memory SQLite store would always be empty.".to_string(),
        ));
    }

    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("authorization.service_admins")
        .try_parsing(true)
}

pub fn load_config(path: &Path) -> Result<LakewardConfig, ConfigError> {
    let path = path
        .to_str()
        .ok_or_else(|| ConfigError::Message(format!("Invalid config path {path:?}")))?;
    let config = Config::builder()
        .add_source(File::with_name(path))
        .add_source(environment());

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<LakewardConfig, ConfigError> {
    let config =
        Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
