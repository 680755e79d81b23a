use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use sqlx::sqlite::SqliteJournalMode;

pub const ENV_PREFIX: &str = "PETREL";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct PetrelConfig {
    pub connections: BTreeMap<String, Connection>,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub lock: Lock,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Connection {
    pub dsn: String,
    #[serde(
        default = "default_journal_mode",
        deserialize_with = "deserialize_journal_mode"
    )]
    pub journal_mode: SqliteJournalMode,
    // Defaults depend on the DSN, see `max_connections()`
    #[serde(default, rename = "max_connections")]
    pub max_connections_override: Option<u32>,
    #[serde(default)]
    pub read_only: bool,
}

impl Connection {
    pub fn is_in_memory(&self) -> bool {
        self.dsn.contains(":memory:") || self.dsn.contains("mode=memory")
    }

    pub fn max_connections(&self) -> u32 {
        match self.max_connections_override {
            Some(max) => max,
            None if self.is_in_memory() => 1,
            None => DEFAULT_MAX_CONNECTIONS,
        }
    }
}

fn default_journal_mode() -> SqliteJournalMode {
    SqliteJournalMode::Wal
}

fn deserialize_journal_mode<'de, D>(deserializer: D) -> Result<SqliteJournalMode, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    SqliteJournalMode::from_str(&name).map_err(serde::de::Error::custom)
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cache {
    Memory(MemoryCache),
    None,
}

impl Default for Cache {
    fn default() -> Self {
        Cache::Memory(MemoryCache::default())
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct MemoryCache {
    pub capacity: u64,
    pub default_ttl_secs: Option<u64>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl_secs: None,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Lock {
    pub default_ttl_secs: u64,
}

impl Default for Lock {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_LOCK_TTL_SECS,
        }
    }
}

pub fn validate_config(config: PetrelConfig) -> Result<PetrelConfig, ConfigError> {
    if config.connections.is_empty() {
        return Err(ConfigError::Message(
            "At least one connection must be configured".to_string(),
        ));
    }

    if let Some((name, _)) = config
        .connections
        .iter()
        .find(|(_, connection)| connection.dsn.trim().is_empty())
    {
        return Err(ConfigError::Message(format!(
            "Connection {name:?} has an empty DSN"
        )));
    }

    if let Cache::Memory(MemoryCache { capacity: 0, .. }) = config.cache {
        return Err(ConfigError::Message(
            "The memory cache needs a capacity above 0".to_string(),
        ));
    }

    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator("__")
}

pub fn load_config(path: &Path) -> Result<PetrelConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::from(path))
        .add_source(environment());

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<PetrelConfig, ConfigError> {
    let config = Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
