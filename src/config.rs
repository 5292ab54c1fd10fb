use std::time::Duration;

use url::Url;

use crate::error::{PolyMongoError, Result};

/// Priority constants. Lower is more important; `NEVER_CLOSE` is protected from
/// all automatic eviction.
pub mod priority {
    pub const NEVER_CLOSE: i64 = -1;
    pub const HIGHEST: i64 = 0;
    pub const HIGH: i64 = 100;
    pub const MEDIUM: i64 = 500;
    pub const LOW: i64 = 1000;
    pub const LOWEST: i64 = 10_000;
}

const DEFAULT_METADATA_DB: &str = "polymongo-metadata";
const DEFAULT_DEFAULT_DB: &str = "Default-DB";
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60_000);
const DB_NAME_FORBIDDEN_CHARS: &[char] =
    &['/', '\\', '.', '"', '$', '*', '<', '>', ':', '|', '?'];
const DB_NAME_MAX_LEN: usize = 64;

/// Eviction policy selector. See [`crate::eviction`] for the strategy each
/// variant resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionType {
    Manual,
    Timeout,
    Lru,
}

impl Default for EvictionType {
    fn default() -> Self {
        EvictionType::Lru
    }
}

/// Fully validated, immutable pool configuration.
///
/// Constructed only through [`ConfigBuilder`]; there is no field-by-field
/// mutation after `build()`.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) mongo_uri: String,
    pub(crate) metadata_db: String,
    pub(crate) default_db: String,
    pub(crate) max_connections: Option<u32>,
    pub(crate) idle_timeout: Duration,
    pub(crate) cache_connections: bool,
    pub(crate) disconnect_on_idle: bool,
    pub(crate) eviction_type: EvictionType,
}

impl Config {
    /// Start building a configuration from the mandatory connection URI.
    pub fn builder(mongo_uri: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(mongo_uri)
    }

    pub fn mongo_uri(&self) -> &str {
        &self.mongo_uri
    }

    pub fn metadata_db(&self) -> &str {
        &self.metadata_db
    }

    pub fn default_db(&self) -> &str {
        &self.default_db
    }

    pub fn max_connections(&self) -> Option<u32> {
        self.max_connections
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn cache_connections(&self) -> bool {
        self.cache_connections
    }

    pub fn disconnect_on_idle(&self) -> bool {
        self.disconnect_on_idle
    }

    pub fn eviction_type(&self) -> EvictionType {
        self.eviction_type
    }
}

/// Fluent builder mirroring the configuration keys of the pool; every setter
/// returns `Self` and validation runs eagerly in [`ConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    mongo_uri: String,
    metadata_db: String,
    default_db: String,
    max_connections: Option<u32>,
    idle_timeout: Duration,
    cache_connections: bool,
    disconnect_on_idle: bool,
    eviction_type: EvictionType,
}

impl ConfigBuilder {
    pub fn new(mongo_uri: impl Into<String>) -> Self {
        Self {
            mongo_uri: mongo_uri.into(),
            metadata_db: DEFAULT_METADATA_DB.to_string(),
            default_db: DEFAULT_DEFAULT_DB.to_string(),
            max_connections: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cache_connections: true,
            disconnect_on_idle: true,
            eviction_type: EvictionType::default(),
        }
    }

    pub fn metadata_db(mut self, name: impl Into<String>) -> Self {
        self.metadata_db = name.into();
        self
    }

    pub fn default_db(mut self, name: impl Into<String>) -> Self {
        self.default_db = name.into();
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn cache_connections(mut self, enabled: bool) -> Self {
        self.cache_connections = enabled;
        self
    }

    pub fn disconnect_on_idle(mut self, enabled: bool) -> Self {
        self.disconnect_on_idle = enabled;
        self
    }

    pub fn eviction_type(mut self, eviction_type: EvictionType) -> Self {
        self.eviction_type = eviction_type;
        self
    }

    /// Validate every field and produce an immutable [`Config`].
    ///
    /// Failures are synchronous: a malformed URI or database name is never
    /// deferred to first use.
    pub fn build(self) -> Result<Config> {
        let mongo_uri = validate_mongo_uri(&self.mongo_uri)?;
        validate_db_name(&self.metadata_db)?;
        validate_db_name(&self.default_db)?;

        if let Some(max) = self.max_connections {
            if max < 1 {
                return Err(PolyMongoError::InvalidConfig("max_connections must be >= 1"));
            }
        }

        Ok(Config {
            mongo_uri,
            metadata_db: self.metadata_db,
            default_db: self.default_db,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout,
            cache_connections: self.cache_connections,
            disconnect_on_idle: self.disconnect_on_idle,
            eviction_type: self.eviction_type,
        })
    }
}

/// Strips any path and query component from `uri`, keeping only the host
/// portion the engine appends `/<dbName>` onto per open.
fn validate_mongo_uri(uri: &str) -> Result<String> {
    if !uri.starts_with("mongodb://") && !uri.starts_with("mongodb+srv://") {
        return Err(PolyMongoError::InvalidMongoURI(uri.to_string()));
    }

    let parsed = Url::parse(uri).map_err(|_| PolyMongoError::InvalidMongoURI(uri.to_string()))?;

    let mut stripped = parsed.clone();
    stripped.set_path("");
    stripped.set_query(None);
    stripped.set_fragment(None);

    Ok(stripped.as_str().trim_end_matches('/').to_string())
}

/// Validates a database name against the constraints every `dbName` must
/// satisfy: non-empty after trim, bounded length, no reserved characters.
pub(crate) fn validate_db_name(name: &str) -> Result<()> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(PolyMongoError::InvalidDatabaseName {
            name: name.to_string(),
            reason: "must be non-empty",
        });
    }

    if trimmed.len() > DB_NAME_MAX_LEN {
        return Err(PolyMongoError::InvalidDatabaseName {
            name: name.to_string(),
            reason: "must be at most 64 characters",
        });
    }

    if trimmed.contains(DB_NAME_FORBIDDEN_CHARS) {
        return Err(PolyMongoError::InvalidDatabaseName {
            name: name.to_string(),
            reason: "contains a reserved character",
        });
    }

    Ok(())
}

/// Validates a priority value: `-1` or any non-negative integer.
pub(crate) fn validate_priority(priority: i64) -> Result<()> {
    if priority < priority::NEVER_CLOSE {
        return Err(PolyMongoError::InvalidPriority(priority));
    }
    Ok(())
}
