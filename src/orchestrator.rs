//! Top-level handle: validates configuration, lazily initializes the
//! metadata store, and exposes the public surface over the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::cache::{CacheCounters, ConnectionCache, ConnectionStatsEntry};
use crate::config::Config;
use crate::driver::{Driver, MongoDriver};
use crate::error::{PolyMongoError, Result};
use crate::metadata::{MetadataStore, MongoMetadataStore};

/// A full snapshot combining cache counters and per-database stats, sorted
/// ascending by priority then descending by score (§4.5 `stats`).
#[derive(Debug, Clone)]
pub struct Stats {
    pub counters: CacheCounters,
    pub connections: Vec<ConnectionStatsEntry>,
}

/// The production orchestrator, backed by the real `mongodb` driver.
pub type PolyMongo = Orchestrator<MongoDriver, MongoMetadataStore>;

/// Lazily-initialized pool and eviction engine over one MongoDB deployment.
///
/// Generic over the driver and metadata backend so the whole surface can run
/// against [`crate::driver::fake::FakeDriver`] in tests; production code
/// uses the [`PolyMongo`] alias.
pub struct Orchestrator<Drv: Driver, Meta: MetadataStore> {
    cache: Arc<ConnectionCache<Drv, Meta>>,
    metadata: Arc<Meta>,
    config: Arc<Config>,
    init_cell: OnceCell<()>,
    closed: AtomicBool,
}

impl<Drv: Driver, Meta: MetadataStore> Orchestrator<Drv, Meta> {
    pub fn with_driver(config: Config, driver: Drv, metadata: Meta) -> Self {
        let config = Arc::new(config);
        let metadata = Arc::new(metadata);
        let cache = ConnectionCache::new(driver, Arc::clone(&metadata), Arc::clone(&config));
        Self {
            cache,
            metadata,
            config,
            init_cell: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Idempotent, concurrency-safe lazy initialization: concurrent callers
    /// share the in-flight attempt; on failure the cell stays uninitialized
    /// so the next caller may retry.
    pub async fn ensure_initialized(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PolyMongoError::NotInitialized);
        }
        self.init_cell.get_or_try_init(|| self.metadata.init()).await?;
        Ok(())
    }

    pub async fn get(&self, db_name: &str) -> Result<Drv::Connection> {
        self.ensure_initialized().await?;
        self.cache.get(db_name).await
    }

    pub async fn open(&self, db_name: &str) -> Result<Drv::Connection> {
        self.get(db_name).await
    }

    pub async fn close_connection(&self, db_name: &str) -> Result<()> {
        self.ensure_initialized().await?;
        self.cache.close(db_name).await
    }

    pub async fn set_priority(&self, db_name: &str, priority: i64) -> Result<()> {
        self.ensure_initialized().await?;
        self.cache.set_priority(db_name, priority).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.ensure_initialized().await?;
        let mut connections = self.cache.stats().await;
        let persisted = self.metadata.get_all().await?;

        for record in persisted {
            if !connections.iter().any(|c| c.db_name == record.db_name) {
                connections.push(ConnectionStatsEntry {
                    db_name: record.db_name,
                    priority: record.priority,
                    use_count: record.use_count,
                    has_active_watch: record.has_active_watch,
                    idle_millis: 0,
                    score: None,
                });
            }
        }
        connections.sort_by(|a, b| a.priority.cmp(&b.priority));

        Ok(Stats {
            counters: self.cache.counters(),
            connections,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ConnectionCache<Drv, Meta>> {
        &self.cache
    }

    pub async fn close(&self) -> Result<()> {
        self.cache.close_all().await?;
        self.metadata.close().await;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Orchestrator<MongoDriver, MongoMetadataStore> {
    /// Build the production orchestrator from validated configuration.
    pub fn new(config: Config) -> Self {
        let metadata_store = MongoMetadataStore::new(config.mongo_uri().to_string(), config.metadata_db().to_string());
        Self::with_driver(config, MongoDriver, metadata_store)
    }

    /// §4.5 `wrapModel`: bind a schema to a collection, forwarding queries
    /// onto whichever database `.db(name)` selects per call.
    pub fn wrap_model<T>(self: Arc<Self>, collection_name: impl Into<String>) -> crate::model::ModelHandle<T>
    where
        T: Send + Sync + Unpin + serde::Serialize + serde::de::DeserializeOwned + 'static,
    {
        crate::model::ModelHandle::new(self, collection_name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::priority;
    use crate::driver::fake::FakeDriver;
    use crate::metadata::fake::InMemoryMetadataStore;

    fn orchestrator(config: Config) -> Orchestrator<FakeDriver, InMemoryMetadataStore> {
        Orchestrator::with_driver(config, FakeDriver::new(), InMemoryMetadataStore::new())
    }

    #[tokio::test]
    async fn ensure_initialized_is_idempotent_and_concurrency_safe() {
        let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
        let orch = orchestrator(cfg);

        let a = orch.ensure_initialized();
        let b = orch.ensure_initialized();
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn operations_after_close_report_not_initialized() {
        let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
        let orch = orchestrator(cfg);

        orch.get("a").await.unwrap();
        orch.close().await.unwrap();

        let err = orch.get("a").await.unwrap_err();
        assert!(matches!(err, PolyMongoError::NotInitialized));
    }

    #[tokio::test]
    async fn set_priority_then_stats_round_trips() {
        let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
        let orch = orchestrator(cfg);

        orch.get("a").await.unwrap();
        orch.set_priority("a", priority::HIGH).await.unwrap();

        let stats = orch.stats().await.unwrap();
        let entry = stats.connections.iter().find(|c| c.db_name == "a").unwrap();
        assert_eq!(entry.priority, priority::HIGH);
    }

    #[tokio::test]
    async fn stats_reflects_metadata_hits_and_misses() {
        let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
        let orch = orchestrator(cfg);

        orch.get("a").await.unwrap();
        orch.get("a").await.unwrap();

        let stats = orch.stats().await.unwrap();
        assert_eq!(stats.counters.cache_misses, 1);
        assert_eq!(stats.counters.cache_hits, 1);
    }
}
