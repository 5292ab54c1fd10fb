//! The connection cache: the heart of the engine. Owns the live map of open
//! connections, arms and reschedules idle timers, and enforces the
//! `maxConnections` admission invariant by delegating to an
//! [`EvictionStrategy`].

pub mod info;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{priority, Config, EvictionType};
use crate::driver::{ConnectionState, Driver, DriverConnection, WatchStream};
use crate::error::{PolyMongoError, Result};
use crate::eviction::{build as build_strategy, EvictionCandidate, EvictionStrategy};
use crate::metadata::MetadataStore;
use crate::scoring::{self, ScoreInputs};

pub use info::ConnectionInfo;

/// Monotonic counters tracked per cache instance, not process-global.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounters {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
}

/// One row of [`ConnectionCache::stats`].
#[derive(Debug, Clone)]
pub struct ConnectionStatsEntry {
    pub db_name: String,
    pub priority: i64,
    pub use_count: u64,
    pub has_active_watch: bool,
    pub idle_millis: i64,
    pub score: Option<f64>,
}

type LiveEntry<C> = Arc<Mutex<ConnectionInfo<C>>>;

pub struct ConnectionCache<Drv: Driver, Meta: MetadataStore> {
    weak_self: Weak<Self>,
    driver: Drv,
    metadata: Arc<Meta>,
    config: Arc<Config>,
    strategy: Box<dyn EvictionStrategy>,
    live: DashMap<String, LiveEntry<Drv::Connection>>,
    /// Per-name locks used to make the miss path single-flight: two
    /// concurrent misses on the same name never both dial out.
    create_locks: DashMap<String, Arc<Mutex<()>>>,
    enforce_max_lock: Mutex<()>,
    started_at: Instant,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions: AtomicU64,
}

impl<Drv: Driver, Meta: MetadataStore> ConnectionCache<Drv, Meta> {
    pub fn new(driver: Drv, metadata: Arc<Meta>, config: Arc<Config>) -> Arc<Self> {
        let strategy = build_strategy(config.eviction_type(), config.idle_timeout());
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            driver,
            metadata,
            config,
            strategy,
            live: DashMap::new(),
            create_locks: DashMap::new(),
            enforce_max_lock: Mutex::new(()),
            started_at: Instant::now(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn arc_self(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("cache outlives every Arc handle to it")
    }

    fn now_millis(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    fn build_uri(&self, db_name: &str) -> String {
        format!("{}/{}", self.config.mongo_uri(), db_name)
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// §4.4 `get`: validate, try the fast hit path, otherwise admit and open.
    pub async fn get(&self, db_name: &str) -> Result<Drv::Connection> {
        crate::config::validate_db_name(db_name)?;

        if self.config.cache_connections() {
            if let Some(entry) = self.live.get(db_name).map(|e| e.value().clone()) {
                let mut info = entry.lock().await;
                if info.connection.state() == ConnectionState::Connected {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    self.record_activity_locked(db_name, &mut info);
                    tracing::trace!(db_name, "cache hit");
                    return Ok(info.connection.clone());
                }
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::info!(db_name, "cache miss");
        self.enforce_max().await?;
        self.create_connection(db_name).await
    }

    /// Explicit prewarm; identical to `get`.
    pub async fn open(&self, db_name: &str) -> Result<Drv::Connection> {
        self.get(db_name).await
    }

    async fn create_connection(&self, db_name: &str) -> Result<Drv::Connection> {
        let lock = self
            .create_locks
            .entry(db_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished opening this name while we
        // waited for the per-name lock.
        if self.config.cache_connections() {
            if let Some(entry) = self.live.get(db_name).map(|e| e.value().clone()) {
                let mut info = entry.lock().await;
                if info.connection.state() == ConnectionState::Connected {
                    self.record_activity_locked(db_name, &mut info);
                    self.create_locks.remove(db_name);
                    return Ok(info.connection.clone());
                }
            }
        }

        let uri = self.build_uri(db_name);
        let connection = match self.driver.connect(&uri).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(db_name, error = %err, "failed to open connection");
                self.create_locks.remove(db_name);
                return Err(err);
            }
        };

        let metadata = self.metadata.get(db_name).await?;
        let now = self.now_millis();
        let mut info = ConnectionInfo::new(connection.clone(), metadata, now);

        if self.should_arm_timer(&info) {
            self.arm_idle_timer(db_name.to_string(), &mut info);
        }

        self.live.insert(db_name.to_string(), Arc::new(Mutex::new(info)));
        self.create_locks.remove(db_name);
        tracing::info!(db_name, "connection opened");
        Ok(connection)
    }

    /// §4.4 `enforceMax`. Runs before every miss-path create.
    pub async fn enforce_max(&self) -> Result<()> {
        let Some(max_connections) = self.config.max_connections() else {
            return Ok(());
        };

        let _guard = self.enforce_max_lock.lock().await;
        let now = self.now_millis();

        // Invariant 7 is stated over non-watched connections only: watch
        // streams are sticky and get a temporary allowance above the cap
        // (§4.4 rationale), so they never count against `maxConnections`
        // here, and an eligible victim is never a watched connection either.
        let mut candidates = Vec::new();
        let mut non_watched_active: u32 = 0;
        for entry in self.live.iter() {
            let info = entry.value().lock().await;
            if info.connection.state() != ConnectionState::Connected {
                continue;
            }
            if !info.has_active_watch() {
                non_watched_active += 1;
            }
            candidates.push(self.candidate_from(entry.key(), &info));
        }

        if non_watched_active < max_connections {
            return Ok(());
        }

        // See DESIGN.md "Open Question decisions" #1: clamp to the number
        // of candidates actually eligible, so the strategy is never asked
        // for more victims than exist.
        let needed_raw = non_watched_active as i64 - max_connections as i64 + 1;
        let eligible = candidates.iter().filter(|c| !c.is_protected()).count();
        let needed = (needed_raw.max(1) as usize).min(eligible);

        if needed == 0 {
            return Err(PolyMongoError::MaxConnectionsExceeded);
        }

        let victims = self.strategy.select_for_eviction(&candidates, needed, now);
        if victims.is_empty() {
            return Err(PolyMongoError::MaxConnectionsExceeded);
        }

        for victim in victims {
            self.close(&victim).await?;
        }

        Ok(())
    }

    /// §4.4 `close`. Idempotent: closing an already-absent name is a no-op.
    pub async fn close(&self, db_name: &str) -> Result<()> {
        let entry = match self.live.remove(db_name) {
            Some((_, entry)) => entry,
            None => return Ok(()),
        };

        let mut info = entry.lock().await;
        for stream in info.watch_streams.drain(..) {
            stream.close().await;
        }
        info.cancel_idle_timer();
        info.connection.close().await;
        drop(info);

        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(db_name, "connection closed");
        Ok(())
    }

    pub async fn close_all(&self) -> Result<()> {
        let names: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        let closes = names.into_iter().map(|name| async move {
            if let Err(err) = self.close(&name).await {
                tracing::warn!(db_name = %name, error = %err, "error closing during close_all");
            }
        });
        futures_util::future::join_all(closes).await;
        Ok(())
    }

    pub async fn set_priority(&self, db_name: &str, new_priority: i64) -> Result<()> {
        crate::config::validate_priority(new_priority)?;
        self.metadata.set_priority(db_name, new_priority).await?;
        if let Some(entry) = self.live.get(db_name).map(|e| e.value().clone()) {
            entry.lock().await.metadata.priority = new_priority;
        }
        Ok(())
    }

    pub async fn register_watch_stream(&self, db_name: &str, stream: Arc<dyn WatchStream>) -> Result<()> {
        let entry = self
            .live
            .get(db_name)
            .map(|e| e.value().clone())
            .ok_or(PolyMongoError::NotInitialized)?;

        let mut info = entry.lock().await;
        info.watch_streams.push(stream);
        info.metadata.has_active_watch = true;
        info.cancel_idle_timer();

        let metadata = Arc::clone(&self.metadata);
        let name = db_name.to_string();
        tokio::spawn(async move {
            if let Err(err) = metadata.set_watch_status(&name, true).await {
                tracing::warn!(db_name = %name, error = %err, "failed to persist watch status");
            }
        });

        Ok(())
    }

    pub async fn unregister_watch_stream(&self, db_name: &str, stream: &Arc<dyn WatchStream>) -> Result<()> {
        let entry = match self.live.get(db_name).map(|e| e.value().clone()) {
            Some(e) => e,
            None => return Ok(()),
        };

        let mut info = entry.lock().await;
        info.watch_streams.retain(|s| !Arc::ptr_eq(s, stream));

        if info.watch_streams.is_empty() {
            info.metadata.has_active_watch = false;

            let metadata = Arc::clone(&self.metadata);
            let name = db_name.to_string();
            tokio::spawn(async move {
                if let Err(err) = metadata.set_watch_status(&name, false).await {
                    tracing::warn!(db_name = %name, error = %err, "failed to persist watch status");
                }
            });

            if self.should_arm_timer(&info) {
                self.arm_idle_timer(db_name.to_string(), &mut info);
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> Vec<ConnectionStatsEntry> {
        let now = self.now_millis();
        let mut entries = Vec::new();

        for entry in self.live.iter() {
            let info = entry.value().lock().await;
            let score = (self.config.eviction_type() == EvictionType::Lru).then(|| {
                scoring::score(ScoreInputs {
                    now_millis: now,
                    created_at_millis: info.created_at_millis,
                    last_activity_millis: info.last_activity_millis,
                    use_count: info.metadata.use_count,
                    priority: info.metadata.priority,
                })
            });

            entries.push(ConnectionStatsEntry {
                db_name: entry.key().clone(),
                priority: info.metadata.priority,
                use_count: info.metadata.use_count,
                has_active_watch: info.has_active_watch(),
                idle_millis: now - info.last_activity_millis,
                score,
            });
        }

        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| b.idle_millis.cmp(&a.idle_millis))
        });
        entries
    }

    fn record_activity_locked(&self, db_name: &str, info: &mut ConnectionInfo<Drv::Connection>) {
        info.last_activity_millis = self.now_millis();
        // Kept in sync eagerly so scoring always reflects the latest use
        // count; the store write itself is fire-and-forget below.
        info.metadata.use_count += 1;
        info.metadata.idle_time_ms = 0;

        let metadata = Arc::clone(&self.metadata);
        let name = db_name.to_string();
        tokio::spawn(async move {
            metadata.increment_use_count(&name).await;
        });

        if info.idle_timer.is_some() {
            if self.should_arm_timer(info) {
                self.arm_idle_timer(db_name.to_string(), info);
            } else {
                info.cancel_idle_timer();
            }
        }
    }

    fn should_arm_timer(&self, info: &ConnectionInfo<Drv::Connection>) -> bool {
        self.config.disconnect_on_idle()
            && self.config.eviction_type() == EvictionType::Timeout
            && info.metadata.priority != priority::NEVER_CLOSE
            && !info.has_active_watch()
    }

    fn arm_idle_timer(&self, db_name: String, info: &mut ConnectionInfo<Drv::Connection>) {
        info.cancel_idle_timer();
        let cache = self.arc_self();
        let timeout = self.config.idle_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cache.on_idle_timer_fire(&db_name).await;
        });
        info.idle_timer = Some(handle);
    }

    /// Re-checks eligibility at fire time: state may have changed between
    /// scheduling and firing (e.g. a watch registered in between).
    async fn on_idle_timer_fire(&self, db_name: &str) {
        let now = self.now_millis();

        let should_evict = {
            let entry = match self.live.get(db_name).map(|e| e.value().clone()) {
                Some(e) => e,
                None => return,
            };
            let info = entry.lock().await;
            let candidate = self.candidate_from(db_name, &info);
            self.strategy.should_evict(&candidate, now)
        };

        if should_evict {
            if let Err(err) = self.close(db_name).await {
                tracing::warn!(db_name, error = %err, "idle-timeout close failed");
            } else {
                tracing::info!(db_name, reason = "idle_timeout", "connection evicted");
            }
        }
    }

    fn candidate_from(&self, db_name: &str, info: &ConnectionInfo<Drv::Connection>) -> EvictionCandidate {
        EvictionCandidate {
            db_name: db_name.to_string(),
            priority: info.metadata.priority,
            has_active_watch: info.has_active_watch(),
            created_at_millis: info.created_at_millis,
            last_activity_millis: info.last_activity_millis,
            use_count: info.metadata.use_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{priority, Config, EvictionType};
    use crate::driver::fake::FakeDriver;
    use crate::metadata::fake::InMemoryMetadataStore;

    use super::*;

    fn cache(config: Config) -> Arc<ConnectionCache<FakeDriver, InMemoryMetadataStore>> {
        ConnectionCache::new(FakeDriver::new(), Arc::new(InMemoryMetadataStore::new()), Arc::new(config))
    }

    #[tokio::test]
    async fn miss_then_hit_updates_counters() {
        let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
        let cache = cache(cfg);

        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();

        let counters = cache.counters();
        assert_eq!(counters.cache_misses, 1);
        assert_eq!(counters.cache_hits, 1);
    }

    #[tokio::test]
    async fn enforce_max_evicts_lowest_score_under_lru() {
        let cfg = Config::builder("mongodb://localhost:27017")
            .max_connections(2)
            .eviction_type(EvictionType::Lru)
            .build()
            .unwrap();
        let cache = cache(cfg);

        cache.get("a").await.unwrap();
        cache.set_priority("a", priority::LOW).await.unwrap();
        cache.get("b").await.unwrap();
        cache.set_priority("b", priority::HIGH).await.unwrap();
        for _ in 0..10 {
            cache.get("b").await.unwrap();
        }

        cache.get("c").await.unwrap();

        assert!(!cache.live.contains_key("a"));
        assert!(cache.live.contains_key("b"));
        assert!(cache.live.contains_key("c"));
    }

    #[tokio::test]
    async fn priority_never_close_is_never_evicted() {
        let cfg = Config::builder("mongodb://localhost:27017")
            .max_connections(2)
            .eviction_type(EvictionType::Lru)
            .build()
            .unwrap();
        let cache = cache(cfg);

        cache.get("a").await.unwrap();
        cache.set_priority("a", priority::NEVER_CLOSE).await.unwrap();
        cache.get("b").await.unwrap();
        cache.set_priority("b", priority::HIGHEST).await.unwrap();

        cache.get("c").await.unwrap();

        assert!(cache.live.contains_key("a"));
        assert!(!cache.live.contains_key("b"));
        assert!(cache.live.contains_key("c"));
    }

    #[tokio::test]
    async fn watch_stream_protects_connection_from_enforce_max() {
        let cfg = Config::builder("mongodb://localhost:27017")
            .max_connections(1)
            .eviction_type(EvictionType::Lru)
            .build()
            .unwrap();
        let cache = cache(cfg);

        cache.get("a").await.unwrap();
        let stream: Arc<dyn WatchStream> = Arc::new(crate::driver::fake::FakeWatchStream::new());
        cache.register_watch_stream("a", stream.clone()).await.unwrap();

        cache.get("b").await.unwrap();

        // The watch allowance lets both stay resident temporarily.
        assert!(cache.live.contains_key("a"));
        assert!(cache.live.contains_key("b"));

        // Once the watch is gone, both `a` and `b` count against the cap
        // again; enforceMax must bring non-watched residents back to at
        // most `maxConnections` before admitting `c` (invariant 7).
        cache.unregister_watch_stream("a", &stream).await.unwrap();
        cache.get("c").await.unwrap();

        assert!(cache.live.contains_key("c"));
        assert_eq!(cache.live.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_evicts_after_the_sliding_window() {
        let cfg = Config::builder("mongodb://localhost:27017")
            .eviction_type(EvictionType::Timeout)
            .idle_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let cache = cache(cfg);

        cache.get("a").await.unwrap();

        tokio::time::advance(Duration::from_millis(90)).await;
        cache.get("a").await.unwrap();

        tokio::time::advance(Duration::from_millis(90)).await;
        assert!(cache.live.contains_key("a"));

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(!cache.live.contains_key("a"));
    }

    #[tokio::test]
    async fn max_connections_exceeded_when_no_eligible_candidates() {
        let cfg = Config::builder("mongodb://localhost:27017")
            .max_connections(1)
            .eviction_type(EvictionType::Lru)
            .build()
            .unwrap();
        let cache = cache(cfg);

        cache.get("a").await.unwrap();
        cache.set_priority("a", priority::NEVER_CLOSE).await.unwrap();

        let err = cache.get("b").await.unwrap_err();
        assert!(matches!(err, PolyMongoError::MaxConnectionsExceeded));
    }
}
