//! End-to-end exercises of the public `Orchestrator` surface against the
//! in-memory test doubles. No live MongoDB deployment is required.

use std::sync::Arc;
use std::time::Duration;

use polymongo::config::{priority, Config, EvictionType};
use polymongo::driver::fake::{FakeDriver, FakeWatchStream};
use polymongo::driver::WatchStream;
use polymongo::metadata::fake::InMemoryMetadataStore;
use polymongo::{Orchestrator, PolyMongoError};

type TestOrchestrator = Orchestrator<FakeDriver, InMemoryMetadataStore>;

fn orchestrator(config: Config) -> TestOrchestrator {
    Orchestrator::with_driver(config, FakeDriver::new(), InMemoryMetadataStore::new())
}

#[tokio::test]
async fn get_is_cached_across_repeated_calls_for_the_same_database() {
    let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
    let orch = orchestrator(cfg);

    orch.get("tenant-a").await.unwrap();
    orch.get("tenant-a").await.unwrap();
    orch.get("tenant-a").await.unwrap();

    let stats = orch.stats().await.unwrap();
    assert_eq!(stats.counters.cache_misses, 1);
    assert_eq!(stats.counters.cache_hits, 2);

    let entry = stats.connections.iter().find(|c| c.db_name == "tenant-a").unwrap();
    assert_eq!(entry.use_count, 3);
}

#[tokio::test]
async fn enforce_max_evicts_across_many_databases_under_a_tight_cap() {
    let cfg = Config::builder("mongodb://localhost:27017")
        .max_connections(3)
        .eviction_type(EvictionType::Lru)
        .build()
        .unwrap();
    let orch = orchestrator(cfg);

    for name in ["a", "b", "c", "d", "e"] {
        orch.get(name).await.unwrap();
    }

    let stats = orch.stats().await.unwrap();
    assert_eq!(stats.counters.evictions, 2);
    assert_eq!(stats.counters.cache_misses, 5);
}

#[tokio::test]
async fn invalid_database_name_is_rejected_before_any_connect_attempt() {
    let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
    let orch = orchestrator(cfg);

    let err = orch.get("bad/name").await.unwrap_err();
    assert!(matches!(err, PolyMongoError::InvalidDatabaseName { .. }));
}

#[tokio::test]
async fn set_priority_to_never_close_survives_a_tight_cap() {
    let cfg = Config::builder("mongodb://localhost:27017")
        .max_connections(1)
        .eviction_type(EvictionType::Lru)
        .build()
        .unwrap();
    let orch = orchestrator(cfg);

    orch.get("critical").await.unwrap();
    orch.set_priority("critical", priority::NEVER_CLOSE).await.unwrap();

    for name in ["b", "c", "d"] {
        orch.get(name).await.unwrap();
    }

    let stats = orch.stats().await.unwrap();
    let critical = stats.connections.iter().find(|c| c.db_name == "critical").unwrap();
    assert_eq!(critical.priority, priority::NEVER_CLOSE);
}

#[tokio::test]
async fn a_failed_connect_does_not_poison_later_attempts_for_the_same_name() {
    let driver = FakeDriver::new();
    driver.fail_next_connect("flaky").await;
    let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
    let orch = Orchestrator::with_driver(cfg, driver, InMemoryMetadataStore::new());

    let first = orch.get("flaky").await;
    assert!(first.is_err());

    let second = orch.get("flaky").await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn concurrent_misses_for_the_same_database_open_exactly_one_connection() {
    let driver = FakeDriver::new();
    driver.set_open_delay(Duration::from_millis(20)).await;
    let probe = driver.clone();
    let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
    let orch = Arc::new(Orchestrator::with_driver(cfg, driver, InMemoryMetadataStore::new()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orch = Arc::clone(&orch);
        handles.push(tokio::spawn(async move { orch.get("shared").await.unwrap() }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // The per-name single-flight lock means only the first caller actually
    // dials out; the rest wait and observe the connection it opened.
    assert_eq!(probe.opened_uris().await.len(), 1);
}

#[tokio::test]
async fn watch_stream_keeps_a_connection_resident_through_enforce_max() {
    let cfg = Config::builder("mongodb://localhost:27017")
        .max_connections(1)
        .eviction_type(EvictionType::Lru)
        .build()
        .unwrap();
    let orch = orchestrator(cfg);

    orch.get("watched").await.unwrap();
    let stream: Arc<dyn WatchStream> = Arc::new(FakeWatchStream::new());
    orch.cache().register_watch_stream("watched", stream.clone()).await.unwrap();

    orch.get("other").await.unwrap();

    let stats = orch.stats().await.unwrap();
    let watched = stats.connections.iter().find(|c| c.db_name == "watched").unwrap();
    assert!(watched.has_active_watch);
}

#[tokio::test]
async fn close_then_reopen_produces_a_fresh_connection() {
    let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
    let orch = orchestrator(cfg);

    orch.get("a").await.unwrap();
    orch.close_connection("a").await.unwrap();
    orch.get("a").await.unwrap();

    let stats = orch.stats().await.unwrap();
    assert_eq!(stats.counters.cache_misses, 2);
}

#[tokio::test]
async fn statistics_persist_across_a_simulated_process_restart() {
    let shared_metadata = InMemoryMetadataStore::new();

    {
        let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
        let orch = Orchestrator::with_driver(cfg, FakeDriver::new(), shared_metadata.clone());
        for _ in 0..5 {
            orch.get("durable-tenant").await.unwrap();
        }
        // Use-count persistence piggybacks on a spawned background task; give
        // it a chance to land before the orchestrator (and its metadata
        // handle) goes out of scope.
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.close().await.unwrap();
    }

    // A freshly constructed orchestrator, same backing metadata store: the
    // usage history survives even though no connection is resident yet.
    let cfg = Config::builder("mongodb://localhost:27017").build().unwrap();
    let orch = Orchestrator::with_driver(cfg, FakeDriver::new(), shared_metadata);

    let stats = orch.stats().await.unwrap();
    let entry = stats
        .connections
        .iter()
        .find(|c| c.db_name == "durable-tenant")
        .expect("metadata for durable-tenant survives the restart");
    assert!(entry.use_count >= 5);

    assert_eq!(stats.counters.cache_hits, 0);
    assert_eq!(stats.counters.cache_misses, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_reaped_under_timeout_policy_while_watched_ones_are_not() {
    let cfg = Config::builder("mongodb://localhost:27017")
        .eviction_type(EvictionType::Timeout)
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let orch = orchestrator(cfg);

    orch.get("idle").await.unwrap();
    orch.get("kept-alive").await.unwrap();
    let stream: Arc<dyn WatchStream> = Arc::new(FakeWatchStream::new());
    orch.cache().register_watch_stream("kept-alive", stream).await.unwrap();

    tokio::time::advance(Duration::from_millis(200)).await;
    tokio::task::yield_now().await;

    // The idle timer reaped "idle" so the next `get` for it is a fresh miss,
    // while "kept-alive" is still resident (pinned by its watch stream).
    orch.get("idle").await.unwrap();
    orch.get("kept-alive").await.unwrap();

    let stats = orch.stats().await.unwrap();
    assert_eq!(stats.counters.cache_misses, 3);
    assert_eq!(stats.counters.cache_hits, 1);
}
