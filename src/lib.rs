//! Multi-database connection pool and adaptive eviction engine for a single
//! MongoDB deployment.
//!
//! Applications address a logical model bound to a collection name and
//! choose, per query, which database on the host the query runs against.
//! [`Orchestrator`] (its production alias, [`PolyMongo`]) transparently
//! maintains a cache of live connections keyed by database name, persists
//! usage statistics durably across restarts, and evicts connections under a
//! configurable policy once `maxConnections` is reached.
//!
//! ```no_run
//! use polymongo::{Config, PolyMongo};
//!
//! # async fn run() -> polymongo::error::Result<()> {
//! let config = Config::builder("mongodb://localhost:27017")
//!     .max_connections(50)
//!     .build()?;
//!
//! let pool = PolyMongo::new(config);
//! let _connection = pool.get("tenant-acme").await?;
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod eviction;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod scoring;

pub use cache::{CacheCounters, ConnectionCache, ConnectionStatsEntry};
pub use config::{priority, Config, ConfigBuilder, EvictionType};
pub use driver::{ConnectionState, Driver, DriverConnection, MongoDriver, WatchStream};
pub use error::{PolyMongoError, Result};
pub use metadata::{ConnectionMetadata, MetadataStore, MongoMetadataStore};
pub use model::{ModelHandle, WatchedChangeStream};
pub use orchestrator::{Orchestrator, PolyMongo, Stats};
