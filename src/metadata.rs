//! The durable, upsert-oriented view of per-database statistics.
//!
//! Backed by its own dedicated connection to a designated metadata database,
//! isolated from the tenant connections the cache manages, so evicting a
//! tenant never touches statistics persistence.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::priority;
use crate::error::Result;

/// Per-database statistics record. Mirrors exactly one document in the
/// `connection_metadata` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub db_name: String,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub priority: i64,
    pub has_active_watch: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Milliseconds since the last `incrementUseCount`. Written on every
    /// increment, never consulted by scoring or eviction — advisory only.
    pub idle_time_ms: i64,
}

impl ConnectionMetadata {
    pub fn new_default(db_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            db_name: db_name.into(),
            last_used: now,
            use_count: 0,
            priority: priority::MEDIUM,
            has_active_watch: false,
            created_at: now,
            updated_at: now,
            idle_time_ms: 0,
        }
    }
}

/// A partial update applied as an upsert, never a read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub priority: Option<i64>,
    pub has_active_watch: Option<bool>,
}

/// The durable metadata backend. Implemented against the real `mongodb`
/// crate by [`MongoMetadataStore`] and in-memory by
/// [`fake::InMemoryMetadataStore`] for tests.
pub trait MetadataStore: Send + Sync + 'static {
    /// Establish the dedicated connection and ensure the collection/indexes
    /// from the external-interfaces layout exist.
    fn init(&self) -> BoxFuture<'_, Result<()>>;

    /// Fetch the record for `db_name`, creating it with defaults if absent.
    fn get(&self, db_name: &str) -> BoxFuture<'_, Result<ConnectionMetadata>>;

    fn update(&self, db_name: &str, patch: MetadataPatch) -> BoxFuture<'_, Result<()>>;

    /// Failures here are logged, never propagated — activity tracking must
    /// never break a user query.
    fn increment_use_count(&self, db_name: &str) -> BoxFuture<'_, ()>;

    fn set_priority(&self, db_name: &str, priority: i64) -> BoxFuture<'_, Result<()>> {
        self.update(
            db_name,
            MetadataPatch {
                priority: Some(priority),
                ..Default::default()
            },
        )
    }

    fn set_watch_status(&self, db_name: &str, has_active_watch: bool) -> BoxFuture<'_, Result<()>> {
        self.update(
            db_name,
            MetadataPatch {
                has_active_watch: Some(has_active_watch),
                ..Default::default()
            },
        )
    }

    fn get_all(&self) -> BoxFuture<'_, Result<Vec<ConnectionMetadata>>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

mod mongo {
    use bson::doc;
    use chrono::Utc;
    use futures_util::future::BoxFuture;
    use futures_util::{FutureExt, TryStreamExt};
    use mongodb::options::{IndexOptions, UpdateModifications};
    use mongodb::{Client, Collection, IndexModel};
    use tokio::sync::OnceCell;

    use super::{ConnectionMetadata, MetadataPatch, MetadataStore};
    use crate::error::{PolyMongoError, Result};

    const COLLECTION_NAME: &str = "connection_metadata";

    /// [`MetadataStore`] backed by a dedicated connection to the configured
    /// metadata database.
    pub struct MongoMetadataStore {
        uri: String,
        db_name: String,
        collection: OnceCell<Collection<ConnectionMetadata>>,
    }

    impl MongoMetadataStore {
        pub fn new(base_uri: impl Into<String>, metadata_db: impl Into<String>) -> Self {
            Self {
                uri: base_uri.into(),
                db_name: metadata_db.into(),
                collection: OnceCell::new(),
            }
        }

        async fn collection(&self) -> Result<&Collection<ConnectionMetadata>> {
            self.collection
                .get_or_try_init(|| async {
                    let client = Client::with_uri_str(&self.uri)
                        .await
                        .map_err(PolyMongoError::MetadataInitFailed)?;
                    let db = client.database(&self.db_name);
                    let collection = db.collection::<ConnectionMetadata>(COLLECTION_NAME);

                    collection
                        .create_index(
                            IndexModel::builder()
                                .keys(doc! { "db_name": 1 })
                                .options(IndexOptions::builder().unique(true).build())
                                .build(),
                        )
                        .await
                        .map_err(PolyMongoError::MetadataInitFailed)?;
                    collection
                        .create_index(IndexModel::builder().keys(doc! { "priority": 1 }).build())
                        .await
                        .map_err(PolyMongoError::MetadataInitFailed)?;
                    collection
                        .create_index(IndexModel::builder().keys(doc! { "last_used": -1 }).build())
                        .await
                        .map_err(PolyMongoError::MetadataInitFailed)?;

                    Ok(collection)
                })
                .await
        }
    }

    impl MetadataStore for MongoMetadataStore {
        fn init(&self) -> BoxFuture<'_, Result<()>> {
            async move {
                self.collection().await?;
                Ok(())
            }
            .boxed()
        }

        fn get(&self, db_name: &str) -> BoxFuture<'_, Result<ConnectionMetadata>> {
            let db_name = db_name.to_string();
            async move {
                let collection = self.collection().await?;
                let now = Utc::now();

                let existing = collection
                    .find_one(doc! { "db_name": &db_name })
                    .await
                    .map_err(PolyMongoError::MetadataInitFailed)?;

                if let Some(record) = existing {
                    return Ok(record);
                }

                let fresh = ConnectionMetadata::new_default(&db_name, now);
                collection
                    .insert_one(&fresh)
                    .await
                    .map_err(PolyMongoError::MetadataInitFailed)?;
                Ok(fresh)
            }
            .boxed()
        }

        fn update(&self, db_name: &str, patch: MetadataPatch) -> BoxFuture<'_, Result<()>> {
            let db_name = db_name.to_string();
            async move {
                let collection = self.collection().await?;
                let now = Utc::now();

                let mut set_doc = doc! { "updated_at": bson::DateTime::from_chrono(now) };
                if let Some(priority) = patch.priority {
                    set_doc.insert("priority", priority);
                }
                if let Some(has_watch) = patch.has_active_watch {
                    set_doc.insert("has_active_watch", has_watch);
                }

                collection
                    .update_one(
                        doc! { "db_name": &db_name },
                        UpdateModifications::Document(doc! { "$set": set_doc }),
                    )
                    .upsert(true)
                    .await
                    .map_err(PolyMongoError::MetadataInitFailed)?;
                Ok(())
            }
            .boxed()
        }

        fn increment_use_count(&self, db_name: &str) -> BoxFuture<'_, ()> {
            let db_name = db_name.to_string();
            async move {
                let collection = match self.collection().await {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::warn!(db_name = %db_name, error = %err, "metadata store unavailable, skipping use-count increment");
                        return;
                    }
                };
                let now = Utc::now();

                let result = collection
                    .update_one(
                        doc! { "db_name": &db_name },
                        UpdateModifications::Document(doc! {
                            "$inc": { "use_count": 1_i64 },
                            "$set": { "last_used": bson::DateTime::from_chrono(now), "idle_time_ms": 0_i64 },
                        }),
                    )
                    .upsert(true)
                    .await;

                if let Err(err) = result {
                    tracing::warn!(db_name = %db_name, error = %err, "failed to persist use-count increment");
                }
            }
            .boxed()
        }

        fn get_all(&self) -> BoxFuture<'_, Result<Vec<ConnectionMetadata>>> {
            async move {
                let collection = self.collection().await?;
                let cursor = collection
                    .find(doc! {})
                    .await
                    .map_err(PolyMongoError::MetadataInitFailed)?;
                cursor
                    .try_collect()
                    .await
                    .map_err(PolyMongoError::MetadataInitFailed)
            }
            .boxed()
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            async move {}.boxed()
        }
    }
}

pub use mongo::MongoMetadataStore;

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! An in-memory [`MetadataStore`] for tests, with upsert-only, atomic
    //! increment semantics matching the real collection.

    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Utc;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use tokio::sync::Mutex;

    use super::{ConnectionMetadata, MetadataPatch, MetadataStore};
    use crate::error::Result;

    /// `records` is `Arc`-wrapped so a test can hand the same backing store
    /// to two successive orchestrators and observe persistence across a
    /// simulated restart.
    #[derive(Debug, Default, Clone)]
    pub struct InMemoryMetadataStore {
        records: Arc<Mutex<HashMap<String, ConnectionMetadata>>>,
    }

    impl InMemoryMetadataStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl MetadataStore for InMemoryMetadataStore {
        fn init(&self) -> BoxFuture<'_, Result<()>> {
            async move { Ok(()) }.boxed()
        }

        fn get(&self, db_name: &str) -> BoxFuture<'_, Result<ConnectionMetadata>> {
            let db_name = db_name.to_string();
            async move {
                let mut records = self.records.lock().await;
                let record = records
                    .entry(db_name.clone())
                    .or_insert_with(|| ConnectionMetadata::new_default(&db_name, Utc::now()))
                    .clone();
                Ok(record)
            }
            .boxed()
        }

        fn update(&self, db_name: &str, patch: MetadataPatch) -> BoxFuture<'_, Result<()>> {
            let db_name = db_name.to_string();
            async move {
                let mut records = self.records.lock().await;
                let now = Utc::now();
                let record = records
                    .entry(db_name.clone())
                    .or_insert_with(|| ConnectionMetadata::new_default(&db_name, now));

                if let Some(priority) = patch.priority {
                    record.priority = priority;
                }
                if let Some(has_watch) = patch.has_active_watch {
                    record.has_active_watch = has_watch;
                }
                record.updated_at = now;
                Ok(())
            }
            .boxed()
        }

        fn increment_use_count(&self, db_name: &str) -> BoxFuture<'_, ()> {
            let db_name = db_name.to_string();
            async move {
                let mut records = self.records.lock().await;
                let now = Utc::now();
                let record = records
                    .entry(db_name.clone())
                    .or_insert_with(|| ConnectionMetadata::new_default(&db_name, now));
                record.use_count += 1;
                record.last_used = now;
                record.idle_time_ms = 0;
            }
            .boxed()
        }

        fn get_all(&self) -> BoxFuture<'_, Result<Vec<ConnectionMetadata>>> {
            async move { Ok(self.records.lock().await.values().cloned().collect()) }.boxed()
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            async move {}.boxed()
        }
    }
}
