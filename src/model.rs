//! The `wrapModel` proxy: a handle exposing `.db(name)` database selection
//! plus the query surface, forwarding every terminal call onto the
//! connection the orchestrator returns for the selected database.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use bson::Document;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, TryStreamExt};
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::Cursor;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::driver::WatchStream as EngineWatchStream;
use crate::error::{PolyMongoError, Result};
use crate::orchestrator::PolyMongo;

/// A schema bound to one collection, forwarding queries to whichever
/// database `.db(name)` most recently selected (or the orchestrator's
/// `defaultDB` if none was selected for this call).
pub struct ModelHandle<T> {
    orchestrator: Arc<PolyMongo>,
    collection_name: String,
    default_db: String,
    /// Reset to `None` by every terminal operation (`find`, `aggregate`,
    /// `watch`, ...).
    selected_db: StdMutex<Option<String>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ModelHandle<T>
where
    T: Send + Sync + Unpin + Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(orchestrator: Arc<PolyMongo>, collection_name: String) -> Self {
        let default_db = orchestrator.config().default_db().to_string();
        Self {
            orchestrator,
            collection_name,
            default_db,
            selected_db: StdMutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Select the database the next terminal operation runs against.
    pub fn db(&self, name: impl Into<String>) -> &Self {
        *self.selected_db.lock().unwrap() = Some(name.into());
        self
    }

    fn take_target_db(&self) -> String {
        self.selected_db
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| self.default_db.clone())
    }

    async fn collection(&self) -> Result<(String, mongodb::Collection<T>)> {
        let db_name = self.take_target_db();
        let connection = self.orchestrator.get(&db_name).await?;
        let collection = connection.database().collection::<T>(&self.collection_name);
        Ok((db_name, collection))
    }

    fn query_failed(db_name: &str, source: mongodb::error::Error) -> PolyMongoError {
        PolyMongoError::ConnectionFailed {
            db_name: db_name.to_string(),
            source,
        }
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        let (db_name, collection) = self.collection().await?;
        collection
            .find_one(filter)
            .await
            .map_err(|source| Self::query_failed(&db_name, source))
    }

    pub async fn find(&self, filter: Document) -> Result<Vec<T>> {
        let (db_name, collection) = self.collection().await?;
        let cursor: Cursor<T> = collection
            .find(filter)
            .await
            .map_err(|source| Self::query_failed(&db_name, source))?;
        cursor
            .try_collect()
            .await
            .map_err(|source| Self::query_failed(&db_name, source))
    }

    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let (db_name, collection) = self.collection().await?;
        let cursor = collection
            .aggregate(pipeline)
            .await
            .map_err(|source| Self::query_failed(&db_name, source))?;
        cursor
            .try_collect()
            .await
            .map_err(|source| Self::query_failed(&db_name, source))
    }

    /// Opens a change stream and registers it with the cache so the
    /// underlying connection is pinned against automatic eviction for as
    /// long as the stream is alive. The returned [`WatchedChangeStream`]
    /// forwards to the real driver stream; the cache tears that stream down
    /// when it calls `close` during eviction, and the stream's own
    /// exhaustion (or the handle being dropped) unregisters it in turn.
    pub async fn watch(&self) -> Result<WatchedChangeStream<T>> {
        let (db_name, collection) = self.collection().await?;
        let stream = collection
            .watch()
            .await
            .map_err(|source| Self::query_failed(&db_name, source))?;

        let inner = Arc::new(StdMutex::new(Some(Box::pin(stream))));
        let close_handle: Arc<dyn EngineWatchStream> = Arc::new(WatchCloseHandle {
            inner: Arc::clone(&inner),
        });
        self.orchestrator
            .cache()
            .register_watch_stream(&db_name, Arc::clone(&close_handle))
            .await?;

        Ok(WatchedChangeStream {
            inner,
            orchestrator: Arc::clone(&self.orchestrator),
            db_name,
            handle: close_handle,
            unregistered: AtomicBool::new(false),
        })
    }
}

type InnerStream<T> = Arc<StdMutex<Option<Pin<Box<ChangeStream<ChangeStreamEvent<T>>>>>>>;

/// The engine-facing side of an outstanding watch: dropping the inner
/// `ChangeStream` tears down the driver's cursor, which is what the cache
/// calls on eviction (§5: "the cache calls `.close()` on each when
/// evicting").
struct WatchCloseHandle<T> {
    inner: InnerStream<T>,
}

impl<T: Send + Sync + 'static> EngineWatchStream for WatchCloseHandle<T> {
    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            self.inner.lock().unwrap().take();
        }
        .boxed()
    }
}

/// A change stream whose lifetime is tied to the connection's watch
/// registration. Forwards polling to the real `mongodb::ChangeStream`;
/// once that stream ends (driver-side close, or this handle being dropped
/// before exhaustion) it runs `unregisterWatchStream` on the connection
/// that opened it, per §4.4's `registerWatchStream` contract.
pub struct WatchedChangeStream<T> {
    inner: InnerStream<T>,
    orchestrator: Arc<PolyMongo>,
    db_name: String,
    handle: Arc<dyn EngineWatchStream>,
    unregistered: AtomicBool,
}

impl<T> WatchedChangeStream<T> {
    fn spawn_unregister(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = Arc::clone(self.orchestrator.cache());
        let db_name = self.db_name.clone();
        let handle = Arc::clone(&self.handle);
        tokio::spawn(async move {
            if let Err(err) = cache.unregister_watch_stream(&db_name, &handle).await {
                tracing::warn!(db_name = %db_name, error = %err, "failed to unregister watch stream");
            }
        });
    }
}

impl<T> Stream for WatchedChangeStream<T>
where
    T: Send + Sync + Unpin + DeserializeOwned + 'static,
{
    type Item = mongodb::error::Result<ChangeStreamEvent<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut guard = this.inner.lock().unwrap();

        let Some(stream) = guard.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                guard.take();
                drop(guard);
                this.spawn_unregister();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> Drop for WatchedChangeStream<T> {
    fn drop(&mut self) {
        self.spawn_unregister();
    }
}
