//! The seam between the pool engine and the concrete MongoDB driver.
//!
//! The cache, eviction and metadata layers are generic over [`Driver`] so
//! they can run against the real `mongodb` crate in production and against
//! [`fake::FakeDriver`] in tests, without a live deployment.

use futures_util::future::BoxFuture;

use crate::error::Result;

/// Observable readiness of a driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

/// Opens connections for a given base URI. Implemented by [`MongoDriver`] in
/// production and [`fake::FakeDriver`] in tests.
pub trait Driver: Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Open a connection to `uri`, waiting until the driver reports it ready.
    fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Self::Connection>>;
}

/// A single live connection to one database.
pub trait DriverConnection: Send + Sync + Clone + 'static {
    fn state(&self) -> ConnectionState;

    /// Tear down the connection. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A change-stream handle registered against a connection. Its liveness pins
/// the connection against automatic eviction until [`close`](Self::close) is
/// called.
pub trait WatchStream: Send + Sync + 'static {
    fn close(&self) -> BoxFuture<'_, ()>;
}

mod mongo {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    use bson::doc;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use mongodb::Client;

    use super::{ConnectionState, Driver, DriverConnection};
    use crate::error::{PolyMongoError, Result};

    const STATE_CONNECTING: u8 = 0;
    const STATE_CONNECTED: u8 = 1;
    const STATE_CLOSED: u8 = 2;

    /// Production [`Driver`] backed by the real `mongodb` crate. Each call to
    /// [`connect`](Driver::connect) establishes a distinct [`Client`] scoped
    /// to one database, matching the one-connection-per-database model the
    /// cache assumes.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MongoDriver;

    impl Driver for MongoDriver {
        type Connection = MongoConnection;

        fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Self::Connection>> {
            async move {
                let client = Client::with_uri_str(uri)
                    .await
                    .map_err(|source| PolyMongoError::ConnectionFailed {
                        db_name: db_name_from_uri(uri),
                        source,
                    })?;

                let db_name = db_name_from_uri(uri);
                let database = client.database(&db_name);

                // A cheap round trip to confirm the server actually answers
                // before the connection is handed back as ready.
                database
                    .run_command(doc! { "ping": 1 })
                    .await
                    .map_err(|source| PolyMongoError::ConnectionFailed {
                        db_name: db_name.clone(),
                        source,
                    })?;

                Ok(MongoConnection {
                    client,
                    database,
                    state: Arc::new(AtomicU8::new(STATE_CONNECTED)),
                })
            }
            .boxed()
        }
    }

    fn db_name_from_uri(uri: &str) -> String {
        uri.rsplit('/').next().unwrap_or_default().to_string()
    }

    /// A live connection bound to one [`mongodb::Database`].
    #[derive(Debug, Clone)]
    pub struct MongoConnection {
        client: Client,
        database: mongodb::Database,
        state: Arc<AtomicU8>,
    }

    impl MongoConnection {
        /// The database handle query execution is dispatched against. Used
        /// by the model-forwarding layer, not by the cache itself.
        pub fn database(&self) -> &mongodb::Database {
            &self.database
        }
    }

    impl DriverConnection for MongoConnection {
        fn state(&self) -> ConnectionState {
            match self.state.load(Ordering::Acquire) {
                STATE_CONNECTING => ConnectionState::Connecting,
                STATE_CLOSED => ConnectionState::Closed,
                _ => ConnectionState::Connected,
            }
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            async move {
                // The driver's own Client keeps its monitoring tasks alive
                // until every clone is dropped; marking the state closed is
                // enough for the cache to stop treating this as live.
                self.state.store(STATE_CLOSED, Ordering::Release);
            }
            .boxed()
        }
    }
}

pub use mongo::{MongoConnection, MongoDriver};

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! An in-memory [`Driver`] for exercising the cache, eviction and
    //! metadata contracts without a live MongoDB deployment.

    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use tokio::sync::Mutex;

    use super::{ConnectionState, Driver, DriverConnection};
    use crate::error::{PolyMongoError, Result};

    const STATE_CONNECTED: u8 = 1;
    const STATE_CLOSED: u8 = 2;

    /// Records every URI the fake driver was asked to open, in order.
    #[derive(Debug, Default, Clone)]
    pub struct FakeDriver {
        inner: Arc<Mutex<FakeDriverState>>,
    }

    #[derive(Debug, Default)]
    struct FakeDriverState {
        opened: Vec<String>,
        /// Database names (suffix of the URI) that should fail to connect.
        fail_for: Vec<String>,
        open_delay: Option<std::time::Duration>,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next connect attempt for `db_name` fail.
        pub async fn fail_next_connect(&self, db_name: impl Into<String>) {
            self.inner.lock().await.fail_for.push(db_name.into());
        }

        /// Artificial latency applied to every subsequent `connect` call.
        pub async fn set_open_delay(&self, delay: std::time::Duration) {
            self.inner.lock().await.open_delay = Some(delay);
        }

        pub async fn opened_uris(&self) -> Vec<String> {
            self.inner.lock().await.opened.clone()
        }
    }

    impl Driver for FakeDriver {
        type Connection = FakeConnection;

        fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Self::Connection>> {
            async move {
                let db_name = uri.rsplit('/').next().unwrap_or_default().to_string();

                let delay = {
                    let mut state = self.inner.lock().await;
                    state.opened.push(uri.to_string());
                    let should_fail = if let Some(pos) =
                        state.fail_for.iter().position(|d| d == &db_name)
                    {
                        state.fail_for.remove(pos);
                        true
                    } else {
                        false
                    };
                    let delay = state.open_delay;
                    (should_fail, delay)
                };

                if let Some(d) = delay.1 {
                    tokio::time::sleep(d).await;
                }

                if delay.0 {
                    return Err(PolyMongoError::ConnectionFailed {
                        db_name,
                        source: fake_driver_error(),
                    });
                }

                Ok(FakeConnection {
                    state: Arc::new(AtomicU8::new(STATE_CONNECTED)),
                })
            }
            .boxed()
        }
    }

    fn fake_driver_error() -> mongodb::error::Error {
        use mongodb::error::ErrorKind;
        ErrorKind::Internal {
            message: "fake driver: injected connect failure".to_string(),
        }
        .into()
    }

    #[derive(Debug, Clone)]
    pub struct FakeConnection {
        state: Arc<AtomicU8>,
    }

    impl DriverConnection for FakeConnection {
        fn state(&self) -> ConnectionState {
            if self.state.load(Ordering::Acquire) == STATE_CLOSED {
                ConnectionState::Closed
            } else {
                ConnectionState::Connected
            }
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            async move {
                self.state.store(STATE_CLOSED, Ordering::Release);
            }
            .boxed()
        }
    }

    /// A watch stream stub that records whether it has been closed.
    #[derive(Debug, Clone, Default)]
    pub struct FakeWatchStream {
        closed: Arc<AtomicU8>,
    }

    impl FakeWatchStream {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire) == 1
        }
    }

    impl super::WatchStream for FakeWatchStream {
        fn close(&self) -> BoxFuture<'_, ()> {
            async move {
                self.closed.store(1, Ordering::Release);
            }
            .boxed()
        }
    }
}
