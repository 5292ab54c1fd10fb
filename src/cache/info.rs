use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::driver::{DriverConnection, WatchStream};
use crate::metadata::ConnectionMetadata;

/// Live, in-memory state for one open connection. Owns its watch streams and
/// its idle timer; the cache owns this.
pub struct ConnectionInfo<C: DriverConnection> {
    pub connection: C,
    pub watch_streams: Vec<Arc<dyn WatchStream>>,
    pub metadata: ConnectionMetadata,
    /// Milliseconds on the cache's monotonic clock, not wall-clock time —
    /// comparable directly against `idle_timeout`.
    pub last_activity_millis: i64,
    pub created_at_millis: i64,
    pub idle_timer: Option<JoinHandle<()>>,
}

impl<C: DriverConnection> ConnectionInfo<C> {
    pub fn new(connection: C, metadata: ConnectionMetadata, now_millis: i64) -> Self {
        Self {
            connection,
            watch_streams: Vec::new(),
            metadata,
            last_activity_millis: now_millis,
            created_at_millis: now_millis,
            idle_timer: None,
        }
    }

    pub fn has_active_watch(&self) -> bool {
        !self.watch_streams.is_empty()
    }

    /// Cancels any pending idle timer. Safe to call when none is armed.
    pub fn cancel_idle_timer(&mut self) {
        if let Some(handle) = self.idle_timer.take() {
            handle.abort();
        }
    }
}
