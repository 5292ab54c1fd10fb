//! Pure scoring function for the LRU-adaptive eviction strategy. No I/O; the
//! only state it consumes is what the caller already holds in memory.

use crate::config::priority;

pub const IDLE_TIME_WEIGHT: f64 = 0.001;
pub const PRIORITY_BASE: f64 = 1000.0;
/// A large finite sentinel, not infinity, so `priority == NEVER_CLOSE`
/// entries still order predictably against each other on ties elsewhere.
pub const VERY_LARGE: f64 = (i32::MAX / 2) as f64;

/// The subset of a connection's state the formula needs. Kept separate from
/// [`crate::cache::info::ConnectionInfo`] so the formula can be unit tested
/// without constructing a live connection.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub now_millis: i64,
    pub created_at_millis: i64,
    pub last_activity_millis: i64,
    pub use_count: u64,
    pub priority: i64,
}

/// Lower score is more evictable.
pub fn score(inputs: ScoreInputs) -> f64 {
    let lifetime_ms = (inputs.now_millis - inputs.created_at_millis).max(0) as f64;
    let use_count = inputs.use_count as f64;

    let avg_interval = if inputs.use_count > 0 {
        lifetime_ms / use_count
    } else {
        lifetime_ms
    };

    let use_score = use_count / avg_interval.max(1.0);

    let idle_ms = (inputs.now_millis - inputs.last_activity_millis).max(0) as f64;
    let idle_penalty = idle_ms * IDLE_TIME_WEIGHT;

    let priority_weight = if inputs.priority == priority::NEVER_CLOSE {
        VERY_LARGE
    } else {
        PRIORITY_BASE / (inputs.priority as f64 + 1.0)
    };

    use_score - idle_penalty + priority_weight
}
