//! Interchangeable eviction policies. A factory maps [`crate::config::EvictionType`]
//! to a concrete strategy at orchestrator construction time.

use std::time::Duration;

use crate::config::{priority, EvictionType};
use crate::scoring::{self, ScoreInputs};

/// The subset of a live connection's state a strategy needs to make a
/// decision, independent of how the cache stores it.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub db_name: String,
    pub priority: i64,
    pub has_active_watch: bool,
    pub created_at_millis: i64,
    pub last_activity_millis: i64,
    pub use_count: u64,
}

impl EvictionCandidate {
    /// True for connections no automatic selector may ever pick: priority
    /// `NEVER_CLOSE` or an active watch stream (invariants 3 and 4).
    pub(crate) fn is_protected(&self) -> bool {
        self.priority == priority::NEVER_CLOSE || self.has_active_watch
    }
}

pub trait EvictionStrategy: Send + Sync {
    /// Re-checked at idle-timer firing time, since state may have changed
    /// between scheduling and firing.
    fn should_evict(&self, candidate: &EvictionCandidate, now_millis: i64) -> bool;

    /// Choose up to `n` victims, ascending in how evictable they are handled
    /// by each implementation's own ordering.
    fn select_for_eviction(&self, candidates: &[EvictionCandidate], n: usize, now_millis: i64) -> Vec<String>;
}

/// No automatic eviction; only explicit `close` operates.
#[derive(Debug, Default)]
pub struct Manual;

impl EvictionStrategy for Manual {
    fn should_evict(&self, _candidate: &EvictionCandidate, _now_millis: i64) -> bool {
        false
    }

    fn select_for_eviction(&self, _candidates: &[EvictionCandidate], _n: usize, _now_millis: i64) -> Vec<String> {
        Vec::new()
    }
}

/// Evicts connections idle for at least `idle_timeout`.
#[derive(Debug)]
pub struct Timeout {
    idle_timeout: Duration,
}

impl Timeout {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    fn is_eligible(&self, candidate: &EvictionCandidate, now_millis: i64) -> bool {
        if candidate.is_protected() {
            return false;
        }
        let idle_ms = now_millis - candidate.last_activity_millis;
        idle_ms >= self.idle_timeout.as_millis() as i64
    }
}

impl EvictionStrategy for Timeout {
    fn should_evict(&self, candidate: &EvictionCandidate, now_millis: i64) -> bool {
        self.is_eligible(candidate, now_millis)
    }

    fn select_for_eviction(&self, candidates: &[EvictionCandidate], n: usize, now_millis: i64) -> Vec<String> {
        let mut eligible: Vec<&EvictionCandidate> = candidates
            .iter()
            .filter(|c| self.is_eligible(c, now_millis))
            .collect();

        eligible.sort_by(|a, b| {
            let a_idle = now_millis - a.last_activity_millis;
            let b_idle = now_millis - b.last_activity_millis;
            b_idle.cmp(&a_idle).then_with(|| a.db_name.cmp(&b.db_name))
        });

        eligible.into_iter().take(n).map(|c| c.db_name.clone()).collect()
    }
}

/// Priority-and-recency-adaptive scoring via [`crate::scoring`].
#[derive(Debug, Default)]
pub struct Lru;

impl Lru {
    fn score_of(&self, candidate: &EvictionCandidate, now_millis: i64) -> f64 {
        scoring::score(ScoreInputs {
            now_millis,
            created_at_millis: candidate.created_at_millis,
            last_activity_millis: candidate.last_activity_millis,
            use_count: candidate.use_count,
            priority: candidate.priority,
        })
    }
}

impl EvictionStrategy for Lru {
    fn should_evict(&self, candidate: &EvictionCandidate, _now_millis: i64) -> bool {
        !candidate.is_protected()
    }

    fn select_for_eviction(&self, candidates: &[EvictionCandidate], n: usize, now_millis: i64) -> Vec<String> {
        // Invariant 3/4: a watched or priority-NEVER_CLOSE connection is
        // never chosen by an automatic selector, so there is no fallback
        // that widens the pool to include them — the caller (enforceMax)
        // is responsible for clamping `n` to what is actually eligible.
        let mut strict: Vec<&EvictionCandidate> = candidates.iter().filter(|c| !c.is_protected()).collect();

        strict.sort_by(|a, b| {
            let a_score = self.score_of(a, now_millis);
            let b_score = self.score_of(b, now_millis);
            a_score
                .partial_cmp(&b_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.db_name.cmp(&b.db_name))
        });

        strict.into_iter().take(n).map(|c| c.db_name.clone()).collect()
    }
}

/// Builds the strategy configured by [`EvictionType`].
pub fn build(eviction_type: EvictionType, idle_timeout: Duration) -> Box<dyn EvictionStrategy> {
    match eviction_type {
        EvictionType::Manual => Box::new(Manual),
        EvictionType::Timeout => Box::new(Timeout::new(idle_timeout)),
        EvictionType::Lru => Box::new(Lru),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, priority: i64, watch: bool, use_count: u64, last_activity_millis: i64) -> EvictionCandidate {
        EvictionCandidate {
            db_name: name.to_string(),
            priority,
            has_active_watch: watch,
            created_at_millis: 0,
            last_activity_millis,
            use_count,
        }
    }

    #[test]
    fn manual_never_selects_or_evicts() {
        let m = Manual;
        let c = candidate("a", 0, false, 10, 0);
        assert!(!m.should_evict(&c, 1_000_000));
        assert!(m.select_for_eviction(&[c], 5, 1_000_000).is_empty());
    }

    #[test]
    fn timeout_respects_priority_and_watch_protection() {
        let t = Timeout::new(Duration::from_millis(100));
        let protected_priority = candidate("a", priority::NEVER_CLOSE, false, 1, 0);
        let protected_watch = candidate("b", 0, true, 1, 0);
        let evictable = candidate("c", 0, false, 1, 0);

        assert!(!t.should_evict(&protected_priority, 1_000));
        assert!(!t.should_evict(&protected_watch, 1_000));
        assert!(t.should_evict(&evictable, 1_000));
    }

    #[test]
    fn timeout_selects_most_idle_first() {
        let t = Timeout::new(Duration::from_millis(0));
        let a = candidate("a", 0, false, 1, 900);
        let b = candidate("b", 0, false, 1, 100);
        let picked = t.select_for_eviction(&[a, b], 1, 1_000);
        assert_eq!(picked, vec!["b".to_string()]);
    }

    #[test]
    fn lru_never_picks_priority_never_close() {
        let lru = Lru;
        let protected = candidate("a", priority::NEVER_CLOSE, false, 1_000_000, 0);
        let normal = candidate("b", priority::MEDIUM, false, 1, 0);
        let picked = lru.select_for_eviction(&[protected, normal], 2, 10_000);
        assert_eq!(picked, vec!["b".to_string()]);
    }

    #[test]
    fn lru_never_selects_a_watched_connection_even_as_the_only_candidate() {
        let lru = Lru;
        let watched = candidate("a", priority::MEDIUM, true, 1, 0);
        let picked = lru.select_for_eviction(&[watched], 1, 10_000);
        assert!(picked.is_empty());
    }
}
