//! Process-local record of when each sandbox was last used.
//!
//! Weakly consistent: each manager instance has its own view. Good enough to
//! steer reclamation, not to gate correctness.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use labvm_core::Clock;

pub struct ActivityTracker {
    last_active: RwLock<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl ActivityTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_active: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Upsert `now` for a sandbox. Unknown ids are registered on the fly.
    pub async fn record(&self, sandbox_id: &str) {
        let now = self.clock.now();
        self.last_active.write().await.insert(sandbox_id.to_string(), now);
    }

    /// Register `at` only if nothing is recorded yet. Returns whether it did.
    pub async fn seed(&self, sandbox_id: &str, at: DateTime<Utc>) -> bool {
        let mut map = self.last_active.write().await;
        if map.contains_key(sandbox_id) {
            return false;
        }
        map.insert(sandbox_id.to_string(), at);
        true
    }

    pub async fn last_active(&self, sandbox_id: &str) -> Option<DateTime<Utc>> {
        self.last_active.read().await.get(sandbox_id).copied()
    }

    /// Time since last activity, `None` if never observed.
    pub async fn idle_for(&self, sandbox_id: &str) -> Option<Duration> {
        let last = self.last_active(sandbox_id).await?;
        Some((self.clock.now() - last).max(Duration::zero()))
    }

    pub async fn forget(&self, sandbox_id: &str) {
        self.last_active.write().await.remove(sandbox_id);
    }

    pub async fn len(&self) -> usize {
        self.last_active.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use labvm_core::ManualClock;

    use super::*;

    #[tokio::test]
    async fn idle_time_follows_the_clock() {
        let clock = Arc::new(ManualClock::default());
        let tracker = ActivityTracker::new(clock.clone());
        assert!(tracker.idle_for("abc").await.is_none());

        tracker.record("abc").await;
        clock.advance(Duration::minutes(11));
        assert_eq!(tracker.idle_for("abc").await, Some(Duration::minutes(11)));

        tracker.record("abc").await;
        assert_eq!(tracker.idle_for("abc").await, Some(Duration::zero()));
    }

    #[tokio::test]
    async fn seed_does_not_overwrite_real_activity() {
        let clock = Arc::new(ManualClock::default());
        let tracker = ActivityTracker::new(clock.clone());
        tracker.record("abc").await;
        let earlier = clock.now() - Duration::hours(1);
        assert!(!tracker.seed("abc", earlier).await);
        assert!(tracker.seed("def", earlier).await);
        assert_eq!(tracker.idle_for("def").await, Some(Duration::hours(1)));

        tracker.forget("abc").await;
        assert_eq!(tracker.len().await, 1);
    }
}
