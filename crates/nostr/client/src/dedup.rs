//! Cross-relay event deduplication.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Bounded set of recently seen event ids.
///
/// Evicts oldest-inserted first once `capacity` is exceeded, and, when a
/// retention period is set, forgets ids older than it.
#[derive(Debug)]
pub struct SeenEventCache {
    capacity: usize,
    retention: Option<Duration>,
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenEventCache {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Record `id` as seen at `now`. Returns `true` if it was not already held.
    pub fn insert_at(&mut self, id: &str, now: Instant) -> bool {
        self.expire(now);
        if self.ids.contains(id) {
            return false;
        }

        self.ids.insert(id.to_string());
        self.order.push_back((id.to_string(), now));
        while self.order.len() > self.capacity {
            if let Some((evicted, _)) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }

    fn expire(&mut self, now: Instant) {
        let Some(retention) = self.retention else {
            return;
        };
        while let Some((id, seen_at)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) < retention {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}

/// Thread-safe front for [`SeenEventCache`], shared by all session events.
#[derive(Debug)]
pub struct EventDeduplicator {
    cache: Mutex<SeenEventCache>,
}

impl EventDeduplicator {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            cache: Mutex::new(SeenEventCache::new(capacity, retention)),
        }
    }

    /// `true` the first time `event_id` is observed within the retention
    /// window, `false` for every repeat until it is evicted.
    pub fn observe(&self, event_id: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert_at(event_id, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
