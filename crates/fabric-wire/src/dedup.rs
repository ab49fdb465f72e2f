//! Seen-message set used for loop prevention.
//!
//! Bounded in both size (LRU eviction) and time (entries older than the TTL
//! count as unseen), so a long-running node does not accumulate every id it
//! has ever observed.

use crate::message::MessageId;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Bounded, time-windowed set of message ids.
#[derive(Debug)]
pub struct DedupSet {
    seen: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record `id`. Returns `false` if it was already seen inside the window.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, id: MessageId, now: Instant) -> bool {
        if let Some(first_seen) = self.seen.get(&id).copied() {
            if now.saturating_duration_since(first_seen) < self.ttl {
                return false;
            }
        }
        self.seen.put(id, now);
        true
    }
}
