//! Registry of recently sent bot messages.
//!
//! Lets the trigger detector recognize "reply to one of ours" without a
//! network round trip. Bounded two ways: entries expire `ttl` after their
//! latest mark, and a prune pass evicts oldest-first past `max_entries`.
//! Every operation is synchronous; the mutex is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// One remembered outbound message.
#[derive(Debug, Clone)]
struct TrackedReply {
    created_at: Instant,
    seq: u64,
    source: String,
}

#[derive(Debug, Default)]
struct TrackerInner {
    entries: HashMap<String, TrackedReply>,
    next_seq: u64,
}

/// Snapshot of tracker occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub size: usize,
}

/// Bounded, TTL'd registry of message ids the bot has sent.
pub struct ReplyTargetTracker {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<TrackerInner>,
}

impl ReplyTargetTracker {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    /// Record a sent message. Idempotent: re-marking resets the entry's age
    /// and its position in the eviction order.
    pub fn mark_sent(&self, id: &str, source: &str) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            id.to_string(),
            TrackedReply {
                created_at: Instant::now(),
                seq,
                source: source.to_string(),
            },
        );
    }

    /// Is this one of ours? Expiry is enforced on read: a lookup past the
    /// TTL deletes the entry and reports false.
    pub fn contains(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(id) {
            Some(entry) => entry.created_at.elapsed() > self.ttl,
            None => return false,
        };
        if expired {
            inner.entries.remove(id);
            false
        } else {
            true
        }
    }

    /// Drop expired entries, then evict oldest-inserted entries until the
    /// resident count is within `max_entries`. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();

        let ttl = self.ttl;
        inner.entries.retain(|_, entry| entry.created_at.elapsed() <= ttl);

        while inner.entries.len() > self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, entry)| (id.clone(), entry.source.clone()));
            match oldest {
                Some((id, source)) => {
                    debug!(id = %id, source = %source, "Evicting oldest tracked reply");
                    inner.entries.remove(&id);
                }
                None => break,
            }
        }

        before - inner.entries.len()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            size: self.inner.lock().unwrap().entries.len(),
        }
    }
}

/// Spawn a background task that runs the prune sweep on an interval.
pub fn spawn_prune_task(
    tracker: Arc<ReplyTargetTracker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        loop {
            interval.tick().await;
            let removed = tracker.prune();
            if removed > 0 {
                debug!(removed, "Tracker prune sweep");
            }
        }
    })
}
