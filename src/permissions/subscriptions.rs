//! Reference counting and grace-period eviction of cache entries

use crate::permissions::key::CanonicalKey;
use crate::permissions::store::{CacheStore, CheckStatus, EntryPatch};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Timer resolution slack added to sweep deadlines so that the strict
/// `elapsed > ttl` test holds when the sweep fires.
const SWEEP_SLACK: Duration = Duration::from_millis(1);

/// Result of [`SubscriptionManager::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub ref_count: usize,
    /// The entry has not been dispatched yet and must be (re)queued
    pub needs_dispatch: bool,
}

/// Result of [`SubscriptionManager::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other subscribers remain
    Shared { remaining: usize },
    /// Last subscriber left; the entry is now an eviction candidate
    Idle { status: CheckStatus },
    /// Nothing was held for this key
    Untracked,
}

/// Tracks how many consumers still care about each key
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    grace_ttl: Duration,
}

impl SubscriptionManager {
    pub fn new(grace_ttl: Duration) -> Self {
        Self { grace_ttl }
    }

    pub fn grace_ttl(&self) -> Duration {
        self.grace_ttl
    }

    pub fn acquire(&self, store: &mut CacheStore, key: &CanonicalKey, now: Instant) -> Acquired {
        let current = store.get(key).map_or(0, |entry| entry.ref_count);
        let patch = EntryPatch {
            ref_count: Some(current + 1),
            last_touched_at: Some(now),
            ..EntryPatch::default()
        };
        let entry = store.upsert(key, patch, now);
        Acquired {
            ref_count: entry.ref_count,
            needs_dispatch: entry.status == CheckStatus::Pending,
        }
    }

    pub fn release(&self, store: &mut CacheStore, key: &CanonicalKey, now: Instant) -> Released {
        let Some(entry) = store.get_mut(key) else {
            return Released::Untracked;
        };
        if entry.ref_count == 0 {
            return Released::Untracked;
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Released::Shared {
                remaining: entry.ref_count,
            };
        }

        entry.last_touched_at = now;
        debug!("Key {} has no subscribers left, eligible for eviction", key);
        Released::Idle { status: entry.status }
    }

    /// Remove every unreferenced entry idle for longer than `ttl`.
    ///
    /// In-flight entries are kept until their response is applied.
    pub fn evict_stale(&self, store: &mut CacheStore, now: Instant, ttl: Duration) -> Vec<CanonicalKey> {
        let mut evicted = Vec::new();
        store.retain(|key, entry| {
            let stale = entry.ref_count == 0
                && entry.status != CheckStatus::InFlight
                && now.saturating_duration_since(entry.last_touched_at) > ttl;
            if stale {
                evicted.push(key.clone());
            }
            !stale
        });
        if !evicted.is_empty() {
            debug!("Evicted {} stale permission entries", evicted.len());
        }
        evicted
    }

    /// [`Self::evict_stale`] with the configured grace TTL
    pub fn sweep(&self, store: &mut CacheStore, now: Instant) -> Vec<CanonicalKey> {
        self.evict_stale(store, now, self.grace_ttl)
    }

    /// When a key released at `released_at` becomes evictable
    pub fn sweep_deadline(&self, released_at: Instant) -> Instant {
        released_at + self.grace_ttl + SWEEP_SLACK
    }

    /// Earliest instant at which a sweep could evict something
    pub fn next_sweep(&self, store: &CacheStore) -> Option<Instant> {
        store
            .iter()
            .filter(|entry| entry.ref_count == 0 && entry.status != CheckStatus::InFlight)
            .map(|entry| self.sweep_deadline(entry.last_touched_at))
            .min()
    }
}
