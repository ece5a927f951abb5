//! In-memory cache of permission answers keyed by [`CanonicalKey`]

use crate::permissions::key::CanonicalKey;
use ahash::AHashMap;
use tokio::time::Instant;

/// Resolution state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    /// Registered, waiting for the debounce window to close
    Pending,
    /// Part of a batch whose response has not arrived yet
    InFlight,
    /// Answered by the backend, or failed open
    Resolved,
}

impl CheckStatus {
    fn rank(self) -> u8 {
        match self {
            CheckStatus::Pending => 0,
            CheckStatus::InFlight => 1,
            CheckStatus::Resolved => 2,
        }
    }
}

/// Cached state of one permission question
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CanonicalKey,
    pub status: CheckStatus,
    /// Meaningful only once `Resolved`; `true` before that
    pub granted: bool,
    pub ref_count: usize,
    pub last_touched_at: Instant,
}

impl CacheEntry {
    fn new(key: CanonicalKey, now: Instant) -> Self {
        Self {
            key,
            status: CheckStatus::Pending,
            granted: true,
            ref_count: 0,
            last_touched_at: now,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == CheckStatus::Resolved
    }
}

/// Partial update merged into an entry by [`CacheStore::upsert`]
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub status: Option<CheckStatus>,
    pub granted: Option<bool>,
    pub ref_count: Option<usize>,
    pub last_touched_at: Option<Instant>,
}

impl EntryPatch {
    pub fn in_flight() -> Self {
        Self {
            status: Some(CheckStatus::InFlight),
            ..Self::default()
        }
    }

    pub fn resolved(granted: bool) -> Self {
        Self {
            status: Some(CheckStatus::Resolved),
            granted: Some(granted),
            ..Self::default()
        }
    }

    pub fn touched(mut self, at: Instant) -> Self {
        self.last_touched_at = Some(at);
        self
    }
}

/// Mapping from canonical key to cache entry
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: AHashMap<CanonicalKey, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &CanonicalKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Create the entry as `Pending`/granted if absent, then merge `patch`.
    ///
    /// Status never moves backwards: a patch that would regress it leaves
    /// `status` and `granted` untouched, while ref count and timestamp still
    /// merge.
    pub fn upsert(&mut self, key: &CanonicalKey, patch: EntryPatch, now: Instant) -> &CacheEntry {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), now));

        let advances = patch
            .status
            .map_or(true, |status| status.rank() >= entry.status.rank());
        if advances {
            if let Some(status) = patch.status {
                entry.status = status;
            }
            if let Some(granted) = patch.granted {
                entry.granted = granted;
            }
        }
        if let Some(ref_count) = patch.ref_count {
            entry.ref_count = ref_count;
        }
        if let Some(at) = patch.last_touched_at {
            entry.last_touched_at = at;
        }
        entry
    }

    /// Synchronous answer for `key`: the cached value, or `true` if unknown
    pub fn evaluate(&self, key: &CanonicalKey) -> bool {
        self.entries.get(key).map_or(true, |entry| entry.granted)
    }

    /// Reset a resolved entry to `Pending` so it is fetched again.
    ///
    /// Returns `false` if the entry does not exist or is not resolved.
    pub fn invalidate(&mut self, key: &CanonicalKey, now: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.status == CheckStatus::Resolved => {
                entry.status = CheckStatus::Pending;
                entry.granted = true;
                entry.last_touched_at = now;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &CanonicalKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub(crate) fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&CanonicalKey, &mut CacheEntry) -> bool,
    {
        self.entries.retain(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::key::{canonicalize, Permission, PermissionCheck, ResourceType, Scope};

    fn key(permission: Permission) -> CanonicalKey {
        canonicalize(&PermissionCheck::new(Scope::account("a1"), ResourceType::Project, permission))
    }

    #[test]
    fn test_unknown_key_fails_open() {
        let store = CacheStore::new();
        assert!(store.evaluate(&key(Permission::Edit)));
        assert!(store.get(&key(Permission::Edit)).is_none());
    }

    #[test]
    fn test_upsert_creates_pending_granted_entry() {
        let mut store = CacheStore::new();
        let now = Instant::now();
        let entry = store.upsert(&key(Permission::Edit), EntryPatch::default(), now);
        assert_eq!(entry.status, CheckStatus::Pending);
        assert!(entry.granted);
        assert_eq!(entry.ref_count, 0);
    }

    #[test]
    fn test_upsert_never_regresses_resolved() {
        let mut store = CacheStore::new();
        let now = Instant::now();
        let k = key(Permission::Delete);
        store.upsert(&k, EntryPatch::resolved(false), now);

        let patch = EntryPatch {
            status: Some(CheckStatus::Pending),
            granted: Some(true),
            ref_count: Some(3),
            last_touched_at: None,
        };
        let entry = store.upsert(&k, patch, now);
        assert_eq!(entry.status, CheckStatus::Resolved);
        assert!(!entry.granted);
        assert_eq!(entry.ref_count, 3);
        assert!(!store.evaluate(&k));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = CacheStore::new();
        let now = Instant::now();
        let k = key(Permission::View);
        store.upsert(&k, EntryPatch::resolved(true), now);
        store.upsert(&k, EntryPatch::resolved(true), now);
        assert_eq!(store.len(), 1);
        assert!(store.get(&k).unwrap().is_resolved());
    }

    #[test]
    fn test_invalidate_only_resets_resolved() {
        let mut store = CacheStore::new();
        let now = Instant::now();
        let k = key(Permission::Edit);
        store.upsert(&k, EntryPatch::in_flight(), now);
        assert!(!store.invalidate(&k, now));

        store.upsert(&k, EntryPatch::resolved(false), now);
        assert!(store.invalidate(&k, now));
        let entry = store.get(&k).unwrap();
        assert_eq!(entry.status, CheckStatus::Pending);
        assert!(entry.granted);
    }
}
