//! Public surface of the permission engine
//!
//! [`PermissionsProvider`] is the only point of contact for consumers. It is a
//! cheap, cloneable handle; all clones share one cache, one pending registry
//! and one scheduler. Every operation except [`PermissionsProvider::wait_for_resolution`]
//! is synchronous and never fails, so it can be called while rendering.

use crate::client::{HttpPermissionsClient, PermissionsClient};
use crate::config::PermissionsConfig;
use crate::error::{PermissionError, Result};
use crate::permissions::executor::{BatchExecutor, BatchOutcome};
use crate::permissions::key::{canonicalize, CanonicalKey, PermissionCheck};
use crate::permissions::scheduler::{DebouncedScheduler, FlushTarget, PendingCheck, PendingRegistry, ScopeBatch};
use crate::permissions::store::{CacheEntry, CacheStore, CheckStatus, EntryPatch};
use crate::permissions::subscriptions::{Released, SubscriptionManager};
use crate::permissions::toggle::{FeatureToggle, SwitchToggle};
use ahash::AHashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-call predicate; checks for which it returns `true` bypass the engine
pub type SkipCondition = Arc<dyn Fn(&PermissionCheck) -> bool + Send + Sync>;

/// Options accepted by registration, cancellation and scoped acquisition
#[derive(Clone, Default)]
pub struct RegisterOptions {
    /// Debounce window for this registration; the configured default otherwise
    pub debounce_wait: Option<Duration>,
    pub skip_condition: Option<SkipCondition>,
}

impl fmt::Debug for RegisterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterOptions")
            .field("debounce_wait", &self.debounce_wait)
            .field("skip_condition", &self.skip_condition.is_some())
            .finish()
    }
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce_wait(mut self, wait: Duration) -> Self {
        self.debounce_wait = Some(wait);
        self
    }

    pub fn with_skip_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&PermissionCheck) -> bool + Send + Sync + 'static,
    {
        self.skip_condition = Some(Arc::new(condition));
        self
    }

    pub fn skips(&self, check: &PermissionCheck) -> bool {
        self.skip_condition.as_ref().map_or(false, |condition| condition(check))
    }
}

/// Counters describing what the engine has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Keys acquired through registration
    pub registrations: u64,
    /// Keys released through cancellation or guard drop
    pub cancellations: u64,
    /// Checks answered without touching the engine (toggle off or skipped)
    pub bypassed: u64,
    /// Keys cancelled before their batch was sent
    pub cancelled_before_dispatch: u64,
    /// Outbound calls issued (one per scope per flush)
    pub batches_dispatched: u64,
    pub keys_dispatched: u64,
    pub transport_failures: u64,
    /// Keys resolved as granted because the backend failed or omitted them
    pub fail_open_resolutions: u64,
    pub evictions: u64,
}

/// Drained batches tagged with the provider lifetime they belong to
pub(crate) struct EpochBatches {
    epoch: u64,
    batches: Vec<ScopeBatch>,
}

struct EngineState {
    store: CacheStore,
    pending: PendingRegistry,
    stats: EngineStats,
    /// Bumped by `dispose`; outcomes from an older epoch are dropped
    epoch: u64,
}

struct ProviderCore {
    config: PermissionsConfig,
    toggle: Arc<dyn FeatureToggle>,
    subscriptions: SubscriptionManager,
    executor: BatchExecutor,
    state: Mutex<EngineState>,
    scheduler: Mutex<Option<DebouncedScheduler>>,
    resolutions: watch::Sender<u64>,
}

/// Shared permission-check aggregation and cache engine
#[derive(Clone)]
pub struct PermissionsProvider {
    core: Arc<ProviderCore>,
}

impl fmt::Debug for PermissionsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionsProvider")
            .field("config", &self.core.config)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl PermissionsProvider {
    /// Create a provider. Call [`Self::init`] before registrations can flush.
    pub fn new(config: PermissionsConfig, client: Arc<dyn PermissionsClient>) -> Self {
        let toggle: Arc<dyn FeatureToggle> = Arc::new(SwitchToggle::new(config.enabled));
        let (resolutions, _) = watch::channel(0);
        let core = ProviderCore {
            subscriptions: SubscriptionManager::new(config.eviction_ttl()),
            executor: BatchExecutor::new(client),
            toggle,
            config,
            state: Mutex::new(EngineState {
                store: CacheStore::new(),
                pending: PendingRegistry::new(),
                stats: EngineStats::default(),
                epoch: 0,
            }),
            scheduler: Mutex::new(None),
            resolutions,
        };
        Self { core: Arc::new(core) }
    }

    /// Provider talking to the HTTP backend described by `config.client`
    pub fn from_config(config: PermissionsConfig) -> Result<Self> {
        let client_config = config
            .client
            .as_ref()
            .ok_or_else(|| PermissionError::config("client.base_url is required to reach the permissions backend"))?;
        let client = HttpPermissionsClient::new(client_config)?;
        Ok(Self::new(config, Arc::new(client)))
    }

    /// Replace the global toggle derived from `config.enabled`.
    ///
    /// Must be called before the handle is cloned and before [`Self::init`];
    /// otherwise the core is shared and a lifecycle error is returned.
    pub fn with_toggle(mut self, toggle: Arc<dyn FeatureToggle>) -> Result<Self> {
        match Arc::get_mut(&mut self.core) {
            Some(core) => core.toggle = toggle,
            None => {
                return Err(PermissionError::lifecycle(
                    "with_toggle must be called before the provider is cloned or initialized",
                ))
            }
        }
        Ok(self)
    }

    pub fn config(&self) -> &PermissionsConfig {
        &self.core.config
    }

    /// Start the scheduler worker on the current tokio runtime.
    ///
    /// Checks registered before `init` are flushed one debounce window later.
    pub fn init(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PermissionError::lifecycle("init() must be called from within a tokio runtime"))?;

        let mut slot = self.core.lock_scheduler();
        if slot.is_some() {
            return Err(PermissionError::lifecycle("permissions provider is already initialized"));
        }

        let scheduler = DebouncedScheduler::spawn(&runtime, Arc::downgrade(&self.core));
        let backlog = self.core.lock_state().pending.len();
        if backlog > 0 {
            scheduler.arm(Instant::now() + self.core.config.debounce_wait());
        }
        *slot = Some(scheduler);

        info!(
            "Permissions provider initialized (enabled={}, debounce={:?}, eviction_ttl={:?}, backlog={})",
            self.core.toggle.is_enabled(),
            self.core.config.debounce_wait(),
            self.core.config.eviction_ttl(),
            backlog
        );
        Ok(())
    }

    /// Stop the scheduler and drop all cached and pending state.
    ///
    /// Answers for batches still in flight are discarded when they arrive.
    /// The provider can be initialized again afterwards.
    pub fn dispose(&self) {
        if let Some(scheduler) = self.core.lock_scheduler().take() {
            scheduler.shutdown();
        }
        {
            let mut state = self.core.lock_state();
            state.pending.clear();
            state.store.clear();
            state.epoch += 1;
        }
        self.core.resolutions.send_modify(|generation| *generation += 1);
        info!("Permissions provider disposed");
    }

    pub fn is_initialized(&self) -> bool {
        self.core
            .lock_scheduler()
            .as_ref()
            .map_or(false, |scheduler| scheduler.is_running())
    }

    pub fn is_enabled(&self) -> bool {
        self.core.toggle.is_enabled()
    }

    /// Declare interest in `checks`. Pair every call with [`Self::cancel_check`]
    /// using the same checks and options.
    pub fn register_check(&self, checks: &[PermissionCheck], options: &RegisterOptions) {
        let Some(admitted) = self.core.admit(checks, options) else {
            return;
        };
        self.core.acquire_all(admitted, options.debounce_wait);
    }

    /// Withdraw interest registered by [`Self::register_check`]
    ///
    /// Release ignores the toggle and skip condition: keys never acquired are
    /// untracked and releasing them is a no-op, so a key acquired under
    /// different options is still released exactly once.
    pub fn cancel_check(&self, checks: &[PermissionCheck], _options: &RegisterOptions) {
        let mut seen = AHashSet::with_capacity(checks.len());
        let keys: Vec<CanonicalKey> = checks
            .iter()
            .map(canonicalize)
            .filter(|key| seen.insert(key.clone()))
            .collect();
        self.core.release_all(&keys);
    }

    /// Acquire `checks` for the lifetime of the returned guard
    pub fn scoped(&self, checks: &[PermissionCheck], options: &RegisterOptions) -> CheckGuard {
        let acquired = match self.core.admit(checks, options) {
            Some(admitted) => self.core.acquire_all(admitted, options.debounce_wait),
            None => Vec::new(),
        };
        CheckGuard {
            provider: self.clone(),
            checks: checks.to_vec(),
            skipped: checks.iter().map(|check| options.skips(check)).collect(),
            acquired,
        }
    }

    /// Synchronous answer; `true` while unresolved or when the subsystem is off
    pub fn evaluate(&self, check: &PermissionCheck) -> bool {
        if !self.core.toggle.is_enabled() {
            return true;
        }
        self.core.lock_state().store.evaluate(&canonicalize(check))
    }

    /// [`Self::evaluate`] honoring the options' skip condition
    pub fn evaluate_with(&self, check: &PermissionCheck, options: &RegisterOptions) -> bool {
        options.skips(check) || self.evaluate(check)
    }

    /// Answers in the same order as `checks`
    pub fn evaluate_all(&self, checks: &[PermissionCheck]) -> Vec<bool> {
        if !self.core.toggle.is_enabled() {
            return vec![true; checks.len()];
        }
        let state = self.core.lock_state();
        checks
            .iter()
            .map(|check| state.store.evaluate(&canonicalize(check)))
            .collect()
    }

    /// Force resolved answers for `checks` to be fetched again.
    ///
    /// Entries nobody has registered are left alone.
    pub fn refresh_check(&self, checks: &[PermissionCheck], options: &RegisterOptions) {
        let Some(admitted) = self.core.admit(checks, options) else {
            return;
        };
        let now = Instant::now();
        let mut requeued = 0usize;
        {
            let mut state = self.core.lock_state();
            for PendingCheck { key, check } in admitted {
                let tracked = state
                    .store
                    .get(&key)
                    .map_or(false, |entry| entry.ref_count > 0);
                if !tracked {
                    continue;
                }
                let stale = state.store.invalidate(&key, now)
                    || state.store.get(&key).map_or(false, |e| e.status == CheckStatus::Pending);
                if stale {
                    state.pending.insert(key, check);
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            debug!("Refreshing {} permission key(s)", requeued);
            self.core
                .arm(now + options.debounce_wait.unwrap_or_else(|| self.core.config.debounce_wait()));
        }
    }

    /// Wait until every check has a final answer, then return the answers in order.
    ///
    /// Checks that were never registered resolve immediately with the fail-open
    /// default. Requires [`Self::init`] for registered checks to make progress.
    pub async fn wait_for_resolution(&self, checks: &[PermissionCheck]) -> Vec<bool> {
        let keys: Vec<CanonicalKey> = checks.iter().map(canonicalize).collect();
        let mut updates = self.core.resolutions.subscribe();
        loop {
            let _ = updates.borrow_and_update();
            if !self.core.toggle.is_enabled() {
                return vec![true; keys.len()];
            }
            {
                let state = self.core.lock_state();
                let settled = keys
                    .iter()
                    .all(|key| state.store.get(key).map_or(true, CacheEntry::is_resolved));
                if settled {
                    return keys.iter().map(|key| state.store.evaluate(key)).collect();
                }
            }
            if updates.changed().await.is_err() {
                return self.evaluate_all(checks);
            }
        }
    }

    /// Snapshot of the cache entry for `check`
    pub fn entry(&self, check: &PermissionCheck) -> Option<CacheEntry> {
        self.core.lock_state().store.get(&canonicalize(check)).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.core.lock_state().pending.len()
    }

    pub fn cache_len(&self) -> usize {
        self.core.lock_state().store.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.core.lock_state().stats.clone()
    }

    /// Evict stale entries right away; returns how many were removed
    pub fn sweep_now(&self) -> usize {
        let mut state = self.core.lock_state();
        let evicted = self.core.subscriptions.sweep(&mut state.store, Instant::now());
        state.stats.evictions += evicted.len() as u64;
        evicted.len()
    }
}

impl ProviderCore {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, Option<DebouncedScheduler>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the bypass policy and dedup `checks` by canonical key.
    ///
    /// `None` means the whole subsystem is switched off.
    fn admit(&self, checks: &[PermissionCheck], options: &RegisterOptions) -> Option<Vec<PendingCheck>> {
        if !self.toggle.is_enabled() {
            self.lock_state().stats.bypassed += checks.len() as u64;
            return None;
        }
        let mut seen = AHashSet::with_capacity(checks.len());
        let mut admitted = Vec::with_capacity(checks.len());
        let mut skipped = 0u64;
        for check in checks {
            if options.skips(check) {
                skipped += 1;
                continue;
            }
            let key = canonicalize(check);
            if seen.insert(key.clone()) {
                admitted.push(PendingCheck {
                    key,
                    check: check.clone(),
                });
            }
        }
        if skipped > 0 {
            self.lock_state().stats.bypassed += skipped;
        }
        Some(admitted)
    }

    fn acquire_all(&self, admitted: Vec<PendingCheck>, wait: Option<Duration>) -> Vec<CanonicalKey> {
        if admitted.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let mut keys = Vec::with_capacity(admitted.len());
        let mut enqueued = 0usize;
        {
            let mut state = self.lock_state();
            for PendingCheck { key, check } in admitted {
                let acquired = self.subscriptions.acquire(&mut state.store, &key, now);
                if acquired.needs_dispatch {
                    state.pending.insert(key.clone(), check);
                    enqueued += 1;
                }
                state.stats.registrations += 1;
                keys.push(key);
            }
        }
        debug!("Registered {} permission key(s), {} awaiting dispatch", keys.len(), enqueued);
        if enqueued > 0 {
            self.arm(now + wait.unwrap_or_else(|| self.config.debounce_wait()));
        }
        keys
    }

    fn release_all(&self, keys: &[CanonicalKey]) {
        if keys.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut idle = false;
        {
            let mut state = self.lock_state();
            for key in keys {
                match self.subscriptions.release(&mut state.store, key, now) {
                    Released::Idle { status } => {
                        if status == CheckStatus::Pending && state.pending.remove(key) {
                            state.stats.cancelled_before_dispatch += 1;
                            debug!("Cancelled {} before dispatch", key);
                        }
                        idle = true;
                        state.stats.cancellations += 1;
                    }
                    Released::Shared { .. } => state.stats.cancellations += 1,
                    Released::Untracked => {}
                }
            }
        }
        if idle {
            self.schedule_sweep(self.subscriptions.sweep_deadline(now));
        }
    }

    fn arm(&self, deadline: Instant) {
        match self.lock_scheduler().as_ref() {
            Some(scheduler) => {
                scheduler.arm(deadline);
            }
            None => debug!("Provider not initialized; pending checks will flush after init()"),
        }
    }

    fn schedule_sweep(&self, at: Instant) {
        if let Some(scheduler) = self.lock_scheduler().as_ref() {
            scheduler.schedule_sweep(at);
        }
    }

    fn apply_outcomes(&self, epoch: u64, outcomes: Vec<BatchOutcome>) {
        let now = Instant::now();
        let next_sweep = {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                debug!("Discarding {} batch outcome(s) from a disposed provider", outcomes.len());
                return;
            }
            let mut idle = false;
            for outcome in outcomes {
                if outcome.transport_failed {
                    state.stats.transport_failures += 1;
                }
                for resolution in outcome.resolutions {
                    if resolution.source.is_fail_open() {
                        state.stats.fail_open_resolutions += 1;
                    }
                    let entry = state
                        .store
                        .upsert(&resolution.key, EntryPatch::resolved(resolution.granted), now);
                    if entry.ref_count == 0 {
                        // Grace period for abandoned keys restarts once they resolve
                        idle = true;
                        state
                            .store
                            .upsert(&resolution.key, EntryPatch::default().touched(now), now);
                    }
                }
            }
            if idle {
                self.subscriptions.next_sweep(&state.store)
            } else {
                None
            }
        };
        if let Some(at) = next_sweep {
            self.schedule_sweep(at);
        }
        self.resolutions.send_modify(|generation| *generation += 1);
    }
}

impl FlushTarget for ProviderCore {
    type Flush = EpochBatches;

    fn take_batches(&self) -> Option<EpochBatches> {
        let now = Instant::now();
        let mut state = self.lock_state();
        let batches = state.pending.drain();
        if batches.is_empty() {
            return None;
        }
        let mut keys = 0u64;
        for batch in &batches {
            for key in batch.keys() {
                state.store.upsert(key, EntryPatch::in_flight(), now);
                keys += 1;
            }
        }
        state.stats.batches_dispatched += batches.len() as u64;
        state.stats.keys_dispatched += keys;
        debug!("Dispatching {} key(s) in {} scope batch(es)", keys, batches.len());
        Some(EpochBatches {
            epoch: state.epoch,
            batches,
        })
    }

    fn dispatch(self: Arc<Self>, flush: EpochBatches) {
        tokio::spawn(async move {
            let outcomes = self.executor.flush(flush.batches).await;
            self.apply_outcomes(flush.epoch, outcomes);
        });
    }

    fn sweep(&self) -> Option<Instant> {
        let mut state = self.lock_state();
        let evicted = self.subscriptions.sweep(&mut state.store, Instant::now());
        state.stats.evictions += evicted.len() as u64;
        self.subscriptions.next_sweep(&state.store)
    }
}

/// Scoped acquisition: checks are registered on creation and released on drop
pub struct CheckGuard {
    provider: PermissionsProvider,
    checks: Vec<PermissionCheck>,
    skipped: Vec<bool>,
    acquired: Vec<CanonicalKey>,
}

impl CheckGuard {
    pub fn checks(&self) -> &[PermissionCheck] {
        &self.checks
    }

    /// Answers for the guarded checks, in registration order
    pub fn evaluate_all(&self) -> Vec<bool> {
        let answers = self.provider.evaluate_all(&self.checks);
        answers
            .into_iter()
            .zip(&self.skipped)
            .map(|(granted, &skipped)| skipped || granted)
            .collect()
    }

    pub async fn wait_for_resolution(&self) -> Vec<bool> {
        let answers = self.provider.wait_for_resolution(&self.checks).await;
        answers
            .into_iter()
            .zip(&self.skipped)
            .map(|(granted, &skipped)| skipped || granted)
            .collect()
    }
}

impl fmt::Debug for CheckGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckGuard")
            .field("checks", &self.checks.len())
            .field("acquired", &self.acquired.len())
            .finish()
    }
}

impl Drop for CheckGuard {
    fn drop(&mut self) {
        self.provider.core.release_all(&self.acquired);
    }
}
