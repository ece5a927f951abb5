//! Pending registry and the debounced flush scheduler
//!
//! Registrations accumulate in a [`PendingRegistry`], grouped by scope. A
//! single worker task per provider holds one flush deadline; every new
//! registration moves it to `now + wait`, so a batch only leaves after a
//! quiet interval. The same worker also owns the eviction sweep deadline.

use crate::permissions::key::{CanonicalKey, PermissionCheck, Scope};
use ahash::{AHashMap, AHashSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Key plus the check it was derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheck {
    pub key: CanonicalKey,
    pub check: PermissionCheck,
}

/// Checks sharing one scope; the unit of a single outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeBatch {
    pub scope: Scope,
    pub checks: Vec<PendingCheck>,
}

impl ScopeBatch {
    pub fn keys(&self) -> impl Iterator<Item = &CanonicalKey> {
        self.checks.iter().map(|pending| &pending.key)
    }
}

/// Keys awaiting dispatch, grouped by scope in first-registration order
#[derive(Debug, Default)]
pub struct PendingRegistry {
    groups: Vec<ScopeBatch>,
    group_index: AHashMap<Scope, usize>,
    keys: AHashSet<CanonicalKey>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a check; returns `false` if its key was already pending
    pub fn insert(&mut self, key: CanonicalKey, check: PermissionCheck) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        let scope = check.scope().clone();
        let slot = match self.group_index.get(&scope) {
            Some(&slot) => slot,
            None => {
                self.groups.push(ScopeBatch {
                    scope: scope.clone(),
                    checks: Vec::new(),
                });
                let slot = self.groups.len() - 1;
                self.group_index.insert(scope, slot);
                slot
            }
        };
        self.groups[slot].checks.push(PendingCheck { key, check });
        true
    }

    /// Drop an undispatched key; returns `false` if it was not pending
    pub fn remove(&mut self, key: &CanonicalKey) -> bool {
        if !self.keys.remove(key) {
            return false;
        }
        for group in &mut self.groups {
            if let Some(pos) = group.checks.iter().position(|pending| &pending.key == key) {
                group.checks.remove(pos);
                break;
            }
        }
        true
    }

    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Hand over everything accumulated so far and start a new cycle
    pub fn drain(&mut self) -> Vec<ScopeBatch> {
        self.keys.clear();
        self.group_index.clear();
        std::mem::take(&mut self.groups)
            .into_iter()
            .filter(|group| !group.checks.is_empty())
            .collect()
    }

    pub fn clear(&mut self) {
        self.drain();
    }
}

/// What the scheduler worker drives
pub(crate) trait FlushTarget: Send + Sync + 'static {
    /// Work handed from `take_batches` to `dispatch`
    type Flush: Send;

    /// Drain the pending registry, marking every drained key in flight.
    /// `None` when nothing is pending.
    fn take_batches(&self) -> Option<Self::Flush>;

    /// Send drained batches to the backend without blocking the worker
    fn dispatch(self: Arc<Self>, flush: Self::Flush);

    /// Evict stale entries; returns when the next sweep is due, if ever
    fn sweep(&self) -> Option<Instant>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerCommand {
    /// (Re)arm the flush timer
    Arm { deadline: Instant },
    /// Make sure a sweep runs no later than `at`
    Sweep { at: Instant },
}

/// Handle to the worker task that owns the flush and sweep timers
#[derive(Debug)]
pub struct DebouncedScheduler {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    worker: JoinHandle<()>,
}

impl DebouncedScheduler {
    /// Start the worker on `runtime`. The worker holds only a weak reference
    /// and stops once the target is gone or the scheduler is shut down.
    pub(crate) fn spawn<T: FlushTarget>(runtime: &tokio::runtime::Handle, target: Weak<T>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let worker = runtime.spawn(run_worker(target, rx));
        Self { commands, worker }
    }

    pub(crate) fn arm(&self, deadline: Instant) -> bool {
        self.commands.send(SchedulerCommand::Arm { deadline }).is_ok()
    }

    pub(crate) fn schedule_sweep(&self, at: Instant) -> bool {
        self.commands.send(SchedulerCommand::Sweep { at }).is_ok()
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    pub fn shutdown(self) {
        self.worker.abort();
    }
}

async fn run_worker<T: FlushTarget>(target: Weak<T>, mut rx: mpsc::UnboundedReceiver<SchedulerCommand>) {
    let mut flush_at: Option<Instant> = None;
    let mut sweep_at: Option<Instant> = None;

    debug!("Permission scheduler started");

    loop {
        tokio::select! {
            biased;

            command = rx.recv() => {
                match command {
                    Some(SchedulerCommand::Arm { deadline }) => {
                        flush_at = Some(deadline);
                    }
                    Some(SchedulerCommand::Sweep { at }) => {
                        sweep_at = Some(sweep_at.map_or(at, |current| current.min(at)));
                    }
                    None => break,
                }
            }

            _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                flush_at = None;
                let Some(target) = target.upgrade() else { break };
                match target.take_batches() {
                    Some(flush) => target.dispatch(flush),
                    None => debug!("Debounce window closed with nothing pending"),
                }
            }

            _ = sleep_until(sweep_at.unwrap_or_else(Instant::now)), if sweep_at.is_some() => {
                let Some(target) = target.upgrade() else { break };
                sweep_at = target.sweep();
            }
        }
    }

    info!("Permission scheduler stopped");
}
