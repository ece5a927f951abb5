//! End-to-end behavior of the permissions provider against a mock backend
//!
//! Every test runs on tokio's paused clock, so debounce windows and grace
//! periods elapse instantly and deterministically.

use async_trait::async_trait;
use permgate::client::{BatchCheckRequest, BatchCheckResponse, PermissionQuery, PermissionResult, PermissionsClient};
use permgate::config::PermissionsConfig;
use permgate::error::{PermissionError, Result};
use permgate::permissions::{
    CheckStatus, Permission, PermissionCheck, PermissionsProvider, RegisterOptions, ResourceType, Scope, SwitchToggle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct MockBackend {
    calls: Mutex<Vec<(Instant, BatchCheckRequest)>>,
    denied: Mutex<Vec<PermissionQuery>>,
    omitted: Mutex<Vec<PermissionQuery>>,
    fail: AtomicBool,
    latency: Duration,
}

impl MockBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    fn deny(&self, check: &PermissionCheck) {
        self.denied.lock().unwrap().push(PermissionQuery::from(check));
    }

    fn allow_all(&self) {
        self.denied.lock().unwrap().clear();
    }

    fn omit(&self, check: &PermissionCheck) {
        self.omitted.lock().unwrap().push(PermissionQuery::from(check));
    }

    fn calls(&self) -> Vec<(Instant, BatchCheckRequest)> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PermissionsClient for MockBackend {
    async fn check_permissions(&self, request: BatchCheckRequest) -> Result<BatchCheckResponse> {
        self.calls.lock().unwrap().push((Instant::now(), request.clone()));
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PermissionError::transport("backend unavailable"));
        }

        let denied = self.denied.lock().unwrap().clone();
        let omitted = self.omitted.lock().unwrap().clone();
        let results = request
            .permissions
            .into_iter()
            .filter(|query| !omitted.contains(query))
            .map(|query| PermissionResult {
                permitted: !denied.contains(&query),
                resource_type: query.resource_type,
                resource_identifier: query.resource_identifier,
                permission: query.permission,
            })
            .collect();
        Ok(BatchCheckResponse { results })
    }
}

fn a1() -> Scope {
    Scope::account("a1")
}

fn project(permission: Permission) -> PermissionCheck {
    PermissionCheck::new(a1(), ResourceType::Project, permission).with_identifier("p1")
}

fn started(backend: &Arc<MockBackend>) -> PermissionsProvider {
    started_with(backend, PermissionsConfig::default())
}

fn started_with(backend: &Arc<MockBackend>, config: PermissionsConfig) -> PermissionsProvider {
    let provider = PermissionsProvider::new(config, backend.clone());
    provider.init().unwrap();
    provider
}

const PAST_WINDOW: Duration = Duration::from_millis(350);

#[tokio::test(start_paused = true)]
async fn test_three_elements_share_one_call() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Delete));
    let provider = started(&backend);
    let options = RegisterOptions::new();
    let checks = [project(Permission::Edit), project(Permission::Delete)];

    for _ in 0..3 {
        provider.register_check(&checks, &options);
    }
    assert_eq!(provider.evaluate_all(&checks), vec![true, true]);

    sleep(PAST_WINDOW).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0].1;
    assert_eq!(request.scope, a1());
    let tuples: Vec<(ResourceType, Option<&str>, Permission)> = request
        .permissions
        .iter()
        .map(|q| (q.resource_type, q.resource_identifier.as_deref(), q.permission))
        .collect();
    assert_eq!(
        tuples,
        vec![
            (ResourceType::Project, Some("p1"), Permission::Edit),
            (ResourceType::Project, Some("p1"), Permission::Delete),
        ]
    );

    for _ in 0..3 {
        assert!(provider.evaluate(&project(Permission::Edit)));
        assert!(!provider.evaluate(&project(Permission::Delete)));
    }
    assert_eq!(provider.entry(&project(Permission::Edit)).unwrap().ref_count, 3);
    provider.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_checks_in_one_call_are_deduplicated() {
    let backend = MockBackend::new();
    let provider = started(&backend);
    provider.register_check(
        &[project(Permission::View), project(Permission::View)],
        &RegisterOptions::new(),
    );

    sleep(PAST_WINDOW).await;
    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.permissions.len(), 1);
    assert_eq!(provider.entry(&project(Permission::View)).unwrap().ref_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_evaluate_all_preserves_order_across_scopes() {
    let backend = MockBackend::new();
    let other = PermissionCheck::new(a1().with_org("o1"), ResourceType::Pipeline, Permission::Execute);
    backend.deny(&project(Permission::Delete));
    backend.deny(&other);
    let provider = started(&backend);

    let checks = [project(Permission::Delete), project(Permission::Edit), other.clone()];
    provider.register_check(&checks, &RegisterOptions::new());
    sleep(PAST_WINDOW).await;

    // One outbound call per scope
    assert_eq!(backend.call_count(), 2);
    assert_eq!(provider.evaluate_all(&checks), vec![false, true, false]);
    assert_eq!(
        provider.evaluate_all(&[other, project(Permission::Edit)]),
        vec![false, true]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_unresolved_checks_fail_open() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Manage));
    let provider = started(&backend);

    assert!(provider.evaluate(&project(Permission::Manage)));
    provider.register_check(&[project(Permission::Manage)], &RegisterOptions::new());
    assert_eq!(
        provider.entry(&project(Permission::Manage)).unwrap().status,
        CheckStatus::Pending
    );
    assert!(provider.evaluate(&project(Permission::Manage)));

    sleep(PAST_WINDOW).await;
    assert!(!provider.evaluate(&project(Permission::Manage)));
}

#[tokio::test(start_paused = true)]
async fn test_registrations_within_window_coalesce() {
    let backend = MockBackend::new();
    let provider = started(&backend);
    let options = RegisterOptions::new();
    let start = Instant::now();

    provider.register_check(&[project(Permission::View)], &options);
    sleep(Duration::from_millis(100)).await;
    provider.register_check(&[project(Permission::Edit)], &options);
    sleep(Duration::from_millis(100)).await;
    provider.register_check(&[project(Permission::Delete)], &options);
    assert_eq!(backend.call_count(), 0);

    sleep(Duration::from_millis(1_000)).await;
    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.permissions.len(), 3);
    // The window restarts on every registration
    assert!(calls[0].0 >= start + Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_spaced_registrations_produce_separate_calls() {
    let backend = MockBackend::new();
    let provider = started(&backend);
    let options = RegisterOptions::new();

    for permission in [Permission::View, Permission::Edit, Permission::Delete] {
        provider.register_check(&[project(permission)], &options);
        sleep(Duration::from_millis(400)).await;
    }

    let calls = backend.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|(_, request)| request.permissions.len() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_per_call_debounce_wait() {
    let backend = MockBackend::new();
    let provider = started(&backend);
    let start = Instant::now();

    provider.register_check(
        &[project(Permission::View)],
        &RegisterOptions::new().with_debounce_wait(Duration::from_millis(20)),
    );
    sleep(Duration::from_millis(50)).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0 < start + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_partial_response_resolves_missing_keys_as_granted() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Delete));
    backend.omit(&project(Permission::Edit));
    let provider = started(&backend);
    let checks = [project(Permission::Edit), project(Permission::Delete)];

    provider.register_check(&checks, &RegisterOptions::new());
    sleep(PAST_WINDOW).await;

    for check in &checks {
        assert_eq!(provider.entry(check).unwrap().status, CheckStatus::Resolved);
    }
    assert_eq!(provider.evaluate_all(&checks), vec![true, false]);
    assert_eq!(provider.stats().fail_open_resolutions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_fails_open_without_retry() {
    let backend = MockBackend::new();
    backend.fail.store(true, Ordering::SeqCst);
    backend.deny(&project(Permission::Delete));
    let provider = started(&backend);

    provider.register_check(&[project(Permission::Delete)], &RegisterOptions::new());
    sleep(PAST_WINDOW).await;

    let entry = provider.entry(&project(Permission::Delete)).unwrap();
    assert_eq!(entry.status, CheckStatus::Resolved);
    assert!(entry.granted);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.call_count(), 1);
    let stats = provider.stats();
    assert_eq!(stats.transport_failures, 1);
    assert_eq!(stats.fail_open_resolutions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_subsystem_never_calls_backend() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Delete));
    let provider = started_with(&backend, PermissionsConfig::default().with_enabled(false));

    provider.register_check(&[project(Permission::Delete)], &RegisterOptions::new());
    sleep(Duration::from_secs(2)).await;

    assert_eq!(backend.call_count(), 0);
    assert!(provider.evaluate(&project(Permission::Delete)));
    assert!(provider.entry(&project(Permission::Delete)).is_none());
    assert_eq!(provider.stats().bypassed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_toggle_overrides_cached_denials() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Delete));
    let toggle = Arc::new(SwitchToggle::default());
    let provider = PermissionsProvider::new(PermissionsConfig::default(), backend.clone())
        .with_toggle(toggle.clone())
        .unwrap();
    provider.init().unwrap();

    provider.register_check(&[project(Permission::Delete)], &RegisterOptions::new());
    sleep(PAST_WINDOW).await;
    assert!(!provider.evaluate(&project(Permission::Delete)));

    toggle.set(false);
    assert!(provider.evaluate(&project(Permission::Delete)));
    assert_eq!(provider.evaluate_all(&[project(Permission::Delete)]), vec![true]);

    toggle.set(true);
    assert!(!provider.evaluate(&project(Permission::Delete)));
}

#[tokio::test(start_paused = true)]
async fn test_skip_condition_bypasses_registration_and_evaluation() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Delete));
    let provider = started(&backend);
    let options = RegisterOptions::new().with_skip_condition(|check| check.permission() == Permission::Delete);

    provider.register_check(&[project(Permission::Delete), project(Permission::Edit)], &options);
    sleep(PAST_WINDOW).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.permissions.len(), 1);
    assert_eq!(calls[0].1.permissions[0].permission, Permission::Edit);
    assert!(provider.evaluate_with(&project(Permission::Delete), &options));
    assert!(provider.entry(&project(Permission::Delete)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_released_entries_are_reused_then_evicted() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Edit));
    let provider = started_with(
        &backend,
        PermissionsConfig::default().with_eviction_ttl(Duration::from_secs(5)),
    );
    let options = RegisterOptions::new();
    let checks = [project(Permission::Edit)];

    provider.register_check(&checks, &options);
    sleep(PAST_WINDOW).await;
    provider.cancel_check(&checks, &options);
    assert_eq!(provider.entry(&checks[0]).unwrap().ref_count, 0);

    // Re-mount within the grace period reuses the answer
    sleep(Duration::from_secs(4)).await;
    provider.register_check(&checks, &options);
    sleep(PAST_WINDOW).await;
    assert_eq!(backend.call_count(), 1);
    assert!(!provider.evaluate(&checks[0]));

    provider.cancel_check(&checks, &options);
    sleep(Duration::from_secs(6)).await;
    assert!(provider.entry(&checks[0]).is_none());
    assert_eq!(provider.cache_len(), 0);
    assert_eq!(provider.stats().evictions, 1);

    // Gone means fetched again
    provider.register_check(&checks, &options);
    sleep(PAST_WINDOW).await;
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shared_key_survives_partial_release() {
    let backend = MockBackend::new();
    let provider = started_with(&backend, PermissionsConfig::default().with_eviction_ttl(Duration::from_secs(1)));
    let options = RegisterOptions::new();
    let checks = [project(Permission::View)];

    provider.register_check(&checks, &options);
    provider.register_check(&checks, &options);
    sleep(PAST_WINDOW).await;
    provider.cancel_check(&checks, &options);

    sleep(Duration::from_secs(10)).await;
    let entry = provider.entry(&checks[0]).unwrap();
    assert_eq!(entry.ref_count, 1);
    assert!(entry.is_resolved());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_flush_sends_nothing() {
    let backend = MockBackend::new();
    let provider = started(&backend);
    let options = RegisterOptions::new();

    provider.register_check(&[project(Permission::Invite)], &options);
    sleep(Duration::from_millis(100)).await;
    provider.cancel_check(&[project(Permission::Invite)], &options);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(backend.call_count(), 0);
    assert_eq!(provider.stats().cancelled_before_dispatch, 1);
}

#[tokio::test(start_paused = true)]
async fn test_registration_during_flight_starts_new_cycle() {
    let backend = MockBackend::with_latency(Duration::from_secs(1));
    let provider = started(&backend);
    let options = RegisterOptions::new();
    let start = Instant::now();

    provider.register_check(&[project(Permission::View)], &options);
    sleep(Duration::from_millis(500)).await;
    assert_eq!(provider.entry(&project(Permission::View)).unwrap().status, CheckStatus::InFlight);

    // Same key joins the in-flight answer, new key waits for the next window
    provider.register_check(&[project(Permission::View), project(Permission::Edit)], &options);
    sleep(Duration::from_millis(400)).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.permissions.len(), 1);
    assert_eq!(calls[1].1.permissions[0].permission, Permission::Edit);
    assert!(calls[1].0 >= start + Duration::from_millis(800));

    sleep(Duration::from_secs(2)).await;
    assert!(provider.entry(&project(Permission::View)).unwrap().is_resolved());
    assert!(provider.entry(&project(Permission::Edit)).unwrap().is_resolved());
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_entry_released_is_evicted_after_resolution() {
    let backend = MockBackend::with_latency(Duration::from_secs(2));
    let provider = started_with(&backend, PermissionsConfig::default().with_eviction_ttl(Duration::from_secs(1)));
    let options = RegisterOptions::new();

    provider.register_check(&[project(Permission::View)], &options);
    sleep(PAST_WINDOW).await;
    provider.cancel_check(&[project(Permission::View)], &options);

    // Grace period elapses while the batch is still out
    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(provider.entry(&project(Permission::View)).unwrap().status, CheckStatus::InFlight);

    // Resolved at ~2.3s, evicted one grace period later
    sleep(Duration::from_millis(700)).await;
    assert!(provider.entry(&project(Permission::View)).unwrap().is_resolved());
    sleep(Duration::from_secs(2)).await;
    assert!(provider.entry(&project(Permission::View)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_refetches_resolved_entries() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Edit));
    let provider = started(&backend);
    let options = RegisterOptions::new();

    provider.register_check(&[project(Permission::Edit)], &options);
    sleep(PAST_WINDOW).await;
    assert!(!provider.evaluate(&project(Permission::Edit)));

    backend.allow_all();
    provider.refresh_check(&[project(Permission::Edit), project(Permission::Delete)], &options);
    sleep(PAST_WINDOW).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    // Unregistered checks are not fetched by a refresh
    assert_eq!(calls[1].1.permissions.len(), 1);
    assert!(provider.evaluate(&project(Permission::Edit)));
}

#[tokio::test(start_paused = true)]
async fn test_guard_releases_on_drop() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Delete));
    let provider = started_with(&backend, PermissionsConfig::default().with_eviction_ttl(Duration::from_secs(1)));
    let checks = [project(Permission::Edit), project(Permission::Delete)];

    {
        let guard = provider.scoped(&checks, &RegisterOptions::new());
        assert_eq!(guard.wait_for_resolution().await, vec![true, false]);
        assert_eq!(guard.evaluate_all(), vec![true, false]);
        assert_eq!(provider.entry(&checks[0]).unwrap().ref_count, 1);
    }

    assert_eq!(provider.entry(&checks[0]).unwrap().ref_count, 0);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(provider.cache_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_registrations_before_init_flush_after_init() {
    let backend = MockBackend::new();
    let provider = PermissionsProvider::new(PermissionsConfig::default(), backend.clone());

    provider.register_check(&[project(Permission::View)], &RegisterOptions::new());
    sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.call_count(), 0);

    provider.init().unwrap();
    sleep(PAST_WINDOW).await;
    assert_eq!(backend.call_count(), 1);
    assert!(provider.entry(&project(Permission::View)).unwrap().is_resolved());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_discards_late_results() {
    let backend = MockBackend::with_latency(Duration::from_secs(1));
    backend.deny(&project(Permission::Delete));
    let provider = started(&backend);

    provider.register_check(&[project(Permission::Delete)], &RegisterOptions::new());
    sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.call_count(), 1);

    provider.dispose();
    assert!(!provider.is_initialized());
    sleep(Duration::from_secs(2)).await;

    assert!(provider.entry(&project(Permission::Delete)).is_none());
    assert!(provider.evaluate(&project(Permission::Delete)));
}

#[tokio::test(start_paused = true)]
async fn test_independent_providers_do_not_share_state() {
    let backend = MockBackend::new();
    backend.deny(&project(Permission::Edit));
    let first = started(&backend);
    let second = started(&backend);

    first.register_check(&[project(Permission::Edit)], &RegisterOptions::new());
    sleep(PAST_WINDOW).await;

    assert!(!first.evaluate(&project(Permission::Edit)));
    assert!(second.entry(&project(Permission::Edit)).is_none());
    assert!(second.evaluate(&project(Permission::Edit)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_with_toggle_off_still_releases() {
    let backend = MockBackend::new();
    let toggle = Arc::new(SwitchToggle::default());
    let provider = PermissionsProvider::new(
        PermissionsConfig::default().with_eviction_ttl(Duration::from_secs(5)),
        backend.clone(),
    )
    .with_toggle(toggle.clone())
    .unwrap();
    provider.init().unwrap();
    let options = RegisterOptions::new();
    let checks = [project(Permission::Edit)];

    provider.register_check(&checks, &options);
    sleep(PAST_WINDOW).await;
    assert!(provider.entry(&checks[0]).unwrap().is_resolved());

    toggle.set(false);
    provider.cancel_check(&checks, &options);
    toggle.set(true);

    sleep(Duration::from_secs(30)).await;
    provider.sweep_now();
    assert!(provider.entry(&checks[0]).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_with_changed_skip_condition_still_releases() {
    let backend = MockBackend::new();
    let provider = started_with(&backend, PermissionsConfig::default().with_eviction_ttl(Duration::from_secs(5)));
    let checks = [project(Permission::Delete)];

    provider.register_check(&checks, &RegisterOptions::new());
    sleep(PAST_WINDOW).await;
    provider.cancel_check(&checks, &RegisterOptions::new().with_skip_condition(|_| true));

    sleep(Duration::from_secs(30)).await;
    provider.sweep_now();
    assert!(provider.entry(&checks[0]).is_none());
    assert_eq!(provider.stats().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_of_untracked_key_is_noop() {
    let backend = MockBackend::new();
    let provider = started(&backend);
    let checks = [project(Permission::View)];

    provider.cancel_check(&checks, &RegisterOptions::new().with_skip_condition(|_| true));
    assert!(provider.entry(&checks[0]).is_none());

    provider.register_check(&checks, &RegisterOptions::new());
    provider.cancel_check(&checks, &RegisterOptions::new());
    provider.cancel_check(&checks, &RegisterOptions::new());
    assert_eq!(provider.entry(&checks[0]).unwrap().ref_count, 0);
    assert_eq!(provider.stats().cancellations, 1);
}
