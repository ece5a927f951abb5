//! Batch executor: one backend call per scope, fail-open on anything missing

use crate::client::{BatchCheckRequest, PermissionQuery, PermissionsClient};
use crate::permissions::key::{CanonicalKey, Scope};
use crate::permissions::scheduler::ScopeBatch;
use ahash::{AHashMap, AHashSet};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Why a key ended up with its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// The backend answered for this key
    Backend,
    /// The backend answered the batch but left this key out
    MissingFromResponse,
    /// The whole batch failed
    TransportFailure,
}

impl ResolutionSource {
    pub fn is_fail_open(&self) -> bool {
        !matches!(self, ResolutionSource::Backend)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: CanonicalKey,
    pub granted: bool,
    pub source: ResolutionSource,
}

/// Everything learned from one scope batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub scope: Scope,
    pub resolutions: Vec<Resolution>,
    pub transport_failed: bool,
}

/// Issues batched calls through a [`PermissionsClient`]
#[derive(Clone)]
pub struct BatchExecutor {
    client: Arc<dyn PermissionsClient>,
}

impl BatchExecutor {
    pub fn new(client: Arc<dyn PermissionsClient>) -> Self {
        Self { client }
    }

    /// Run every scope batch concurrently; one outcome per batch, same order
    pub async fn flush(&self, batches: Vec<ScopeBatch>) -> Vec<BatchOutcome> {
        join_all(batches.into_iter().map(|batch| self.execute(batch))).await
    }

    /// Resolve a single scope batch. Never fails: errors turn into fail-open
    /// resolutions.
    pub async fn execute(&self, batch: ScopeBatch) -> BatchOutcome {
        let batch_id = Uuid::new_v4();
        let span = info_span!("permission_batch", %batch_id, scope = %batch.scope, size = batch.checks.len());
        self.execute_inner(batch_id, batch).instrument(span).await
    }

    async fn execute_inner(&self, batch_id: Uuid, batch: ScopeBatch) -> BatchOutcome {
        let request = BatchCheckRequest {
            scope: batch.scope.clone(),
            permissions: batch.checks.iter().map(|pending| PermissionQuery::from(&pending.check)).collect(),
        };

        match self.client.check_permissions(request).await {
            Ok(response) => {
                let requested: AHashSet<&CanonicalKey> = batch.keys().collect();
                let mut answers: AHashMap<CanonicalKey, bool> = AHashMap::with_capacity(response.results.len());
                let mut unrequested = 0usize;
                for result in &response.results {
                    let key = result.key(&batch.scope);
                    if requested.contains(&key) {
                        answers.insert(key, result.permitted);
                    } else {
                        unrequested += 1;
                    }
                }
                if unrequested > 0 {
                    debug!("Ignoring {} result(s) that were not requested", unrequested);
                }

                let resolutions: Vec<Resolution> = batch
                    .keys()
                    .map(|key| match answers.get(key) {
                        Some(&granted) => Resolution {
                            key: key.clone(),
                            granted,
                            source: ResolutionSource::Backend,
                        },
                        None => Resolution {
                            key: key.clone(),
                            granted: true,
                            source: ResolutionSource::MissingFromResponse,
                        },
                    })
                    .collect();

                let missing = resolutions.iter().filter(|r| r.source.is_fail_open()).count();
                if missing > 0 {
                    warn!("Backend omitted {} of {} key(s), failing open", missing, resolutions.len());
                } else {
                    debug!("Resolved {} key(s)", resolutions.len());
                }

                BatchOutcome {
                    batch_id,
                    scope: batch.scope,
                    resolutions,
                    transport_failed: false,
                }
            }
            Err(e) => {
                warn!("Permission batch failed ({}): {}, failing open", e.category(), e);
                let resolutions = batch
                    .keys()
                    .map(|key| Resolution {
                        key: key.clone(),
                        granted: true,
                        source: ResolutionSource::TransportFailure,
                    })
                    .collect();
                BatchOutcome {
                    batch_id,
                    scope: batch.scope,
                    resolutions,
                    transport_failed: true,
                }
            }
        }
    }
}
