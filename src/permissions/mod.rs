//! Permission-check aggregation and cache engine
//!
//! Consumers register the checks they care about, read answers synchronously
//! with `evaluate`, and cancel when done. Registrations are deduplicated by
//! [`CanonicalKey`], coalesced over a debounce window, and sent as one batch
//! per scope. Anything the backend fails to answer is granted.

pub mod executor;
pub mod key;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod subscriptions;
pub mod toggle;

pub use executor::{BatchExecutor, BatchOutcome, Resolution, ResolutionSource};
pub use key::{canonicalize, CanonicalKey, Permission, PermissionCheck, RawPermissionCheck, ResourceType, Scope};
pub use provider::{CheckGuard, EngineStats, PermissionsProvider, RegisterOptions, SkipCondition};
pub use scheduler::{DebouncedScheduler, PendingCheck, PendingRegistry, ScopeBatch};
pub use store::{CacheEntry, CacheStore, CheckStatus, EntryPatch};
pub use subscriptions::{Acquired, Released, SubscriptionManager};
pub use toggle::{FeatureToggle, SwitchToggle};
