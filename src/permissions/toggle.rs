//! Global switch for the whole permission-checking subsystem

use std::sync::atomic::{AtomicBool, Ordering};

/// Source of the global enable flag, read on every registration and evaluation
pub trait FeatureToggle: Send + Sync {
    fn is_enabled(&self) -> bool;
}

/// Toggle that can be flipped at runtime
#[derive(Debug)]
pub struct SwitchToggle {
    enabled: AtomicBool,
}

impl SwitchToggle {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Default for SwitchToggle {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FeatureToggle for SwitchToggle {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl<F> FeatureToggle for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_enabled(&self) -> bool {
        self()
    }
}
