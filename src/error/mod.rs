//! Error handling module for Permgate
//!
//! Errors only surface at the edges of the engine (configuration, input
//! validation, lifecycle and the backend transport). `evaluate` never fails.

mod error;

pub use error::{PermissionError, Result};
