//! Outbound interface to the authorization backend
//!
//! The engine issues one [`BatchCheckRequest`] per scope per flush and only
//! consumes the shapes defined here; transport, authentication headers and
//! serialization belong to the [`PermissionsClient`] implementation.

pub mod http;

use crate::error::Result;
use crate::permissions::key::{CanonicalKey, Permission, PermissionCheck, ResourceType, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpPermissionsClient;

/// One `{resourceType, resourceIdentifier, permission}` tuple of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionQuery {
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_identifier: Option<String>,
    pub permission: Permission,
}

impl From<&PermissionCheck> for PermissionQuery {
    fn from(check: &PermissionCheck) -> Self {
        Self {
            resource_type: check.resource_type(),
            resource_identifier: check.resource_identifier().map(str::to_string),
            permission: check.permission(),
        }
    }
}

/// All pending questions for a single scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCheckRequest {
    pub scope: Scope,
    pub permissions: Vec<PermissionQuery>,
}

/// Backend answer for one tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResult {
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_identifier: Option<String>,
    pub permission: Permission,
    pub permitted: bool,
}

impl PermissionResult {
    /// Canonical key of this answer within `scope`
    pub fn key(&self, scope: &Scope) -> CanonicalKey {
        CanonicalKey::from_parts(
            scope,
            self.resource_type,
            self.resource_identifier.as_deref(),
            self.permission,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckResponse {
    pub results: Vec<PermissionResult>,
}

/// Performs the actual batched network call
#[async_trait]
pub trait PermissionsClient: Send + Sync {
    /// Resolve every query of `request`.
    ///
    /// An `Err` means the whole batch failed; the engine then fails open for
    /// every key in it and does not retry.
    async fn check_permissions(&self, request: BatchCheckRequest) -> Result<BatchCheckResponse>;
}
