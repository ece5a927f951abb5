//! HTTP implementation of [`PermissionsClient`]

use crate::client::{BatchCheckRequest, BatchCheckResponse, PermissionResult, PermissionsClient};
use crate::config::HttpClientConfig;
use crate::error::{PermissionError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Path of the batch check endpoint, relative to the configured base URL
pub const CHECK_PATH: &str = "api/v1/permissions/check";

/// Response row before the closed enums are validated
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPermissionResult {
    resource_type: String,
    #[serde(default)]
    resource_identifier: Option<String>,
    permission: String,
    permitted: bool,
}

#[derive(Debug, Deserialize)]
struct RawBatchCheckResponse {
    #[serde(default)]
    results: Vec<RawPermissionResult>,
}

/// Posts batches as JSON to the authorization backend
#[derive(Debug, Clone)]
pub struct HttpPermissionsClient {
    http: reqwest::Client,
    endpoint: Url,
    api_token: Option<String>,
}

impl HttpPermissionsClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| PermissionError::config(format!("Invalid base_url '{}': {}", config.base_url, e)))?;
        // Join relative to the base path, so "https://host/authz" keeps its prefix
        let base = if base.path().ends_with('/') {
            base
        } else {
            let mut with_slash = base.clone();
            with_slash.set_path(&format!("{}/", base.path()));
            with_slash
        };
        let endpoint = base
            .join(CHECK_PATH)
            .map_err(|e| PermissionError::config(format!("Invalid check endpoint: {}", e)))?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout_ms) = config.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            endpoint,
            api_token: config.api_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PermissionsClient for HttpPermissionsClient {
    async fn check_permissions(&self, request: BatchCheckRequest) -> Result<BatchCheckResponse> {
        debug!(
            "POST {} with {} permission(s) for scope {}",
            self.endpoint,
            request.permissions.len(),
            request.scope
        );

        let mut call = self.http.post(self.endpoint.clone()).json(&request);
        if let Some(token) = &self.api_token {
            call = call.bearer_auth(token);
        }

        let response = call.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PermissionError::transport(format!(
                "permission check returned {}: {}",
                status, body
            )));
        }

        let raw: RawBatchCheckResponse = response.json().await?;
        let mut results = Vec::with_capacity(raw.results.len());
        for row in raw.results {
            let resource_type = match row.resource_type.parse() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("Skipping permission result: {}", e);
                    continue;
                }
            };
            let permission = match row.permission.parse() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping permission result: {}", e);
                    continue;
                }
            };
            results.push(PermissionResult {
                resource_type,
                resource_identifier: row.resource_identifier.filter(|id| !id.is_empty()),
                permission,
                permitted: row.permitted,
            });
        }

        Ok(BatchCheckResponse { results })
    }
}
