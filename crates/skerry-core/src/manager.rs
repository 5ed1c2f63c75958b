//! Sandbox lifecycle manager.
//!
//! Drives the `Creating -> Running -> {Stopped | Error}` state machine
//! against the backend and keeps the [`Registry`] in step with every
//! observed transition.

use crate::api::{decode, ApiClient, Idempotency, Scope};
use crate::config::{validate_timeout_secs, SandboxConfig};
use crate::error::{CoreError, Result};
use crate::registry::{Registry, Tombstone};
use crate::sandbox::{Removal, Sandbox, SandboxId, SandboxList, SandboxMetrics, SandboxState};
use crate::transport::{ApiRequest, ApiResponse};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default page size for [`SandboxManager::list`].
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Result of a timeout update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutUpdate {
    /// Backend acknowledgement.
    #[serde(default)]
    pub message: String,
    /// New timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    /// New absolute expiry, when the backend reports it.
    #[serde(default, deserialize_with = "crate::sandbox::lenient_timestamp")]
    pub timeout_at: Option<DateTime<Utc>>,
}

/// Public URL of a sandbox port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostUrl {
    pub url: String,
}

/// Creates, inspects, extends and kills sandboxes.
#[derive(Clone)]
pub struct SandboxManager {
    api: ApiClient,
    registry: Arc<Registry>,
    default_provider: Option<String>,
    default_region: Option<String>,
}

impl SandboxManager {
    pub(crate) fn new(
        api: ApiClient,
        registry: Arc<Registry>,
        default_provider: Option<String>,
        default_region: Option<String>,
    ) -> Self {
        Self {
            api,
            registry,
            default_provider,
            default_region,
        }
    }

    /// Create a sandbox.
    ///
    /// Configuration is validated before any remote call. Provider and
    /// region fall back to the client defaults. The returned sandbox
    /// accepts execution calls.
    pub async fn create(&self, config: &SandboxConfig) -> Result<Sandbox> {
        config.validate()?;
        let provider = config
            .provider
            .clone()
            .or_else(|| self.default_provider.clone())
            .ok_or_else(|| {
                CoreError::InvalidConfiguration(
                    "provider is required (set it on the sandbox or client config)".into(),
                )
            })?;
        let region = config
            .region
            .clone()
            .or_else(|| self.default_region.clone())
            .ok_or_else(|| {
                CoreError::InvalidConfiguration(
                    "region is required (set it on the sandbox or client config)".into(),
                )
            })?;

        let start = std::time::Instant::now();
        tracing::info!(
            template = %config.template,
            provider = %provider,
            region = %region,
            timeout_secs = config.timeout_secs,
            "Creating sandbox"
        );

        let mut body = serde_json::json!({
            "provider": provider,
            "region": region,
            "template": config.template,
            "timeout": config.timeout_secs,
        });
        if !config.env_vars.is_empty() {
            body["env_vars"] = serde_json::to_value(&config.env_vars)?;
        }
        if !config.metadata.is_empty() {
            body["metadata"] = serde_json::to_value(&config.metadata)?;
        }

        let response = self
            .api
            .call_raw(
                ApiRequest::post("sandboxes").json(body),
                Scope::Collection,
                Idempotency::NonIdempotent,
            )
            .await?;
        let mut sandbox: Sandbox = match decode(&response) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.discard_undecodable(&response, &e).await;
                return Err(e);
            }
        };

        sandbox.template.get_or_insert_with(|| config.template.clone());
        sandbox.provider.get_or_insert(provider);
        sandbox.region.get_or_insert(region);
        sandbox.timeout_secs.get_or_insert(config.timeout_secs);
        if sandbox.timeout_at.is_none() {
            let started = sandbox.started_at.unwrap_or_else(Utc::now);
            sandbox.timeout_at = Some(started + ChronoDuration::seconds(i64::from(config.timeout_secs)));
        }
        // Creation is a black box; an accepted create is ready for calls.
        if sandbox.state == SandboxState::Creating {
            sandbox.state = SandboxState::Running;
        }

        self.registry.observe(sandbox.clone()).await;
        tracing::info!(
            sandbox_id = %sandbox.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox created"
        );
        Ok(sandbox)
    }

    /// Fetch a sandbox.
    ///
    /// Fails with `SandboxNotFound` if it never existed, was killed through
    /// this client, or the backend reports it stopped; with `Expired` if its
    /// cached expiry has passed.
    pub async fn get(&self, id: &SandboxId) -> Result<Sandbox> {
        self.registry.check_usable(id).await?;

        let result: Result<Sandbox> = self
            .api
            .call(
                ApiRequest::get(format!("sandboxes/{id}")),
                Scope::Sandbox(id),
                Idempotency::Idempotent,
            )
            .await;

        let mut entry = self.registry.lock(id).await;
        match result {
            Ok(sandbox) => {
                entry.observe(sandbox.clone());
                if entry.tombstone.is_some() {
                    tracing::debug!(sandbox_id = %id, state = %sandbox.state, "Sandbox no longer running");
                    return Err(CoreError::SandboxNotFound(id.clone()));
                }
                Ok(sandbox)
            }
            Err(e @ CoreError::SandboxNotFound(_)) => {
                entry.bury(Tombstone::Gone);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// List sandboxes known to the backend.
    ///
    /// A snapshot, not a live view. Every listed sandbox refreshes its
    /// registry entry.
    pub async fn list(&self, limit: Option<u32>, offset: Option<u32>) -> Result<SandboxList> {
        let request = ApiRequest::get("sandboxes")
            .query("limit", limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .query("offset", offset.unwrap_or(0));
        let list: SandboxList = self
            .api
            .call(request, Scope::Collection, Idempotency::Idempotent)
            .await?;

        for sandbox in &list.sandboxes {
            self.registry.observe(sandbox.clone()).await;
        }
        tracing::debug!(count = list.sandboxes.len(), total = list.total, "Listed sandboxes");
        Ok(list)
    }

    /// Change a running sandbox's lifetime.
    ///
    /// Fails with `InvalidState` if the sandbox is not running, including
    /// when its cached expiry has already passed.
    pub async fn set_timeout(&self, id: &SandboxId, timeout_secs: u32) -> Result<TimeoutUpdate> {
        validate_timeout_secs(timeout_secs)?;

        let mut entry = self.registry.lock(id).await;
        entry.check_running(Utc::now())?;

        let request = ApiRequest::post(format!("sandboxes/{id}/timeout"))
            .json(serde_json::json!({ "timeout": timeout_secs }));
        let result: Result<TimeoutUpdate> = self
            .api
            .call(request, Scope::Lifecycle(id), Idempotency::NonIdempotent)
            .await;
        let mut update = match result {
            Ok(update) => update,
            Err(e @ (CoreError::SandboxNotFound(_) | CoreError::InvalidState { .. })) => {
                entry.bury(Tombstone::Gone);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        update.timeout.get_or_insert(timeout_secs);

        if let Some(sandbox) = entry.sandbox.as_mut() {
            sandbox.timeout_secs = Some(timeout_secs);
            sandbox.timeout_at = Some(
                update
                    .timeout_at
                    .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(i64::from(timeout_secs))),
            );
        }
        tracing::info!(
            sandbox_id = %id,
            timeout_secs,
            timeout_at = ?update.timeout_at,
            "Sandbox timeout updated"
        );
        Ok(update)
    }

    /// Kill a sandbox.
    ///
    /// Idempotent: killing a sandbox that is already gone, or that the
    /// backend never knew, succeeds with [`Removal::AlreadyGone`].
    pub async fn kill(&self, id: &SandboxId) -> Result<Removal> {
        let mut entry = self.registry.lock(id).await;
        if matches!(entry.tombstone, Some(Tombstone::Killed | Tombstone::Gone)) {
            tracing::debug!(sandbox_id = %id, "Sandbox already gone, skipping kill");
            entry.bury(Tombstone::Killed);
            return Ok(Removal::AlreadyGone);
        }

        let start = std::time::Instant::now();
        tracing::info!(sandbox_id = %id, "Killing sandbox");
        let outcome = match self
            .api
            .call_raw(
                ApiRequest::delete(format!("sandboxes/{id}")),
                Scope::Sandbox(id),
                Idempotency::NonIdempotent,
            )
            .await
        {
            Ok(_) => Removal::Removed,
            Err(CoreError::SandboxNotFound(_)) => Removal::AlreadyGone,
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Kill failed");
                return Err(e);
            }
        };

        entry.bury(Tombstone::Killed);
        tracing::info!(
            sandbox_id = %id,
            outcome = ?outcome,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox killed"
        );
        Ok(outcome)
    }

    /// Current resource usage. Never cached.
    pub async fn get_metrics(&self, id: &SandboxId) -> Result<SandboxMetrics> {
        self.registry.check_usable(id).await?;
        let mut metrics: SandboxMetrics = self
            .call_sandbox(ApiRequest::get(format!("sandboxes/{id}/metrics")), id)
            .await?;
        metrics.sandbox_id = id.clone();
        Ok(metrics)
    }

    /// Public URL for a port exposed by the sandbox.
    pub async fn get_host_url(&self, id: &SandboxId, port: u16) -> Result<String> {
        if port == 0 {
            return Err(CoreError::InvalidConfiguration("port must be > 0".into()));
        }
        self.registry.check_usable(id).await?;
        let host: HostUrl = self
            .call_sandbox(ApiRequest::get(format!("sandboxes/{id}/host/{port}")), id)
            .await?;
        Ok(host.url)
    }

    /// Whether the sandbox is running. Never fails.
    pub async fn is_alive(&self, id: &SandboxId) -> bool {
        match self.get(id).await {
            Ok(sandbox) => sandbox.state == SandboxState::Running,
            Err(e) => {
                tracing::debug!(sandbox_id = %id, error = %e, "Liveness check failed");
                false
            }
        }
    }

    /// Kill a sandbox whose create response could not be decoded.
    ///
    /// The backend accepted the create, so a sandbox may be running that no
    /// caller holds a handle to.
    async fn discard_undecodable(&self, response: &ApiResponse, error: &CoreError) {
        let id = serde_json::from_slice::<serde_json::Value>(&response.body)
            .ok()
            .and_then(|value| {
                value
                    .get("sandbox_id")
                    .or_else(|| value.get("id"))
                    .and_then(|id| id.as_str())
                    .map(SandboxId::from)
            });
        let Some(id) = id else {
            tracing::error!(error = %error, "Create response carried no sandbox ID, sandbox may be left running");
            return;
        };

        tracing::warn!(sandbox_id = %id, error = %error, "Create response could not be decoded, killing sandbox");
        if let Err(e) = self.kill(&id).await {
            tracing::error!(sandbox_id = %id, error = %e, "Failed to kill undecodable sandbox");
        }
    }

    /// Idempotent sandbox-scoped read that buries the handle on 404.
    async fn call_sandbox<R: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
        id: &SandboxId,
    ) -> Result<R> {
        let result = self
            .api
            .call(request, Scope::Sandbox(id), Idempotency::Idempotent)
            .await;
        if let Err(CoreError::SandboxNotFound(_)) = &result {
            self.registry.bury(id, Tombstone::Gone).await;
        }
        result
    }
}
