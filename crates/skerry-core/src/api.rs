//! API dispatch: request sending, status mapping and bounded retries.
//!
//! Every component talks to the backend through [`ApiClient`]. It turns
//! non-success statuses into the [`CoreError`] taxonomy, scoped to the
//! resource the call addressed, and retries transient failures for calls
//! the caller marked idempotent.

use crate::context::ContextId;
use crate::error::CoreError;
use crate::sandbox::SandboxId;
use crate::transport::{ApiRequest, ApiResponse, Transport};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Whether a call may be repeated without duplicating side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Idempotency {
    /// Safe to retry on transient failures.
    Idempotent,
    /// Never retried by the core.
    NonIdempotent,
}

/// Resource a call addresses; decides which not-found error a 404 becomes.
///
/// On every scope bound to a sandbox except `Lifecycle`, a 409 means the
/// sandbox is no longer running and maps to `SandboxNotFound`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope<'a> {
    /// Collection endpoints (list, templates).
    Collection,
    /// A single sandbox.
    Sandbox(&'a SandboxId),
    /// A lifecycle transition on a sandbox; 409 stays `InvalidState`.
    Lifecycle(&'a SandboxId),
    /// A code context on a sandbox.
    Context(&'a SandboxId, &'a ContextId),
    /// A filesystem path inside a sandbox.
    Path(&'a SandboxId, &'a str),
}

/// Retry policy for idempotent calls.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Shared request dispatcher used by all components.
#[derive(Clone)]
pub(crate) struct ApiClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub(crate) fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Send a request and decode the JSON body.
    pub(crate) async fn call<R: DeserializeOwned>(
        &self,
        request: ApiRequest,
        scope: Scope<'_>,
        idempotency: Idempotency,
    ) -> Result<R, CoreError> {
        let response = self.call_raw(request, scope, idempotency).await?;
        decode(&response)
    }

    /// Send a request and return the raw success response.
    pub(crate) async fn call_raw(
        &self,
        request: ApiRequest,
        scope: Scope<'_>,
        idempotency: Idempotency,
    ) -> Result<ApiResponse, CoreError> {
        let start = std::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            tracing::debug!(
                method = %request.method,
                path = %request.path,
                attempt = attempts,
                "Sending API request"
            );

            let result = match self.transport.send(request.clone()).await {
                Ok(response) if response.is_success() => Ok(response),
                Ok(response) => Err(status_error(&response, scope)),
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => {
                    tracing::debug!(
                        path = %request.path,
                        status = response.status,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "API call successful"
                    );
                    return Ok(response);
                }
                Err(e)
                    if e.is_retryable()
                        && idempotency == Idempotency::Idempotent
                        && attempts <= self.retry.max_retries =>
                {
                    let delay = self.retry.delay_for(attempts);
                    tracing::warn!(
                        path = %request.path,
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::debug!(path = %request.path, error = %e, attempts, "API call failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Decode a JSON response body.
pub(crate) fn decode<R: DeserializeOwned>(response: &ApiResponse) -> Result<R, CoreError> {
    // Empty bodies decode as JSON null so unit-like responses still work.
    if response.body.is_empty() {
        return serde_json::from_value(serde_json::Value::Null).map_err(CoreError::from);
    }
    serde_json::from_slice(&response.body).map_err(CoreError::from)
}

/// Map a non-success response onto the error taxonomy.
pub(crate) fn status_error(response: &ApiResponse, scope: Scope<'_>) -> CoreError {
    let message = error_message(response);
    match (response.status, scope) {
        (401 | 403, _) => CoreError::Authentication(message),
        (404, Scope::Sandbox(id) | Scope::Lifecycle(id)) => CoreError::SandboxNotFound(id.clone()),
        (404, Scope::Context(sandbox_id, context_id)) => CoreError::ContextNotFound {
            sandbox_id: sandbox_id.clone(),
            context_id: context_id.clone(),
        },
        (404, Scope::Path(_, path)) => CoreError::FileNotFound(path.to_string()),
        (400 | 422, Scope::Path(_, path)) => CoreError::InvalidPath(format!("{path}: {message}")),
        (400 | 422, _) => CoreError::InvalidConfiguration(message),
        (409, Scope::Sandbox(id) | Scope::Context(id, _) | Scope::Path(id, _)) => {
            CoreError::SandboxNotFound(id.clone())
        }
        (409, _) => CoreError::invalid_state("Running", message),
        (408 | 429 | 502 | 503 | 504, _) => {
            CoreError::TransientTransport(format!("status {}: {message}", response.status))
        }
        (status @ 500..=599, _) => CoreError::Server { status, message },
        (status, _) => CoreError::Connection(format!("unexpected status {status}: {message}")),
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(response: &ApiResponse) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&response.body) {
        for key in ["error", "message", "detail"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let text = response.text();
    if text.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        text
    }
}
