//! Code contexts - interpreter sessions scoped to one sandbox.
//!
//! A context keeps its variable bindings across `run_code` calls and never
//! shares them with another context. Contexts die with their sandbox: a
//! local kill or expiry drops every context tracked for it.

use crate::api::{ApiClient, Idempotency, Scope};
use crate::error::{CoreError, Result};
use crate::registry::{Registry, Tombstone};
use crate::sandbox::{Removal, SandboxId};
use crate::transport::ApiRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default working directory of a new context.
pub const DEFAULT_CWD: &str = "/home/user";

/// Opaque identifier for a code context, assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An interpreter session living inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeContext {
    /// Backend-assigned identifier.
    #[serde(rename = "context_id", alias = "id")]
    pub id: ContextId,
    /// Sandbox this context runs in (filled in locally).
    #[serde(default = "unfilled_sandbox")]
    pub sandbox_id: SandboxId,
    /// Interpreter language.
    #[serde(default = "default_language")]
    pub language: String,
    /// Working directory.
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default, deserialize_with = "crate::sandbox::lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "crate::sandbox::lenient_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "crate::sandbox::lenient_timestamp")]
    pub last_used: Option<DateTime<Utc>>,
}

fn unfilled_sandbox() -> SandboxId {
    SandboxId::from("")
}

fn default_language() -> String {
    "python".to_string()
}

fn default_cwd() -> String {
    DEFAULT_CWD.to_string()
}

/// Creates, inspects and deletes code contexts.
#[derive(Clone)]
pub struct ContextManager {
    api: ApiClient,
    registry: Arc<Registry>,
}

impl ContextManager {
    pub(crate) fn new(api: ApiClient, registry: Arc<Registry>) -> Self {
        Self { api, registry }
    }

    /// Create a context on a running sandbox.
    ///
    /// `cwd` defaults to `/home/user`.
    pub async fn create_context(
        &self,
        sandbox_id: &SandboxId,
        language: &str,
        cwd: Option<&str>,
    ) -> Result<CodeContext> {
        if language.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration("language is required".into()));
        }

        // Held across the remote call; a concurrent kill must not leave the
        // new context in a dead sandbox's table.
        let mut entry = self.registry.lock(sandbox_id).await;
        entry.check_usable(sandbox_id, Utc::now())?;

        let cwd = cwd.unwrap_or(DEFAULT_CWD);
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/code/contexts"))
            .json(serde_json::json!({ "language": language, "cwd": cwd }));

        let result: Result<CodeContext> = self
            .api
            .call(request, Scope::Sandbox(sandbox_id), Idempotency::NonIdempotent)
            .await;
        let mut context = match result {
            Ok(context) => context,
            Err(e @ CoreError::SandboxNotFound(_)) => {
                entry.bury(Tombstone::Gone);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        context.sandbox_id = sandbox_id.clone();

        tracing::info!(
            sandbox_id = %sandbox_id,
            context_id = %context.id,
            language = %context.language,
            "Code context created"
        );
        entry.contexts.insert(context.id.clone(), context.clone());
        Ok(context)
    }

    /// Fetch a context.
    ///
    /// Fails with `ContextNotFound` if it was deleted or never existed.
    pub async fn get_context(&self, sandbox_id: &SandboxId, context_id: &ContextId) -> Result<CodeContext> {
        self.registry.check_usable(sandbox_id).await?;

        let request = ApiRequest::get(format!("sandboxes/{sandbox_id}/code/contexts/{context_id}"));
        let result: Result<CodeContext> = self
            .api
            .call(
                request,
                Scope::Context(sandbox_id, context_id),
                Idempotency::Idempotent,
            )
            .await;

        let mut entry = self.registry.lock(sandbox_id).await;
        match result {
            Ok(mut context) => {
                context.sandbox_id = sandbox_id.clone();
                if entry.tombstone.is_none() {
                    entry.contexts.insert(context.id.clone(), context.clone());
                }
                Ok(context)
            }
            Err(e @ CoreError::ContextNotFound { .. }) => {
                entry.forget_context(context_id);
                Err(e)
            }
            Err(e @ CoreError::SandboxNotFound(_)) => {
                entry.bury(Tombstone::Gone);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a context and its interpreter state.
    ///
    /// Deleting a context that is already gone succeeds with
    /// [`Removal::AlreadyGone`].
    pub async fn delete_context(&self, sandbox_id: &SandboxId, context_id: &ContextId) -> Result<Removal> {
        let mut entry = self.registry.lock(sandbox_id).await;
        if entry.check_usable(sandbox_id, Utc::now()).is_err() {
            tracing::debug!(
                sandbox_id = %sandbox_id,
                context_id = %context_id,
                "Sandbox already gone, context removed with it"
            );
            return Ok(Removal::AlreadyGone);
        }

        let request = ApiRequest::delete(format!("sandboxes/{sandbox_id}/code/contexts/{context_id}"));
        let outcome = match self
            .api
            .call_raw(
                request,
                Scope::Context(sandbox_id, context_id),
                Idempotency::NonIdempotent,
            )
            .await
        {
            Ok(_) => Removal::Removed,
            Err(CoreError::ContextNotFound { .. }) => Removal::AlreadyGone,
            Err(CoreError::SandboxNotFound(_)) => {
                entry.bury(Tombstone::Gone);
                Removal::AlreadyGone
            }
            Err(e) => return Err(e),
        };

        entry.forget_context(context_id);
        tracing::info!(
            sandbox_id = %sandbox_id,
            context_id = %context_id,
            outcome = ?outcome,
            "Code context deleted"
        );
        Ok(outcome)
    }

    /// Execution lock for a context; calls on one context run one at a time.
    pub(crate) async fn lock_for(&self, sandbox_id: &SandboxId, context_id: &ContextId) -> Arc<Mutex<()>> {
        self.registry.lock(sandbox_id).await.context_lock(context_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_decodes_either_id_key() {
        let by_id: CodeContext = serde_json::from_value(serde_json::json!({
            "id": "ctx-1",
            "language": "python"
        }))
        .expect("decode");
        assert_eq!(by_id.id.as_str(), "ctx-1");
        assert_eq!(by_id.cwd, "/home/user");

        let by_context_id: CodeContext = serde_json::from_value(serde_json::json!({
            "context_id": "ctx-2",
            "cwd": "/tmp",
            "created_at": "2030-01-01T00:00:00Z"
        }))
        .expect("decode");
        assert_eq!(by_context_id.id.as_str(), "ctx-2");
        assert_eq!(by_context_id.language, "python");
        assert_eq!(by_context_id.cwd, "/tmp");
        assert!(by_context_id.created_at.is_some());
    }

    #[test]
    fn test_context_id_display() {
        assert_eq!(ContextId::from("c").to_string(), "c");
    }
}
