//! Execution dispatcher - runs code, commands and file operations inside a
//! sandbox and decodes their results.
//!
//! Calls against one context are serialized through the context's lock;
//! calls against different contexts or sandboxes run independently.

use crate::api::{ApiClient, Idempotency, Scope};
use crate::context::{ContextId, ContextManager};
use crate::error::{CoreError, Result};
use crate::execution::{CodeExecutionResult, CommandExecutionResult, WireCodeRun, WireCommandRun};
use crate::registry::{Registry, Tombstone};
use crate::sandbox::SandboxId;
use crate::transport::ApiRequest;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Exit codes shells use for "cannot execute" and "not found".
const SPAWN_FAILURE_CODES: [i32; 2] = [126, 127];

/// Shell diagnostics that confirm one of those codes came from a failed
/// spawn rather than from the command itself.
const SPAWN_FAILURE_MARKERS: [&str; 4] = [
    "not found",
    "cannot execute",
    "Permission denied",
    "No such file or directory",
];

/// Code to run in an interpreter.
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub code: String,
    /// Interpreter language (default: `python`).
    pub language: String,
    /// Context whose state the code sees; `None` runs in a fresh transient
    /// context.
    pub context: Option<ContextId>,
    pub env: HashMap<String, String>,
    /// Execution timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl CodeRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: "python".to_string(),
            context: None,
            env: HashMap::new(),
            timeout_ms: None,
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn context(mut self, context: ContextId) -> Self {
        self.context = Some(context);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Shell command to run.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    /// Execution timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout_ms: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Dispatches execution and file calls to a sandbox.
#[derive(Clone)]
pub struct Dispatcher {
    api: ApiClient,
    registry: Arc<Registry>,
    contexts: ContextManager,
    grace: Duration,
}

impl Dispatcher {
    pub(crate) fn new(api: ApiClient, registry: Arc<Registry>, contexts: ContextManager, grace: Duration) -> Self {
        Self {
            api,
            registry,
            contexts,
            grace,
        }
    }

    pub(crate) fn api(&self) -> &ApiClient {
        &self.api
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run code in an interpreter.
    ///
    /// Errors raised by the code are part of the result, not an `Err`.
    /// With a context, the call waits for any other call on the same
    /// context to finish first.
    pub async fn run_code(&self, sandbox_id: &SandboxId, request: &CodeRequest) -> Result<CodeExecutionResult> {
        if request.language.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration("language is required".into()));
        }
        self.registry.check_usable(sandbox_id).await?;

        let _turn = match &request.context {
            Some(context_id) => Some(self.contexts.lock_for(sandbox_id, context_id).await.lock_owned().await),
            None => None,
        };

        let mut body = serde_json::json!({
            "code": request.code,
            "language": request.language,
        });
        if let Some(context_id) = &request.context {
            body["context_id"] = serde_json::json!(context_id);
        }
        if !request.env.is_empty() {
            body["environment"] = serde_json::to_value(&request.env)?;
        }
        if let Some(ms) = request.timeout_ms {
            body["timeout"] = serde_json::json!(ms);
        }

        let scope = match &request.context {
            Some(context_id) => Scope::Context(sandbox_id, context_id),
            None => Scope::Sandbox(sandbox_id),
        };
        let start = std::time::Instant::now();
        let api_request = ApiRequest::post(format!("sandboxes/{sandbox_id}/code/run")).json(body);
        let wire: WireCodeRun = self
            .execute(sandbox_id, api_request, scope, request.timeout_ms)
            .await?;
        let result = CodeExecutionResult::from(wire);

        tracing::debug!(
            sandbox_id = %sandbox_id,
            context_id = ?request.context.as_ref().map(ContextId::as_str),
            failed = result.is_error(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Code executed"
        );
        Ok(result)
    }

    /// Run a shell command.
    ///
    /// A non-zero exit is a normal result. A command that could not be
    /// started at all fails with `ExecutionFailure`.
    pub async fn run_command(
        &self,
        sandbox_id: &SandboxId,
        request: &CommandRequest,
    ) -> Result<CommandExecutionResult> {
        if request.command.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration("command is required".into()));
        }
        self.registry.check_usable(sandbox_id).await?;

        let mut body = serde_json::json!({ "command": request.command });
        if !request.args.is_empty() {
            body["args"] = serde_json::json!(request.args);
        }
        if let Some(dir) = &request.working_dir {
            body["working_dir"] = serde_json::json!(dir);
        }
        if !request.env.is_empty() {
            body["environment"] = serde_json::to_value(&request.env)?;
        }
        if let Some(ms) = request.timeout_ms {
            body["timeout"] = serde_json::json!(ms);
        }

        let api_request = ApiRequest::post(format!("sandboxes/{sandbox_id}/commands/run")).json(body);
        let wire: WireCommandRun = self
            .execute(sandbox_id, api_request, Scope::Sandbox(sandbox_id), request.timeout_ms)
            .await?;

        let exit_code = match wire.exit_code {
            Some(code) if !is_spawn_failure(code, &wire) => code,
            Some(code) => {
                let detail = wire.error.unwrap_or(wire.stderr);
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    command = %request.command,
                    exit_code = code,
                    "Command could not be started"
                );
                return Err(CoreError::ExecutionFailure(format!(
                    "{}: exit code {code}: {}",
                    request.command,
                    detail.trim()
                )));
            }
            None => {
                let detail = wire.error.unwrap_or_else(|| "no exit status reported".to_string());
                return Err(CoreError::ExecutionFailure(format!("{}: {detail}", request.command)));
            }
        };

        tracing::debug!(
            sandbox_id = %sandbox_id,
            command = %request.command,
            exit_code,
            duration_ms = wire.duration_ms,
            "Command executed"
        );
        Ok(CommandExecutionResult {
            stdout: wire.stdout,
            stderr: wire.stderr,
            exit_code,
            success: exit_code == 0,
            duration_ms: wire.duration_ms,
        })
    }

    /// Send an execution call, enforcing the caller's timeout locally.
    ///
    /// On local expiry the remote outcome is unknown and the call is never
    /// retried.
    async fn execute<R: DeserializeOwned>(
        &self,
        sandbox_id: &SandboxId,
        request: ApiRequest,
        scope: Scope<'_>,
        timeout_ms: Option<u64>,
    ) -> Result<R> {
        let result = match timeout_ms {
            Some(ms) => {
                let deadline = Duration::from_millis(ms) + self.grace;
                let call = self
                    .api
                    .call::<R>(request.timeout(deadline), scope, Idempotency::NonIdempotent);
                match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            sandbox_id = %sandbox_id,
                            timeout_ms = ms,
                            "Execution timed out locally"
                        );
                        Err(CoreError::Timeout(deadline))
                    }
                }
            }
            None => {
                self.api
                    .call::<R>(request, scope, Idempotency::NonIdempotent)
                    .await
            }
        };

        match result {
            Err(CoreError::SandboxNotFound(_)) => {
                self.registry.bury(sandbox_id, Tombstone::Gone).await;
                Err(CoreError::SandboxNotFound(sandbox_id.clone()))
            }
            Err(e @ CoreError::ContextNotFound { .. }) => {
                if let Scope::Context(_, context_id) = scope {
                    self.registry.lock(sandbox_id).await.forget_context(context_id);
                }
                Err(e)
            }
            other => other,
        }
    }
}

/// Whether a reported exit code means the command never started.
///
/// 126 and 127 only count when the backend flags an error or the shell
/// says so on stderr; a command may exit 127 on its own.
fn is_spawn_failure(code: i32, wire: &WireCommandRun) -> bool {
    if code < 0 {
        return true;
    }
    SPAWN_FAILURE_CODES.contains(&code)
        && (wire.error.is_some() || SPAWN_FAILURE_MARKERS.iter().any(|marker| wire.stderr.contains(marker)))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn wire(stderr: &str, error: Option<&str>) -> WireCommandRun {
        serde_json::from_value(serde_json::json!({
            "stderr": stderr,
            "error": error,
        }))
        .expect("wire payload")
    }

    #[test]
    fn test_spawn_failure_needs_a_diagnostic() {
        assert!(is_spawn_failure(127, &wire("sh: foo: command not found\n", None)));
        assert!(is_spawn_failure(126, &wire("sh: ./run.sh: Permission denied\n", None)));
        assert!(is_spawn_failure(127, &wire("", Some("exec failed"))));
        assert!(is_spawn_failure(-1, &wire("", None)));

        assert!(!is_spawn_failure(127, &wire("", None)));
        assert!(!is_spawn_failure(126, &wire("custom failure\n", None)));
        assert!(!is_spawn_failure(1, &wire("not found\n", None)));
    }
}
