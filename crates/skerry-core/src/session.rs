//! Scoped sessions - a sandbox that is killed when its scope ends.
//!
//! [`Client::with_session`] runs a closure against a fresh sandbox and
//! kills it afterwards, whether the closure succeeded or failed. If the
//! future is dropped instead, the [`SessionGuard`] spawns the kill on the
//! current runtime. Either way the kill is issued exactly once.

use crate::client::Client;
use crate::config::SandboxConfig;
use crate::context::{CodeContext, ContextId};
use crate::dispatcher::{CodeRequest, CommandRequest};
use crate::error::{CoreError, Result};
use crate::execution::{CodeExecutionResult, CommandExecutionResult};
use crate::files::{FileContent, FileInfo, PathAck, WriteAck, WriteEntry, WriteFilesResult, WriteOptions, WriteResult};
use crate::manager::TimeoutUpdate;
use crate::sandbox::{Removal, Sandbox, SandboxId, SandboxMetrics};
use bytes::Bytes;
use std::future::Future;
use std::ops::Deref;
use std::path::Path;

/// Operations bound to one sandbox.
#[derive(Clone)]
pub struct Session {
    client: Client,
    sandbox: Sandbox,
}

impl Session {
    pub(crate) fn new(client: Client, sandbox: Sandbox) -> Self {
        Self { client, sandbox }
    }

    /// Sandbox ID.
    pub fn id(&self) -> &SandboxId {
        &self.sandbox.id
    }

    /// Snapshot taken when the session was opened.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Fresh snapshot from the backend.
    pub async fn refresh(&self) -> Result<Sandbox> {
        self.client.sandboxes().get(self.id()).await
    }

    pub async fn is_alive(&self) -> bool {
        self.client.sandboxes().is_alive(self.id()).await
    }

    pub async fn set_timeout(&self, timeout_secs: u32) -> Result<TimeoutUpdate> {
        self.client.sandboxes().set_timeout(self.id(), timeout_secs).await
    }

    pub async fn get_metrics(&self) -> Result<SandboxMetrics> {
        self.client.sandboxes().get_metrics(self.id()).await
    }

    pub async fn get_host_url(&self, port: u16) -> Result<String> {
        self.client.sandboxes().get_host_url(self.id(), port).await
    }

    pub async fn create_context(&self, language: &str, cwd: Option<&str>) -> Result<CodeContext> {
        self.client.contexts().create_context(self.id(), language, cwd).await
    }

    pub async fn get_context(&self, context_id: &ContextId) -> Result<CodeContext> {
        self.client.contexts().get_context(self.id(), context_id).await
    }

    pub async fn delete_context(&self, context_id: &ContextId) -> Result<Removal> {
        self.client.contexts().delete_context(self.id(), context_id).await
    }

    pub async fn run_code(&self, request: &CodeRequest) -> Result<CodeExecutionResult> {
        self.client.dispatcher().run_code(self.id(), request).await
    }

    pub async fn run_command(&self, request: &CommandRequest) -> Result<CommandExecutionResult> {
        self.client.dispatcher().run_command(self.id(), request).await
    }

    pub async fn read_file(&self, path: &str) -> Result<FileContent> {
        self.client.dispatcher().read_file(self.id(), path).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<WriteAck> {
        self.client.dispatcher().write_file(self.id(), path, content).await
    }

    pub async fn write(&self, path: &str, data: impl Into<Bytes>, options: &WriteOptions) -> Result<WriteResult> {
        self.client.dispatcher().write(self.id(), path, data, options).await
    }

    pub async fn write_files(&self, entries: Vec<WriteEntry>, user: Option<&str>) -> Result<WriteFilesResult> {
        self.client.dispatcher().write_files(self.id(), entries, user).await
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.client.dispatcher().list_files(self.id(), path).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<PathAck> {
        self.client.dispatcher().delete_file(self.id(), path).await
    }

    pub async fn make_directory(&self, path: &str) -> Result<PathAck> {
        self.client.dispatcher().make_directory(self.id(), path).await
    }

    pub async fn upload_file(&self, local_path: &Path, remote_path: Option<&str>) -> Result<WriteAck> {
        self.client
            .dispatcher()
            .upload_file(self.id(), local_path, remote_path)
            .await
    }

    pub async fn download_file(&self, path: &str) -> Result<Bytes> {
        self.client.dispatcher().download_file(self.id(), path).await
    }
}

/// Owns a session's sandbox and kills it exactly once.
///
/// Call [`release`](Self::release) to kill it and observe the result.
/// Dropping an unreleased guard spawns the kill on the current tokio
/// runtime; outside a runtime the sandbox lives on until its timeout.
pub struct SessionGuard {
    session: Session,
    released: bool,
}

impl SessionGuard {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            released: false,
        }
    }

    /// The guarded session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Kill the sandbox now.
    ///
    /// The kill runs on its own task, so it completes exactly once even if
    /// the returned future is dropped.
    pub async fn release(mut self) -> Result<Removal> {
        self.released = true;
        let sandboxes = self.session.client.sandboxes().clone();
        let id = self.session.id().clone();
        match tokio::spawn(async move { sandboxes.kill(&id).await }).await {
            Ok(outcome) => outcome,
            Err(e) => match e.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(e) => Err(CoreError::Connection(format!("kill task cancelled: {e}"))),
            },
        }
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let sandboxes = self.session.client.sandboxes().clone();
        let id = self.session.id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(sandbox_id = %id, "Session dropped, killing sandbox in background");
                handle.spawn(async move {
                    if let Err(e) = sandboxes.kill(&id).await {
                        tracing::warn!(sandbox_id = %id, error = %e, "Background kill failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %id,
                    "Session dropped outside a runtime, sandbox left to expire"
                );
            }
        }
    }
}

impl Client {
    /// Create a sandbox and wrap it in a guard.
    pub async fn open_session(&self, config: &SandboxConfig) -> Result<SessionGuard> {
        let sandbox = self.sandboxes().create(config).await?;
        tracing::info!(sandbox_id = %sandbox.id, "Session opened");
        Ok(SessionGuard::new(Session::new(self.clone(), sandbox)))
    }

    /// Run `f` against a fresh sandbox, then kill it.
    ///
    /// The kill happens on every exit path. An error from `f` takes
    /// precedence over a cleanup error; a cleanup error alone is returned.
    pub async fn with_session<F, Fut, T, E>(&self, config: &SandboxConfig, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CoreError>,
    {
        let guard = self.open_session(config).await?;
        let id = guard.id().clone();
        let outcome = f(guard.session().clone()).await;
        let cleanup = guard.release().await;

        match (outcome, cleanup) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(cleanup)) => {
                tracing::warn!(sandbox_id = %id, error = %cleanup, "Cleanup failed after session error");
                Err(e)
            }
        }
    }
}
