//! Blocking adapter over the async client.
//!
//! Each call is driven to completion on a runtime owned by the client, so
//! the contracts, validation and error taxonomy are exactly those of the
//! async surface. Do not call into this module from inside an async task.

use crate::config::{ClientConfig, SandboxConfig};
use crate::context::{CodeContext, ContextId};
use crate::dispatcher::{CodeRequest, CommandRequest};
use crate::error::{CoreError, Result};
use crate::execution::{CodeExecutionResult, CommandExecutionResult};
use crate::files::{FileContent, FileInfo, PathAck, WriteAck, WriteEntry, WriteFilesResult, WriteOptions, WriteResult};
use crate::manager::TimeoutUpdate;
use crate::sandbox::{Removal, Sandbox, SandboxId, SandboxList, SandboxMetrics};
use crate::templates::TemplateList;
use crate::transport::Transport;
use bytes::Bytes;
use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Blocking client for the sandbox API.
#[derive(Clone)]
pub struct Client {
    inner: crate::Client,
    rt: Arc<Runtime>,
}

impl Client {
    /// Create a client that talks HTTP to `config.base_url`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            inner: crate::Client::new(config)?,
            rt: Arc::new(runtime()?),
        })
    }

    /// Create a client over a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self {
            inner: crate::Client::with_transport(config, transport)?,
            rt: Arc::new(runtime()?),
        })
    }

    /// The async client this adapter drives.
    pub fn as_async(&self) -> &crate::Client {
        &self.inner
    }

    fn block<F: Future>(&self, future: F) -> F::Output {
        self.rt.block_on(future)
    }

    pub fn create(&self, config: &SandboxConfig) -> Result<Sandbox> {
        self.block(self.inner.sandboxes().create(config))
    }

    pub fn get(&self, id: &SandboxId) -> Result<Sandbox> {
        self.block(self.inner.sandboxes().get(id))
    }

    pub fn list(&self, limit: Option<u32>, offset: Option<u32>) -> Result<SandboxList> {
        self.block(self.inner.sandboxes().list(limit, offset))
    }

    pub fn set_timeout(&self, id: &SandboxId, timeout_secs: u32) -> Result<TimeoutUpdate> {
        self.block(self.inner.sandboxes().set_timeout(id, timeout_secs))
    }

    pub fn kill(&self, id: &SandboxId) -> Result<Removal> {
        self.block(self.inner.sandboxes().kill(id))
    }

    pub fn get_metrics(&self, id: &SandboxId) -> Result<SandboxMetrics> {
        self.block(self.inner.sandboxes().get_metrics(id))
    }

    pub fn get_host_url(&self, id: &SandboxId, port: u16) -> Result<String> {
        self.block(self.inner.sandboxes().get_host_url(id, port))
    }

    pub fn is_alive(&self, id: &SandboxId) -> bool {
        self.block(self.inner.sandboxes().is_alive(id))
    }

    pub fn create_context(&self, id: &SandboxId, language: &str, cwd: Option<&str>) -> Result<CodeContext> {
        self.block(self.inner.contexts().create_context(id, language, cwd))
    }

    pub fn get_context(&self, id: &SandboxId, context_id: &ContextId) -> Result<CodeContext> {
        self.block(self.inner.contexts().get_context(id, context_id))
    }

    pub fn delete_context(&self, id: &SandboxId, context_id: &ContextId) -> Result<Removal> {
        self.block(self.inner.contexts().delete_context(id, context_id))
    }

    pub fn run_code(&self, id: &SandboxId, request: &CodeRequest) -> Result<CodeExecutionResult> {
        self.block(self.inner.dispatcher().run_code(id, request))
    }

    pub fn run_command(&self, id: &SandboxId, request: &CommandRequest) -> Result<CommandExecutionResult> {
        self.block(self.inner.dispatcher().run_command(id, request))
    }

    pub fn read_file(&self, id: &SandboxId, path: &str) -> Result<FileContent> {
        self.block(self.inner.dispatcher().read_file(id, path))
    }

    pub fn write_file(&self, id: &SandboxId, path: &str, content: &str) -> Result<WriteAck> {
        self.block(self.inner.dispatcher().write_file(id, path, content))
    }

    pub fn write(&self, id: &SandboxId, path: &str, data: impl Into<Bytes>, options: &WriteOptions) -> Result<WriteResult> {
        self.block(self.inner.dispatcher().write(id, path, data, options))
    }

    pub fn write_files(&self, id: &SandboxId, entries: Vec<WriteEntry>, user: Option<&str>) -> Result<WriteFilesResult> {
        self.block(self.inner.dispatcher().write_files(id, entries, user))
    }

    pub fn list_files(&self, id: &SandboxId, path: &str) -> Result<Vec<FileInfo>> {
        self.block(self.inner.dispatcher().list_files(id, path))
    }

    pub fn delete_file(&self, id: &SandboxId, path: &str) -> Result<PathAck> {
        self.block(self.inner.dispatcher().delete_file(id, path))
    }

    pub fn make_directory(&self, id: &SandboxId, path: &str) -> Result<PathAck> {
        self.block(self.inner.dispatcher().make_directory(id, path))
    }

    pub fn upload_file(&self, id: &SandboxId, local_path: &Path, remote_path: Option<&str>) -> Result<WriteAck> {
        self.block(self.inner.dispatcher().upload_file(id, local_path, remote_path))
    }

    pub fn download_file(&self, id: &SandboxId, path: &str) -> Result<Bytes> {
        self.block(self.inner.dispatcher().download_file(id, path))
    }

    pub fn list_templates(&self, limit: Option<u32>, offset: Option<u32>) -> Result<TemplateList> {
        self.block(self.inner.templates().list(limit, offset))
    }

    /// Create a sandbox and wrap it in a guard that kills it on drop.
    pub fn open_session(&self, config: &SandboxConfig) -> Result<SessionGuard> {
        let guard = self.block(self.inner.open_session(config))?;
        Ok(SessionGuard {
            session: Session {
                inner: guard.session().clone(),
                rt: Arc::clone(&self.rt),
            },
            async_guard: Some(guard),
        })
    }

    /// Run `f` against a fresh sandbox, then kill it.
    ///
    /// The kill also happens when `f` panics, while the stack unwinds. An
    /// error from `f` takes precedence over a cleanup error.
    pub fn with_session<F, T, E>(&self, config: &SandboxConfig, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Session) -> std::result::Result<T, E>,
        E: From<CoreError>,
    {
        let guard = self.open_session(config)?;
        let outcome = f(guard.session());
        let id = guard.id().clone();
        let cleanup = guard.release();

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

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("skerry-blocking")
        .enable_all()
        .build()
        .map_err(CoreError::from)
}

/// Blocking operations bound to one sandbox.
#[derive(Clone)]
pub struct Session {
    inner: crate::Session,
    rt: Arc<Runtime>,
}

impl Session {
    pub fn id(&self) -> &SandboxId {
        self.inner.id()
    }

    pub fn sandbox(&self) -> &Sandbox {
        self.inner.sandbox()
    }

    pub fn refresh(&self) -> Result<Sandbox> {
        self.rt.block_on(self.inner.refresh())
    }

    pub fn is_alive(&self) -> bool {
        self.rt.block_on(self.inner.is_alive())
    }

    pub fn set_timeout(&self, timeout_secs: u32) -> Result<TimeoutUpdate> {
        self.rt.block_on(self.inner.set_timeout(timeout_secs))
    }

    pub fn get_metrics(&self) -> Result<SandboxMetrics> {
        self.rt.block_on(self.inner.get_metrics())
    }

    pub fn get_host_url(&self, port: u16) -> Result<String> {
        self.rt.block_on(self.inner.get_host_url(port))
    }

    pub fn create_context(&self, language: &str, cwd: Option<&str>) -> Result<CodeContext> {
        self.rt.block_on(self.inner.create_context(language, cwd))
    }

    pub fn get_context(&self, context_id: &ContextId) -> Result<CodeContext> {
        self.rt.block_on(self.inner.get_context(context_id))
    }

    pub fn delete_context(&self, context_id: &ContextId) -> Result<Removal> {
        self.rt.block_on(self.inner.delete_context(context_id))
    }

    pub fn run_code(&self, request: &CodeRequest) -> Result<CodeExecutionResult> {
        self.rt.block_on(self.inner.run_code(request))
    }

    pub fn run_command(&self, request: &CommandRequest) -> Result<CommandExecutionResult> {
        self.rt.block_on(self.inner.run_command(request))
    }

    pub fn read_file(&self, path: &str) -> Result<FileContent> {
        self.rt.block_on(self.inner.read_file(path))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<WriteAck> {
        self.rt.block_on(self.inner.write_file(path, content))
    }

    pub fn write(&self, path: &str, data: impl Into<Bytes>, options: &WriteOptions) -> Result<WriteResult> {
        self.rt.block_on(self.inner.write(path, data, options))
    }

    pub fn write_files(&self, entries: Vec<WriteEntry>, user: Option<&str>) -> Result<WriteFilesResult> {
        self.rt.block_on(self.inner.write_files(entries, user))
    }

    pub fn list_files(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.rt.block_on(self.inner.list_files(path))
    }

    pub fn delete_file(&self, path: &str) -> Result<PathAck> {
        self.rt.block_on(self.inner.delete_file(path))
    }

    pub fn make_directory(&self, path: &str) -> Result<PathAck> {
        self.rt.block_on(self.inner.make_directory(path))
    }

    pub fn upload_file(&self, local_path: &Path, remote_path: Option<&str>) -> Result<WriteAck> {
        self.rt.block_on(self.inner.upload_file(local_path, remote_path))
    }

    pub fn download_file(&self, path: &str) -> Result<Bytes> {
        self.rt.block_on(self.inner.download_file(path))
    }
}

/// Owns a blocking session's sandbox and kills it exactly once.
pub struct SessionGuard {
    session: Session,
    async_guard: Option<crate::SessionGuard>,
}

impl SessionGuard {
    /// The guarded session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Kill the sandbox now.
    pub fn release(mut self) -> Result<Removal> {
        match self.async_guard.take() {
            Some(guard) => self.session.rt.block_on(guard.release()),
            None => Ok(Removal::AlreadyGone),
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
        let Some(guard) = self.async_guard.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking here would panic; hand the kill to our own runtime.
            let _enter = self.session.rt.enter();
            drop(guard);
            return;
        }
        if let Err(e) = self.session.rt.block_on(guard.release()) {
            tracing::warn!(sandbox_id = %self.session.id(), error = %e, "Kill on drop failed");
        }
    }
}
