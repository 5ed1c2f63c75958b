//! # skerry-core
//!
//! Client-side orchestrator for remote code-execution sandboxes.
//!
//! This crate creates ephemeral sandboxes on a remote backend, runs code,
//! shell commands and file operations inside them, keeps interpreter state
//! in per-sandbox code contexts, and guarantees that sandboxes acquired
//! through a session are torn down exactly once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    skerry-core (client)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ Session facade  │────▶│  SandboxManager          │   │
//! │  │ - with_session  │     │  - create() / kill()     │   │
//! │  │ - SessionGuard  │     │  - get() / set_timeout() │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │                         │                    │
//! │           ▼                         ▼                    │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   Dispatcher    │────▶│  Registry                │   │
//! │  │ - run_code()    │     │  per-sandbox Mutex,      │   │
//! │  │ - run_command() │     │  contexts, tombstones    │   │
//! │  │ - files         │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   ApiClient     │────▶│  dyn Transport           │   │
//! │  │ - status map    │     │  (HttpTransport/reqwest) │   │
//! │  │ - retries       │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │ HTTPS + bearer token
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 sandbox backend (remote)                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use skerry_core::{Client, ClientConfig, CodeRequest, SandboxConfig};
//!
//! # async fn example() -> skerry_core::Result<()> {
//! let client = Client::new(ClientConfig::from_env()?)?;
//!
//! let config = SandboxConfig::builder()
//!     .template("python-base-v1")
//!     .timeout_secs(600)
//!     .build()?;
//!
//! client
//!     .with_session(&config, |session| async move {
//!         let ctx = session.create_context("python", None).await?;
//!         session
//!             .run_code(&CodeRequest::new("x = 42").context(ctx.id.clone()))
//!             .await?;
//!         let result = session
//!             .run_code(&CodeRequest::new("print(x)").context(ctx.id))
//!             .await?;
//!         println!("Output: {}", result.stdout_text());
//!
//!         session.write_file("notes.txt", "hello").await?;
//!         Ok::<_, skerry_core::CoreError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Sandbox Lifecycle**: Create, inspect, extend and kill remote sandboxes
//! - **Code Contexts**: Interpreter state that persists across calls
//! - **Commands and Files**: Shell commands, text and multipart file I/O
//! - **Scoped Sessions**: Kill-on-exit for success, error and cancellation
//! - **Automatic Retry**: Backoff for idempotent calls on transient failures
//! - **Blocking Surface**: The same contracts from synchronous code

mod api;
pub mod blocking;
mod client;
mod config;
mod context;
mod dispatcher;
mod error;
mod execution;
mod files;
mod manager;
mod registry;
mod sandbox;
mod session;
mod templates;
mod transport;

pub use client::Client;
pub use config::{
    validate_timeout_secs, ClientConfig, ClientConfigBuilder, SandboxConfig, SandboxConfigBuilder,
    DEFAULT_BASE_URL, DEFAULT_TEMPLATE, MAX_SANDBOX_TIMEOUT_SECS, MIN_SANDBOX_TIMEOUT_SECS,
};
pub use context::{CodeContext, ContextId, ContextManager, DEFAULT_CWD};
pub use dispatcher::{CodeRequest, CommandRequest, Dispatcher};
pub use error::{CoreError, Result};
pub use execution::{
    CodeExecutionResult, CodeOutcome, CommandExecutionResult, DisplayData, ExecutionError,
    ExecutionResult,
};
pub use files::{
    normalize_path, FileContent, FileInfo, FileOpResult, PathAck, WriteAck, WriteEntry,
    WriteFilesResult, WriteOptions, WriteResult,
};
pub use manager::{HostUrl, SandboxManager, TimeoutUpdate, DEFAULT_LIST_LIMIT};
pub use registry::{Registry, Tombstone, DEFAULT_TOMBSTONE_RETENTION_SECS};
pub use sandbox::{Removal, Sandbox, SandboxId, SandboxList, SandboxMetrics, SandboxState};
pub use session::{Session, SessionGuard};
pub use templates::{Template, TemplateCatalog, TemplateList};
pub use transport::{ApiRequest, ApiResponse, Body, FilePart, HttpTransport, Method, Transport};
