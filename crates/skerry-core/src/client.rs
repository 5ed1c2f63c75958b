//! Public async client - the entry point that wires every component to one
//! transport and one registry.

use crate::api::{ApiClient, RetryPolicy};
use crate::config::ClientConfig;
use crate::context::ContextManager;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::manager::SandboxManager;
use crate::registry::Registry;
use crate::templates::TemplateCatalog;
use crate::transport::{HttpTransport, Transport};
use std::sync::Arc;

/// Async client for the sandbox API.
///
/// Cheap to clone; clones share the transport and the handle registry.
///
/// # Example
///
/// ```ignore
/// let client = Client::new(ClientConfig::from_env()?)?;
/// let sandbox = client.sandboxes().create(&SandboxConfig::default()).await?;
/// let result = client
///     .dispatcher()
///     .run_code(&sandbox.id, &CodeRequest::new("print(1 + 1)"))
///     .await?;
/// client.sandboxes().kill(&sandbox.id).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    registry: Arc<Registry>,
    sandboxes: SandboxManager,
    contexts: ContextManager,
    dispatcher: Dispatcher,
    templates: TemplateCatalog,
}

impl Client {
    /// Create a client that talks HTTP to `config.base_url`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let api = ApiClient::new(
            transport,
            RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base_delay,
            },
        );
        let registry = Arc::new(Registry::new());
        let sandboxes = SandboxManager::new(
            api.clone(),
            Arc::clone(&registry),
            config.provider.clone(),
            config.region.clone(),
        );
        let contexts = ContextManager::new(api.clone(), Arc::clone(&registry));
        let dispatcher = Dispatcher::new(
            api.clone(),
            Arc::clone(&registry),
            contexts.clone(),
            config.execution_grace,
        );
        let templates = TemplateCatalog::new(api);

        tracing::debug!(
            base_url = %config.base_url,
            max_retries = config.max_retries,
            "Client initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            sandboxes,
            contexts,
            dispatcher,
            templates,
        })
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sandbox lifecycle operations.
    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    /// Code context operations.
    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Code, command and file operations.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Template catalog.
    pub fn templates(&self) -> &TemplateCatalog {
        &self.templates
    }

    /// Locally known sandbox handles.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
