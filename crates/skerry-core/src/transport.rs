//! Transport seam between the orchestrator and the remote backend.
//!
//! The core never talks HTTP directly. It builds [`ApiRequest`] values and
//! hands them to a [`Transport`], which owns authentication and the wire.
//! [`HttpTransport`] is the production implementation; tests substitute an
//! in-memory backend.

use crate::config::ClientConfig;
use crate::error::CoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read
    Get,
    /// Create or act
    Post,
    /// Remove
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One part of a multipart upload.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// File name sent with the part; the backend uses it as destination.
    pub file_name: String,
    /// Raw content.
    pub data: Bytes,
}

/// Request payload.
#[derive(Debug, Clone)]
pub enum Body {
    /// JSON document.
    Json(serde_json::Value),
    /// Multipart form with `file` parts and extra text fields.
    Multipart {
        /// Files, each sent under the `file` field.
        files: Vec<FilePart>,
        /// Additional text fields.
        fields: Vec<(String, String)>,
    },
}

/// A backend-agnostic request against a resource path.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Request method.
    pub method: Method,
    /// Path relative to the base URL, e.g. `sandboxes/abc/code/run`.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Optional payload.
    pub body: Option<Body>,
    /// Overrides the transport's default request timeout.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    /// Create a request without a body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Shorthand for a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Shorthand for a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Shorthand for a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    /// Attach a multipart body.
    pub fn multipart(mut self, files: Vec<FilePart>, fields: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Multipart { files, fields });
        self
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Override the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Raw response from the backend.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

impl ApiResponse {
    /// Build a JSON response (used by in-memory transports).
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: Bytes::from(value.to_string()),
        }
    }

    /// Whether the status is one of the accepted success codes.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201 | 204 | 207)
    }

    /// Body as lossy UTF-8, for error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issues authenticated request/response calls to the backend.
///
/// Implementations return `Ok` for every response that arrived, whatever
/// its status; status interpretation belongs to the caller. `Err` is
/// reserved for failures where no response was received.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one request.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, CoreError>;
}

/// HTTP transport built on reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport from client configuration.
    pub fn new(config: &ClientConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| CoreError::Connection(format!("http client: {e}")))?;

        tracing::info!(base_url = %config.base_url, "HTTP transport initialized");

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, CoreError> {
        let url = self.url(&request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .query(&request.query);

        let deadline = request.timeout.unwrap_or(self.request_timeout);
        builder = builder.timeout(deadline);

        builder = match request.body {
            Some(Body::Json(value)) => builder.json(&value),
            Some(Body::Multipart { files, fields }) => {
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                for part in files {
                    let part = reqwest::multipart::Part::bytes(part.data.to_vec())
                        .file_name(part.file_name)
                        .mime_str("application/octet-stream")
                        .map_err(|e| CoreError::Connection(format!("multipart: {e}")))?;
                    form = form.part("file", part);
                }
                builder.multipart(form)
            }
            None => builder,
        };

        tracing::trace!(method = %request.method, url = %url, "Sending HTTP request");
        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, deadline))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, deadline))?;
        tracing::trace!(status, body_len = body.len(), "HTTP response received");

        Ok(ApiResponse { status, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error, deadline: Duration) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout(deadline)
    } else if e.is_connect() || e.is_request() || e.is_body() {
        CoreError::TransientTransport(e.to_string())
    } else {
        CoreError::Connection(e.to_string())
    }
}
