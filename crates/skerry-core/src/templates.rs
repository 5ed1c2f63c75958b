//! Template catalog.

use crate::api::{ApiClient, Idempotency, Scope};
use crate::error::Result;
use crate::transport::ApiRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sandbox image that new sandboxes can be created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vcpu_count: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_size_mb: u64,
    /// `public` or `private`.
    #[serde(default)]
    pub visibility: String,
    #[serde(default, deserialize_with = "crate::sandbox::lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "crate::sandbox::lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One page of templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateList {
    pub templates: Vec<Template>,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// Read-only access to the template catalog.
#[derive(Clone)]
pub struct TemplateCatalog {
    api: ApiClient,
}

impl TemplateCatalog {
    pub(crate) fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// List templates (defaults: `limit=100`, `offset=0`).
    pub async fn list(&self, limit: Option<u32>, offset: Option<u32>) -> Result<TemplateList> {
        let request = ApiRequest::get("templates")
            .query("limit", limit.unwrap_or(crate::manager::DEFAULT_LIST_LIMIT))
            .query("offset", offset.unwrap_or(0));
        let list: TemplateList = self
            .api
            .call(request, Scope::Collection, Idempotency::Idempotent)
            .await?;
        tracing::debug!(count = list.templates.len(), "Listed templates");
        Ok(list)
    }
}
