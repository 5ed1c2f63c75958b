//! Sandbox handle types - identity, lifecycle state and cached attributes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier for a sandbox, assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Current lifecycle state of a sandbox.
///
/// `Creating -> Running -> {Stopped | Error}`. `Running` self-transitions
/// when its timeout is changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum SandboxState {
    /// Provisioning on the backend.
    Creating,
    /// Accepts execution calls.
    Running,
    /// Killed or expired.
    Stopped,
    /// Backend reported a failure.
    Error,
}

impl SandboxState {
    /// Whether the sandbox can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl From<&str> for SandboxState {
    fn from(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "creating" | "pending" | "starting" | "provisioning" => Self::Creating,
            "running" => Self::Running,
            "stopped" | "terminated" | "killed" | "expired" | "timeout" => Self::Stopped,
            _ => Self::Error,
        }
    }
}

impl From<String> for SandboxState {
    fn from(status: String) -> Self {
        Self::from(status.as_str())
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Last-known snapshot of a remote sandbox.
///
/// Values are as reported by the backend at the time of the call that
/// produced this snapshot; they are not refreshed automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Backend-assigned identifier.
    #[serde(rename = "sandbox_id", alias = "id")]
    pub id: SandboxId,
    /// Lifecycle state.
    #[serde(rename = "status")]
    pub state: SandboxState,
    /// Template name the sandbox was provisioned from.
    #[serde(default)]
    pub template: Option<String>,
    /// Template identifier.
    #[serde(default)]
    pub template_id: Option<String>,
    /// Cloud provider.
    #[serde(default)]
    pub provider: Option<String>,
    /// Cloud region.
    #[serde(default)]
    pub region: Option<String>,
    /// Declared vCPU limit.
    #[serde(default)]
    pub cpu_count: Option<u32>,
    /// Declared memory limit in MB.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Declared disk limit in MB.
    #[serde(default)]
    pub disk_mb: Option<u64>,
    /// Creation timestamp.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    /// Absolute expiry.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Teardown timestamp, once stopped.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Configured timeout in seconds, when known locally.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u32>,
    /// Key-value tags.
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    /// Address of the sandbox, when exposed.
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl Sandbox {
    /// Whether the cached expiry lies in the past at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| at <= now)
    }
}

/// One page of sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxList {
    /// Sandboxes on this page.
    pub sandboxes: Vec<Sandbox>,
    /// Total number of sandboxes known to the backend.
    #[serde(default)]
    pub total: u64,
}

/// Point-in-time resource usage of a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetrics {
    /// Sandbox the sample belongs to (filled in locally).
    #[serde(default = "unknown_sandbox")]
    pub sandbox_id: SandboxId,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// CPU usage percentage.
    #[serde(default)]
    pub cpu_usage: f64,
    /// Memory in use.
    #[serde(default)]
    pub memory_usage: f64,
    /// Total memory available.
    #[serde(default)]
    pub memory_total: f64,
    /// Disk bytes read.
    #[serde(default)]
    pub disk_read: u64,
    /// Disk bytes written.
    #[serde(default)]
    pub disk_write: u64,
    /// Network bytes received.
    #[serde(default)]
    pub network_rx: u64,
    /// Network bytes sent.
    #[serde(default)]
    pub network_tx: u64,
}

fn unknown_sandbox() -> SandboxId {
    SandboxId::from("")
}

/// Result of an idempotent teardown (sandbox kill or context delete).
///
/// Both variants mean the resource no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Removal {
    /// This call tore the resource down.
    Removed,
    /// Already gone, or the backend never knew it.
    AlreadyGone,
}

/// Decode an optional timestamp in any format the backend emits.
///
/// RFC 3339 is preferred. Naive ISO 8601 times are taken as UTC, and
/// integers as Unix seconds. Anything else decodes as `None`.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(text)) => parse_timestamp(&text),
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    })
}

pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_state_display() {
        assert_eq!(format!("{}", SandboxState::Creating), "Creating");
        assert_eq!(format!("{}", SandboxState::Running), "Running");
        assert_eq!(format!("{}", SandboxState::Stopped), "Stopped");
        assert_eq!(format!("{}", SandboxState::Error), "Error");
    }

    #[test]
    fn test_sandbox_state_from_status() {
        assert_eq!(SandboxState::from("RUNNING"), SandboxState::Running);
        assert_eq!(SandboxState::from("pending"), SandboxState::Creating);
        assert_eq!(SandboxState::from("terminated"), SandboxState::Stopped);
        assert_eq!(SandboxState::from("timeout"), SandboxState::Stopped);
        assert_eq!(SandboxState::from("failed"), SandboxState::Error);
        assert_eq!(SandboxState::from("something-new"), SandboxState::Error);
        assert!(SandboxState::Stopped.is_terminal());
        assert!(!SandboxState::Running.is_terminal());
    }

    #[test]
    fn test_sandbox_decodes_sparse_payload() {
        let sandbox: Sandbox = serde_json::from_value(serde_json::json!({
            "sandbox_id": "sbx-1",
            "status": "running",
            "metadata": null,
            "timeout_at": "2030-01-01T00:00:00Z",
            "unknown_field": 7
        }))
        .expect("sparse payload should decode");

        assert_eq!(sandbox.id.as_str(), "sbx-1");
        assert_eq!(sandbox.state, SandboxState::Running);
        assert!(sandbox.metadata.is_empty());
        assert!(sandbox.template.is_none());
        assert!(!sandbox.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_timestamps_decode_leniently() {
        let sandbox: Sandbox = serde_json::from_value(serde_json::json!({
            "sandbox_id": "sbx-2",
            "status": "running",
            "started_at": "2025-01-01T00:00:00.123456",
            "timeout_at": "2025-01-01 00:10:00",
            "ended_at": "not a time",
        }))
        .expect("naive timestamps should decode");

        assert_eq!(
            sandbox.started_at.map(|at| at.to_rfc3339()),
            Some("2025-01-01T00:00:00.123456+00:00".to_string())
        );
        assert_eq!(
            sandbox.timeout_at.map(|at| at.to_rfc3339()),
            Some("2025-01-01T00:10:00+00:00".to_string())
        );
        assert!(sandbox.ended_at.is_none());

        assert_eq!(
            parse_timestamp("2025-01-01T02:00:00+02:00").map(|at| at.to_rfc3339()),
            Some("2025-01-01T00:00:00+00:00".to_string())
        );
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_sandbox_id_display() {
        let id = SandboxId::from("abc");
        assert_eq!(format!("{}", id), "abc");
        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&SandboxState::Running).expect("serialize");
        assert_eq!(json, "\"running\"");
    }
}
