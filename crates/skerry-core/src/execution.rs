//! Execution results - the closed model every code, command and file
//! operation is decoded into.
//!
//! The backend's payloads are loose: results may be an object or a list,
//! errors may be structured or a bare string, logs may be line lists or a
//! single blob. All of that is normalized here, at the boundary.

use crate::files::FileOpResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of any dispatched operation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Interpreter run.
    Code(CodeExecutionResult),
    /// Shell command.
    Command(CommandExecutionResult),
    /// Filesystem operation.
    File(FileOpResult),
}

impl From<CodeExecutionResult> for ExecutionResult {
    fn from(result: CodeExecutionResult) -> Self {
        Self::Code(result)
    }
}

impl From<CommandExecutionResult> for ExecutionResult {
    fn from(result: CommandExecutionResult) -> Self {
        Self::Command(result)
    }
}

impl From<FileOpResult> for ExecutionResult {
    fn from(result: FileOpResult) -> Self {
        Self::File(result)
    }
}

/// One rich display value produced by an interpreter run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayData {
    /// Plain-text rendering, when present.
    pub text: Option<String>,
    /// Payloads keyed by MIME type.
    pub data: BTreeMap<String, serde_json::Value>,
}

impl DisplayData {
    fn from_wire(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) => Some(Self {
                text: Some(text),
                data: BTreeMap::new(),
            }),
            serde_json::Value::Object(map) if map.is_empty() => None,
            serde_json::Value::Object(map) => {
                let text = ["text/plain", "text"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
                    .map(str::to_string);
                Some(Self {
                    text,
                    data: map.into_iter().collect(),
                })
            }
            other => Some(Self {
                text: Some(other.to_string()),
                data: BTreeMap::new(),
            }),
        }
    }
}

/// Error raised by the submitted code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionError {
    /// Exception class, e.g. `NameError`.
    pub name: String,
    /// Exception message.
    pub value: String,
    /// Formatted traceback.
    pub traceback: String,
}

/// Exactly one of completion or failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CodeOutcome {
    Completed { results: Vec<DisplayData> },
    Failed(ExecutionError),
}

/// Result of running code in an interpreter.
///
/// Output written before a failure is kept in `stdout`/`stderr`.
#[derive(Debug, Clone, Serialize)]
pub struct CodeExecutionResult {
    pub execution_id: Option<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub outcome: CodeOutcome,
}

impl CodeExecutionResult {
    /// The error raised by the code, if it failed.
    pub fn error(&self) -> Option<&ExecutionError> {
        match &self.outcome {
            CodeOutcome::Failed(error) => Some(error),
            CodeOutcome::Completed { .. } => None,
        }
    }

    /// Whether the code raised an error.
    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// Display results; empty when the code failed.
    pub fn results(&self) -> &[DisplayData] {
        match &self.outcome {
            CodeOutcome::Completed { results } => results,
            CodeOutcome::Failed(_) => &[],
        }
    }

    /// Standard output joined into one string.
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Standard error joined into one string.
    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Result of running a shell command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// `exit_code == 0`.
    pub success: bool,
    pub duration_ms: u64,
}

impl CommandExecutionResult {
    /// Wall time reported by the backend.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Log lines as a list or a single newline-separated blob.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireLines {
    Lines(Vec<String>),
    Blob(String),
}

impl WireLines {
    fn into_lines(self) -> Vec<String> {
        match self {
            Self::Lines(lines) => lines,
            Self::Blob(blob) if blob.is_empty() => Vec::new(),
            Self::Blob(blob) => blob.lines().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireLogs {
    #[serde(default)]
    stdout: Option<WireLines>,
    #[serde(default)]
    stderr: Option<WireLines>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireError {
    Structured {
        #[serde(default, alias = "ename")]
        name: String,
        #[serde(default, alias = "evalue")]
        value: String,
        #[serde(default)]
        traceback: serde_json::Value,
    },
    Message(String),
}

impl From<WireError> for ExecutionError {
    fn from(wire: WireError) -> Self {
        match wire {
            WireError::Structured {
                name,
                value,
                traceback,
            } => {
                let traceback = match traceback {
                    serde_json::Value::Null => String::new(),
                    serde_json::Value::String(text) => text,
                    serde_json::Value::Array(lines) => lines
                        .iter()
                        .map(|line| line.as_str().map_or_else(|| line.to_string(), str::to_string))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    other => other.to_string(),
                };
                Self {
                    name: if name.is_empty() { "Error".to_string() } else { name },
                    value,
                    traceback,
                }
            }
            WireError::Message(message) => Self {
                name: "Error".to_string(),
                value: message,
                traceback: String::new(),
            },
        }
    }
}

/// `code/run` response as sent by the backend.
#[derive(Debug, Deserialize)]
pub(crate) struct WireCodeRun {
    #[serde(default)]
    execution_id: Option<String>,
    #[serde(default)]
    results: serde_json::Value,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    logs: Option<WireLogs>,
}

impl From<WireCodeRun> for CodeExecutionResult {
    fn from(wire: WireCodeRun) -> Self {
        let logs = wire.logs.unwrap_or_default();
        let outcome = match wire.error {
            Some(error) => CodeOutcome::Failed(error.into()),
            None => {
                let results = match wire.results {
                    serde_json::Value::Array(items) => {
                        items.into_iter().filter_map(DisplayData::from_wire).collect()
                    }
                    other => DisplayData::from_wire(other).into_iter().collect(),
                };
                CodeOutcome::Completed { results }
            }
        };
        Self {
            execution_id: wire.execution_id,
            stdout: logs.stdout.map(WireLines::into_lines).unwrap_or_default(),
            stderr: logs.stderr.map(WireLines::into_lines).unwrap_or_default(),
            outcome,
        }
    }
}

/// `commands/run` response as sent by the backend.
#[derive(Debug, Deserialize)]
pub(crate) struct WireCommandRun {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}
