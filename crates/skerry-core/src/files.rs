//! Filesystem operations inside a sandbox.

use crate::api::{decode, Idempotency, Scope};
use crate::context::DEFAULT_CWD;
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, Result};
use crate::registry::Tombstone;
use crate::sandbox::SandboxId;
use crate::transport::{ApiRequest, FilePart};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Content of a text file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    #[serde(default)]
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Acknowledgement of a write or upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAck {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, alias = "size")]
    pub bytes_written: Option<u64>,
}

/// Acknowledgement of a delete or mkdir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathAck {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// One directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, alias = "mod_time")]
    pub modified_at: Option<String>,
    /// Permission bits as reported, e.g. `-rw-r--r--`.
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileListing {
    #[serde(default)]
    files: Vec<FileInfo>,
}

/// Per-file outcome of a multipart write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_kind", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Set when this file failed.
    #[serde(default)]
    pub error: Option<String>,
}

fn default_kind() -> String {
    "file".to_string()
}

/// Outcome of a batch write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteFilesResult {
    pub files: Vec<WriteResult>,
    /// The backend answered 207: at least one file failed.
    pub partial_failure: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireWriteResults {
    List(Vec<WriteResult>),
    Wrapped { files: Vec<WriteResult> },
    Other(serde_json::Value),
}

impl WireWriteResults {
    fn into_vec(self) -> Vec<WriteResult> {
        match self {
            Self::List(files) | Self::Wrapped { files } => files,
            Self::Other(_) => Vec::new(),
        }
    }
}

/// One file of a batch write.
#[derive(Debug, Clone)]
pub struct WriteEntry {
    /// Destination; relative paths are rooted at `/home/user`.
    pub path: String,
    pub data: Bytes,
}

impl WriteEntry {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

/// Options for a single multipart write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Owner of the new file.
    pub user: Option<String>,
    /// Permission bits, e.g. `0o755`.
    pub mode: Option<u32>,
}

/// Outcome of any file operation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOpResult {
    Read(FileContent),
    Write(WriteAck),
    WriteMultipart(WriteFilesResult),
    List { files: Vec<FileInfo> },
    Delete(PathAck),
    Mkdir(PathAck),
    Upload(WriteAck),
    Download {
        path: String,
        size: usize,
        #[serde(skip)]
        data: Bytes,
    },
}

/// Check and normalize a sandbox path.
///
/// Relative paths are rooted at `/home/user`. Fails with `InvalidPath` on
/// an empty path, a NUL byte, or a `..` that climbs above `/`.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.trim().is_empty() {
        return Err(CoreError::InvalidPath("path is empty".into()));
    }
    if path.contains('\0') {
        return Err(CoreError::InvalidPath(format!("{path:?} contains a NUL byte")));
    }

    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{DEFAULT_CWD}/{path}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(CoreError::InvalidPath(format!("{path} escapes the sandbox root")));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

fn octal_mode(mode: u32) -> String {
    format!("0o{mode:o}")
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

impl Dispatcher {
    /// Read a text file.
    pub async fn read_file(&self, sandbox_id: &SandboxId, path: &str) -> Result<FileContent> {
        let path = normalize_path(path)?;
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files/read"))
            .json(serde_json::json!({ "path": path }));
        let mut content: FileContent = self
            .file_call(sandbox_id, request, &path, Idempotency::Idempotent)
            .await?;
        if content.path.is_empty() {
            content.path = path;
        }
        Ok(content)
    }

    /// Write a text file, replacing any existing content.
    pub async fn write_file(&self, sandbox_id: &SandboxId, path: &str, content: &str) -> Result<WriteAck> {
        let path = normalize_path(path)?;
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files/write"))
            .json(serde_json::json!({ "path": path, "content": content }));
        let ack = self
            .file_call(sandbox_id, request, &path, Idempotency::NonIdempotent)
            .await?;
        tracing::debug!(sandbox_id = %sandbox_id, path = %path, bytes = content.len(), "File written");
        Ok(ack)
    }

    /// Write raw bytes through a multipart upload.
    pub async fn write(
        &self,
        sandbox_id: &SandboxId,
        path: &str,
        data: impl Into<Bytes>,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        let path = normalize_path(path)?;
        let data: Bytes = data.into();
        let size = data.len() as u64;
        let name = file_name(&path);

        let mut request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files")).query("path", &path);
        if let Some(user) = &options.user {
            request = request.query("username", user);
        }
        if let Some(mode) = options.mode {
            request = request.query("mode", octal_mode(mode));
        }
        let request = request.multipart(
            vec![FilePart {
                file_name: name.clone(),
                data,
            }],
            Vec::new(),
        );

        let response = self
            .file_call_raw(sandbox_id, request, &path, Idempotency::NonIdempotent)
            .await?;
        let wire: WireWriteResults = decode(&response)?;
        let mut result = wire.into_vec().into_iter().next().unwrap_or(WriteResult {
            path: path.clone(),
            name,
            kind: default_kind(),
            size: None,
            error: None,
        });
        result.size = Some(size);
        Ok(result)
    }

    /// Write several files in one multipart upload.
    ///
    /// Per-file failures do not fail the call; they are reported in each
    /// entry's `error` and in `partial_failure`.
    pub async fn write_files(
        &self,
        sandbox_id: &SandboxId,
        entries: Vec<WriteEntry>,
        user: Option<&str>,
    ) -> Result<WriteFilesResult> {
        if entries.is_empty() {
            return Ok(WriteFilesResult {
                files: Vec::new(),
                partial_failure: false,
            });
        }

        let mut parts = Vec::with_capacity(entries.len());
        for entry in entries {
            // The full path travels as the part's file name.
            parts.push(FilePart {
                file_name: normalize_path(&entry.path)?,
                data: entry.data,
            });
        }

        let mut request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files"));
        if let Some(user) = user {
            request = request.query("username", user);
        }
        let count = parts.len();
        let request = request.multipart(parts, Vec::new());

        let response = self
            .file_call_raw(sandbox_id, request, "/", Idempotency::NonIdempotent)
            .await?;
        let partial_failure = response.status == 207;
        let wire: WireWriteResults = decode(&response)?;
        let files = wire.into_vec();

        if partial_failure {
            tracing::warn!(
                sandbox_id = %sandbox_id,
                files = count,
                failed = files.iter().filter(|f| f.error.is_some()).count(),
                "Batch write partially failed"
            );
        }
        Ok(WriteFilesResult {
            files,
            partial_failure,
        })
    }

    /// List a directory.
    pub async fn list_files(&self, sandbox_id: &SandboxId, path: &str) -> Result<Vec<FileInfo>> {
        let path = normalize_path(path)?;
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files/list"))
            .json(serde_json::json!({ "path": path }));
        let listing: FileListing = self
            .file_call(sandbox_id, request, &path, Idempotency::Idempotent)
            .await?;
        Ok(listing.files)
    }

    /// Delete a file or directory.
    pub async fn delete_file(&self, sandbox_id: &SandboxId, path: &str) -> Result<PathAck> {
        let path = normalize_path(path)?;
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files/delete"))
            .json(serde_json::json!({ "path": path }));
        self.file_call(sandbox_id, request, &path, Idempotency::NonIdempotent)
            .await
    }

    /// Create a directory.
    pub async fn make_directory(&self, sandbox_id: &SandboxId, path: &str) -> Result<PathAck> {
        let path = normalize_path(path)?;
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/files/mkdir"))
            .json(serde_json::json!({ "path": path }));
        self.file_call(sandbox_id, request, &path, Idempotency::NonIdempotent)
            .await
    }

    /// Upload a local file.
    ///
    /// Without `remote_path` the backend picks the destination from the
    /// file name.
    pub async fn upload_file(
        &self,
        sandbox_id: &SandboxId,
        local_path: &Path,
        remote_path: Option<&str>,
    ) -> Result<WriteAck> {
        let remote = remote_path.map(normalize_path).transpose()?;
        let data = tokio::fs::read(local_path).await?;
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let fields = remote
            .iter()
            .map(|path| ("path".to_string(), path.clone()))
            .collect();
        let size = data.len();
        let request = ApiRequest::post(format!("sandboxes/{sandbox_id}/upload")).multipart(
            vec![FilePart {
                file_name: name,
                data: Bytes::from(data),
            }],
            fields,
        );

        let scope_path = remote.as_deref().unwrap_or(DEFAULT_CWD);
        let ack: WriteAck = self
            .file_call(sandbox_id, request, scope_path, Idempotency::NonIdempotent)
            .await?;
        tracing::debug!(
            sandbox_id = %sandbox_id,
            local = %local_path.display(),
            bytes = size,
            "File uploaded"
        );
        Ok(ack)
    }

    /// Download a file as raw bytes.
    pub async fn download_file(&self, sandbox_id: &SandboxId, path: &str) -> Result<Bytes> {
        let path = normalize_path(path)?;
        let request = ApiRequest::get(format!("sandboxes/{sandbox_id}/download")).query("path", &path);
        let response = self
            .file_call_raw(sandbox_id, request, &path, Idempotency::Idempotent)
            .await?;
        Ok(response.body)
    }

    async fn file_call<R: serde::de::DeserializeOwned>(
        &self,
        sandbox_id: &SandboxId,
        request: ApiRequest,
        path: &str,
        idempotency: Idempotency,
    ) -> Result<R> {
        let response = self.file_call_raw(sandbox_id, request, path, idempotency).await?;
        decode(&response)
    }

    async fn file_call_raw(
        &self,
        sandbox_id: &SandboxId,
        request: ApiRequest,
        path: &str,
        idempotency: Idempotency,
    ) -> Result<crate::transport::ApiResponse> {
        self.registry().check_usable(sandbox_id).await?;
        let result = self
            .api()
            .call_raw(request, Scope::Path(sandbox_id, path), idempotency)
            .await;
        if let Err(CoreError::SandboxNotFound(_)) = &result {
            self.registry().bury(sandbox_id, Tombstone::Gone).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_path("notes.txt").unwrap(), "/home/user/notes.txt");
        assert_eq!(normalize_path("a/./b/../c").unwrap(), "/home/user/a/c");
        assert_eq!(normalize_path("../../tmp/x").unwrap(), "/tmp/x");
    }

    #[test]
    fn test_normalize_absolute_path() {
        assert_eq!(normalize_path("/tmp//x/").unwrap(), "/tmp/x");
        assert_eq!(normalize_path("/").unwrap(), "/");
    }

    #[test]
    fn test_invalid_paths() {
        assert!(matches!(normalize_path(""), Err(CoreError::InvalidPath(_))));
        assert!(matches!(normalize_path("   "), Err(CoreError::InvalidPath(_))));
        assert!(matches!(normalize_path("a\0b"), Err(CoreError::InvalidPath(_))));
        assert!(matches!(normalize_path("/.."), Err(CoreError::InvalidPath(_))));
        assert!(matches!(
            normalize_path("../../../etc/passwd"),
            Err(CoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_octal_mode() {
        assert_eq!(octal_mode(0o755), "0o755");
        assert_eq!(octal_mode(0o644), "0o644");
    }

    #[test]
    fn test_write_results_accept_both_shapes() {
        let list: WireWriteResults =
            serde_json::from_value(serde_json::json!([{"path": "/a", "name": "a"}])).unwrap();
        assert_eq!(list.into_vec().len(), 1);

        let wrapped: WireWriteResults = serde_json::from_value(serde_json::json!({
            "files": [{"path": "/a", "name": "a", "type": "file"}, {"path": "/b", "name": "b", "error": "denied"}]
        }))
        .unwrap();
        let files = wrapped.into_vec();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].error.as_deref(), Some("denied"));
        assert_eq!(files[0].kind, "file");
    }

    #[test]
    fn test_file_info_accepts_mod_time() {
        let info: FileInfo = serde_json::from_value(serde_json::json!({
            "name": "x", "path": "/x", "size": 3, "is_dir": false, "mod_time": "2030-01-01"
        }))
        .unwrap();
        assert_eq!(info.modified_at.as_deref(), Some("2030-01-01"));
    }
}
