//! In-memory sandbox backend used by the integration tests.
//!
//! Implements [`Transport`] directly: no sockets, deterministic IDs, call
//! counting, injectable faults and a tiny interpreter that is just capable
//! enough to exercise context isolation and error reporting.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use skerry_core::{
    ApiRequest, ApiResponse, Body, Client, ClientConfig, CoreError, Method, SandboxConfig, SandboxId, Transport,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded request.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

struct Fault {
    method: Method,
    path: String,
    status: u16,
    remaining: usize,
}

#[derive(Default)]
struct RemoteSandbox {
    record: Value,
    contexts: HashMap<String, HashMap<String, String>>,
    files: BTreeMap<String, Bytes>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    sandboxes: BTreeMap<String, RemoteSandbox>,
}

/// Fake backend; clone the `Arc` to inspect it after handing it to a client.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next `times` matching requests with `status`.
    pub fn fail_next(&self, method: Method, path: &str, status: u16, times: usize) {
        self.state.lock().unwrap().faults.push(Fault {
            method,
            path: path.to_string(),
            status,
            remaining: times,
        });
    }

    /// Change a sandbox's status behind the client's back.
    pub fn set_status(&self, id: &SandboxId, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(sandbox) = state.sandboxes.get_mut(id.as_str()) {
            sandbox.record["status"] = json!(status);
        }
    }

    /// Forget a sandbox as if it expired remotely.
    pub fn evict(&self, id: &SandboxId) {
        self.state.lock().unwrap().sandboxes.remove(id.as_str());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Number of requests with exactly this method and path.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    pub fn kill_calls(&self, id: &SandboxId) -> usize {
        self.count(Method::Delete, &format!("sandboxes/{id}"))
    }

    pub fn live_sandboxes(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .values()
            .filter(|s| s.record["status"] == "running")
            .count()
    }

    pub fn file(&self, id: &SandboxId, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .get(id.as_str())
            .and_then(|s| s.files.get(path).cloned())
    }
}

fn respond(status: u16, body: Value) -> ApiResponse {
    ApiResponse::json(status, &body)
}

fn not_found(what: &str) -> ApiResponse {
    respond(404, json!({ "error": format!("{what} not found") }))
}

fn json_body(request: &ApiRequest) -> Value {
    match &request.body {
        Some(Body::Json(value)) => value.clone(),
        _ => Value::Null,
    }
}

fn query<'a>(request: &'a ApiRequest, key: &str) -> Option<&'a str> {
    request
        .query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
impl Transport for FakeBackend {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, CoreError> {
        let (response, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call {
                method: request.method,
                path: request.path.clone(),
                query: request.query.clone(),
                body: match &request.body {
                    Some(Body::Json(v)) => Some(v.clone()),
                    _ => None,
                },
            });

            let fault = state
                .faults
                .iter_mut()
                .find(|f| f.remaining > 0 && f.method == request.method && f.path == request.path);
            if let Some(fault) = fault {
                fault.remaining -= 1;
                let status = fault.status;
                return Ok(respond(status, json!({ "error": "injected fault" })));
            }

            handle(&mut state, &request)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }
}

fn handle(state: &mut State, request: &ApiRequest) -> (ApiResponse, Duration) {
    let segments: Vec<&str> = request.path.split('/').collect();
    let instant = |response| (response, Duration::ZERO);

    match (request.method, segments.as_slice()) {
        (Method::Post, ["sandboxes"]) => instant(create_sandbox(state, &json_body(request))),
        (Method::Get, ["sandboxes"]) => {
            let limit: usize = query(request, "limit").and_then(|v| v.parse().ok()).unwrap_or(100);
            let offset: usize = query(request, "offset").and_then(|v| v.parse().ok()).unwrap_or(0);
            let all: Vec<Value> = state.sandboxes.values().map(|s| s.record.clone()).collect();
            let page: Vec<Value> = all.iter().skip(offset).take(limit).cloned().collect();
            instant(respond(200, json!({ "sandboxes": page, "total": all.len() })))
        }
        (Method::Get, ["templates"]) => instant(respond(
            200,
            json!({
                "templates": [{
                    "id": "tpl-1",
                    "name": "python-base-v1",
                    "description": "Python 3 with common packages",
                    "vcpu_count": 2,
                    "memory_mb": 2048,
                    "disk_size_mb": 4096,
                    "visibility": "public",
                    "created_at": "2025-01-01T00:00:00Z",
                    "updated_at": "2025-01-02T00:00:00Z"
                }],
                "limit": query(request, "limit").and_then(|v| v.parse::<u32>().ok()).unwrap_or(100),
                "offset": query(request, "offset").and_then(|v| v.parse::<u32>().ok()).unwrap_or(0)
            }),
        )),
        (_, ["sandboxes", id, rest @ ..]) => {
            let id = id.to_string();
            let Some(sandbox) = state.sandboxes.get_mut(&id) else {
                return instant(not_found("sandbox"));
            };
            sandbox_route(sandbox, &id, request, rest)
        }
        _ => instant(respond(400, json!({ "error": "unknown route" }))),
    }
}

fn create_sandbox(state: &mut State, body: &Value) -> ApiResponse {
    let timeout = body["timeout"].as_i64().unwrap_or(300);
    if !(300..=43_200).contains(&timeout) {
        return respond(422, json!({ "error": "timeout out of range" }));
    }
    state.next_id += 1;
    let id = format!("sbx-{:04}-{}", state.next_id, uuid::Uuid::new_v4().simple());
    let now = Utc::now();
    let record = json!({
        "sandbox_id": id,
        "status": "running",
        "template": body["template"],
        "template_id": "tpl-1",
        "started_at": now.to_rfc3339(),
        "timeout_at": (now + ChronoDuration::seconds(timeout)).to_rfc3339(),
        "cpu_count": 2,
        "memory_mb": 2048,
        "metadata": body.get("metadata").cloned().unwrap_or(Value::Null),
    });
    state.sandboxes.insert(
        id,
        RemoteSandbox {
            record: record.clone(),
            ..Default::default()
        },
    );
    respond(201, record)
}

fn sandbox_route(
    sandbox: &mut RemoteSandbox,
    id: &str,
    request: &ApiRequest,
    rest: &[&str],
) -> (ApiResponse, Duration) {
    let instant = |response| (response, Duration::ZERO);
    let running = sandbox.record["status"] == "running";
    let body = json_body(request);

    match (request.method, rest) {
        (Method::Get, []) => instant(respond(200, sandbox.record.clone())),
        (Method::Delete, []) => {
            sandbox.record["status"] = json!("killed");
            sandbox.contexts.clear();
            instant(respond(200, json!({ "message": "sandbox killed", "sandbox_id": id })))
        }
        _ if !running => instant(respond(409, json!({ "error": "sandbox is not running" }))),
        (Method::Post, ["timeout"]) => {
            let timeout = body["timeout"].as_i64().unwrap_or(300);
            let at = Utc::now() + ChronoDuration::seconds(timeout);
            sandbox.record["timeout_at"] = json!(at.to_rfc3339());
            instant(respond(
                200,
                json!({ "message": "timeout updated", "timeout": timeout, "timeout_at": at.to_rfc3339() }),
            ))
        }
        (Method::Get, ["metrics"]) => instant(respond(
            200,
            json!({
                "timestamp": Utc::now().to_rfc3339(),
                "cpu_usage": 12.5,
                "memory_usage": 256.0,
                "memory_total": 2048.0,
                "disk_read": 1024,
                "disk_write": 2048,
                "network_rx": 10,
                "network_tx": 20
            }),
        )),
        (Method::Get, ["host", port]) => {
            instant(respond(200, json!({ "url": format!("https://{port}-{id}.sandbox.test") })))
        }
        (Method::Post, ["code", "contexts"]) => {
            let ctx_id = format!("ctx-{}", uuid::Uuid::new_v4().simple());
            sandbox.contexts.insert(ctx_id.clone(), HashMap::new());
            instant(respond(
                201,
                json!({
                    "id": ctx_id,
                    "language": body["language"],
                    "cwd": body["cwd"],
                    "created_at": Utc::now().to_rfc3339(),
                    "status": "ready"
                }),
            ))
        }
        (Method::Get, ["code", "contexts", ctx]) => match sandbox.contexts.contains_key(*ctx) {
            true => instant(respond(200, json!({ "context_id": ctx, "language": "python", "status": "ready" }))),
            false => instant(not_found("context")),
        },
        (Method::Delete, ["code", "contexts", ctx]) => match sandbox.contexts.remove(*ctx) {
            Some(_) => instant(respond(200, json!({ "message": "context deleted", "context_id": ctx }))),
            None => instant(not_found("context")),
        },
        (Method::Post, ["code", "run"]) => {
            let code = body["code"].as_str().unwrap_or_default().to_string();
            let mut transient = HashMap::new();
            let vars = match body["context_id"].as_str() {
                Some(ctx) => match sandbox.contexts.get_mut(ctx) {
                    Some(vars) => vars,
                    None => return instant(not_found("context")),
                },
                None => &mut transient,
            };
            let (response, delay) = interpret(&code, vars);
            (respond(200, response), delay)
        }
        (Method::Post, ["commands", "run"]) => instant(respond(200, run_command(&body))),
        (Method::Post, ["files", op]) => instant(file_op(sandbox, op, &body)),
        (Method::Post, ["files"]) => instant(multipart_write(sandbox, request)),
        (Method::Post, ["upload"]) => instant(upload(sandbox, request)),
        (Method::Get, ["download"]) => {
            let path = query(request, "path").unwrap_or_default();
            match sandbox.files.get(path) {
                Some(data) => instant(ApiResponse {
                    status: 200,
                    body: data.clone(),
                }),
                None => instant(not_found("file")),
            }
        }
        _ => instant(respond(400, json!({ "error": "unknown route" }))),
    }
}

/// `name = value`, `print(expr)`, `sleep(ms)` and bare expressions.
fn interpret(code: &str, vars: &mut HashMap<String, String>) -> (Value, Duration) {
    let statements: Vec<&str> = code
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if let Some(bad) = statements
        .iter()
        .find(|s| s.starts_with("print(") && !s.ends_with(')'))
    {
        return (
            failure(Vec::new(), "SyntaxError", "'(' was never closed", bad),
            Duration::ZERO,
        );
    }

    let mut stdout = Vec::new();
    let mut delay = Duration::ZERO;
    let mut last = None;
    for statement in &statements {
        last = None;
        if let Some(inner) = statement.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
            match eval(inner, vars) {
                Ok(value) => stdout.push(value),
                Err(name) => return (name_error(stdout, &name), delay),
            }
        } else if let Some(ms) = statement.strip_prefix("sleep(").and_then(|s| s.strip_suffix(')')) {
            delay += Duration::from_millis(ms.trim().parse().unwrap_or(0));
        } else if let Some((name, value)) = statement.split_once('=') {
            match eval(value, vars) {
                Ok(value) => {
                    vars.insert(name.trim().to_string(), value);
                }
                Err(name) => return (name_error(stdout, &name), delay),
            }
        } else {
            match eval(statement, vars) {
                Ok(value) => last = Some(value),
                Err(name) => return (name_error(stdout, &name), delay),
            }
        }
    }

    let results = match last {
        Some(value) => json!([{ "text/plain": value }]),
        None => json!([]),
    };
    (
        json!({
            "execution_id": format!("exec-{}", uuid::Uuid::new_v4().simple()),
            "results": results,
            "error": null,
            "logs": { "stdout": stdout, "stderr": [] }
        }),
        delay,
    )
}

fn eval(expr: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    let expr = expr.trim();
    if let Some(text) = expr.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(text.to_string());
    }
    if expr.parse::<i64>().is_ok() {
        return Ok(expr.to_string());
    }
    vars.get(expr).cloned().ok_or_else(|| expr.to_string())
}

fn name_error(stdout: Vec<String>, name: &str) -> Value {
    failure(stdout, "NameError", &format!("name '{name}' is not defined"), name)
}

fn failure(stdout: Vec<String>, name: &str, value: &str, line: &str) -> Value {
    json!({
        "execution_id": format!("exec-{}", uuid::Uuid::new_v4().simple()),
        "results": {},
        "error": {
            "name": name,
            "value": value,
            "traceback": [format!("  {line}"), format!("{name}: {value}")]
        },
        "logs": { "stdout": stdout, "stderr": [] }
    })
}

fn run_command(body: &Value) -> Value {
    let command = body["command"].as_str().unwrap_or_default();
    let args: Vec<String> = body["args"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let (stdout, stderr, exit_code) = match command {
        "echo" => (format!("{}\n", args.join(" ")), String::new(), 0),
        "true" => (String::new(), String::new(), 0),
        "false" => (String::new(), String::new(), 1),
        "exit" => {
            let code = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            (String::new(), String::new(), code)
        }
        "pwd" => (
            format!("{}\n", body["working_dir"].as_str().unwrap_or("/home/user")),
            String::new(),
            0,
        ),
        other => (String::new(), format!("sh: {other}: command not found\n"), 127),
    };
    json!({
        "stdout": stdout,
        "stderr": stderr,
        "exit_code": exit_code,
        "duration_ms": 3,
        "success": exit_code == 0,
    })
}

fn file_op(sandbox: &mut RemoteSandbox, op: &str, body: &Value) -> ApiResponse {
    let path = body["path"].as_str().unwrap_or_default().to_string();
    match op {
        "read" => match sandbox.files.get(&path) {
            Some(data) => respond(
                200,
                json!({
                    "content": String::from_utf8_lossy(data),
                    "path": path,
                    "size": data.len()
                }),
            ),
            None => not_found("file"),
        },
        "write" => {
            let content = body["content"].as_str().unwrap_or_default().to_string();
            let len = content.len();
            sandbox.files.insert(path.clone(), Bytes::from(content));
            respond(200, json!({ "message": "written", "path": path, "bytes_written": len }))
        }
        "list" => {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let files: Vec<Value> = sandbox
                .files
                .iter()
                .filter_map(|(p, data)| {
                    let name = p.strip_prefix(&prefix)?;
                    (!name.contains('/')).then(|| {
                        json!({
                            "name": name,
                            "path": p,
                            "size": data.len(),
                            "is_dir": false,
                            "mod_time": "2025-01-01T00:00:00Z"
                        })
                    })
                })
                .collect();
            respond(200, json!({ "files": files }))
        }
        "delete" => match sandbox.files.remove(&path) {
            Some(_) => respond(200, json!({ "message": "deleted", "path": path })),
            None => not_found("file"),
        },
        "mkdir" => respond(200, json!({ "message": "created", "path": path })),
        _ => respond(400, json!({ "error": "unknown file op" })),
    }
}

fn multipart_write(sandbox: &mut RemoteSandbox, request: &ApiRequest) -> ApiResponse {
    let Some(Body::Multipart { files, .. }) = &request.body else {
        return respond(400, json!({ "error": "multipart body expected" }));
    };

    let single_path = query(request, "path").map(str::to_string);
    let mut results = Vec::new();
    let mut failed = false;
    for part in files {
        let path = single_path.clone().unwrap_or_else(|| part.file_name.clone());
        if path.contains("forbidden") {
            failed = true;
            results.push(json!({ "path": path, "name": part.file_name, "type": "file", "error": "permission denied" }));
            continue;
        }
        sandbox.files.insert(path.clone(), part.data.clone());
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        results.push(json!({ "path": path, "name": name, "type": "file" }));
    }
    respond(if failed { 207 } else { 200 }, Value::Array(results))
}

fn upload(sandbox: &mut RemoteSandbox, request: &ApiRequest) -> ApiResponse {
    let Some(Body::Multipart { files, fields }) = &request.body else {
        return respond(400, json!({ "error": "multipart body expected" }));
    };
    let Some(part) = files.first() else {
        return respond(400, json!({ "error": "no file" }));
    };
    let path = fields
        .iter()
        .find(|(k, _)| k == "path")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| format!("/home/user/{}", part.file_name));
    sandbox.files.insert(path.clone(), part.data.clone());
    respond(200, json!({ "message": "uploaded", "path": path, "size": part.data.len() }))
}

/// A client over a fresh fake backend with fast retries.
pub fn client() -> (Client, Arc<FakeBackend>) {
    let backend = FakeBackend::new();
    let client = Client::with_transport(test_config(), backend.clone()).expect("valid test config");
    (client, backend)
}

pub fn test_config() -> ClientConfig {
    ClientConfig::builder()
        .api_key("test-key")
        .base_url("http://fake.invalid/v1/agents")
        .provider("gravix")
        .region("eu-west-1")
        .max_retries(2)
        .retry_base_delay(Duration::from_millis(1))
        .execution_grace(Duration::from_millis(50))
        .build()
        .expect("valid test config")
}

pub fn sandbox_config() -> SandboxConfig {
    SandboxConfig::builder()
        .template("python-base-v1")
        .timeout_secs(600)
        .build()
        .expect("valid sandbox config")
}
