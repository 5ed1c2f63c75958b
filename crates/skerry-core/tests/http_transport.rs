//! HTTP transport against a mock server.

use httpmock::prelude::*;
use serde_json::json;
use skerry_core::{Client, ClientConfig, CommandRequest, CoreError, Removal, SandboxConfig, SandboxId};
use std::time::Duration;

fn client_for(server: &MockServer) -> Client {
    let config = ClientConfig::builder()
        .api_key("test-key")
        .base_url(server.url("/v1/agents"))
        .provider("gravix")
        .region("eu-west-1")
        .max_retries(2)
        .retry_base_delay(Duration::from_millis(1))
        .execution_grace(Duration::from_millis(50))
        .build()
        .unwrap();
    Client::new(config).unwrap()
}

#[tokio::test]
async fn test_create_sends_bearer_token_and_body() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/agents/sandboxes")
                .header("authorization", "Bearer test-key")
                .json_body_partial(r#"{"provider": "gravix", "region": "eu-west-1", "timeout": 600}"#);
            then.status(201).json_body(json!({
                "sandbox_id": "sbx-1",
                "status": "creating",
                "started_at": "2025-01-01T00:00:00Z"
            }));
        })
        .await;

    let client = client_for(&server);
    let config = SandboxConfig::builder().timeout_secs(600).build().unwrap();
    let sandbox = client.sandboxes().create(&config).await.unwrap();

    mock.assert_async().await;
    assert_eq!(sandbox.id, SandboxId::from("sbx-1"));
    assert_eq!(sandbox.state, skerry_core::SandboxState::Running);
    assert_eq!(
        sandbox.timeout_at.unwrap().to_rfc3339(),
        "2025-01-01T00:10:00+00:00"
    );
}

#[tokio::test]
async fn test_status_codes_map_to_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/agents/sandboxes/missing");
            then.status(404).json_body(json!({ "error": "sandbox not found" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/agents/sandboxes/locked");
            then.status(401).json_body(json!({ "message": "invalid api key" }));
        })
        .await;

    let client = client_for(&server);

    let err = client.sandboxes().get(&SandboxId::from("missing")).await.unwrap_err();
    assert!(matches!(err, CoreError::SandboxNotFound(ref id) if id.as_str() == "missing"));

    let err = client.sandboxes().get(&SandboxId::from("locked")).await.unwrap_err();
    match err {
        CoreError::Authentication(message) => assert_eq!(message, "invalid api key"),
        other => panic!("expected authentication error, got {other}"),
    }
}

#[tokio::test]
async fn test_transient_status_is_retried_for_reads() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/agents/sandboxes/sbx-1/metrics");
            then.status(503).body("upstream unavailable");
        })
        .await;

    let client = client_for(&server);
    let err = client
        .sandboxes()
        .get_metrics(&SandboxId::from("sbx-1"))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    mock.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_kill_treats_404_as_already_gone() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v1/agents/sandboxes/sbx-9");
            then.status(404);
        })
        .await;

    let client = client_for(&server);
    let id = SandboxId::from("sbx-9");
    assert_eq!(client.sandboxes().kill(&id).await.unwrap(), Removal::AlreadyGone);
    assert_eq!(client.sandboxes().kill(&id).await.unwrap(), Removal::AlreadyGone);
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_slow_command_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/agents/sandboxes/sbx-1/commands/run")
                .json_body_partial(r#"{"command": "sleep", "timeout": 100}"#);
            then.status(200)
                .delay(Duration::from_secs(2))
                .json_body(json!({ "stdout": "", "stderr": "", "exit_code": 0 }));
        })
        .await;

    let client = client_for(&server);
    let err = client
        .dispatcher()
        .run_command(
            &SandboxId::from("sbx-1"),
            &CommandRequest::new("sleep").arg("10").timeout_ms(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(d) if d == Duration::from_millis(150)));
}

#[tokio::test]
async fn test_multipart_write_reaches_files_endpoint() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/agents/sandboxes/sbx-1/files")
                .query_param("path", "/home/user/data.csv")
                .header_exists("content-type")
                .body_contains("a,b,c");
            then.status(200)
                .json_body(json!([{ "path": "/home/user/data.csv", "name": "data.csv", "type": "file" }]));
        })
        .await;

    let client = client_for(&server);
    let result = client
        .dispatcher()
        .write(
            &SandboxId::from("sbx-1"),
            "data.csv",
            "a,b,c\n",
            &Default::default(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(result.name, "data.csv");
    assert_eq!(result.size, Some(6));
}

#[tokio::test]
async fn test_create_accepts_naive_timestamps() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/agents/sandboxes");
            then.status(201).json_body(json!({
                "sandbox_id": "sbx-2",
                "status": "running",
                "started_at": "2025-01-01T00:00:00.123456"
            }));
        })
        .await;

    let client = client_for(&server);
    let config = SandboxConfig::builder().timeout_secs(600).build().unwrap();
    let sandbox = client.sandboxes().create(&config).await.unwrap();

    assert_eq!(sandbox.id, SandboxId::from("sbx-2"));
    assert_eq!(
        sandbox.timeout_at.unwrap().to_rfc3339(),
        "2025-01-01T00:10:00.123456+00:00"
    );
}

#[tokio::test]
async fn test_undecodable_create_response_kills_the_sandbox() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/agents/sandboxes");
            then.status(201).json_body(json!({ "sandbox_id": "sbx-3", "status": 42 }));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v1/agents/sandboxes/sbx-3");
            then.status(200).json_body(json!({ "message": "sandbox killed" }));
        })
        .await;

    let client = client_for(&server);
    let config = SandboxConfig::builder().timeout_secs(600).build().unwrap();
    let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let err = client
        .with_session(&config, {
            let ran = std::sync::Arc::clone(&ran);
            move |_session| async move {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, CoreError>(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Json(_)), "{err}");
    assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    delete.assert_hits_async(1).await;
    assert_eq!(
        client.sandboxes().kill(&SandboxId::from("sbx-3")).await.unwrap(),
        Removal::AlreadyGone
    );
    delete.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_kill_accepts_no_content() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v1/agents/sandboxes/sbx-4");
            then.status(204);
        })
        .await;

    let client = client_for(&server);
    let removal = client.sandboxes().kill(&SandboxId::from("sbx-4")).await.unwrap();
    assert_eq!(removal, Removal::Removed);
    mock.assert_async().await;
}
