//! DaytonaClient against a mock Daytona API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use docs_sandbox::sandbox::{CreateSandboxParams, SandboxSource, SnapshotParams};
use docs_sandbox::snapshot::snapshot_params as lib_snapshot_params;
use docs_sandbox::sync::{sync_repos, SandboxGit, SyncAction, SyncOptions, SyncOutcome};
use docs_sandbox::sandbox::Resources;
use docs_sandbox::{DaytonaClient, Error, Registry, SandboxApi};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client(server: &MockServer) -> DaytonaClient {
    DaytonaClient::new("test-key", format!("{}/api", server.uri()), "us").unwrap()
}

fn snapshot_params() -> CreateSandboxParams {
    CreateSandboxParams {
        source: SandboxSource::Snapshot("effect-docs-snapshot".to_string()),
        env_vars: HashMap::from([(
            "OPENCODE_CONFIG".to_string(),
            "/context/opencode.json".to_string(),
        )]),
        public: true,
        auto_stop_interval: 600,
        resources: None,
    }
}

#[tokio::test]
async fn create_waits_until_started() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/sandbox"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "snapshot": "effect-docs-snapshot",
            "public": true,
            "autoStopInterval": 600,
            "target": "us",
            "env": { "OPENCODE_CONFIG": "/context/opencode.json" },
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "sb-1", "state": "creating" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/sandbox/sb-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "sb-1", "state": "started" })),
        )
        .mount(&server)
        .await;

    let info = client(&server).await.create(snapshot_params()).await.unwrap();
    assert_eq!(info.id, "sb-1");
    assert_eq!(info.state.as_deref(), Some("started"));
}

#[tokio::test]
async fn create_fails_when_sandbox_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/sandbox"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "sb-2", "state": "error" })),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .create(snapshot_params())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sandbox { op: "create", .. }));
}

#[tokio::test]
async fn non_success_status_maps_to_api_error() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/sandbox/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("sandbox not found"))
        .mount(&server)
        .await;

    let client = client(&server).await;
    assert_err!(client.delete("gone").await);

    match client.delete("gone").await.unwrap_err() {
        Error::Api {
            method,
            status,
            body,
            ..
        } => {
            assert_eq!(method, "DELETE");
            assert_eq!(status, 404);
            assert_eq!(body, "sandbox not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn preview_link_and_ssh_access() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sandbox/sb-1/ports/8080/preview-url"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://8080-sb-1.proxy.daytona.works",
            "token": "preview-token",
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/sandbox/sb-1/ssh-access"))
        .and(query_param("expiresInMinutes", "24"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "ssh-token",
            "expiresAt": "2026-01-01T00:24:00Z",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server).await;
    let preview = client.preview_link("sb-1", 8080).await.unwrap();
    assert_eq!(preview.url, "https://8080-sb-1.proxy.daytona.works");

    let ssh = client.create_ssh_access("sb-1", 24).await.unwrap();
    assert_eq!(ssh.token, "ssh-token");
}

#[tokio::test]
async fn file_round_trip_through_toolbox() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/toolbox/sb-1/toolbox/files/download"))
        .and(query_param("path", "/root/.bashrc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"# bashrc\n".to_vec()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/toolbox/sb-1/toolbox/files/upload"))
        .and(query_param("path", "/root/.bashrc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server).await;
    let content = client.download_file("sb-1", "/root/.bashrc").await.unwrap();
    assert_eq!(content, b"# bashrc\n");
    assert_ok!(client.upload_file("sb-1", "/root/.bashrc", content).await);
}

#[tokio::test]
async fn sandbox_git_pulls_existing_and_clones_missing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/toolbox/sb-1/toolbox/files/folder"))
        .and(query_param("path", "/context/repos"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/toolbox/sb-1/toolbox/files"))
        .and(query_param("path", "/context/repos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "name": "effect", "isDir": true },
        ])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/toolbox/sb-1/toolbox/process/execute"))
        .and(body_partial_json(json!({
            "command": "git pull",
            "cwd": "/context/repos/effect",
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "exitCode": 0, "result": "Already up to date." })),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/toolbox/sb-1/toolbox/process/execute"))
        .and(body_partial_json(json!({
            "command": "git clone --depth 1 --single-branch --branch main \
                        https://github.com/sveltejs/svelte.dev /context/repos/svelte",
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "exitCode": 128, "result": "fatal: unable to access" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api: Arc<dyn SandboxApi> = Arc::new(client(&server).await);
    let backend = Arc::new(SandboxGit::new(api, "sb-1"));
    let results = sync_repos(
        backend,
        Registry::local_context().repos(),
        Path::new("/context/repos"),
        &SyncOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 2);
    assert!(matches!(
        results[0].outcome,
        SyncOutcome::Synced {
            action: SyncAction::Pulled,
            ..
        }
    ));
    assert!(!results[1].is_success());
    assert!(results[1].error().unwrap_or_default().contains("exited with 128"));
}

#[tokio::test]
async fn snapshot_build_logs_are_read_while_building() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/snapshots"))
        .and(body_partial_json(json!({ "name": "effect-docs-snapshot", "cpu": 3 })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "snap-1", "state": "building" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/snapshots/snap-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "snap-1", "state": "active" })),
        )
        .mount(&server)
        .await;

    // Once while building and once after the build went active.
    Mock::given(method("GET"))
        .and(path("/api/snapshots/snap-1/build-logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Step 1/4 : FROM debian\n"))
        .expect(2)
        .mount(&server)
        .await;

    let registry = Registry::builtin();
    let params: SnapshotParams =
        lib_snapshot_params(registry.require("effect").unwrap(), Resources::SNAPSHOT);
    let client = client(&server)
        .await
        .with_snapshot_timeout(Duration::from_secs(30));

    assert_ok!(client.create_snapshot(params).await);
}
