//! API surface tests: drive the router end-to-end against a real engine and
//! a temp workdir.

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::agent::CodexManager;
use common::bus::EventBus;
use common::persist::SessionStore;
use common::tasks::{TaskStore, TaskTracker};
use common::terminal::{EngineOptions, TerminalEngine};
use common::tunnels::TunnelManager;
use common::worktree::FsWorktreeResolver;
use server::AppState;

fn test_state(workdir: &Path) -> AppState {
    let bus = EventBus::new();
    let engine = TerminalEngine::new(
        bus.clone(),
        SessionStore::new(workdir.join(".state").join("sessions.json")),
        Box::new(FsWorktreeResolver),
        EngineOptions {
            ready_delay: Duration::from_millis(50),
            sigkill_delay: Duration::from_millis(200),
            ..Default::default()
        },
    );
    AppState {
        engine,
        tasks: TaskTracker::new(bus.clone()),
        tunnels: TunnelManager::new(),
        codex: CodexManager::new(Box::new(FsWorktreeResolver)),
        bus,
        workdir: workdir.to_path_buf(),
    }
}

async fn call(
    state: &AppState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    };
    let response = server::router(state.clone())
        .oneshot(request)
        .await
        .expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| serde_json::json!(String::from_utf8_lossy(&bytes)));
    (status, value)
}

#[tokio::test(flavor = "multi_thread")]
async fn session_roster_starts_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path());
    let (status, body) = call(&state, "GET", "/api/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test(flavor = "multi_thread")]
async fn creating_a_session_for_a_missing_worktree_is_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path());
    let (status, body) = call(
        &state,
        "POST",
        "/api/sessions",
        Some(serde_json::json!({
            "org": "acme", "repo": "widget", "branch": "main", "mode": "pty"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.as_str().unwrap_or_default().contains("No worktree"));
}

#[tokio::test(flavor = "multi_thread")]
async fn session_create_list_delete_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("acme/widget/worktrees/main")).expect("worktree");
    let state = test_state(dir.path());

    let (status, created) = call(
        &state,
        "POST",
        "/api/sessions",
        Some(serde_json::json!({
            "org": "acme", "repo": "widget", "branch": "main", "mode": "pty"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["created"], true);
    let session_id = created["session"]["id"].as_str().expect("id").to_string();
    assert_eq!(created["session"]["label"], "Terminal 1");

    let (status, roster) = call(&state, "GET", "/api/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(roster[0]["org"], "acme");
    assert_eq!(roster[0]["sessions"][0]["id"], session_id.as_str());

    let (status, _) = call(&state, "DELETE", &format!("/api/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, roster) = call(&state, "GET", "/api/sessions", None).await;
    assert_eq!(roster, serde_json::json!([]));

    let (status, _) = call(&state, "DELETE", &format!("/api/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn worktree_task_creates_directory_and_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path());

    let (status, body) = call(
        &state,
        "POST",
        "/api/worktrees",
        Some(serde_json::json!({
            "org": "acme", "repo": "widget", "branch": "feature-x"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["taskId"].as_str().expect("task id").to_string();

    let mut task = serde_json::Value::Null;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, tasks) = call(&state, "GET", "/api/tasks", None).await;
        if let Some(found) = tasks["tasks"]
            .as_array()
            .and_then(|list| list.iter().find(|t| t["id"] == task_id.as_str()))
        {
            if t_status(found) == "succeeded" || t_status(found) == "failed" {
                task = found.clone();
                break;
            }
        }
    }
    assert_eq!(t_status(&task), "succeeded");
    assert_eq!(task["result"]["branch"], "feature-x");
    assert!(dir
        .path()
        .join("acme/widget/worktrees/feature-x")
        .is_dir());
    let steps = task["steps"].as_array().expect("steps");
    assert!(steps.iter().any(|s| s["id"] == "branch" && s["status"] == "skipped"));
    assert!(steps.iter().any(|s| s["id"] == "create" && s["status"] == "succeeded"));
}

fn t_status(task: &serde_json::Value) -> &str {
    task["status"].as_str().unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_the_main_worktree_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("acme/widget/worktrees/main")).expect("worktree");
    let state = test_state(dir.path());

    let (status, body) = call(
        &state,
        "DELETE",
        "/api/worktrees?org=acme&repo=widget&branch=main",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.as_str().unwrap_or_default().contains("main"));
    assert!(dir.path().join("acme/widget/worktrees/main").is_dir());
}

#[tokio::test(flavor = "multi_thread")]
async fn launching_an_agent_without_a_command_is_400() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path());
    let (status, _) = call(
        &state,
        "POST",
        "/api/agents/launch",
        Some(serde_json::json!({
            "command": "   ", "org": "acme", "repo": "widget",
            "branch": "main", "prompt": "do things"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_an_unknown_tunnel_is_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path());
    let (status, _) = call(&state, "DELETE", "/api/tunnels/8080", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = call(&state, "GET", "/api/tunnels", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tunnels"], serde_json::json!([]));
}
