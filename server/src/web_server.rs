//! Axum HTTP + WebSocket server: session roster API, WS watcher attachment
//! at /ws, roster/task event stream at /ws/events, task listing, agent
//! launch, port listing and tunnel management, and Codex session CRUD.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use common::agent::CodexManager;
use common::bus::{EventBus, SESSIONS_UPDATE, TASKS_UPDATE};
use common::error::WorkbenchError;
use common::launcher::{launch_agent_process, LaunchRequest};
use common::ports::list_active_ports;
use common::session::{
    SessionId, SessionKind, SessionTool, StreamGone, StreamPayload, StreamState, TerminalStream,
};
use common::tasks::TaskTracker;
use common::terminal::{CreateOptions, SessionMode, TerminalEngine};
use common::tunnels::TunnelManager;

/// Shared app state injected into every route.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TerminalEngine>,
    pub tasks: Arc<TaskTracker>,
    pub tunnels: Arc<TunnelManager>,
    pub codex: Arc<CodexManager>,
    pub bus: Arc<EventBus>,
    pub workdir: PathBuf,
}

/// Map the error taxonomy onto HTTP statuses; bodies are single strings.
fn error_response(err: WorkbenchError) -> (StatusCode, String) {
    let status = match &err {
        WorkbenchError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkbenchError::Conflict(_) => StatusCode::CONFLICT,
        WorkbenchError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
        WorkbenchError::External(_) => StatusCode::BAD_GATEWAY,
        WorkbenchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        WorkbenchError::Cancelled(_) | WorkbenchError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Runs the server. Binds to 127.0.0.1 (localhost only); tunnels provide
/// remote access when wanted.
pub async fn run_web_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("agentrix server listening on http://{addr}");
    axum::serve(listener, app).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route("/api/sessions/{id}", delete(delete_session_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route(
            "/api/worktrees",
            post(create_worktree_handler).delete(remove_worktree_handler),
        )
        .route("/api/agents/launch", post(launch_agent_handler))
        .route("/api/ports", get(list_ports_handler))
        .route("/api/tunnels", get(list_tunnels_handler))
        .route(
            "/api/tunnels/{port}",
            post(open_tunnel_handler).delete(close_tunnel_handler),
        )
        .route(
            "/api/codex/sessions",
            get(list_codex_handler).post(create_codex_handler),
        )
        .route(
            "/api/codex/sessions/{id}",
            get(codex_events_handler).delete(delete_codex_handler),
        )
        .route(
            "/api/codex/sessions/{id}/messages",
            post(codex_message_handler),
        )
        .route("/api/codex/sessions/{id}/stream", get(codex_stream_handler))
        .route("/ws", get(ws_handler))
        .route("/ws/events", get(ws_events_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    org: String,
    repo: String,
    branch: String,
    #[serde(default)]
    mode: SessionMode,
    #[serde(default)]
    force_new: bool,
    #[serde(default)]
    tool: Option<SessionTool>,
    #[serde(default)]
    kind: Option<SessionKind>,
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.engine.summaries()))
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let created = state
        .engine
        .get_or_create(
            &state.workdir,
            &body.org,
            &body.repo,
            &body.branch,
            CreateOptions {
                mode: body.mode,
                force_new: body.force_new,
                tool: body.tool,
                kind: body.kind,
            },
        )
        .await
        .map_err(error_response)?;
    let snapshot = created.session.snapshot();
    Ok(Json(serde_json::json!({
        "session": snapshot,
        "created": created.created,
    })))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let session_id: SessionId = id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid session id".to_string()))?;
    state
        .engine
        .dispose_by_id(&session_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Watcher attachment
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct WsQuery {
    session_id: Option<String>,
}

/// Client sends this as JSON over a text frame to resize the PTY.
#[derive(serde::Deserialize)]
struct ResizeMessage {
    #[serde(rename = "type")]
    ty: String,
    cols: u16,
    rows: u16,
}

enum WsOut {
    Payload(StreamPayload),
    Close,
}

const WS_STATE_OPEN: u8 = 1;
const WS_STATE_CLOSING: u8 = 2;
const WS_STATE_CLOSED: u8 = 3;

/// WebSocket-backed watcher stream: frames queue onto an unbounded channel
/// the socket task drains, so the engine's send never blocks on the network.
struct WsWatcher {
    tx: tokio::sync::mpsc::UnboundedSender<WsOut>,
    state: AtomicU8,
}

impl WsWatcher {
    fn new(tx: tokio::sync::mpsc::UnboundedSender<WsOut>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            state: AtomicU8::new(WS_STATE_OPEN),
        })
    }

    fn mark_closed(&self) {
        self.state.store(WS_STATE_CLOSED, Ordering::SeqCst);
    }
}

impl TerminalStream for WsWatcher {
    fn ready_state(&self) -> StreamState {
        match self.state.load(Ordering::SeqCst) {
            WS_STATE_OPEN => StreamState::Open,
            WS_STATE_CLOSING => StreamState::Closing,
            _ => StreamState::Closed,
        }
    }

    fn send(&self, payload: StreamPayload) -> Result<(), StreamGone> {
        if self.ready_state() != StreamState::Open {
            return Err(StreamGone);
        }
        self.tx.send(WsOut::Payload(payload)).map_err(|_| StreamGone)
    }

    fn close(&self) {
        self.state.store(WS_STATE_CLOSING, Ordering::SeqCst);
        let _ = self.tx.send(WsOut::Close);
    }

    fn terminate(&self) {
        self.mark_closed();
        let _ = self.tx.send(WsOut::Close);
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = query
        .session_id
        .as_deref()
        .and_then(|sid| sid.parse::<SessionId>().ok())
        .and_then(|sid| state.engine.get_session(&sid));
    match session {
        Some(session) => {
            let engine = state.engine.clone();
            ws.on_upgrade(move |socket| handle_socket_attach(socket, engine, session))
        }
        None => ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Text("Missing or unknown session_id".into()))
                .await;
        }),
    }
}

async fn handle_socket_attach(
    socket: WebSocket,
    engine: Arc<TerminalEngine>,
    session: Arc<common::session::Session>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<WsOut>();
    let watcher = WsWatcher::new(out_tx);
    let Some(watcher_id) = engine.attach_watcher(&session, watcher.clone()) else {
        // Session already closed; the exit frame is queued, flush and go.
        while let Some(out) = out_rx.recv().await {
            match out {
                WsOut::Payload(payload) => {
                    if send_payload(&mut ws_tx, payload).await.is_err() {
                        break;
                    }
                }
                WsOut::Close => break,
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };

    let watcher_for_writer = watcher.clone();
    let queue_to_ws = async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                WsOut::Payload(payload) => {
                    if send_payload(&mut ws_tx, payload).await.is_err() {
                        watcher_for_writer.mark_closed();
                        break;
                    }
                }
                WsOut::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    };

    let engine_for_reader = engine.clone();
    let session_for_reader = session.clone();
    let ws_to_session = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(resize) = serde_json::from_str::<ResizeMessage>(&text) {
                        if resize.ty == "resize" {
                            session_for_reader.pty.resize(resize.cols, resize.rows);
                            continue;
                        }
                    }
                    engine_for_reader.enqueue_input(&session_for_reader, text.as_bytes());
                }
                Message::Binary(data) => {
                    engine_for_reader.enqueue_input(&session_for_reader, &data);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = queue_to_ws => {}
        _ = ws_to_session => {}
    }
    watcher.mark_closed();
    engine.detach_watcher(&session, watcher_id);
}

async fn send_payload(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    payload: StreamPayload,
) -> Result<(), ()> {
    let message = match payload {
        StreamPayload::Text(text) => Message::Text(text.into()),
        StreamPayload::Binary(bytes) => Message::Binary(bytes),
    };
    ws_tx.send(message).await.map_err(|_| ())
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

async fn ws_events_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| handle_events_socket(socket, bus))
}

async fn handle_events_socket(socket: WebSocket, bus: Arc<EventBus>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let subscriptions: Vec<_> = [SESSIONS_UPDATE, TASKS_UPDATE]
        .into_iter()
        .map(|topic| {
            let tx = tx.clone();
            bus.subscribe(topic, move |payload| {
                let envelope =
                    serde_json::json!({ "topic": topic, "payload": payload }).to_string();
                let _ = tx.send(envelope);
            })
        })
        .collect();

    let forward = async {
        while let Some(envelope) = rx.recv().await {
            if ws_tx.send(Message::Text(envelope.into())).await.is_err() {
                break;
            }
        }
    };
    let drain = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };
    tokio::select! {
        _ = forward => {}
        _ = drain => {}
    }
    drop(subscriptions);
}

// ---------------------------------------------------------------------------
// Tasks, launcher, ports, tunnels
// ---------------------------------------------------------------------------

async fn list_tasks_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tasks": state.tasks.list_tasks() }))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorktreeBody {
    org: String,
    repo: String,
    /// Explicit branch name; when absent one is generated via `branchLlm`.
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    description: String,
    /// Shell command of the LLM used to generate a branch name.
    #[serde(default)]
    branch_llm: Option<String>,
}

/// Kick off worktree creation as a tracked background task; the response
/// carries the task id, progress flows over /ws/events.
async fn create_worktree_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateWorktreeBody>,
) -> Json<serde_json::Value> {
    let workdir = state.workdir.clone();
    let title = format!("Create worktree for {}/{}", body.org, body.repo);
    let metadata = serde_json::json!({ "org": body.org, "repo": body.repo });
    let task_id = state.tasks.run_task(
        common::tasks::TaskSpec {
            task_type: "create_worktree".to_string(),
            title: Some(title),
            metadata: Some(metadata),
        },
        move |ctx| async move {
            ctx.ensure_step("branch", Some("Resolve branch name"));
            let branch = match body.branch.filter(|b| !b.trim().is_empty()) {
                Some(branch) => {
                    ctx.skip_step("branch");
                    branch
                }
                None => {
                    let llm = body
                        .branch_llm
                        .ok_or_else(|| anyhow::anyhow!("branch or branchLlm is required"))?;
                    ctx.start_step("branch");
                    let name =
                        common::llm::generate_branch_name(&llm, &body.description, None)
                            .await
                            .map_err(|e| {
                                ctx.fail_step("branch");
                                anyhow::anyhow!(e.to_string())
                            })?;
                    ctx.log_step("branch", &format!("generated branch name {name}"));
                    ctx.complete_step("branch");
                    name
                }
            };
            ctx.start_step("create");
            let path = common::worktree::create_worktree_dir(
                &workdir, &body.org, &body.repo, &branch,
            )
            .map_err(|e| {
                ctx.fail_step("create");
                anyhow::anyhow!(e.to_string())
            })?;
            ctx.complete_step("create");
            ctx.update_metadata(serde_json::json!({ "branch": branch }));
            Ok(Some(serde_json::json!({
                "branch": branch,
                "path": path,
            })))
        },
    );
    Json(serde_json::json!({ "taskId": task_id }))
}

async fn remove_worktree_handler(
    State(state): State<AppState>,
    Query(q): Query<TripleQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .engine
        .dispose_session_by_key(&common::session::session_key(&q.org, &q.repo, &q.branch))
        .await;
    common::worktree::remove_worktree(&state.workdir, &q.org, &q.repo, &q.branch)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchBody {
    command: String,
    org: String,
    repo: String,
    branch: String,
    #[serde(default)]
    prompt: String,
}

async fn launch_agent_handler(
    State(state): State<AppState>,
    Json(body): Json<LaunchBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let result = launch_agent_process(
        &state.engine,
        LaunchRequest {
            command: body.command,
            workdir: state.workdir.clone(),
            org: body.org,
            repo: body.repo,
            branch: body.branch,
            prompt: body.prompt,
        },
    )
    .await
    .map_err(error_response)?;
    Ok(Json(serde_json::json!(result)))
}

async fn list_ports_handler() -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let ports = list_active_ports().await.map_err(error_response)?;
    Ok(Json(serde_json::json!({ "ports": ports })))
}

async fn list_tunnels_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tunnels": state.tunnels.list() }))
}

async fn open_tunnel_handler(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let details = state.tunnels.open(port).await.map_err(error_response)?;
    Ok(Json(serde_json::json!(details)))
}

async fn close_tunnel_handler(State(state): State<AppState>, Path(port): Path<u16>) -> StatusCode {
    if state.tunnels.close(port) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// ---------------------------------------------------------------------------
// Codex sessions
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct TripleQuery {
    org: String,
    repo: String,
    branch: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCodexBody {
    org: String,
    repo: String,
    branch: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(serde::Deserialize)]
struct CodexMessageBody {
    org: String,
    repo: String,
    branch: String,
    text: String,
}

async fn list_codex_handler(
    State(state): State<AppState>,
    Query(q): Query<TripleQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let sessions = state
        .codex
        .list_sessions(&state.workdir, &q.org, &q.repo, &q.branch)
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn create_codex_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateCodexBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let info = state
        .codex
        .create_session(
            &state.workdir,
            &body.org,
            &body.repo,
            &body.branch,
            body.label,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!(info)))
}

async fn codex_events_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TripleQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = state
        .codex
        .get_session(&state.workdir, &q.org, &q.repo, &q.branch, &id)
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "session": session.info(),
        "events": session.events(),
    })))
}

async fn codex_message_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CodexMessageBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .codex
        .send_user_message(
            &state.workdir,
            &body.org,
            &body.repo,
            &body.branch,
            &id,
            &body.text,
        )
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

/// Live transcript stream: one JSON text frame per appended event, from the
/// moment of attachment. History is fetched separately via the GET route.
async fn codex_stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TripleQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state
        .codex
        .get_session(&state.workdir, &q.org, &q.repo, &q.branch, &id)
    {
        Ok(session) => ws.on_upgrade(move |socket| handle_codex_stream(socket, session)),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_codex_stream(socket: WebSocket, session: Arc<common::agent::CodexSession>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = session.subscribe();

    let forward = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("codex stream for {} lagged by {skipped} events", session.id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    let drain = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };
    tokio::select! {
        _ = forward => {}
        _ = drain => {}
    }
}

async fn delete_codex_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TripleQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .codex
        .delete_session(&state.workdir, &q.org, &q.repo, &q.branch, &id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
