//! Terminal sessions: the central entity of the workbench. Each session owns
//! one PTY child, a bounded scrollback log, the set of attached watcher
//! streams, and a pending-input queue that drains once the shell is ready.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::pty::PtyProcess;

/// Unique session identifier (UUID v4). Used in the API and WS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// Interactive sessions belong to a person at a terminal; automation sessions
/// host launched agents and are only reused as a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Interactive,
    Automation,
}

/// Which label pool the session draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTool {
    #[default]
    Terminal,
    Agent,
}

impl SessionTool {
    pub fn label_prefix(&self) -> &'static str {
        match self {
            SessionTool::Terminal => "Terminal",
            SessionTool::Agent => "Agent",
        }
    }
}

/// The equivalence class reuse policies range over.
pub fn session_key(org: &str, repo: &str, branch: &str) -> String {
    format!("{org}::{repo}::{branch}")
}

/// Scrollback cap per session. Output beyond this keeps only the most recent
/// suffix.
pub const MAX_TERMINAL_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// Fixed-capacity scrollback buffer (bytes). New data appends; when over
/// capacity, the oldest bytes are dropped.
pub struct LogBuffer {
    data: Mutex<Vec<u8>>,
    cap: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_TERMINAL_BUFFER_BYTES)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            cap,
        }
    }

    /// Append bytes; if over capacity, drop the oldest.
    pub fn push(&self, bytes: &[u8]) {
        let mut g = self.data.lock().unwrap_or_else(|p| p.into_inner());
        g.extend_from_slice(bytes);
        if g.len() > self.cap {
            let excess = g.len() - self.cap;
            g.drain(..excess);
        }
    }

    /// Copy of the current contents, for the ready frame on attach.
    pub fn dump(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Watcher contract — the capability surface any attached transport satisfies
// ---------------------------------------------------------------------------

/// Transport states mirroring the WebSocket readyState numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What goes over a watcher stream: structured frames as text, PTY output as
/// binary.
#[derive(Debug, Clone)]
pub enum StreamPayload {
    Text(String),
    Binary(Bytes),
}

/// The stream is gone; the watcher holding it must be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGone;

/// Capability contract for attached client streams. WebSocket, TCP, and test
/// mocks all satisfy it; the engine never sees a concrete transport.
pub trait TerminalStream: Send + Sync {
    fn ready_state(&self) -> StreamState;
    fn send(&self, payload: StreamPayload) -> Result<(), StreamGone>;
    /// Graceful close (after an exit frame).
    fn close(&self);
    /// Hard teardown on eviction; best-effort.
    fn terminate(&self);
}

/// One attached client stream plus its per-attachment readiness state.
pub struct Watcher {
    pub id: u64,
    pub stream: Arc<dyn TerminalStream>,
    /// Whether this attachment has received its ready frame yet.
    pub sent_ready: bool,
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Structured frames the engine emits alongside raw output.
#[derive(Debug, Clone)]
pub enum Frame {
    Ready { log: String, cols: u16, rows: u16 },
    Output(Bytes),
    Exit(SessionExit),
}

impl Frame {
    pub fn into_payload(self) -> StreamPayload {
        match self {
            Frame::Ready { log, cols, rows } => StreamPayload::Text(
                serde_json::json!({
                    "type": "ready",
                    "log": log,
                    "cols": cols,
                    "rows": rows,
                })
                .to_string(),
            ),
            Frame::Output(bytes) => StreamPayload::Binary(bytes),
            Frame::Exit(exit) => {
                let mut obj = serde_json::json!({ "type": "exit" });
                if let Some(code) = exit.code {
                    obj["code"] = code.into();
                }
                if let Some(signal) = exit.signal {
                    obj["signal"] = signal.into();
                }
                if let Some(error) = exit.error {
                    obj["error"] = error.into();
                }
                StreamPayload::Text(obj.to_string())
            }
        }
    }
}

/// Frozen exit disposition, set exactly once when a session closes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Mutable lifecycle state, guarded by one mutex so input ordering and
/// watcher bookkeeping stay consistent with readiness transitions.
pub struct SessionState {
    pub ready: bool,
    pub closed: bool,
    pub idle: bool,
    pub last_activity_at: DateTime<Utc>,
    pub pending_inputs: VecDeque<Bytes>,
    pub watchers: Vec<Watcher>,
    pub next_watcher_id: u64,
    pub exit: Option<SessionExit>,
    pub exit_waiters: Vec<oneshot::Sender<SessionExit>>,
}

/// One live terminal session. Identity fields are immutable for the session's
/// lifetime; everything that changes lives in [`SessionState`].
pub struct Session {
    pub id: SessionId,
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub key: String,
    pub label: String,
    pub kind: SessionKind,
    pub tool: SessionTool,
    pub using_tmux: bool,
    pub tmux_session_name: Option<String>,
    pub worktree_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub pty: PtyProcess,
    pub log: LogBuffer,
    pub state: Mutex<SessionState>,
}

impl Session {
    /// Immutable projection for roster payloads and the state file.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        SessionSnapshot {
            id: self.id.to_string(),
            label: self.label.clone(),
            kind: self.kind,
            tool: self.tool,
            using_tmux: self.using_tmux,
            tmux_session_name: self.tmux_session_name.clone(),
            idle: state.idle,
            created_at: self.created_at.to_rfc3339(),
            last_activity_at: state.last_activity_at.to_rfc3339(),
        }
    }

    /// Point-in-time (idle, last activity) pair for roster aggregation.
    pub fn activity(&self) -> (bool, DateTime<Utc>) {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        (state.idle, state.last_activity_at)
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .closed
    }

    /// Await the session's exit. Resolves immediately if already closed.
    pub fn wait_for_exit(&self) -> ExitWaiter {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.closed {
            let exit = state.exit.clone().unwrap_or_default();
            return ExitWaiter::Done(exit);
        }
        let (tx, rx) = oneshot::channel();
        state.exit_waiters.push(tx);
        ExitWaiter::Pending(rx)
    }
}

/// Resolved or in-flight exit wait.
pub enum ExitWaiter {
    Done(SessionExit),
    Pending(oneshot::Receiver<SessionExit>),
}

impl ExitWaiter {
    pub async fn wait(self) -> SessionExit {
        match self {
            ExitWaiter::Done(exit) => exit,
            ExitWaiter::Pending(rx) => rx.await.unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// External snapshots
// ---------------------------------------------------------------------------

/// Per-session roster entry (externally observable).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub label: String,
    pub kind: SessionKind,
    pub tool: SessionTool,
    pub using_tmux: bool,
    pub tmux_session_name: Option<String>,
    pub idle: bool,
    pub created_at: String,
    pub last_activity_at: String,
}

/// Roster entry grouping all sessions that share a key. Derived on demand,
/// never stored in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSessionSummary {
    pub org: String,
    pub repo: String,
    pub branch: String,
    /// Idle only when every member session is idle.
    pub idle: bool,
    /// Most recent activity across members.
    pub last_activity_at: String,
    pub sessions: Vec<SessionSnapshot>,
}
