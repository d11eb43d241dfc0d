//! Codex agent sessions: a per-worktree roster of transcript-backed Codex
//! threads. Each session owns an upstream CLI thread, an ordered history of
//! typed events, a broadcast emitter for live subscribers, and a persistence
//! chain that writes the transcript after every appended event.

pub mod codex_sdk;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::config;
use crate::error::{Result, WorkbenchError};
use crate::worktree::WorktreeResolver;
use codex_sdk::{CodexThread, CommandOutputAccumulator, ThreadEvent, ThreadItem};

/// Verbose command-execution logging is enabled when this env flag is truthy.
pub const VERBOSE_ENV: &str = "CODEX_SDK_VERBOSE";

const DEFAULT_LABEL: &str = "Codex Session";

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// Typed transcript entries, append-only per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CodexEvent {
    UserMessage {
        id: String,
        text: String,
        timestamp: String,
    },
    Thinking {
        id: String,
        text: String,
        status: String,
        timestamp: String,
    },
    AgentResponse {
        id: String,
        text: String,
        timestamp: String,
    },
    Usage {
        id: String,
        input_tokens: u64,
        cached_input_tokens: u64,
        output_tokens: u64,
        timestamp: String,
    },
    Error {
        id: String,
        message: String,
        timestamp: String,
    },
    /// Verbose-mode command execution log lines.
    Log {
        id: String,
        message: String,
        timestamp: String,
    },
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// External projection of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexSessionInfo {
    pub id: String,
    pub label: String,
    pub created_at: String,
    pub thread_id: Option<String>,
    pub event_count: usize,
}

/// On-disk transcript shape.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    id: String,
    label: String,
    created_at: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    events: Vec<CodexEvent>,
}

pub struct CodexSession {
    pub id: String,
    pub label: String,
    pub created_at: String,
    worktree: PathBuf,
    thread: AsyncMutex<Option<CodexThread>>,
    thread_id: Mutex<Option<String>>,
    history: Mutex<Vec<CodexEvent>>,
    emitter: broadcast::Sender<CodexEvent>,
    /// One turn at a time; a new turn queues behind the pending one.
    turn_lock: AsyncMutex<()>,
    /// Serialises transcript writes so later events never race earlier ones.
    write_chain: AsyncMutex<()>,
    accumulator: Mutex<CommandOutputAccumulator>,
}

impl CodexSession {
    fn new(worktree: PathBuf, id: String, label: String, created_at: String) -> Arc<Self> {
        let (emitter, _) = broadcast::channel(256);
        Arc::new(Self {
            id,
            label,
            created_at,
            worktree,
            thread: AsyncMutex::new(None),
            thread_id: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            emitter,
            turn_lock: AsyncMutex::new(()),
            write_chain: AsyncMutex::new(()),
            accumulator: Mutex::new(CommandOutputAccumulator::default()),
        })
    }

    pub fn info(&self) -> CodexSessionInfo {
        CodexSessionInfo {
            id: self.id.clone(),
            label: self.label.clone(),
            created_at: self.created_at.clone(),
            thread_id: self.thread_id.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            event_count: self.history.lock().unwrap_or_else(|p| p.into_inner()).len(),
        }
    }

    pub fn events(&self) -> Vec<CodexEvent> {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Live event stream for subscribers; history is fetched separately.
    pub fn subscribe(&self) -> broadcast::Receiver<CodexEvent> {
        self.emitter.subscribe()
    }

    /// Append to history, fan out to subscribers, and chain a transcript
    /// write.
    async fn append_event(&self, event: CodexEvent) {
        {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            history.push(event.clone());
        }
        let _ = self.emitter.send(event);
        self.persist().await;
    }

    async fn persist(&self) {
        let _chain = self.write_chain.lock().await;
        let stored = StoredSession {
            id: self.id.clone(),
            label: self.label.clone(),
            created_at: self.created_at.clone(),
            thread_id: self.thread_id.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            events: self.events(),
        };
        let path = session_file(&self.worktree, &self.id);
        if let Err(e) = write_stored(&path, &stored) {
            tracing::warn!("failed to persist codex session {}: {e}", self.id);
        }
    }

    async fn ensure_thread(&self) -> Result<()> {
        let mut thread = self.thread.lock().await;
        if thread.is_some() {
            return Ok(());
        }
        let model = config::ensure_loaded().codex_model.clone();
        let spawned = CodexThread::spawn(&self.worktree, model.as_deref())
            .await
            .map_err(WorkbenchError::External)?;
        *thread = Some(spawned);
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(thread) = self.thread.lock().await.take() {
            thread.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct WorktreeSessions {
    worktree: PathBuf,
    hydrated: AtomicBool,
    sessions: DashMap<String, Arc<CodexSession>>,
}

/// Per-worktree Codex session registry with lazy, at-most-once hydration of
/// stored transcripts.
pub struct CodexManager {
    resolver: Box<dyn WorktreeResolver>,
    worktrees: DashMap<PathBuf, Arc<WorktreeSessions>>,
}

impl CodexManager {
    pub fn new(resolver: Box<dyn WorktreeResolver>) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            worktrees: DashMap::new(),
        })
    }

    fn bucket(&self, worktree: &Path) -> Arc<WorktreeSessions> {
        self.worktrees
            .entry(worktree.to_path_buf())
            .or_insert_with(|| {
                Arc::new(WorktreeSessions {
                    worktree: worktree.to_path_buf(),
                    hydrated: AtomicBool::new(false),
                    sessions: DashMap::new(),
                })
            })
            .clone()
    }

    fn hydrate(&self, bucket: &WorktreeSessions) {
        if bucket.hydrated.swap(true, Ordering::SeqCst) {
            return;
        }
        let dir = storage_dir(&bucket.worktree);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(stored) = serde_json::from_str::<StoredSession>(&data) else {
                tracing::warn!("skipping malformed codex transcript at {path:?}");
                continue;
            };
            if stored.id.is_empty() || bucket.sessions.contains_key(&stored.id) {
                continue;
            }
            let session = CodexSession::new(
                bucket.worktree.clone(),
                stored.id.clone(),
                stored.label,
                stored.created_at,
            );
            {
                let mut history = session.history.lock().unwrap_or_else(|p| p.into_inner());
                *history = stored.events;
            }
            {
                let mut tid = session.thread_id.lock().unwrap_or_else(|p| p.into_inner());
                *tid = stored.thread_id;
            }
            bucket.sessions.insert(stored.id, session);
        }
    }

    fn resolve(&self, workdir: &Path, org: &str, repo: &str, branch: &str) -> Result<PathBuf> {
        self.resolver.resolve(workdir, org, repo, branch)
    }

    /// Create a session: allocate an id, start the upstream thread with a
    /// fixed working directory, persist the empty transcript.
    pub async fn create_session(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        label: Option<String>,
    ) -> Result<CodexSessionInfo> {
        let worktree = self.resolve(workdir, org, repo, branch)?;
        let bucket = self.bucket(&worktree);
        self.hydrate(&bucket);

        let label = label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LABEL.to_string());
        let session = CodexSession::new(
            worktree.clone(),
            uuid::Uuid::new_v4().to_string(),
            label,
            now_rfc3339(),
        );
        session.ensure_thread().await?;
        session.persist().await;
        let info = session.info();
        bucket.sessions.insert(session.id.clone(), session);
        Ok(info)
    }

    /// All sessions for the tuple, hydrated at most once, sorted by creation.
    pub fn list_sessions(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<CodexSessionInfo>> {
        let worktree = self.resolve(workdir, org, repo, branch)?;
        let bucket = self.bucket(&worktree);
        self.hydrate(&bucket);
        let mut out: Vec<CodexSessionInfo> =
            bucket.sessions.iter().map(|e| e.info()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub fn get_session(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        session_id: &str,
    ) -> Result<Arc<CodexSession>> {
        let worktree = self.resolve(workdir, org, repo, branch)?;
        let bucket = self.bucket(&worktree);
        self.hydrate(&bucket);
        bucket
            .sessions
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| WorkbenchError::not_found(format!("No codex session {session_id}")))
    }

    /// Send a user message and stream the turn into the transcript. Turns
    /// are serialised per session; concurrent senders queue.
    pub async fn send_user_message(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        session_id: &str,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WorkbenchError::precondition("message text is required".to_string()));
        }
        let session = self.get_session(workdir, org, repo, branch, session_id)?;

        session
            .append_event(CodexEvent::UserMessage {
                id: event_id(),
                text: text.to_string(),
                timestamp: now_rfc3339(),
            })
            .await;

        let _turn = session.turn_lock.lock().await;
        session.ensure_thread().await?;
        let mut rx = {
            let thread = session.thread.lock().await;
            let thread = thread
                .as_ref()
                .ok_or_else(|| WorkbenchError::internal("thread vanished mid-turn".to_string()))?;
            thread
                .run_streamed(text)
                .await
                .map_err(WorkbenchError::External)?
        };

        let verbose = config::env_flag(VERBOSE_ENV);
        while let Some(event) = rx.recv().await {
            self.consume_thread_event(&session, event, verbose).await;
        }
        Ok(())
    }

    async fn consume_thread_event(
        &self,
        session: &Arc<CodexSession>,
        event: ThreadEvent,
        verbose: bool,
    ) {
        match event {
            ThreadEvent::ThreadStarted { thread_id } => {
                {
                    let mut tid = session.thread_id.lock().unwrap_or_else(|p| p.into_inner());
                    *tid = Some(thread_id);
                }
                session.persist().await;
            }
            ThreadEvent::ItemStarted { item } => {
                self.consume_item(session, item, "started", verbose).await;
            }
            ThreadEvent::ItemUpdated { item } => {
                self.consume_item(session, item, "updated", verbose).await;
            }
            ThreadEvent::ItemCompleted { item } => {
                self.consume_item(session, item, "completed", verbose).await;
            }
            ThreadEvent::TurnCompleted { usage } => {
                session
                    .append_event(CodexEvent::Usage {
                        id: event_id(),
                        input_tokens: usage.input_tokens,
                        cached_input_tokens: usage.cached_input_tokens,
                        output_tokens: usage.output_tokens,
                        timestamp: now_rfc3339(),
                    })
                    .await;
            }
            ThreadEvent::TurnFailed { message } | ThreadEvent::Error { message } => {
                session
                    .append_event(CodexEvent::Error {
                        id: event_id(),
                        message,
                        timestamp: now_rfc3339(),
                    })
                    .await;
            }
        }
    }

    async fn consume_item(
        &self,
        session: &Arc<CodexSession>,
        item: ThreadItem,
        phase: &str,
        verbose: bool,
    ) {
        match item {
            ThreadItem::Reasoning { id: _, text } => {
                session
                    .append_event(CodexEvent::Thinking {
                        id: event_id(),
                        text,
                        status: phase.to_string(),
                        timestamp: now_rfc3339(),
                    })
                    .await;
            }
            ThreadItem::AgentMessage { id: _, text } => {
                if phase == "completed" {
                    session
                        .append_event(CodexEvent::AgentResponse {
                            id: event_id(),
                            text,
                            timestamp: now_rfc3339(),
                        })
                        .await;
                }
            }
            ThreadItem::CommandExecution {
                id,
                command,
                aggregated_output,
                exit_code,
                status,
            } => {
                if !verbose {
                    return;
                }
                let message = match phase {
                    "started" => Some(format!("$ {command}")),
                    "updated" => {
                        let delta = {
                            let mut acc =
                                session.accumulator.lock().unwrap_or_else(|p| p.into_inner());
                            acc.delta(&id, &aggregated_output)
                        };
                        (!delta.is_empty()).then_some(delta)
                    }
                    _ => {
                        {
                            let mut acc =
                                session.accumulator.lock().unwrap_or_else(|p| p.into_inner());
                            acc.forget(&id);
                        }
                        Some(match exit_code {
                            Some(code) => format!("command exited with code {code}"),
                            None => format!("command {status}"),
                        })
                    }
                };
                if let Some(message) = message {
                    session
                        .append_event(CodexEvent::Log {
                            id: event_id(),
                            message,
                            timestamp: now_rfc3339(),
                        })
                        .await;
                }
            }
            ThreadItem::Other { .. } => {}
        }
    }

    /// Remove the session in memory and on disk.
    pub async fn delete_session(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        session_id: &str,
    ) -> Result<()> {
        let worktree = self.resolve(workdir, org, repo, branch)?;
        let bucket = self.bucket(&worktree);
        self.hydrate(&bucket);
        let Some((_, session)) = bucket.sessions.remove(session_id) else {
            return Err(WorkbenchError::not_found(format!(
                "No codex session {session_id}"
            )));
        };
        session.shutdown().await;
        let path = session_file(&worktree, session_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove codex transcript {path:?}: {e}");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage layout
// ---------------------------------------------------------------------------

fn storage_dir(worktree: &Path) -> PathBuf {
    worktree.join(".agentrix").join("codex-sessions")
}

fn session_file(worktree: &Path, session_id: &str) -> PathBuf {
    storage_dir(worktree).join(format!("{session_id}.json"))
}

fn write_stored(path: &Path, stored: &StoredSession) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, serde_json::to_string_pretty(stored)?)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
