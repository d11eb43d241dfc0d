//! Terminal session engine: create/reuse/dispose sessions, the readiness and
//! input-queue protocol, output fan-out to watchers, idle sweeping, roster
//! snapshots and tmux-backed rehydration after a restart.
//!
//! Ordering discipline: a session's state mutex guards every lifecycle
//! transition, the pending-input queue, the watcher set, and writes to the
//! PTY, so enqueued inputs reach the shell in enqueue order and the queue
//! drains fully before any post-ready write overtakes it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bus::{EventBus, SESSIONS_UPDATE};
use crate::error::{Result, WorkbenchError};
use crate::persist::SessionStore;
use crate::pty::{spawn_pty, PtySignal, SpawnTarget};
use crate::registry::SessionRegistry;
use crate::session::{
    session_key, Frame, LogBuffer, Session, SessionExit, SessionId, SessionKind, SessionState,
    SessionTool, StreamState, TerminalStream, Watcher, WorktreeSessionSummary,
};
use crate::tmux;
use crate::worktree::WorktreeResolver;

/// How a session's backing process is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Prefer tmux when available, fall back to a raw PTY.
    #[default]
    Auto,
    /// Require tmux; fail when it is not installed.
    Tmux,
    /// Never use tmux.
    Pty,
}

/// Options for [`TerminalEngine::get_or_create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub mode: SessionMode,
    /// Always create, never reuse; tmux names get a unique suffix.
    pub force_new: bool,
    pub tool: Option<SessionTool>,
    pub kind: Option<SessionKind>,
}

/// Result of a get-or-create call.
pub struct CreatedSession {
    pub session: Arc<Session>,
    pub created: bool,
}

impl std::fmt::Debug for CreatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedSession")
            .field("session_id", &self.session.id)
            .field("created", &self.created)
            .finish()
    }
}

/// Engine timing knobs. Defaults match production behaviour; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// A session becomes ready this long after spawn even with no output.
    pub ready_delay: Duration,
    pub idle_sweep_period: Duration,
    pub idle_threshold: Duration,
    /// SIGTERM → SIGKILL escalation delay for disposal.
    pub sigkill_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            ready_delay: Duration::from_millis(150),
            idle_sweep_period: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(90),
            sigkill_delay: Duration::from_secs(2),
        }
    }
}

/// The terminal session engine. One per process; shared via Arc.
pub struct TerminalEngine {
    registry: SessionRegistry,
    store: SessionStore,
    bus: Arc<EventBus>,
    resolver: Box<dyn WorktreeResolver>,
    opts: EngineOptions,
    sweeper_running: AtomicBool,
    shutting_down: AtomicBool,
}

impl TerminalEngine {
    pub fn new(
        bus: Arc<EventBus>,
        store: SessionStore,
        resolver: Box<dyn WorktreeResolver>,
        opts: EngineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            store,
            bus,
            resolver,
            opts,
            sweeper_running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Current roster, grouped by key, live sessions only.
    pub fn summaries(&self) -> Vec<WorktreeSessionSummary> {
        self.registry.summaries()
    }

    // -----------------------------------------------------------------------
    // Creation and reuse
    // -----------------------------------------------------------------------

    /// Get or create a session for a worktree triple.
    ///
    /// Reuse policy: `force_new` always creates; automation sessions are
    /// remembered only as a fallback; an interactive tmux-backed session is
    /// returned immediately when the mode allows tmux; otherwise the
    /// automation fallback, and failing that a fresh session.
    pub async fn get_or_create(
        self: &Arc<Self>,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        opts: CreateOptions,
    ) -> Result<CreatedSession> {
        let worktree = self.resolver.resolve(workdir, org, repo, branch)?;
        let key = session_key(org, repo, branch);

        if !opts.force_new {
            let mut automation_fallback: Option<Arc<Session>> = None;
            for session in self.registry.sessions_for_key(&key) {
                if session.is_closed() {
                    continue;
                }
                if session.kind == SessionKind::Automation {
                    automation_fallback.get_or_insert(session);
                    continue;
                }
                if session.using_tmux && opts.mode != SessionMode::Pty {
                    return Ok(CreatedSession {
                        session,
                        created: false,
                    });
                }
            }
            if let Some(session) = automation_fallback {
                return Ok(CreatedSession {
                    session,
                    created: false,
                });
            }
        }

        let session = self
            .create_session(&worktree, org, repo, branch, &key, &opts)
            .await?;
        Ok(CreatedSession {
            session,
            created: true,
        })
    }

    /// Always spawn a fresh automation session for the triple, tmux-backed
    /// when available so launched agents can be re-attached for observation.
    /// Skips the reuse walk but keeps the plain tmux name for the key.
    pub async fn create_isolated_terminal_session(
        self: &Arc<Self>,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Arc<Session>> {
        let worktree = self.resolver.resolve(workdir, org, repo, branch)?;
        let key = session_key(org, repo, branch);
        self.create_session(
            &worktree,
            org,
            repo,
            branch,
            &key,
            &CreateOptions {
                mode: SessionMode::Auto,
                force_new: false,
                tool: Some(SessionTool::Agent),
                kind: Some(SessionKind::Automation),
            },
        )
        .await
    }

    async fn create_session(
        self: &Arc<Self>,
        worktree: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        key: &str,
        opts: &CreateOptions,
    ) -> Result<Arc<Session>> {
        let use_tmux = match opts.mode {
            SessionMode::Tmux => {
                if !tmux::tmux_available() {
                    return Err(WorkbenchError::precondition(
                        "tmux mode requested but tmux is not available".to_string(),
                    ));
                }
                true
            }
            SessionMode::Pty => false,
            SessionMode::Auto => tmux::tmux_available(),
        };

        let tool = opts.tool.unwrap_or_default();
        let kind = opts.kind.unwrap_or_default();
        let label = self.registry.allocate_label(key, tool);

        let tmux_session_name = if use_tmux {
            let slug = opts.force_new.then_some(label.as_str());
            Some(tmux::make_session_name(org, repo, branch, slug))
        } else {
            None
        };
        let target = match &tmux_session_name {
            Some(name) => SpawnTarget::Tmux {
                session_name: name.clone(),
            },
            None => SpawnTarget::Shell,
        };

        // A failed spawn must not consume the label slot or leave an orphan
        // bucket behind.
        let (pty, data_rx, exit_rx) = match spawn_pty(&target, worktree) {
            Ok(parts) => parts,
            Err(e) => {
                self.registry.release_label(key, tool, &label);
                return Err(e);
            }
        };
        let now = Utc::now();
        let session = Arc::new(Session {
            id: SessionId::new(),
            org: org.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            key: key.to_string(),
            label,
            kind,
            tool,
            using_tmux: use_tmux,
            tmux_session_name,
            worktree_path: worktree.to_path_buf(),
            created_at: now,
            pty,
            log: LogBuffer::new(),
            state: Mutex::new(SessionState {
                ready: false,
                closed: false,
                idle: false,
                last_activity_at: now,
                pending_inputs: Default::default(),
                watchers: Vec::new(),
                next_watcher_id: 1,
                exit: None,
                exit_waiters: Vec::new(),
            }),
        });

        self.registry.insert(session.clone());
        self.start_pumps(&session, data_rx, exit_rx);
        self.ensure_sweeper();
        self.roster_changed().await;
        tracing::info!(
            "session {} created for {key} (label {:?}, tmux {})",
            session.id,
            session.label,
            session.using_tmux,
        );
        Ok(session)
    }

    fn start_pumps(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut data_rx: mpsc::Receiver<Bytes>,
        mut exit_rx: mpsc::Receiver<crate::pty::PtyExit>,
    ) {
        let engine = self.clone();
        let s = session.clone();
        tokio::spawn(async move {
            while let Some(chunk) = data_rx.recv().await {
                engine.handle_output(&s, chunk);
            }
        });

        let engine = self.clone();
        let s = session.clone();
        tokio::spawn(async move {
            let exit = exit_rx.recv().await;
            engine
                .finalize_exit(
                    &s,
                    SessionExit {
                        code: exit.and_then(|e| e.code),
                        signal: None,
                        error: None,
                    },
                )
                .await;
        });

        let engine = self.clone();
        let s = session.clone();
        let delay = self.opts.ready_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.mark_ready(&s);
        });
    }

    // -----------------------------------------------------------------------
    // Readiness and input
    // -----------------------------------------------------------------------

    /// Queue input for a session. Before readiness the bytes join the pending
    /// queue; after it they write straight through. Input to a closed session
    /// is dropped; write failures are swallowed (the exit handler is the
    /// source of truth).
    pub fn enqueue_input(self: &Arc<Self>, session: &Arc<Session>, data: &[u8]) {
        let mut roster_dirty = false;
        {
            let mut state = lock_state(session);
            if state.closed {
                return;
            }
            state.last_activity_at = Utc::now();
            if state.idle {
                state.idle = false;
                roster_dirty = true;
            }
            if state.ready {
                let _ = session.pty.write(data);
            } else {
                state.pending_inputs.push_back(Bytes::copy_from_slice(data));
            }
        }
        if roster_dirty {
            self.roster_changed_bg();
        }
    }

    fn mark_ready(self: &Arc<Self>, session: &Arc<Session>) {
        let transitioned = {
            let mut state = lock_state(session);
            if state.closed || state.ready {
                false
            } else {
                state.ready = true;
                flush_pending_locked(session, &mut state);
                send_ready_frames_locked(session, &mut state);
                true
            }
        };
        if transitioned {
            self.roster_changed_bg();
        }
    }

    // -----------------------------------------------------------------------
    // Output fan-out
    // -----------------------------------------------------------------------

    fn handle_output(self: &Arc<Self>, session: &Arc<Session>, chunk: Bytes) {
        let mut roster_dirty = false;
        {
            let mut state = lock_state(session);
            if state.closed {
                return;
            }
            state.last_activity_at = Utc::now();
            if state.idle {
                state.idle = false;
                roster_dirty = true;
            }
            if !state.ready {
                // First output marks the session ready; the ready frame goes
                // out before this chunk, with the log as it stood before it.
                state.ready = true;
                roster_dirty = true;
                flush_pending_locked(session, &mut state);
            }
            send_ready_frames_locked(session, &mut state);
            session.log.push(&chunk);
            deliver_locked(&mut state, Frame::Output(chunk).into_payload());
        }
        if roster_dirty {
            self.roster_changed_bg();
        }
    }

    /// Attach a client stream. If the session is already ready the stream
    /// receives its ready frame (full log, current dimensions) immediately;
    /// otherwise the frame is sent at the readiness transition. Returns the
    /// watcher id to pass to [`detach_watcher`] on stream close, or `None`
    /// when the session is already closed (the stream gets an exit frame and
    /// is closed).
    pub fn attach_watcher(
        &self,
        session: &Arc<Session>,
        stream: Arc<dyn TerminalStream>,
    ) -> Option<u64> {
        let mut state = lock_state(session);
        if state.closed {
            let exit = state.exit.clone().unwrap_or_default();
            let _ = stream.send(Frame::Exit(exit).into_payload());
            stream.close();
            return None;
        }
        let id = state.next_watcher_id;
        state.next_watcher_id += 1;
        state.watchers.push(Watcher {
            id,
            stream,
            sent_ready: false,
        });
        if state.ready {
            send_ready_frames_locked(session, &mut state);
        }
        Some(id)
    }

    /// Drop a watcher after its stream closed. No frames are sent.
    pub fn detach_watcher(&self, session: &Arc<Session>, watcher_id: u64) {
        let mut state = lock_state(session);
        state.watchers.retain(|w| w.id != watcher_id);
    }

    // -----------------------------------------------------------------------
    // Idle sweep
    // -----------------------------------------------------------------------

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(engine.opts.idle_sweep_period).await;
                if engine.registry.is_empty() {
                    engine.sweeper_running.store(false, Ordering::SeqCst);
                    // A session may have been added between the emptiness
                    // check and the reset; reclaim the sweeper role if so.
                    if engine.registry.is_empty()
                        || engine.sweeper_running.swap(true, Ordering::SeqCst)
                    {
                        break;
                    }
                    continue;
                }
                let mut changed = false;
                for session in engine.registry.all() {
                    let mut state = lock_state(&session);
                    if state.closed || state.idle {
                        continue;
                    }
                    let age = Utc::now().signed_duration_since(state.last_activity_at);
                    let stale = age
                        .to_std()
                        .map(|d| d >= engine.opts.idle_threshold)
                        .unwrap_or(false);
                    if stale {
                        state.idle = true;
                        changed = true;
                    }
                }
                if changed {
                    engine.roster_changed().await;
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Dispose a session: SIGTERM, SIGKILL after `kill_delay`, await the exit
    /// event. The exit frame reaches every watcher before its stream closes.
    pub async fn dispose(&self, session: &Arc<Session>, kill_delay: Duration) -> SessionExit {
        if !session.is_closed() {
            session.pty.signal(PtySignal::Term);
            let s = session.clone();
            tokio::spawn(async move {
                if !kill_delay.is_zero() {
                    tokio::time::sleep(kill_delay).await;
                }
                if !s.is_closed() {
                    s.pty.signal(PtySignal::Kill);
                }
            });
        }
        session.wait_for_exit().wait().await
    }

    /// Dispose by id; NotFound when the id is unknown.
    pub async fn dispose_by_id(&self, id: &SessionId) -> Result<SessionExit> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| WorkbenchError::not_found(format!("No session {id}")))?;
        Ok(self.dispose(&session, self.opts.sigkill_delay).await)
    }

    /// Dispose every live session, suppressing per-step persistence; a single
    /// empty-roster persist happens at the very end.
    pub async fn dispose_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for session in self.registry.all() {
            let _ = self.dispose(&session, Duration::ZERO).await;
        }
        self.store.persist(&self.registry.summaries()).await;
        self.shutting_down.store(false, Ordering::SeqCst);
    }

    /// Dispose every session belonging to a repository.
    pub async fn dispose_sessions_for_repository(&self, org: &str, repo: &str) {
        for session in self.registry.all() {
            if session.org == org && session.repo == repo {
                let _ = self.dispose(&session, self.opts.sigkill_delay).await;
            }
        }
    }

    /// Dispose every session for one key.
    pub async fn dispose_session_by_key(&self, key: &str) {
        for session in self.registry.sessions_for_key(key) {
            let _ = self.dispose(&session, self.opts.sigkill_delay).await;
        }
    }

    /// Close the books on a session once its PTY has exited: freeze the exit
    /// disposition, send the exit frame, close and clear the watchers,
    /// remove both index entries, resolve waiters, broadcast.
    async fn finalize_exit(&self, session: &Arc<Session>, exit: SessionExit) {
        let (watchers, waiters) = {
            let mut state = lock_state(session);
            if state.closed {
                return;
            }
            state.closed = true;
            state.ready = true;
            state.pending_inputs.clear();
            state.exit = Some(exit.clone());
            (
                std::mem::take(&mut state.watchers),
                std::mem::take(&mut state.exit_waiters),
            )
        };
        // Exit frame strictly before close, so clients can act on it.
        for watcher in watchers {
            let _ = watcher.stream.send(Frame::Exit(exit.clone()).into_payload());
            watcher.stream.close();
        }
        for waiter in waiters {
            let _ = waiter.send(exit.clone());
        }
        self.registry.remove(&session.id);
        tracing::info!("session {} closed (code {:?})", session.id, exit.code);
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.roster_changed().await;
        }
    }

    // -----------------------------------------------------------------------
    // Roster broadcasts and rehydration
    // -----------------------------------------------------------------------

    async fn roster_changed(&self) {
        let summaries = self.registry.summaries();
        match serde_json::to_value(&summaries) {
            Ok(payload) => self.bus.emit(SESSIONS_UPDATE, &payload),
            Err(e) => tracing::warn!("failed to encode roster payload: {e}"),
        }
        self.store.persist(&summaries).await;
    }

    fn roster_changed_bg(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.roster_changed().await;
        });
    }

    /// Rebuild tmux-backed sessions from the last persisted roster. No-op
    /// when the registry already has sessions, when the mode forbids tmux,
    /// or when tmux is unavailable. Returns the number restored.
    pub async fn rehydrate(self: &Arc<Self>, workdir: &Path, mode: SessionMode) -> usize {
        if !self.registry.is_empty() || mode == SessionMode::Pty {
            return 0;
        }
        let summaries = self.store.load();
        if summaries.is_empty() || !tmux::tmux_available() {
            return 0;
        }

        let mut restored = 0;
        for summary in summaries {
            for snap in &summary.sessions {
                if !snap.using_tmux {
                    continue;
                }
                let Some(name) = snap.tmux_session_name.clone() else {
                    continue;
                };
                match tmux::has_session(&name).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!("tmux lookup for {name} failed: {e}");
                        continue;
                    }
                }
                let worktree = match self.resolver.resolve(
                    workdir,
                    &summary.org,
                    &summary.repo,
                    &summary.branch,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("skipping rehydration of {name}: {e}");
                        continue;
                    }
                };
                let target = SpawnTarget::Tmux {
                    session_name: name.clone(),
                };
                let (pty, data_rx, exit_rx) = match spawn_pty(&target, &worktree) {
                    Ok(parts) => parts,
                    Err(e) => {
                        tracing::warn!("failed to re-attach tmux session {name}: {e}");
                        continue;
                    }
                };
                let key = session_key(&summary.org, &summary.repo, &summary.branch);
                let created_at = parse_timestamp(&snap.created_at);
                let last_activity_at = parse_timestamp(&snap.last_activity_at);
                let session = Arc::new(Session {
                    id: SessionId::new(),
                    org: summary.org.clone(),
                    repo: summary.repo.clone(),
                    branch: summary.branch.clone(),
                    key,
                    label: snap.label.clone(),
                    kind: snap.kind,
                    tool: snap.tool,
                    using_tmux: true,
                    tmux_session_name: Some(name.clone()),
                    worktree_path: worktree,
                    created_at,
                    pty,
                    log: LogBuffer::new(),
                    state: Mutex::new(SessionState {
                        ready: false,
                        closed: false,
                        idle: snap.idle,
                        last_activity_at,
                        pending_inputs: Default::default(),
                        watchers: Vec::new(),
                        next_watcher_id: 1,
                        exit: None,
                        exit_waiters: Vec::new(),
                    }),
                });
                self.registry.insert(session.clone());
                self.start_pumps(&session, data_rx, exit_rx);
                restored += 1;
                tracing::info!("rehydrated tmux session {name} as {}", session.id);
            }
        }
        if restored > 0 {
            self.ensure_sweeper();
            self.roster_changed().await;
        }
        restored
    }
}

fn lock_state(session: &Session) -> std::sync::MutexGuard<'_, SessionState> {
    session.state.lock().unwrap_or_else(|p| p.into_inner())
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Drain the pending-input queue into the PTY in insertion order. Runs with
/// the state lock held so no direct write can overtake the queue.
fn flush_pending_locked(session: &Session, state: &mut SessionState) {
    while let Some(input) = state.pending_inputs.pop_front() {
        let _ = session.pty.write(&input);
    }
}

/// Send the ready frame to every watcher that has not had one. Runs with the
/// state lock held; failed sends evict.
fn send_ready_frames_locked(session: &Session, state: &mut SessionState) {
    if !state.ready || state.watchers.iter().all(|w| w.sent_ready) {
        return;
    }
    let log = String::from_utf8_lossy(&session.log.dump()).into_owned();
    let (cols, rows) = session.pty.size();
    state.watchers.retain_mut(|watcher| {
        if watcher.sent_ready {
            return true;
        }
        if watcher.stream.ready_state() != StreamState::Open {
            watcher.stream.terminate();
            return false;
        }
        let frame = Frame::Ready {
            log: log.clone(),
            cols,
            rows,
        };
        match watcher.stream.send(frame.into_payload()) {
            Ok(()) => {
                watcher.sent_ready = true;
                true
            }
            Err(_) => {
                watcher.stream.terminate();
                false
            }
        }
    });
}

/// Deliver one payload to every watcher; send-or-evict, no buffering.
fn deliver_locked(state: &mut SessionState, payload: crate::session::StreamPayload) {
    state.watchers.retain(|watcher| {
        if watcher.stream.ready_state() != StreamState::Open {
            watcher.stream.terminate();
            return false;
        }
        match watcher.stream.send(payload.clone()) {
            Ok(()) => true,
            Err(_) => {
                watcher.stream.terminate();
                false
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{StreamGone, StreamPayload};
    use crate::worktree::FsWorktreeResolver;

    struct MockStream {
        state: Mutex<StreamState>,
        sent: Mutex<Vec<StreamPayload>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl MockStream {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(StreamState::Open),
                sent: Mutex::new(Vec::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn frames(&self) -> Vec<StreamPayload> {
            self.sent.lock().unwrap().clone()
        }

        fn text_frames(&self) -> Vec<serde_json::Value> {
            self.frames()
                .into_iter()
                .filter_map(|p| match p {
                    StreamPayload::Text(t) => serde_json::from_str(&t).ok(),
                    StreamPayload::Binary(_) => None,
                })
                .collect()
        }
    }

    impl TerminalStream for MockStream {
        fn ready_state(&self) -> StreamState {
            *self.state.lock().unwrap()
        }

        fn send(&self, payload: StreamPayload) -> std::result::Result<(), StreamGone> {
            if self.ready_state() != StreamState::Open {
                return Err(StreamGone);
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        fn close(&self) {
            *self.state.lock().unwrap() = StreamState::Closed;
            self.closed.store(true, Ordering::SeqCst);
        }

        fn terminate(&self) {
            self.close();
        }
    }

    fn test_engine(dir: &Path) -> Arc<TerminalEngine> {
        TerminalEngine::new(
            EventBus::new(),
            SessionStore::new(dir.join("state").join("sessions.json")),
            Box::new(FsWorktreeResolver),
            EngineOptions {
                ready_delay: Duration::from_millis(50),
                idle_sweep_period: Duration::from_millis(100),
                idle_threshold: Duration::from_secs(90),
                sigkill_delay: Duration::from_millis(200),
            },
        )
    }

    fn make_worktree(dir: &Path, org: &str, repo: &str, branch: &str) {
        std::fs::create_dir_all(dir.join(org).join(repo).join("worktrees").join(branch))
            .expect("mkdir worktree");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_new_always_creates() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_worktree(dir.path(), "acme", "widget", "main");
        let engine = test_engine(dir.path());
        let opts = CreateOptions {
            mode: SessionMode::Pty,
            force_new: true,
            ..Default::default()
        };
        let a = engine
            .get_or_create(dir.path(), "acme", "widget", "main", opts.clone())
            .await
            .expect("first");
        let b = engine
            .get_or_create(dir.path(), "acme", "widget", "main", opts)
            .await
            .expect("second");
        assert!(a.created && b.created);
        assert_ne!(a.session.id, b.session.id);
        assert_eq!(engine.session_count(), 2);
        engine.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn automation_session_serves_as_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_worktree(dir.path(), "acme", "widget", "main");
        let engine = test_engine(dir.path());
        let isolated = engine
            .create_isolated_terminal_session(dir.path(), "acme", "widget", "main")
            .await
            .expect("isolated");
        assert_eq!(isolated.kind, SessionKind::Automation);
        assert_eq!(isolated.label, "Agent 1");

        let reused = engine
            .get_or_create(
                dir.path(),
                "acme",
                "widget",
                "main",
                CreateOptions::default(),
            )
            .await
            .expect("fallback");
        assert!(!reused.created);
        assert_eq!(reused.session.id, isolated.id);
        engine.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_worktree_propagates_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(dir.path());
        let err = engine
            .get_or_create(
                dir.path(),
                "acme",
                "widget",
                "main",
                CreateOptions::default(),
            )
            .await
            .expect_err("no worktree");
        assert_eq!(err.status_class(), "not_found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inputs_queue_until_ready_then_flush_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_worktree(dir.path(), "acme", "widget", "main");
        let engine = test_engine(dir.path());
        let created = engine
            .get_or_create(
                dir.path(),
                "acme",
                "widget",
                "main",
                CreateOptions {
                    mode: SessionMode::Pty,
                    ..Default::default()
                },
            )
            .await
            .expect("create");
        let session = created.session;

        engine.enqueue_input(&session, b"echo one\r");
        engine.enqueue_input(&session, b"echo two\r");
        {
            let state = session.state.lock().unwrap();
            if !state.ready {
                assert_eq!(state.pending_inputs.len(), 2);
                assert_eq!(state.pending_inputs[0].as_ref(), b"echo one\r");
            }
        }
        engine.mark_ready(&session);
        {
            let state = session.state.lock().unwrap();
            assert!(state.ready);
            assert!(state.pending_inputs.is_empty());
        }
        engine.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_after_ready_sends_ready_frame_with_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_worktree(dir.path(), "acme", "widget", "main");
        let engine = test_engine(dir.path());
        let created = engine
            .get_or_create(
                dir.path(),
                "acme",
                "widget",
                "main",
                CreateOptions {
                    mode: SessionMode::Pty,
                    ..Default::default()
                },
            )
            .await
            .expect("create");
        let session = created.session;
        engine.mark_ready(&session);

        let stream = MockStream::open();
        let id = engine
            .attach_watcher(&session, stream.clone())
            .expect("attached");
        assert!(id > 0);
        let frames = stream.text_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ready");
        assert!(frames[0]["cols"].is_number());
        engine.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_streams_are_evicted_on_delivery() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_worktree(dir.path(), "acme", "widget", "main");
        let engine = test_engine(dir.path());
        let created = engine
            .get_or_create(
                dir.path(),
                "acme",
                "widget",
                "main",
                CreateOptions {
                    mode: SessionMode::Pty,
                    ..Default::default()
                },
            )
            .await
            .expect("create");
        let session = created.session;
        engine.mark_ready(&session);

        let live = MockStream::open();
        let dead = MockStream::open();
        engine.attach_watcher(&session, live.clone());
        engine.attach_watcher(&session, dead.clone());
        *dead.state.lock().unwrap() = StreamState::Closed;

        engine.handle_output(&session, Bytes::from_static(b"hello"));
        {
            let state = session.state.lock().unwrap();
            assert_eq!(state.watchers.len(), 1);
            assert_eq!(state.watchers[0].id, 1);
        }
        assert!(live
            .frames()
            .iter()
            .any(|p| matches!(p, StreamPayload::Binary(b) if b.as_ref() == b"hello")));
        engine.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispose_sends_exit_frame_then_closes_watchers() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_worktree(dir.path(), "acme", "widget", "main");
        let engine = test_engine(dir.path());
        let created = engine
            .get_or_create(
                dir.path(),
                "acme",
                "widget",
                "main",
                CreateOptions {
                    mode: SessionMode::Pty,
                    ..Default::default()
                },
            )
            .await
            .expect("create");
        let session = created.session;
        engine.mark_ready(&session);

        let first = MockStream::open();
        let second = MockStream::open();
        engine.attach_watcher(&session, first.clone());
        engine.attach_watcher(&session, second.clone());

        engine.dispose(&session, Duration::from_millis(100)).await;

        for stream in [&first, &second] {
            let exits: Vec<_> = stream
                .text_frames()
                .into_iter()
                .filter(|f| f["type"] == "exit")
                .collect();
            assert_eq!(exits.len(), 1);
            assert!(stream.closed.load(Ordering::SeqCst));
        }
        assert!(session.is_closed());
        assert_eq!(engine.session_count(), 0);
        {
            let state = session.state.lock().unwrap();
            assert!(state.watchers.is_empty());
            assert!(state.pending_inputs.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rehydrate_is_a_no_op_without_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(dir.path());
        assert_eq!(engine.rehydrate(dir.path(), SessionMode::Auto).await, 0);
        assert_eq!(engine.rehydrate(dir.path(), SessionMode::Pty).await, 0);
    }
}
