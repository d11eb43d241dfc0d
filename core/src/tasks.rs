//! Task tracker: lifecycle of background operations (worktree creation,
//! branch-name generation, …) with step-level progress, append-only step
//! logs, TTL pruning, debounced snapshot persistence and restart
//! rehydration that fails anything caught mid-flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{EventBus, TASKS_UPDATE};

/// Completed tasks are dropped this long after completion.
const TASK_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
const TASKS_DIR: &str = ".terminal-worktree";
const TASKS_FILE: &str = "tasks.json";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Skipped | StepStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub logs: Vec<StepLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Inputs to [`TaskTracker::run_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub task_type: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

/// Messages applied when rehydration fails interrupted work.
#[derive(Debug, Clone)]
pub struct RestartMessages {
    pub task_error: String,
    pub step_log: String,
}

impl Default for RestartMessages {
    fn default() -> Self {
        Self {
            task_error: "Task interrupted by a server restart".to_string(),
            step_log: "Step marked as failed after a server restart".to_string(),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// In-memory map of background tasks plus the machinery that keeps clients
/// and the snapshot file in sync.
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, Task>>,
    bus: Arc<EventBus>,
    store: Mutex<Option<Arc<TaskStore>>>,
    ttl: Duration,
}

/// Handle given to task handlers for progress reporting.
#[derive(Clone)]
pub struct TaskContext {
    tracker: Arc<TaskTracker>,
    task_id: String,
}

impl TaskTracker {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            bus,
            store: Mutex::new(None),
            ttl: TASK_TTL,
        })
    }

    /// Create a task and run `handler` on the next scheduler tick. The
    /// handler's return value (when `Some`) becomes the task result; a
    /// handler error fails the task without touching the scheduler.
    pub fn run_task<F, Fut>(self: &Arc<Self>, spec: TaskSpec, handler: F) -> String
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let task = Task {
            id: id.clone(),
            task_type: spec.task_type.clone(),
            title: spec.title.unwrap_or_else(|| spec.task_type.clone()),
            status: TaskStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            metadata: spec.metadata.unwrap_or_else(|| Value::Object(Default::default())),
            steps: Vec::new(),
            result: None,
            error: None,
        };
        {
            let mut tasks = self.lock_tasks();
            self.prune_expired_locked(&mut tasks);
            tasks.insert(id.clone(), task.clone());
        }
        self.emit_task(&task);
        self.schedule_persist(false);

        let tracker = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let ctx = TaskContext {
                tracker: tracker.clone(),
                task_id: task_id.clone(),
            };
            tracker.set_status(&task_id, TaskStatus::Running);
            match handler(ctx).await {
                Ok(result) => {
                    if let Some(value) = result {
                        tracker.mutate(&task_id, |task| task.result = Some(value));
                    }
                    tracker.set_status(&task_id, TaskStatus::Succeeded);
                }
                Err(e) => {
                    tracker.mutate(&task_id, |task| {
                        task.error = Some(TaskError {
                            message: e.to_string(),
                            reason: None,
                        });
                    });
                    tracker.set_status(&task_id, TaskStatus::Failed);
                }
            }
        });
        id
    }

    /// All live tasks, oldest first. Prunes expired tasks first.
    pub fn list_tasks(self: &Arc<Self>) -> Vec<Task> {
        let mut out: Vec<Task> = {
            let mut tasks = self.lock_tasks();
            self.prune_expired_locked(&mut tasks);
            tasks.values().cloned().collect()
        };
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.lock_tasks().get(id).cloned()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(self: &Arc<Self>, id: &str, status: TaskStatus) {
        self.mutate(id, |task| {
            task.status = status;
            if status.is_terminal() {
                task.completed_at = Some(now_rfc3339());
            } else {
                task.completed_at = None;
            }
        });
        // Terminal transitions bypass the debounce.
        if status.is_terminal() {
            self.schedule_persist(true);
        }
    }

    /// Apply one mutation: bump updatedAt, emit, schedule persistence, prune.
    fn mutate(self: &Arc<Self>, id: &str, f: impl FnOnce(&mut Task)) {
        let snapshot = {
            let mut tasks = self.lock_tasks();
            self.prune_expired_locked(&mut tasks);
            let Some(task) = tasks.get_mut(id) else {
                return;
            };
            f(task);
            task.updated_at = now_rfc3339();
            task.clone()
        };
        self.emit_task(&snapshot);
        self.schedule_persist(false);
    }

    fn emit_task(&self, task: &Task) {
        match serde_json::to_value(task) {
            Ok(payload) => self.bus.emit(TASKS_UPDATE, &serde_json::json!({ "task": payload })),
            Err(e) => tracing::warn!("failed to encode task {}: {e}", task.id),
        }
    }

    /// Drop tasks whose completion is older than the TTL, announcing each
    /// removal on the bus.
    fn prune_expired_locked(&self, tasks: &mut HashMap<String, Task>) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        let expired: Vec<String> = tasks
            .values()
            .filter(|t| {
                t.completed_at
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|done| done.with_timezone(&chrono::Utc) < cutoff)
                    .unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect();
        for id in expired {
            tasks.remove(&id);
            self.bus.emit(
                TASKS_UPDATE,
                &serde_json::json!({ "task": { "id": id, "removed": true } }),
            );
        }
    }

    // -- step-level progress -------------------------------------------------

    fn ensure_step_locked(task: &mut Task, id: &str, label: Option<&str>) -> usize {
        if let Some(pos) = task.steps.iter().position(|s| s.id == id) {
            if let Some(label) = label {
                task.steps[pos].label = label.to_string();
            }
            return pos;
        }
        task.steps.push(TaskStep {
            id: id.to_string(),
            label: label.unwrap_or(id).to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
        });
        task.steps.len() - 1
    }

    fn step_transition(self: &Arc<Self>, task_id: &str, step_id: &str, status: StepStatus) {
        self.mutate(task_id, |task| {
            let pos = Self::ensure_step_locked(task, step_id, None);
            let step = &mut task.steps[pos];
            step.status = status;
            match status {
                StepStatus::Running => {
                    step.started_at.get_or_insert_with(now_rfc3339);
                    step.completed_at = None;
                }
                s if s.is_terminal() => {
                    step.completed_at = Some(now_rfc3339());
                }
                _ => step.completed_at = None,
            }
        });
    }

    // -- persistence ---------------------------------------------------------

    /// Wire a snapshot store to the tracker: load and rehydrate the snapshot
    /// (failing anything that was still in flight), then persist the repaired
    /// roster once and keep it fresh on every future mutation.
    pub async fn configure_persistence(self: &Arc<Self>, store: Arc<TaskStore>) {
        let messages = store.restart_messages.clone();
        let restored = store.load();
        {
            let mut tasks = self.lock_tasks();
            for mut task in restored {
                rehydrate_task(&mut task, &messages);
                tasks.insert(task.id.clone(), task);
            }
        }
        {
            let mut slot = self.store.lock().unwrap_or_else(|p| p.into_inner());
            *slot = Some(store);
        }
        self.persist_now().await;
    }

    fn current_store(&self) -> Option<Arc<TaskStore>> {
        self.store
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn snapshot_all(&self) -> Vec<Task> {
        let mut out: Vec<Task> = self.lock_tasks().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    async fn persist_now(self: &Arc<Self>) {
        if let Some(store) = self.current_store() {
            store.save(&self.snapshot_all()).await;
        }
    }

    /// Debounced by default; `immediate` flushes synchronously with the
    /// caller's await point.
    fn schedule_persist(self: &Arc<Self>, immediate: bool) {
        let Some(store) = self.current_store() else {
            return;
        };
        let tracker = self.clone();
        if immediate {
            tokio::spawn(async move {
                store.save(&tracker.snapshot_all()).await;
            });
            return;
        }
        {
            let mut pending = store.pending.lock().unwrap_or_else(|p| p.into_inner());
            if *pending {
                return;
            }
            *pending = true;
        }
        let debounce = store.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            {
                let mut pending = store.pending.lock().unwrap_or_else(|p| p.into_inner());
                *pending = false;
            }
            store.save(&tracker.snapshot_all()).await;
        });
    }
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn ensure_step(&self, id: &str, label: Option<&str>) {
        self.tracker.mutate(&self.task_id, |task| {
            TaskTracker::ensure_step_locked(task, id, label);
        });
    }

    pub fn start_step(&self, id: &str) {
        self.tracker
            .step_transition(&self.task_id, id, StepStatus::Running);
    }

    pub fn complete_step(&self, id: &str) {
        self.tracker
            .step_transition(&self.task_id, id, StepStatus::Succeeded);
    }

    pub fn skip_step(&self, id: &str) {
        self.tracker
            .step_transition(&self.task_id, id, StepStatus::Skipped);
    }

    pub fn fail_step(&self, id: &str) {
        self.tracker
            .step_transition(&self.task_id, id, StepStatus::Failed);
    }

    /// Append a log line to a step. Empty messages are dropped.
    pub fn log_step(&self, id: &str, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        let message = message.to_string();
        self.tracker.mutate(&self.task_id, |task| {
            let pos = TaskTracker::ensure_step_locked(task, id, None);
            task.steps[pos].logs.push(StepLog {
                id: uuid::Uuid::new_v4().to_string(),
                message,
                timestamp: now_rfc3339(),
            });
        });
    }

    /// Merge object keys into the task metadata.
    pub fn update_metadata(&self, patch: Value) {
        self.tracker.mutate(&self.task_id, |task| {
            if let (Value::Object(meta), Value::Object(patch)) = (&mut task.metadata, patch) {
                for (k, v) in patch {
                    meta.insert(k, v);
                }
            }
        });
    }

    pub fn set_result(&self, value: Value) {
        self.tracker
            .mutate(&self.task_id, |task| task.result = Some(value));
    }

    pub fn task_snapshot(&self) -> Option<Task> {
        self.tracker.get_task(&self.task_id)
    }
}

/// Force a snapshot task back to a consistent shape after a restart: running
/// or pending work failed with `reason = "process_restart"`; terminal tasks
/// regain a completion stamp if the snapshot lost one.
fn rehydrate_task(task: &mut Task, messages: &RestartMessages) {
    if task.created_at.is_empty() {
        task.created_at = now_rfc3339();
    }
    if task.updated_at.is_empty() {
        task.updated_at = task.created_at.clone();
    }
    if !task.status.is_terminal() {
        task.status = TaskStatus::Failed;
        task.error = Some(TaskError {
            message: messages.task_error.clone(),
            reason: Some("process_restart".to_string()),
        });
        task.completed_at = Some(task.updated_at.clone());
        for step in &mut task.steps {
            if !step.status.is_terminal() {
                step.status = StepStatus::Failed;
                step.completed_at = Some(task.updated_at.clone());
                step.logs.push(StepLog {
                    id: uuid::Uuid::new_v4().to_string(),
                    message: messages.step_log.clone(),
                    timestamp: now_rfc3339(),
                });
            }
        }
    } else if task.completed_at.is_none() {
        task.completed_at = Some(task.updated_at.clone());
    }
}

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

/// Atomic, debounced JSON snapshot of the task roster at
/// `<workdir>/.terminal-worktree/tasks.json`.
pub struct TaskStore {
    path: PathBuf,
    debounce: Duration,
    pending: Mutex<bool>,
    restart_messages: RestartMessages,
    write_lock: tokio::sync::Mutex<()>,
}

impl TaskStore {
    pub fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            debounce: DEFAULT_DEBOUNCE,
            pending: Mutex::new(false),
            restart_messages: RestartMessages::default(),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn for_workdir(workdir: &Path) -> Arc<Self> {
        Self::new(workdir.join(TASKS_DIR).join(TASKS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. Accepts the `{version, tasks}` envelope or a bare
    /// legacy array; individually malformed entries are dropped.
    pub fn load(&self) -> Vec<Task> {
        let Ok(data) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let Ok(root) = serde_json::from_str::<Value>(&data) else {
            tracing::warn!("ignoring malformed task snapshot at {:?}", self.path);
            return Vec::new();
        };
        let entries = match root.get("tasks").and_then(Value::as_array) {
            Some(list) => list.clone(),
            None => root.as_array().cloned().unwrap_or_default(),
        };
        entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<Task>(entry).ok())
            .filter(|t| !t.id.is_empty())
            .collect()
    }

    async fn save(&self, tasks: &[Task]) {
        let _guard = self.write_lock.lock().await;
        let payload = serde_json::json!({
            "version": 1,
            "generatedAt": now_rfc3339(),
            "tasks": tasks,
        });
        if let Err(e) = write_atomic(&self.path, &payload) {
            tracing::warn!("failed to persist tasks to {:?}: {e}", self.path);
        }
    }
}

fn write_atomic(path: &Path, payload: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, serde_json::to_string_pretty(payload)?)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        // Let spawned task handlers and debounced writes run.
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_lifecycle_reaches_succeeded_with_result() {
        let tracker = TaskTracker::new(EventBus::new());
        let id = tracker.run_task(
            TaskSpec {
                task_type: "create_worktree".into(),
                title: Some("Create worktree".into()),
                metadata: None,
            },
            |ctx| async move {
                ctx.ensure_step("clone", Some("Clone repository"));
                ctx.start_step("clone");
                ctx.log_step("clone", "cloning");
                ctx.log_step("clone", "   ");
                ctx.complete_step("clone");
                ctx.skip_step("hooks");
                Ok(Some(serde_json::json!({"path": "/tmp/wt"})))
            },
        );
        settle().await;

        let task = tracker.get_task(&id).expect("task exists");
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_ref().unwrap()["path"], "/tmp/wt");
        let clone = task.steps.iter().find(|s| s.id == "clone").unwrap();
        assert_eq!(clone.status, StepStatus::Succeeded);
        assert_eq!(clone.logs.len(), 1, "empty log lines are dropped");
        let hooks = task.steps.iter().find(|s| s.id == "hooks").unwrap();
        assert_eq!(hooks.status, StepStatus::Skipped);
        assert!(hooks.completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_error_fails_the_task() {
        let tracker = TaskTracker::new(EventBus::new());
        let id = tracker.run_task(
            TaskSpec {
                task_type: "generate_branch_name".into(),
                ..Default::default()
            },
            |_ctx| async move { Err(anyhow::anyhow!("llm unavailable")) },
        );
        settle().await;

        let task = tracker.get_task(&id).expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_ref().unwrap().message, "llm unavailable");
        assert!(task.completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_tasks_expire_after_ttl() {
        let tracker = TaskTracker::new(EventBus::new());
        let stale = Task {
            id: "stale".into(),
            task_type: "noop".into(),
            status: TaskStatus::Succeeded,
            created_at: "2026-01-01T00:00:00+00:00".into(),
            updated_at: "2026-01-01T00:00:00+00:00".into(),
            completed_at: Some("2026-01-01T00:00:00+00:00".into()),
            ..Default::default()
        };
        tracker.lock_tasks().insert(stale.id.clone(), stale);
        assert!(tracker.list_tasks().is_empty());
        assert!(tracker.get_task("stale").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_rehydration_fails_running_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_workdir(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).expect("mkdir");
        std::fs::write(
            store.path(),
            r#"{
                "version": 1,
                "tasks": [{
                    "id": "restored",
                    "type": "create_worktree",
                    "status": "running",
                    "createdAt": "2026-08-01T10:00:00+00:00",
                    "updatedAt": "2026-08-01T10:00:05+00:00",
                    "steps": [{
                        "id": "s1",
                        "status": "running",
                        "logs": [{"message": "progressing"}]
                    }]
                }]
            }"#,
        )
        .expect("write snapshot");

        let tracker = TaskTracker::new(EventBus::new());
        tracker.configure_persistence(store).await;

        let tasks = tracker.list_tasks();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.as_ref().expect("restart error");
        assert_eq!(error.reason.as_deref(), Some("process_restart"));
        assert_eq!(task.completed_at.as_deref(), Some("2026-08-01T10:00:05+00:00"));
        assert_eq!(task.steps[0].status, StepStatus::Failed);
        let restart_log = task.steps[0]
            .logs
            .iter()
            .any(|l| l.message.to_lowercase().contains("step marked as failed"));
        assert!(restart_log, "restart log line appended");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminal_tasks_survive_persist_and_load_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_workdir(dir.path());
        let done = Task {
            id: "done".into(),
            task_type: "create_worktree".into(),
            title: "Create worktree".into(),
            status: TaskStatus::Succeeded,
            created_at: "2026-08-01T10:00:00+00:00".into(),
            updated_at: "2026-08-01T10:00:10+00:00".into(),
            completed_at: Some("2026-08-01T10:00:10+00:00".into()),
            result: Some(serde_json::json!({"ok": true})),
            ..Default::default()
        };
        store.save(std::slice::from_ref(&done)).await;

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[0];
        assert_eq!(restored.id, done.id);
        assert_eq!(restored.status, TaskStatus::Succeeded);
        assert_eq!(restored.completed_at, done.completed_at);
        assert_eq!(restored.result, done.result);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn legacy_bare_array_snapshots_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_workdir(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).expect("mkdir");
        std::fs::write(
            store.path(),
            r#"[{"id": "legacy", "type": "noop", "status": "succeeded",
                 "createdAt": "2026-08-01T10:00:00+00:00",
                 "updatedAt": "2026-08-01T10:00:00+00:00",
                 "completedAt": "2026-08-01T10:00:00+00:00"}]"#,
        )
        .expect("write snapshot");
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "legacy");
    }
}
