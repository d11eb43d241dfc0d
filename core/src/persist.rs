//! Session roster persistence: atomic writes of the sanitised roster to
//! ~/.agentrix/sessions.json, serialised on a single-writer queue. Failures
//! are logged and never surface into the event path.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::config;
use crate::session::{SessionKind, SessionTool, SessionSnapshot, WorktreeSessionSummary};

const SESSIONS_FILE: &str = "sessions.json";

/// Persistent store for the session roster.
pub struct SessionStore {
    path: PathBuf,
    /// Single-writer queue: persists chain onto the tail in call order.
    write_queue: tokio::sync::Mutex<()>,
    /// Serialised roster of the last successful write, for duplicate elision.
    last_payload: std::sync::Mutex<Option<String>>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_queue: tokio::sync::Mutex::new(()),
            last_payload: std::sync::Mutex::new(None),
        }
    }

    /// Default location: ~/.agentrix/sessions.json.
    pub fn at_default_path() -> Self {
        Self::new(config::state_dir().join(SESSIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the roster. Chained onto the single-writer queue; a payload
    /// identical to the last successful write is elided. Errors are logged,
    /// never raised.
    pub async fn persist(&self, summaries: &[WorktreeSessionSummary]) {
        let roster = match serde_json::to_string(summaries) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to serialise session roster: {e}");
                return;
            }
        };

        let _queue = self.write_queue.lock().await;
        {
            let last = self.last_payload.lock().unwrap_or_else(|p| p.into_inner());
            if last.as_deref() == Some(roster.as_str()) {
                return;
            }
        }
        let payload = build_payload(summaries);
        if let Err(e) = write_atomic(&self.path, &payload) {
            tracing::warn!("failed to persist sessions to {:?}: {e}", self.path);
            return;
        }
        let mut last = self.last_payload.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(roster);
    }

    /// Load and sanitise the last persisted roster. Missing or malformed
    /// files yield an empty roster.
    pub fn load(&self) -> Vec<WorktreeSessionSummary> {
        let Ok(data) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let Ok(root) = serde_json::from_str::<Value>(&data) else {
            tracing::warn!("ignoring malformed session snapshot at {:?}", self.path);
            return Vec::new();
        };
        let Some(entries) = root.get("summaries").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        entries.iter().filter_map(sanitize_summary).collect()
    }
}

/// Full state-file payload: nested org → repo → worktrees view plus the flat
/// summaries array consumers actually read back.
fn build_payload(summaries: &[WorktreeSessionSummary]) -> Value {
    let mut orgs: Map<String, Value> = Map::new();
    for summary in summaries {
        let org = orgs
            .entry(summary.org.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        let repo = org
            .as_object_mut()
            .expect("org entry is an object")
            .entry(summary.repo.clone())
            .or_insert_with(|| json!({ "worktrees": {} }));
        if let Some(worktrees) = repo
            .get_mut("worktrees")
            .and_then(|w| w.as_object_mut())
        {
            worktrees.insert(
                summary.branch.clone(),
                json!({
                    "branch": summary.branch,
                    "idle": summary.idle,
                    "lastActivityAt": summary.last_activity_at,
                    "sessions": summary.sessions,
                }),
            );
        }
    }
    json!({
        "version": 1,
        "generatedAt": chrono::Utc::now().to_rfc3339(),
        "orgs": orgs,
        "summaries": summaries,
    })
}

/// Write to a temp file in the same directory, then rename into place. A
/// failed rename leaves nothing behind (best-effort temp removal).
fn write_atomic(path: &Path, payload: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_string_pretty(payload)?;
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn sanitize_summary(value: &Value) -> Option<WorktreeSessionSummary> {
    let org = value.get("org")?.as_str()?.to_string();
    let repo = value.get("repo")?.as_str()?.to_string();
    let branch = value.get("branch")?.as_str()?.to_string();
    if org.is_empty() || repo.is_empty() || branch.is_empty() {
        return None;
    }
    let idle = value.get("idle").and_then(Value::as_bool).unwrap_or(false);
    let last_activity_at = string_or_empty(value.get("lastActivityAt"));
    let sessions = value
        .get("sessions")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(sanitize_session).collect())
        .unwrap_or_default();
    Some(WorktreeSessionSummary {
        org,
        repo,
        branch,
        idle,
        last_activity_at,
        sessions,
    })
}

fn sanitize_session(value: &Value) -> Option<SessionSnapshot> {
    let id = value.get("id")?.as_str()?.trim().to_string();
    if id.is_empty() {
        return None;
    }
    let label = value
        .get("label")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Terminal")
        .to_string();
    let kind = match value.get("kind").and_then(Value::as_str) {
        Some("automation") => SessionKind::Automation,
        _ => SessionKind::Interactive,
    };
    let tool = match value.get("tool").and_then(Value::as_str) {
        Some("agent") => SessionTool::Agent,
        _ => SessionTool::Terminal,
    };
    let using_tmux = value
        .get("usingTmux")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let tmux_session_name = value
        .get("tmuxSessionName")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());
    let idle = value.get("idle").and_then(Value::as_bool).unwrap_or(false);
    Some(SessionSnapshot {
        id,
        label,
        kind,
        tool,
        using_tmux,
        tmux_session_name,
        idle,
        created_at: string_or_empty(value.get("createdAt")),
        last_activity_at: string_or_empty(value.get("lastActivityAt")),
    })
}

fn string_or_empty(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(branch: &str) -> WorktreeSessionSummary {
        WorktreeSessionSummary {
            org: "acme".into(),
            repo: "widget".into(),
            branch: branch.into(),
            idle: false,
            last_activity_at: "2026-08-01T10:00:00+00:00".into(),
            sessions: vec![SessionSnapshot {
                id: "abc".into(),
                label: "Terminal 1".into(),
                kind: SessionKind::Interactive,
                tool: SessionTool::Terminal,
                using_tmux: true,
                tmux_session_name: Some("tw-acme--widget--main".into()),
                idle: false,
                created_at: "2026-08-01T09:00:00+00:00".into(),
                last_activity_at: "2026-08-01T10:00:00+00:00".into(),
            }],
        }
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));
        let roster = vec![summary("main")];
        store.persist(&roster).await;

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].branch, "main");
        assert_eq!(loaded[0].sessions[0].label, "Terminal 1");
        assert!(loaded[0].sessions[0].using_tmux);
    }

    #[tokio::test]
    async fn duplicate_payloads_are_elided() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let store = SessionStore::new(path.clone());
        let roster = vec![summary("main")];

        store.persist(&roster).await;
        let first = std::fs::read_to_string(&path).expect("first write");
        store.persist(&roster).await;
        let second = std::fs::read_to_string(&path).expect("file still there");
        // Identical roster → the second write is skipped, so even the
        // generatedAt stamp is unchanged.
        assert_eq!(first, second);

        store.persist(&[summary("other")]).await;
        let third = std::fs::read_to_string(&path).expect("third write");
        assert_ne!(first, third);
    }

    #[test]
    fn load_drops_malformed_entries_and_defaults_label() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{
                "version": 1,
                "summaries": [
                    {"org": "acme", "repo": "widget", "branch": "main",
                     "idle": "not-a-bool",
                     "sessions": [
                        {"id": "s1", "label": "  ", "kind": "bogus", "tool": "agent",
                         "usingTmux": 1, "createdAt": 42},
                        {"label": "no id"}
                     ]},
                    {"org": "missing-repo"}
                ]
            }"#,
        )
        .expect("write fixture");
        let store = SessionStore::new(path);
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        let entry = &loaded[0];
        assert!(!entry.idle);
        assert_eq!(entry.sessions.len(), 1);
        let s = &entry.sessions[0];
        assert_eq!(s.label, "Terminal");
        assert_eq!(s.kind, SessionKind::Interactive);
        assert_eq!(s.tool, SessionTool::Agent);
        assert!(!s.using_tmux);
        assert_eq!(s.created_at, "");
    }

    #[test]
    fn load_of_missing_file_is_empty() {
        let store = SessionStore::new(PathBuf::from("/nonexistent/sessions.json"));
        assert!(store.load().is_empty());
    }
}
