//! Double-indexed session registry: a by-key bucket map and a by-id map kept
//! in lockstep under one lock, so roster snapshots observe a consistent view.
//! Buckets also own the per-key label counters; both die with the bucket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::{Session, SessionId, SessionTool, WorktreeSessionSummary};

#[derive(Default)]
struct LabelCounters {
    terminal: u32,
    agent: u32,
}

impl LabelCounters {
    fn slot(&mut self, tool: SessionTool) -> &mut u32 {
        match tool {
            SessionTool::Terminal => &mut self.terminal,
            SessionTool::Agent => &mut self.agent,
        }
    }
}

struct Bucket {
    /// Insertion order; roster entries list sessions oldest-first.
    sessions: Vec<Arc<Session>>,
    counters: LabelCounters,
}

impl Bucket {
    fn new() -> Self {
        Self {
            sessions: Vec::new(),
            counters: LabelCounters::default(),
        }
    }
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<String, Bucket>,
    by_id: HashMap<SessionId, Arc<Session>>,
}

/// Exclusive owner of all live sessions.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Allocate the next label for a key: "Terminal 1", "Agent 2", … The
    /// counter survives until its bucket empties.
    pub fn allocate_label(&self, key: &str, tool: SessionTool) -> String {
        let mut inner = self.lock();
        let bucket = inner
            .by_key
            .entry(key.to_string())
            .or_insert_with(Bucket::new);
        let slot = bucket.counters.slot(tool);
        *slot += 1;
        format!("{} {}", tool.label_prefix(), slot)
    }

    /// Give back a label whose session never materialised (spawn failure).
    /// The counter is only rewound when this was the most recent allocation;
    /// a bucket left with no sessions and no outstanding labels is dropped.
    pub fn release_label(&self, key: &str, tool: SessionTool, label: &str) {
        let mut inner = self.lock();
        let Some(bucket) = inner.by_key.get_mut(key) else {
            return;
        };
        if let Some(n) = label_number(label, tool) {
            let slot = bucket.counters.slot(tool);
            if *slot == n {
                *slot = n - 1;
            }
        }
        if bucket.sessions.is_empty()
            && bucket.counters.terminal == 0
            && bucket.counters.agent == 0
        {
            inner.by_key.remove(key);
        }
    }

    /// Insert a session into both indices. A restored label like "Terminal 3"
    /// bumps the counter so later allocations never collide with it.
    pub fn insert(&self, session: Arc<Session>) {
        let mut inner = self.lock();
        let bucket = inner
            .by_key
            .entry(session.key.clone())
            .or_insert_with(Bucket::new);
        if let Some(n) = label_number(&session.label, session.tool) {
            let slot = bucket.counters.slot(session.tool);
            if *slot < n {
                *slot = n;
            }
        }
        bucket.sessions.push(session.clone());
        inner.by_id.insert(session.id, session);
    }

    /// Remove a session from both indices. Dropping the last member of a
    /// bucket drops the bucket and its counters.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let session = inner.by_id.remove(id)?;
        let empty = match inner.by_key.get_mut(&session.key) {
            Some(bucket) => {
                bucket.sessions.retain(|s| s.id != *id);
                bucket.sessions.is_empty()
            }
            None => false,
        };
        if empty {
            inner.by_key.remove(&session.key);
        }
        Some(session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.lock().by_id.get(id).cloned()
    }

    pub fn sessions_for_key(&self, key: &str) -> Vec<Arc<Session>> {
        self.lock()
            .by_key
            .get(key)
            .map(|b| b.sessions.clone())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.lock().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One consistent roster snapshot: every live (non-closed) session,
    /// grouped by key. Entry idle is the AND of member idles; entry activity
    /// is the max across members.
    pub fn summaries(&self) -> Vec<WorktreeSessionSummary> {
        let inner = self.lock();
        let mut keys: Vec<&String> = inner.by_key.keys().collect();
        keys.sort();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let bucket = &inner.by_key[key];
            let mut snapshots = Vec::new();
            let mut all_idle = true;
            let mut last_activity = None;
            let mut triple = None;
            for session in &bucket.sessions {
                if session.is_closed() {
                    continue;
                }
                let (idle, activity) = session.activity();
                all_idle &= idle;
                last_activity = Some(match last_activity {
                    Some(prev) if prev >= activity => prev,
                    _ => activity,
                });
                triple.get_or_insert_with(|| {
                    (
                        session.org.clone(),
                        session.repo.clone(),
                        session.branch.clone(),
                    )
                });
                snapshots.push(session.snapshot());
            }
            let Some((org, repo, branch)) = triple else {
                continue;
            };
            let last_activity_at = last_activity
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            out.push(WorktreeSessionSummary {
                org,
                repo,
                branch,
                idle: all_idle,
                last_activity_at,
                sessions: snapshots,
            });
        }
        out
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the trailing number of a label minted by [`allocate_label`].
fn label_number(label: &str, tool: SessionTool) -> Option<u32> {
    let rest = label.strip_prefix(tool.label_prefix())?.trim();
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_increment_per_tool_and_reset_with_bucket() {
        let registry = SessionRegistry::new();
        let key = "acme::widget::main";
        assert_eq!(registry.allocate_label(key, SessionTool::Terminal), "Terminal 1");
        assert_eq!(registry.allocate_label(key, SessionTool::Terminal), "Terminal 2");
        assert_eq!(registry.allocate_label(key, SessionTool::Agent), "Agent 1");
        // Counters are independent per key.
        assert_eq!(
            registry.allocate_label("acme::other::main", SessionTool::Terminal),
            "Terminal 1"
        );
        // Bucket was created by allocation alone; empty-session buckets do
        // not leak into summaries.
        assert!(registry.summaries().is_empty());
    }

    #[test]
    fn released_labels_do_not_burn_slots() {
        let registry = SessionRegistry::new();
        let key = "acme::widget::main";
        let label = registry.allocate_label(key, SessionTool::Terminal);
        assert_eq!(label, "Terminal 1");
        registry.release_label(key, SessionTool::Terminal, &label);
        // The orphan bucket is gone and the slot is reusable.
        assert_eq!(registry.allocate_label(key, SessionTool::Terminal), "Terminal 1");
    }

    #[test]
    fn release_after_a_newer_allocation_keeps_the_counter() {
        let registry = SessionRegistry::new();
        let key = "acme::widget::main";
        let first = registry.allocate_label(key, SessionTool::Terminal);
        let second = registry.allocate_label(key, SessionTool::Terminal);
        assert_eq!(second, "Terminal 2");
        // Rolling back the stale allocation must not re-issue "Terminal 2".
        registry.release_label(key, SessionTool::Terminal, &first);
        assert_eq!(registry.allocate_label(key, SessionTool::Terminal), "Terminal 3");
    }

    #[test]
    fn restored_labels_bump_counters() {
        assert_eq!(label_number("Terminal 3", SessionTool::Terminal), Some(3));
        assert_eq!(label_number("Agent 12", SessionTool::Agent), Some(12));
        assert_eq!(label_number("Terminal", SessionTool::Terminal), None);
        assert_eq!(label_number("Agent x", SessionTool::Agent), None);
    }
}
