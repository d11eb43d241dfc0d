//! Codex CLI transport — NDJSON event stream wrapper.
//!
//! Spawns the Codex CLI in streaming mode and provides:
//! - process lifecycle (spawn, shutdown)
//! - one serialised turn at a time via `run_streamed`
//! - typed upstream events parsed from stdout NDJSON
//!
//! This module knows nothing about transcripts or persistence; the session
//! layer in `agent/mod.rs` consumes the event stream and builds both.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

// ---------------------------------------------------------------------------
// Upstream event types — Codex CLI stream → structured Rust events
// ---------------------------------------------------------------------------

/// Token accounting reported at the end of a turn.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

/// One item in the agent's output stream.
#[derive(Debug, Clone)]
pub enum ThreadItem {
    Reasoning {
        id: String,
        text: String,
    },
    AgentMessage {
        id: String,
        text: String,
    },
    CommandExecution {
        id: String,
        command: String,
        aggregated_output: String,
        exit_code: Option<i32>,
        status: String,
    },
    /// Item types this version does not surface (file changes, web searches).
    Other {
        id: String,
    },
}

impl ThreadItem {
    pub fn id(&self) -> &str {
        match self {
            ThreadItem::Reasoning { id, .. }
            | ThreadItem::AgentMessage { id, .. }
            | ThreadItem::CommandExecution { id, .. }
            | ThreadItem::Other { id } => id,
        }
    }
}

/// Events emitted by the Codex CLI, parsed from stdout NDJSON.
#[derive(Debug, Clone)]
pub enum ThreadEvent {
    ThreadStarted { thread_id: String },
    ItemStarted { item: ThreadItem },
    ItemUpdated { item: ThreadItem },
    ItemCompleted { item: ThreadItem },
    TurnCompleted { usage: Usage },
    TurnFailed { message: String },
    Error { message: String },
}

// ---------------------------------------------------------------------------
// CodexThread — the subprocess handle
// ---------------------------------------------------------------------------

type TurnSender = Arc<Mutex<Option<mpsc::Sender<ThreadEvent>>>>;

/// A running Codex CLI subprocess bound to one working directory.
pub struct CodexThread {
    write_tx: mpsc::Sender<String>,
    child: AsyncMutex<Option<Child>>,
    /// Sender for the turn currently in flight; the reader routes events
    /// here and drops it when the turn ends.
    turn_tx: TurnSender,
    thread_id: Arc<Mutex<Option<String>>>,
}

impl CodexThread {
    /// Spawn the Codex CLI in streaming mode with a fixed working directory.
    /// Events start flowing immediately; the thread id arrives with the
    /// first `thread.started` event.
    pub async fn spawn(cwd: &Path, model: Option<&str>) -> Result<Self, String> {
        let mut cmd = Command::new("codex");
        cmd.args(["proto"]);
        if let Some(model) = model {
            cmd.args(["-m", model]);
        }
        let mut child = cmd
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn codex: {e}"))?;

        let stdin = child.stdin.take().ok_or("No stdin")?;
        let stdout = child.stdout.take().ok_or("No stdout")?;

        // Writer task: drains write_tx → stdin, one JSON line per message.
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let stdin: Arc<AsyncMutex<ChildStdin>> = Arc::new(AsyncMutex::new(stdin));
        let stdin_w = stdin.clone();
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                let mut w = stdin_w.lock().await;
                if w.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if w.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = w.flush().await;
            }
        });

        let turn_tx: TurnSender = Arc::new(Mutex::new(None));
        let thread_id = Arc::new(Mutex::new(None));

        // Reader task: parses stdout NDJSON → ThreadEvent, routed to the
        // in-flight turn.
        let turn_for_reader = turn_tx.clone();
        let thread_id_for_reader = thread_id.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let msg: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let Some(event) = parse_thread_event(&msg) else {
                    continue;
                };
                if let ThreadEvent::ThreadStarted { thread_id } = &event {
                    if let Ok(mut slot) = thread_id_for_reader.lock() {
                        *slot = Some(thread_id.clone());
                    }
                }
                let turn_over = matches!(
                    event,
                    ThreadEvent::TurnCompleted { .. } | ThreadEvent::TurnFailed { .. }
                );
                let sender = turn_for_reader.lock().ok().and_then(|guard| guard.clone());
                if let Some(sender) = sender {
                    let _ = sender.send(event).await;
                }
                if turn_over {
                    if let Ok(mut guard) = turn_for_reader.lock() {
                        guard.take();
                    }
                }
            }
            tracing::debug!("codex stdout reader finished");
        });

        Ok(Self {
            write_tx,
            child: AsyncMutex::new(Some(child)),
            turn_tx,
            thread_id,
        })
    }

    /// Send one user turn and stream its events. The returned channel yields
    /// everything up to and including the turn's completion or failure, then
    /// closes. Callers serialise turns; starting a turn while one is in
    /// flight is an error.
    pub async fn run_streamed(&self, text: &str) -> Result<mpsc::Receiver<ThreadEvent>, String> {
        let (tx, rx) = mpsc::channel::<ThreadEvent>(256);
        {
            let mut guard = self
                .turn_tx
                .lock()
                .map_err(|_| "turn state poisoned".to_string())?;
            if guard.is_some() {
                return Err("a turn is already in flight".to_string());
            }
            *guard = Some(tx);
        }
        let submission = serde_json::json!({
            "type": "user_input",
            "text": text,
        });
        if let Err(e) = self.write_tx.send(submission.to_string()).await {
            if let Ok(mut guard) = self.turn_tx.lock() {
                guard.take();
            }
            return Err(format!("Failed to send user input: {e}"));
        }
        Ok(rx)
    }

    /// Thread id captured from `thread.started`, if seen yet.
    pub fn thread_id(&self) -> Option<String> {
        self.thread_id.lock().ok().and_then(|g| g.clone())
    }

    /// Shut down the subprocess.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers — stream parsing
// ---------------------------------------------------------------------------

fn parse_thread_event(msg: &serde_json::Value) -> Option<ThreadEvent> {
    let msg_type = msg.get("type").and_then(|v| v.as_str())?;
    match msg_type {
        "thread.started" => {
            let thread_id = msg
                .get("thread_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ThreadEvent::ThreadStarted { thread_id })
        }
        "item.started" | "item.updated" | "item.completed" => {
            let item = parse_item(msg.get("item")?)?;
            Some(match msg_type {
                "item.started" => ThreadEvent::ItemStarted { item },
                "item.updated" => ThreadEvent::ItemUpdated { item },
                _ => ThreadEvent::ItemCompleted { item },
            })
        }
        "turn.completed" => {
            let usage = msg.get("usage").map(parse_usage).unwrap_or_default();
            Some(ThreadEvent::TurnCompleted { usage })
        }
        "turn.failed" => {
            let message = msg
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("turn failed")
                .to_string();
            Some(ThreadEvent::TurnFailed { message })
        }
        "error" => {
            let message = msg
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            Some(ThreadEvent::Error { message })
        }
        _ => None,
    }
}

fn parse_item(item: &serde_json::Value) -> Option<ThreadItem> {
    let id = item
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let item_type = item.get("item_type").or_else(|| item.get("type"))?.as_str()?;
    let text = |key: &str| {
        item.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Some(match item_type {
        "reasoning" => ThreadItem::Reasoning {
            id,
            text: text("text"),
        },
        "agent_message" => ThreadItem::AgentMessage {
            id,
            text: text("text"),
        },
        "command_execution" => ThreadItem::CommandExecution {
            id,
            command: text("command"),
            aggregated_output: text("aggregated_output"),
            exit_code: item
                .get("exit_code")
                .and_then(|v| v.as_i64())
                .map(|c| c as i32),
            status: text("status"),
        },
        _ => ThreadItem::Other { id },
    })
}

fn parse_usage(usage: &serde_json::Value) -> Usage {
    let field = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    Usage {
        input_tokens: field("input_tokens"),
        cached_input_tokens: field("cached_input_tokens"),
        output_tokens: field("output_tokens"),
    }
}

/// Accumulates command output per item id so updates can be logged as deltas.
#[derive(Default)]
pub struct CommandOutputAccumulator {
    seen: HashMap<String, usize>,
}

impl CommandOutputAccumulator {
    /// Return the unseen suffix of `aggregated` for this item and remember
    /// the new length.
    pub fn delta(&mut self, item_id: &str, aggregated: &str) -> String {
        let seen = self.seen.entry(item_id.to_string()).or_insert(0);
        if aggregated.len() <= *seen {
            return String::new();
        }
        let delta = aggregated[*seen..].to_string();
        *seen = aggregated.len();
        delta
    }

    pub fn forget(&mut self, item_id: &str) {
        self.seen.remove(item_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thread_and_turn_events() {
        let started: serde_json::Value =
            serde_json::json!({"type": "thread.started", "thread_id": "th_1"});
        assert!(matches!(
            parse_thread_event(&started),
            Some(ThreadEvent::ThreadStarted { thread_id }) if thread_id == "th_1"
        ));

        let completed = serde_json::json!({
            "type": "turn.completed",
            "usage": {"input_tokens": 10, "cached_input_tokens": 3, "output_tokens": 7}
        });
        match parse_thread_event(&completed) {
            Some(ThreadEvent::TurnCompleted { usage }) => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.cached_input_tokens, 3);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let failed = serde_json::json!({
            "type": "turn.failed",
            "error": {"message": "rate limited"}
        });
        assert!(matches!(
            parse_thread_event(&failed),
            Some(ThreadEvent::TurnFailed { message }) if message == "rate limited"
        ));
    }

    #[test]
    fn parses_items_by_type() {
        let reasoning = serde_json::json!({
            "type": "item.completed",
            "item": {"id": "i1", "item_type": "reasoning", "text": "thinking hard"}
        });
        match parse_thread_event(&reasoning) {
            Some(ThreadEvent::ItemCompleted {
                item: ThreadItem::Reasoning { id, text },
            }) => {
                assert_eq!(id, "i1");
                assert_eq!(text, "thinking hard");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let command = serde_json::json!({
            "type": "item.updated",
            "item": {"id": "c1", "item_type": "command_execution",
                     "command": "cargo check", "aggregated_output": "ok",
                     "exit_code": 0, "status": "completed"}
        });
        match parse_thread_event(&command) {
            Some(ThreadEvent::ItemUpdated {
                item:
                    ThreadItem::CommandExecution {
                        command, exit_code, ..
                    },
            }) => {
                assert_eq!(command, "cargo check");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let unknown = serde_json::json!({
            "type": "item.started",
            "item": {"id": "x", "item_type": "file_change"}
        });
        assert!(matches!(
            parse_thread_event(&unknown),
            Some(ThreadEvent::ItemStarted { item: ThreadItem::Other { .. } })
        ));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let v = serde_json::json!({"type": "turn.started"});
        assert!(parse_thread_event(&v).is_none());
    }

    #[test]
    fn accumulator_yields_only_new_output() {
        let mut acc = CommandOutputAccumulator::default();
        assert_eq!(acc.delta("c1", "hel"), "hel");
        assert_eq!(acc.delta("c1", "hello"), "lo");
        assert_eq!(acc.delta("c1", "hello"), "");
        acc.forget("c1");
        assert_eq!(acc.delta("c1", "hello"), "hello");
    }
}
