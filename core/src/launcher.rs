//! Agent launcher: spin up an isolated automation session, write the plan
//! file, inject the prompt through tmux environment (or a shell export
//! fallback), and queue the agent command line as terminal input.

use std::sync::Arc;

use crate::config;
use crate::error::{Result, WorkbenchError};
use crate::terminal::TerminalEngine;
use crate::tmux;
use crate::worktree::write_plan_file;

/// Environment variable carrying the prompt into agent processes.
pub const PROMPT_ENV: &str = "AGENTRIX_PROMPT";

/// Request to launch an agent into a fresh automation session.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub command: String,
    pub workdir: std::path::PathBuf,
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub prompt: String,
}

/// What the caller gets back: enough to find and observe the session.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResult {
    pub pid: Option<u32>,
    pub command: String,
    pub session_id: String,
    pub tmux_session_name: Option<String>,
    pub using_tmux: bool,
    pub created_session: bool,
}

/// POSIX single-quote escaping: the value is wrapped in single quotes with
/// every embedded `'` spelled `'\''`.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Normalise text for terminal input: `\r\n` → `\n`, then every `\n` → `\r`,
/// with a trailing `\r` guaranteed so the shell executes the line.
pub fn normalize_terminal_input(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n").replace('\n', "\r");
    if !out.ends_with('\r') {
        out.push('\r');
    }
    out
}

/// Shell statement that exports (or unsets) the prompt variable, used when
/// tmux cannot carry it.
fn prompt_export_statement(prompt: &str) -> String {
    if prompt.is_empty() {
        format!("unset {PROMPT_ENV}")
    } else {
        format!("export {PROMPT_ENV}={}", shell_quote(prompt))
    }
}

/// Launch an agent process in a fresh automation session for the triple.
///
/// The plan is written to `.plans/` inside the worktree (failures logged,
/// launch proceeds). The prompt reaches the agent through the tmux session
/// environment when possible, through a shell export queued ahead of the
/// command otherwise.
pub async fn launch_agent_process(
    engine: &Arc<TerminalEngine>,
    req: LaunchRequest,
) -> Result<LaunchResult> {
    let command = req.command.trim();
    if command.is_empty() {
        return Err(WorkbenchError::precondition("command is required".to_string()));
    }
    if req.workdir.as_os_str().is_empty()
        || req.org.trim().is_empty()
        || req.repo.trim().is_empty()
        || req.branch.trim().is_empty()
    {
        return Err(WorkbenchError::precondition(
            "workdir, org, repo and branch are required".to_string(),
        ));
    }

    let session = engine
        .create_isolated_terminal_session(&req.workdir, &req.org, &req.repo, &req.branch)
        .await?;

    let prompt = req.prompt.as_str();
    if !prompt.is_empty() {
        let retain = config::ensure_loaded().plan_retention;
        if let Err(e) = write_plan_file(&session.worktree_path, &req.branch, prompt, retain) {
            tracing::warn!("plan write failed for {}/{}: {e}", req.org, req.repo);
        }
    }

    let export_statement = prepare_prompt_env(&session.tmux_session_name, session.using_tmux, prompt).await;
    if let Some(statement) = export_statement {
        engine.enqueue_input(&session, normalize_terminal_input(&statement).as_bytes());
    }

    let command_line = if prompt.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", shell_quote(prompt))
    };
    engine.enqueue_input(&session, normalize_terminal_input(&command_line).as_bytes());

    Ok(LaunchResult {
        pid: session.pty.pid(),
        command: command_line,
        session_id: session.id.to_string(),
        tmux_session_name: session.tmux_session_name.clone(),
        using_tmux: session.using_tmux,
        created_session: true,
    })
}

/// Put the prompt into the session's environment. Returns a shell statement
/// to queue when tmux could not (or should not) carry it.
async fn prepare_prompt_env(
    tmux_session_name: &Option<String>,
    using_tmux: bool,
    prompt: &str,
) -> Option<String> {
    if using_tmux {
        if let Some(name) = tmux_session_name {
            let value = if prompt.is_empty() { None } else { Some(prompt) };
            match tmux::set_environment(name, PROMPT_ENV, value).await {
                Ok(()) => return None,
                Err(e) => {
                    tracing::warn!("tmux set-environment on {name} failed, falling back: {e}");
                }
            }
        }
    }
    Some(prompt_export_statement(prompt))
}
