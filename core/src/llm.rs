//! Bounded LLM command execution: hard wall-clock timeouts, output caps and
//! caller-driven cancellation. Overflow, timeout or cancellation kills the
//! child's whole process group on POSIX (direct kill elsewhere) and yields a
//! structured error. Branch-name generation sits on top.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::{Result, WorkbenchError};

/// Limits for branch-name generation commands.
pub const BRANCH_NAME_LIMITS: CommandLimits = CommandLimits {
    timeout: Duration::from_secs(30),
    max_output_bytes: 512 * 1024,
};

/// Limits for plan generation commands.
pub const PLAN_LIMITS: CommandLimits = CommandLimits {
    timeout: Duration::from_secs(5 * 60),
    max_output_bytes: 2 * 1024 * 1024,
};

#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Cancellation token: the caller flips it, the running command observes it
/// at its next suspension point and tears the child down.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Kill the child and, on POSIX, its whole process group so shell pipelines
/// die with it.
async fn kill_child_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

/// Run a shell command with bounded output and wall-clock time. `stdin_text`
/// is written to the child's stdin before reading. Returns captured stdout.
pub async fn run_capped_command(
    command: &str,
    stdin_text: Option<&str>,
    limits: CommandLimits,
    cancel: Option<&CancelToken>,
) -> Result<String> {
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", command])
        .stdin(if stdin_text.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| WorkbenchError::external(format!("Failed to run {command:?}: {e}")))?;

    if let Some(text) = stdin_text {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(text.as_bytes()).await;
            // Dropping closes the pipe so the child sees EOF.
        }
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| WorkbenchError::internal("child stdout not captured".to_string()))?;

    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);
    let mut output = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        output.extend_from_slice(&buf[..n]);
                        if output.len() > limits.max_output_bytes {
                            kill_child_group(&mut child).await;
                            return Err(WorkbenchError::external(format!(
                                "Command output exceeded {} bytes", limits.max_output_bytes
                            )));
                        }
                    }
                    Err(e) => {
                        kill_child_group(&mut child).await;
                        return Err(WorkbenchError::external(format!(
                            "Failed reading command output: {e}"
                        )));
                    }
                }
            }
            _ = &mut deadline => {
                kill_child_group(&mut child).await;
                return Err(WorkbenchError::Timeout(format!(
                    "Command timed out after {:?}", limits.timeout
                )));
            }
            _ = cancelled(cancel) => {
                kill_child_group(&mut child).await;
                return Err(WorkbenchError::Cancelled("Command was cancelled".to_string()));
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| WorkbenchError::external(format!("Failed to reap command: {e}")))?;
    if !status.success() {
        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text).await;
        }
        let trimmed = stderr_text.trim();
        let message = if trimmed.is_empty() {
            format!("Command exited with {status}")
        } else {
            trimmed.to_string()
        };
        return Err(WorkbenchError::external(message));
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

async fn cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Ask an LLM command for a branch name for `description`. Any failure is
/// wrapped with the command name; an answer equal to "main" is refused
/// regardless of what the model said.
pub async fn generate_branch_name(
    llm: &str,
    description: &str,
    cancel: Option<&CancelToken>,
) -> Result<String> {
    let prompt = format!(
        "Suggest a short git branch name (kebab-case, no prefix) for this change. \
         Answer with the name only.\n\n{description}\n"
    );
    let raw = run_capped_command(llm, Some(&prompt), BRANCH_NAME_LIMITS, cancel)
        .await
        .map_err(|e| match e {
            WorkbenchError::Cancelled(m) => WorkbenchError::Cancelled(m),
            WorkbenchError::Timeout(m) => WorkbenchError::Timeout(m),
            other => WorkbenchError::external(format!(
                "Failed to generate branch name using {llm}: {other}"
            )),
        })?;
    let name = sanitize_branch_name(&raw);
    if name.is_empty() {
        return Err(WorkbenchError::external(format!(
            "Failed to generate branch name using {llm}: empty answer"
        )));
    }
    if name == "main" {
        return Err(WorkbenchError::precondition(
            "Generated branch name resolves to \"main\"".to_string(),
        ));
    }
    Ok(name)
}

/// First line of the answer, lowercased, non `[a-z0-9._/-]` squashed to `-`.
pub fn sanitize_branch_name(raw: &str) -> String {
    let line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let lowered = line.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-') {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    let collapsed: String = {
        let mut acc = String::with_capacity(out.len());
        for c in out.chars() {
            if c == '-' && acc.ends_with('-') {
                continue;
            }
            acc.push(c);
        }
        acc
    };
    collapsed.trim_matches('-').to_string()
}
