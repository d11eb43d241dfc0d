//! Portable PTY: spawn a shell (or a tmux client) inside a worktree and
//! bridge its I/O. The child is wrapped in a Mutex so a thread can poll
//! try_wait() while kill() stays available; output is pumped from a blocking
//! reader thread into an async channel.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::error::{Result, WorkbenchError};

/// Default terminal dimensions for fresh sessions.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 36;

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub enum SpawnTarget {
    /// The user's shell ($SHELL, /bin/bash fallback), login + interactive.
    Shell,
    /// A tmux client: `tmux new-session -A -s <name>` (attach-or-create),
    /// so the underlying shell survives server restarts.
    Tmux { session_name: String },
}

/// Signals the engine delivers to the PTY child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtySignal {
    Term,
    Kill,
}

impl PtySignal {
    pub fn name(&self) -> &'static str {
        match self {
            PtySignal::Term => "SIGTERM",
            PtySignal::Kill => "SIGKILL",
        }
    }
}

/// Exit report from the child, sent exactly once on the exit channel.
#[derive(Debug, Clone)]
pub struct PtyExit {
    pub code: Option<i32>,
}

/// A live PTY child: writer for input, resize, signal delivery. The reader
/// and exit-poll threads are detached; they end when the child does.
pub struct PtyProcess {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    size: Mutex<(u16, u16)>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Write raw bytes to the child's stdin. Callers treat failures as
    /// non-fatal; the exit channel is the source of truth for liveness.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer mutex poisoned"))?;
        guard.write_all(data)?;
        guard.flush()
    }

    /// Resize the terminal; remembered for subsequent ready frames.
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Ok(mut size) = self.size.lock() {
            *size = (cols, rows);
        }
        if let Ok(master) = self.master.lock() {
            let _ = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    /// Current (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        self.size
            .lock()
            .map(|s| *s)
            .unwrap_or((DEFAULT_COLS, DEFAULT_ROWS))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver a signal to the child. On Unix this targets the child's pid
    /// directly; elsewhere (or with no pid) it falls back to a hard kill.
    pub fn signal(&self, sig: PtySignal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let signal = match sig {
                PtySignal::Term => Signal::SIGTERM,
                PtySignal::Kill => Signal::SIGKILL,
            };
            let _ = kill(Pid::from_raw(pid as i32), signal);
            return;
        }
        let _ = sig;
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }

    /// True once the child has been reaped.
    pub fn has_exited(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(Some(_))),
            Err(_) => true,
        }
    }
}

/// Spawn a process attached to a fresh PTY. Returns the process handle plus
/// the output stream and the one-shot exit stream.
pub fn spawn_pty(
    target: &SpawnTarget,
    cwd: &Path,
) -> Result<(PtyProcess, mpsc::Receiver<Bytes>, mpsc::Receiver<PtyExit>)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| WorkbenchError::external(format!("Failed to open PTY: {e}")))?;

    let cmd = build_command(target, cwd);
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| WorkbenchError::external(format!("Failed to spawn PTY child: {e}")))?;
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| WorkbenchError::external(format!("Failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| WorkbenchError::external(format!("Failed to take PTY writer: {e}")))?;

    let child = Arc::new(Mutex::new(child));
    let (data_tx, data_rx) = mpsc::channel::<Bytes>(256);
    let (exit_tx, exit_rx) = mpsc::channel::<PtyExit>(1);

    // Blocking thread: read PTY output and hand chunks to the async side.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if data_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Poll try_wait(); report the exit exactly once.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let status = {
            let mut guard = match child_poll.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(s)) => Some(s),
                Err(_) => break,
            }
        };
        if let Some(status) = status {
            let _ = exit_tx.blocking_send(PtyExit {
                code: Some(status.exit_code() as i32),
            });
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    let process = PtyProcess {
        writer: Arc::new(Mutex::new(writer)),
        child,
        master: Arc::new(Mutex::new(pair.master)),
        size: Mutex::new((DEFAULT_COLS, DEFAULT_ROWS)),
        pid,
    };
    Ok((process, data_rx, exit_rx))
}

/// Shell for interactive sessions: $SHELL, /bin/bash fallback.
fn select_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

fn shell_basename(shell: &str) -> &str {
    shell.rsplit('/').next().unwrap_or(shell)
}

/// Build the child command with a normalised terminal environment: a modern
/// 256-colour/truecolor terminal, a UTF-8 locale, and no inherited tmux
/// nesting markers.
fn build_command(target: &SpawnTarget, cwd: &Path) -> CommandBuilder {
    let mut cmd = match target {
        SpawnTarget::Shell => {
            let shell = select_shell();
            let mut c = CommandBuilder::new(&shell);
            if matches!(shell_basename(&shell), "bash" | "zsh" | "fish") {
                c.arg("-l");
                c.arg("-i");
            }
            c
        }
        SpawnTarget::Tmux { session_name } => {
            let mut c = CommandBuilder::new("tmux");
            c.args(["new-session", "-A", "-s", session_name]);
            c.arg("-c");
            c.arg(cwd);
            c
        }
    };
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env("FORCE_COLOR", "1");
    for (key, value) in utf8_locale_env() {
        cmd.env(key, value);
    }
    cmd.env_remove("TMUX");
    cmd.env_remove("TMUX_PANE");
    cmd
}

/// Coerce LANG/LC_ALL/LC_CTYPE to a UTF-8 locale, keeping any UTF-8 value
/// already present in the host environment.
fn utf8_locale_env() -> Vec<(&'static str, String)> {
    ["LANG", "LC_ALL", "LC_CTYPE"]
        .into_iter()
        .map(|key| {
            let value = std::env::var(key)
                .ok()
                .filter(|v| is_utf8_locale(v))
                .unwrap_or_else(|| "en_US.UTF-8".to_string());
            (key, value)
        })
        .collect()
}

fn is_utf8_locale(value: &str) -> bool {
    let v = value.to_lowercase();
    v.contains("utf-8") || v.contains("utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_locale_values_are_kept() {
        assert!(is_utf8_locale("en_GB.UTF-8"));
        assert!(is_utf8_locale("C.utf8"));
        assert!(!is_utf8_locale("POSIX"));
        assert!(!is_utf8_locale("en_US.ISO8859-1"));
    }

    #[test]
    fn shell_basename_handles_paths() {
        assert_eq!(shell_basename("/usr/bin/zsh"), "zsh");
        assert_eq!(shell_basename("bash"), "bash");
    }

    #[test]
    fn signal_names_are_posix() {
        assert_eq!(PtySignal::Term.name(), "SIGTERM");
        assert_eq!(PtySignal::Kill.name(), "SIGKILL");
    }
}
