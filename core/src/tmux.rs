//! Tmux controller: availability probe (cached for the process lifetime),
//! session-name construction/parsing, existence checks, kills, and
//! per-session environment variables. Session names follow
//! `tw-<org>--<repo>--<branch>[--<slug>]` with sanitised components.

use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

use crate::error::{Result, WorkbenchError};

/// Prefix for every tmux session the workbench owns.
pub const SESSION_PREFIX: &str = "tw-";

const COMPONENT_FALLBACK: &str = "x";

/// Probe `tmux -V` once; the result is cached for the process lifetime.
pub fn tmux_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(probe_tmux)
}

fn probe_tmux() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn non_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"))
}

fn dash_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-{2,}").expect("valid regex"))
}

/// Sanitise one name component: whitespace and anything outside
/// `[A-Za-z0-9._-]` becomes `-`, runs of `-` collapse, leading/trailing `-`
/// are stripped, and an empty result falls back to a placeholder.
pub fn sanitize_component(raw: &str) -> String {
    let dashed: String = raw
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect();
    let replaced = non_name_chars().replace_all(&dashed, "-");
    let collapsed = dash_runs().replace_all(&replaced, "-");
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        COMPONENT_FALLBACK.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build the tmux session name for a worktree triple. `slug` forces a unique
/// variant (used when a caller insists on a fresh session for a key that
/// already has one).
pub fn make_session_name(org: &str, repo: &str, branch: &str, slug: Option<&str>) -> String {
    let mut name = format!(
        "{}{}--{}--{}",
        SESSION_PREFIX,
        sanitize_component(org),
        sanitize_component(repo),
        sanitize_component(branch),
    );
    if let Some(slug) = slug {
        name.push_str("--");
        name.push_str(&sanitize_component(slug));
    }
    name
}

/// A session name split back into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSessionName {
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub slug: Option<String>,
}

/// Inverse of [`make_session_name`]. Returns `None` for names that were not
/// produced by it; callers treat those as opaque.
pub fn parse_session_name(name: &str) -> Option<ParsedSessionName> {
    let rest = name.strip_prefix(SESSION_PREFIX)?;
    // Sanitised components collapse dash runs, so "--" only ever separates.
    let parts: Vec<&str> = rest.split("--").collect();
    if parts.len() < 3 || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(ParsedSessionName {
        org: parts[0].to_string(),
        repo: parts[1].to_string(),
        branch: parts[2].to_string(),
        slug: parts.get(3).map(|s| s.to_string()),
    })
}

/// True if tmux has a session with exactly this name. An exit-coded failure
/// means "no"; failing to run tmux at all propagates.
pub async fn has_session(name: &str) -> Result<bool> {
    let output = Command::new("tmux")
        .args(["has-session", "-t", &format!("={name}")])
        .output()
        .await
        .map_err(|e| WorkbenchError::external(format!("Failed to run tmux has-session: {e}")))?;
    if output.status.success() {
        return Ok(true);
    }
    if output.status.code().is_some() {
        return Ok(false);
    }
    Err(WorkbenchError::external(format!(
        "tmux has-session failed: {}",
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

/// Kill a tmux session. "No such session" is swallowed; everything else
/// propagates with trimmed stderr.
pub async fn kill_session(name: &str) -> Result<()> {
    let output = Command::new("tmux")
        .args(["kill-session", "-t", &format!("={name}")])
        .output()
        .await
        .map_err(|e| WorkbenchError::external(format!("Failed to run tmux kill-session: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let missing = stderr.contains("can't find session")
        || stderr.contains("no such session")
        || stderr.contains("no server running");
    if output.status.code().is_some() && missing {
        return Ok(());
    }
    Err(WorkbenchError::external(format!(
        "tmux kill-session failed: {}",
        stderr.trim()
    )))
}

/// Set (or with `value = None` unset) an environment variable inside a tmux
/// session, so processes launched there afterwards inherit it.
pub async fn set_environment(name: &str, key: &str, value: Option<&str>) -> Result<()> {
    let target = format!("={name}");
    let mut cmd = Command::new("tmux");
    match value {
        Some(v) => cmd.args(["set-environment", "-t", &target, key, v]),
        None => cmd.args(["set-environment", "-u", "-t", &target, key]),
    };
    let output = cmd
        .output()
        .await
        .map_err(|e| WorkbenchError::external(format!("Failed to run tmux set-environment: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    Err(WorkbenchError::external(format!(
        "tmux set-environment failed: {}",
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_component("feature/x"), "feature-x");
        assert_eq!(sanitize_component("a  b"), "a-b");
        assert_eq!(sanitize_component("--weird--name--"), "weird-name");
        assert_eq!(sanitize_component("dots.and_underscores"), "dots.and_underscores");
        assert_eq!(sanitize_component("héllo wörld"), "h-llo-w-rld");
    }

    #[test]
    fn sanitize_falls_back_when_empty() {
        assert_eq!(sanitize_component(""), "x");
        assert_eq!(sanitize_component("///"), "x");
        assert_eq!(sanitize_component("   "), "x");
    }

    #[test]
    fn name_round_trips_through_parse() {
        let name = make_session_name("acme", "widget", "feature/x", None);
        assert_eq!(name, "tw-acme--widget--feature-x");
        let parsed = parse_session_name(&name).expect("parses");
        assert_eq!(parsed.org, "acme");
        assert_eq!(parsed.repo, "widget");
        assert_eq!(parsed.branch, "feature-x");
        assert_eq!(parsed.slug, None);
    }

    #[test]
    fn forced_unique_variant_carries_slug() {
        let name = make_session_name("acme", "demo", "main", Some("Terminal 2"));
        assert_eq!(name, "tw-acme--demo--main--Terminal-2");
        let parsed = parse_session_name(&name).expect("parses");
        assert_eq!(parsed.slug.as_deref(), Some("Terminal-2"));
    }

    #[test]
    fn parse_is_stable_under_sanitisation() {
        for (org, repo, branch) in [
            ("Acme Inc", "my repo", "feature/deep/branch"),
            ("a", "b", "c"),
            ("with.dots", "under_scores", "mix-3d"),
        ] {
            let name = make_session_name(org, repo, branch, None);
            let parsed = parse_session_name(&name).expect("parses");
            assert_eq!(parsed.org, sanitize_component(org));
            assert_eq!(parsed.repo, sanitize_component(repo));
            assert_eq!(parsed.branch, sanitize_component(branch));
        }
    }

    #[test]
    fn foreign_names_do_not_parse() {
        assert!(parse_session_name("random-session").is_none());
        assert!(parse_session_name("tw-only--two").is_none());
        assert!(parse_session_name("tw-a--b--c--d--e").is_none());
        assert!(parse_session_name("tw---missing--part").is_none());
    }
}
