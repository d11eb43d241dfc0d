//! Global config singleton. Load settings.json once; the server and the
//! engine both call `ensure_loaded()` so the first caller does the work and
//! later callers get the same instance. Settings live in ~/.agentrix/.

use std::path::PathBuf;
use std::sync::Once;
use std::sync::OnceLock;
use std::time::Duration;

const STATE_DIR: &str = ".agentrix";
const SETTINGS_FILE: &str = "settings.json";

/// Install rustls default crypto provider once (required by rustls 0.22+
/// before any TLS use, e.g. the ngrok SDK).
fn ensure_rustls_provider() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("rustls default crypto provider");
    });
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from ~/.agentrix/settings.json.
pub struct Config {
    pub ngrok_auth_token: Option<String>,
    /// Reserved/static domain (e.g. myapp.ngrok.io). If set, tunnels use this
    /// instead of a random URL.
    pub ngrok_domain: Option<String>,
    /// Root for managed worktrees when the caller does not supply one.
    pub working_dir: PathBuf,
    /// How many plan files to keep per branch before pruning oldest.
    pub plan_retention: usize,
    /// SIGTERM → SIGKILL escalation delay for session disposal.
    pub sigkill_delay: Duration,
    /// Model passed to the Codex CLI when starting a thread.
    pub codex_model: Option<String>,
}

/// Ensure config is loaded (idempotent). Reads settings.json on first call;
/// returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    ensure_rustls_provider();
    CONFIG.get_or_init(|| load_settings_from(&state_dir().join(SETTINGS_FILE)))
}

/// Home directory, `/tmp` as a last resort.
pub fn home_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
}

/// State directory: ~/.agentrix (sessions.json, settings.json).
pub fn state_dir() -> PathBuf {
    home_dir().join(STATE_DIR)
}

fn load_settings_from(path: &std::path::Path) -> Config {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
        return Config::default();
    };

    let ngrok = root.get("tunnel").and_then(|t| t.get("ngrok"));
    let ngrok_auth_token = ngrok
        .and_then(|n| n.get("auth_token"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());
    let ngrok_domain = ngrok
        .and_then(|n| n.get("domain"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let working_dir = root
        .get("working_dir")
        .and_then(|v| v.as_str())
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(default_working_dir);

    let plan_retention = root
        .get("plans")
        .and_then(|p| p.get("retention"))
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_PLAN_RETENTION);

    let sigkill_delay = root
        .get("sessions")
        .and_then(|s| s.get("sigkill_delay_ms"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SIGKILL_DELAY);

    let codex_model = root
        .get("codex")
        .and_then(|c| c.get("model"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Config {
        ngrok_auth_token,
        ngrok_domain,
        working_dir,
        plan_retention,
        sigkill_delay,
        codex_model,
    }
}

const DEFAULT_PLAN_RETENTION: usize = 20;
const DEFAULT_SIGKILL_DELAY: Duration = Duration::from_secs(2);

/// Default root for managed worktrees: ~/agentrix.
fn default_working_dir() -> PathBuf {
    home_dir().join("agentrix")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ngrok_auth_token: None,
            ngrok_domain: None,
            working_dir: default_working_dir(),
            plan_retention: DEFAULT_PLAN_RETENTION,
            sigkill_delay: DEFAULT_SIGKILL_DELAY,
            codex_model: None,
        }
    }
}

/// Truthy env flag: set, non-empty, and not "0"/"false"/"no"/"off".
pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim().to_lowercase();
            !v.is_empty() && v != "0" && v != "false" && v != "no" && v != "off"
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_fall_back_to_defaults() {
        let cfg = load_settings_from(std::path::Path::new("/nonexistent/settings.json"));
        assert!(cfg.ngrok_auth_token.is_none());
        assert_eq!(cfg.plan_retention, DEFAULT_PLAN_RETENTION);
        assert_eq!(cfg.sigkill_delay, DEFAULT_SIGKILL_DELAY);
    }

    #[test]
    fn settings_parse_nested_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "tunnel": {"ngrok": {"auth_token": "tok", "domain": " my.ngrok.io "}},
                "plans": {"retention": 5},
                "sessions": {"sigkill_delay_ms": 500}
            }"#,
        )
        .expect("write settings");
        let cfg = load_settings_from(&path);
        assert_eq!(cfg.ngrok_auth_token.as_deref(), Some("tok"));
        assert_eq!(cfg.ngrok_domain.as_deref(), Some("my.ngrok.io"));
        assert_eq!(cfg.plan_retention, 5);
        assert_eq!(cfg.sigkill_delay, Duration::from_millis(500));
    }
}
