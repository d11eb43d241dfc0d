//! Tunnel manager: expose local listening ports over public URLs. One live
//! tunnel per port; opening a port that already has one replaces it. The
//! provider backend trait keeps the manager independent of the ngrok SDK so
//! tests can run against a fake.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::config;
use crate::error::{Result, WorkbenchError};

mod ngrok;

/// Keeps a tunnel alive. Closing drops the underlying session.
pub enum TunnelGuard {
    /// Tunnel held by an SDK background task.
    Sdk(tokio::task::JoinHandle<()>),
}

impl TunnelGuard {
    fn close(self) {
        match self {
            TunnelGuard::Sdk(handle) => handle.abort(),
        }
    }
}

/// Externally visible record of an open tunnel.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDetails {
    pub port: u16,
    pub url: String,
    pub created_at: String,
}

struct ActiveTunnel {
    details: TunnelDetails,
    guard: TunnelGuard,
}

/// Provider backend: forward a local port, return the guard and public URL.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self, port: u16, config: &config::Config) -> Result<(TunnelGuard, String)>;
}

/// Tracks open tunnels by port.
pub struct TunnelManager {
    tunnels: DashMap<u16, ActiveTunnel>,
    backend: Arc<dyn TunnelBackend>,
    /// Tests inject a config here; production reads the global one.
    config_override: Option<config::Config>,
}

impl TunnelManager {
    /// Production manager backed by the ngrok SDK.
    pub fn new() -> Arc<Self> {
        Self::with_backend(Arc::new(ngrok::NgrokBackend))
    }

    pub fn with_backend(backend: Arc<dyn TunnelBackend>) -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            backend,
            config_override: None,
        })
    }

    /// Manager with an explicit config instead of the process-global one.
    pub fn with_config(backend: Arc<dyn TunnelBackend>, config: config::Config) -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            backend,
            config_override: Some(config),
        })
    }

    fn config(&self) -> &config::Config {
        match &self.config_override {
            Some(cfg) => cfg,
            None => config::ensure_loaded(),
        }
    }

    /// Open a tunnel to `port`. Requires a configured auth token. A
    /// pre-existing tunnel on the same port is closed first (close errors
    /// swallowed) and replaced.
    pub async fn open(&self, port: u16) -> Result<TunnelDetails> {
        let cfg = self.config();
        if cfg.ngrok_auth_token.is_none() {
            return Err(WorkbenchError::precondition(format!(
                "Cannot open tunnel for port {port}: no {} auth token configured",
                self.backend.name()
            )));
        }

        if let Some((_, existing)) = self.tunnels.remove(&port) {
            existing.guard.close();
        }

        let (guard, url) = self.backend.open(port, cfg).await?;
        if url.is_empty() {
            guard.close();
            return Err(WorkbenchError::external(format!(
                "{} returned a listener without a URL for port {port}",
                self.backend.name()
            )));
        }
        let details = TunnelDetails {
            port,
            url,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.tunnels.insert(
            port,
            ActiveTunnel {
                details: details.clone(),
                guard,
            },
        );
        tracing::info!("tunnel open: {} -> localhost:{port}", details.url);
        Ok(details)
    }

    /// Close the tunnel on `port`, if any. Returns whether one was open.
    pub fn close(&self, port: u16) -> bool {
        match self.tunnels.remove(&port) {
            Some((_, tunnel)) => {
                tunnel.guard.close();
                tracing::info!("tunnel closed for port {port}");
                true
            }
            None => false,
        }
    }

    /// Tear down every tracked tunnel.
    pub fn close_all(&self) {
        let ports: Vec<u16> = self.tunnels.iter().map(|e| *e.key()).collect();
        for port in ports {
            self.close(port);
        }
    }

    /// Details of all open tunnels, ascending by port.
    pub fn list(&self) -> Vec<TunnelDetails> {
        let mut out: Vec<TunnelDetails> =
            self.tunnels.iter().map(|e| e.details.clone()).collect();
        out.sort_by_key(|d| d.port);
        out
    }
}
