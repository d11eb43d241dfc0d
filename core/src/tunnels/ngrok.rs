//! Ngrok backend: forward a local port via the ngrok Rust SDK. Token and
//! optional static domain come from global config. The session and forwarder
//! are parked in a background task; dropping them closes the endpoint.

use ngrok::config::ForwarderBuilder;
use ngrok::tunnel::EndpointInfo;
use url::Url;

use crate::config::Config;
use crate::error::{Result, WorkbenchError};

pub struct NgrokBackend;

#[async_trait::async_trait]
impl super::TunnelBackend for NgrokBackend {
    fn name(&self) -> &'static str {
        "ngrok"
    }

    async fn open(&self, port: u16, config: &Config) -> Result<(super::TunnelGuard, String)> {
        let token = config.ngrok_auth_token.as_deref().ok_or_else(|| {
            WorkbenchError::precondition("ngrok auth token not configured".to_string())
        })?;
        let session = ngrok::Session::builder()
            .authtoken(token)
            .connect()
            .await
            .map_err(|e| WorkbenchError::external(format!("ngrok session connect: {e}")))?;

        let forward_url = Url::parse(&format!("http://localhost:{port}"))
            .map_err(|e| WorkbenchError::internal(format!("forward URL: {e}")))?;
        let forwarder = match config
            .ngrok_domain
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(domain) => session
                .http_endpoint()
                .domain(domain)
                .listen_and_forward(forward_url)
                .await
                .map_err(|e| {
                    WorkbenchError::external(format!(
                        "ngrok domain {domain:?} failed: {e} (use your reserved domain from the ngrok dashboard)"
                    ))
                })?,
            None => session
                .http_endpoint()
                .listen_and_forward(forward_url)
                .await
                .map_err(|e| WorkbenchError::external(format!("ngrok listen_and_forward: {e}")))?,
        };

        let url = forwarder.url().to_string();

        // Both Session and Forwarder must stay alive; dropping the session
        // takes the endpoint offline.
        let handle = tokio::spawn(async move {
            let _session = session;
            let _forwarder = forwarder;
            std::future::pending::<()>().await
        });

        Ok((super::TunnelGuard::Sdk(handle), url))
    }
}
