//! Reachability probes and the post-install connection test.

use async_trait::async_trait;
use brinst_common::errors::InstallError;
use brinst_common::platform::NetworkDiagnostics;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub struct HttpNetworkDiagnostics {
    client: reqwest::Client,
}

impl HttpNetworkDiagnostics {
    pub fn new() -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("brinst/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallError::Network(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// GET `url` and require a 2xx answer.
    pub async fn check_health(&self, url: &str, timeout: Duration) -> Result<(), InstallError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(url, timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::Network(format!(
                "health check {url} returned HTTP {}",
                status.as_u16()
            )));
        }
        info!(url, "Connection test passed");
        Ok(())
    }
}

/// Health endpoint of the platform the bridge pairs with.
pub fn health_url(endpoint: &str) -> String {
    format!("{}/health", endpoint.trim_end_matches('/'))
}

fn request_error(url: &str, timeout: Duration, err: reqwest::Error) -> InstallError {
    if err.is_timeout() {
        InstallError::Timeout(format!("{url} did not answer within {timeout:?}"))
    } else {
        InstallError::Network(format!("{url}: {err}"))
    }
}

/// Platform command that drops the resolver cache.
fn dns_flush_commands() -> &'static [(&'static str, &'static [&'static str])] {
    if cfg!(windows) {
        &[("ipconfig", &["/flushdns"])]
    } else if cfg!(target_os = "macos") {
        &[("dscacheutil", &["-flushcache"])]
    } else {
        &[
            ("resolvectl", &["flush-caches"]),
            ("systemd-resolve", &["--flush-caches"]),
        ]
    }
}

#[async_trait]
impl NetworkDiagnostics for HttpNetworkDiagnostics {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), InstallError> {
        // Any HTTP answer proves reachability, whatever the status.
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(url, timeout, e))?;
        debug!(url, status = response.status().as_u16(), "Probe answered");
        Ok(())
    }

    async fn flush_dns_cache(&self) -> Result<(), InstallError> {
        let mut last_error = String::from("no DNS flush command available");
        for (program, args) in dns_flush_commands() {
            match Command::new(program).args(*args).output().await {
                Ok(output) if output.status.success() => {
                    info!(program, "DNS cache flushed");
                    return Ok(());
                }
                Ok(output) => {
                    last_error = format!(
                        "{program} exited with {:?}: {}",
                        output.status.code(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Err(e) => last_error = format!("{program}: {e}"),
            }
            debug!(program, error = %last_error, "DNS flush attempt failed");
        }
        Err(InstallError::Network(last_error))
    }
}
