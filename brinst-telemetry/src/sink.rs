//! Telemetry destinations.

use crate::error::TelemetryError;
use crate::protocol::TelemetryEnvelope;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::trace;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, envelope: &TelemetryEnvelope) -> Result<(), TelemetryError>;
}

/// POSTs each envelope as JSON.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TelemetryError> {
        let url = url.into();
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(TelemetryError::Config(format!(
                "telemetry url must be http(s), got '{url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("brinst/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TelemetryError::Config(e.to_string()))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, envelope: &TelemetryEnvelope) -> Result<(), TelemetryError> {
        self.client
            .post(&self.url)
            .json(envelope)
            .send()
            .await?
            .error_for_status()?;
        trace!(url = %self.url, kind = envelope.kind(), "Telemetry delivered");
        Ok(())
    }
}

/// Appends one JSON line per envelope.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_error(&self) -> impl FnOnce(std::io::Error) -> TelemetryError + '_ {
        move |source| TelemetryError::File {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl TelemetrySink for FileSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn send(&self, envelope: &TelemetryEnvelope) -> Result<(), TelemetryError> {
        let mut line = envelope.to_json()?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(self.file_error())?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(self.file_error())?;
        file.write_all(line.as_bytes())
            .await
            .map_err(self.file_error())?;
        file.flush().await.map_err(self.file_error())
    }
}

/// Keeps envelopes in memory. Optionally fails every send.
#[derive(Default)]
pub struct MemorySink {
    received: Mutex<Vec<TelemetryEnvelope>>,
    fail: bool,
    delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Hold every send for `delay` before accepting it.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<TelemetryEnvelope> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, envelope: &TelemetryEnvelope) -> Result<(), TelemetryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(TelemetryError::Transport("memory sink set to fail".into()));
        }
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brinst_common::events::InstallEvent;
    use uuid::Uuid;

    fn envelope() -> TelemetryEnvelope {
        TelemetryEnvelope::new(
            "host",
            InstallEvent::Completed {
                installation_id: Uuid::new_v4(),
                result: "succeeded".into(),
                exit_code: 0,
                duration_ms: 1200,
            },
        )
    }

    #[tokio::test]
    async fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("nested").join("telemetry.jsonl"));
        sink.send(&envelope()).await.unwrap();
        sink.send(&envelope()).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert_eq!(TelemetryEnvelope::from_json(line).unwrap().kind(), "completed");
        }
    }

    #[test]
    fn test_http_sink_rejects_non_http_url() {
        assert!(matches!(
            HttpSink::new("ftp://example.com", Duration::from_secs(1)),
            Err(TelemetryError::Config(_))
        ));
        assert!(HttpSink::new("https://example.com/telemetry", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_http_sink_unreachable_is_error() {
        // Port 9 (discard) on localhost is closed on test machines.
        let sink = HttpSink::new("http://127.0.0.1:9/telemetry", Duration::from_secs(2)).unwrap();
        let err = sink.send(&envelope()).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
