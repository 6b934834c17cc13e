//! Telemetry for the bridge installer.
//!
//! Installation events are wrapped in a [`TelemetryEnvelope`] and handed to
//! a bounded [`TelemetryQueue`]. A background worker delivers them to an
//! HTTP endpoint and a local JSONL file. The installer never waits on it.

pub mod error;
pub mod protocol;
pub mod queue;
pub mod sink;

pub use error::TelemetryError;
pub use protocol::{TELEMETRY_SCHEMA_VERSION, TelemetryEnvelope, resolve_host};
pub use queue::{TelemetryQueue, TelemetryStats, TelemetryWorker};
pub use sink::{FileSink, HttpSink, MemorySink, TelemetrySink};

use brinst_common::config::TelemetryConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Sinks described by `config`.
///
/// The HTTP sink defaults to `<endpoint>/telemetry` and the JSONL file to
/// `<log_dir>/telemetry.jsonl`. A disabled config yields no sinks.
pub fn build_sinks(
    config: &TelemetryConfig,
    endpoint: Option<&str>,
    log_dir: &Path,
) -> Result<Vec<Arc<dyn TelemetrySink>>, TelemetryError> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    let mut sinks: Vec<Arc<dyn TelemetrySink>> = Vec::new();
    let url = config.url.clone().or_else(|| {
        endpoint.map(|e| format!("{}/telemetry", e.trim_end_matches('/')))
    });
    if let Some(url) = url {
        sinks.push(Arc::new(HttpSink::new(
            url,
            Duration::from_secs(config.timeout_secs),
        )?));
    }

    let jsonl = config
        .jsonl_path
        .clone()
        .unwrap_or_else(|| log_dir.join("telemetry.jsonl"));
    sinks.push(Arc::new(FileSink::new(jsonl)));
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sinks_follow_endpoint() {
        let sinks = build_sinks(
            &TelemetryConfig::default(),
            Some("https://bridge.example.com/"),
            Path::new("/tmp/logs"),
        )
        .unwrap();
        let names: Vec<_> = sinks.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["http", "jsonl"]);
    }

    #[test]
    fn test_disabled_config_has_no_sinks() {
        let config = TelemetryConfig {
            enabled: false,
            ..TelemetryConfig::default()
        };
        assert!(build_sinks(&config, Some("https://x"), Path::new("/tmp")).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let config = TelemetryConfig {
            url: Some("mailto:ops@example.com".into()),
            ..TelemetryConfig::default()
        };
        assert!(matches!(
            build_sinks(&config, None, Path::new("/tmp")),
            Err(TelemetryError::Config(_))
        ));
    }
}
