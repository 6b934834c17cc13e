//! Wire envelope for telemetry sinks.

use brinst_common::events::InstallEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TELEMETRY_SCHEMA_VERSION: u32 = 1;

/// One event as delivered to the HTTP endpoint and the JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryEnvelope {
    pub schema_version: u32,
    /// Unique per envelope; lets the receiver drop duplicates.
    pub envelope_id: Uuid,
    pub installation_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub host: String,
    pub os: String,
    pub installer_version: String,
    pub event: InstallEvent,
}

impl TelemetryEnvelope {
    pub fn new(host: impl Into<String>, event: InstallEvent) -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            envelope_id: Uuid::new_v4(),
            installation_id: event.installation_id(),
            sent_at: Utc::now(),
            host: host.into(),
            os: std::env::consts::OS.to_string(),
            installer_version: env!("CARGO_PKG_VERSION").to_string(),
            event,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Host name reported in envelopes.
pub fn resolve_host() -> String {
    for var in ["BRINST_HOST_ID", "HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(var)
            && !value.trim().is_empty()
        {
            return value;
        }
    }
    "unknown-host".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> InstallEvent {
        InstallEvent::Progress {
            installation_id: Uuid::new_v4(),
            step: "download-package".into(),
            index: 3,
            total: 8,
            percent: 37,
        }
    }

    #[test]
    fn test_envelope_carries_event_identity() {
        let event = progress();
        let envelope = TelemetryEnvelope::new("host-1", event.clone());
        assert_eq!(envelope.installation_id, event.installation_id());
        assert_eq!(envelope.kind(), "progress");
        assert_eq!(envelope.schema_version, TELEMETRY_SCHEMA_VERSION);

        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert_eq!(TelemetryEnvelope::from_json(&json).unwrap(), envelope);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let envelope = TelemetryEnvelope::new("host-1", progress());
        let mut value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        value["extra"] = serde_json::json!(true);
        assert!(TelemetryEnvelope::from_json(&value.to_string()).is_err());
    }
}
