//! Per-run state shared by every component.

use crate::audit::{AuditEventType, AuditLog, AuditSeverity, details};
use crate::config::InstallerConfig;
use crate::events::EventSink;
use crate::layout::InstallLayout;
use crate::retry::{RetryExecutor, RetryPolicy};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Built once per installation and passed explicitly to components.
#[derive(Clone)]
pub struct InstallationContext {
    pub installation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub config: Arc<InstallerConfig>,
    pub audit: Arc<AuditLog>,
    pub events: Arc<dyn EventSink>,
    pub layout: Arc<InstallLayout>,
}

impl InstallationContext {
    pub fn new(config: InstallerConfig, events: Arc<dyn EventSink>) -> Self {
        let installation_id = Uuid::new_v4();
        let audit = Arc::new(AuditLog::new(installation_id));
        let layout = Arc::new(InstallLayout::from_config(&config.paths));

        audit.record(
            AuditEventType::InstallationStarted,
            AuditSeverity::Information,
            "Installation started",
            details([
                ("installationId", installation_id.to_string()),
                ("version", env!("CARGO_PKG_VERSION").to_string()),
                ("os", std::env::consts::OS.to_string()),
                ("installDir", layout.install_dir().display().to_string()),
            ]),
        );

        Self {
            installation_id,
            started_at: Utc::now(),
            config: Arc::new(config),
            audit,
            events,
            layout,
        }
    }

    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::from_config(&self.config.retry),
            self.audit.clone(),
        )
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;

    #[test]
    fn test_new_context_records_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = InstallationContext::new(
            InstallerConfig::rooted_at(dir.path()),
            Arc::new(NullEventSink),
        );
        assert_eq!(ctx.audit.installation_id(), ctx.installation_id);
        assert_eq!(ctx.audit.count_of(AuditEventType::InstallationStarted), 1);
        assert_eq!(ctx.layout.install_dir(), dir.path().join("bin"));
        assert_eq!(
            ctx.retry_executor().policy().max_delay.as_millis(),
            u128::from(ctx.config.retry.max_delay_ms)
        );
    }
}
