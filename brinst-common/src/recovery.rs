//! Category-specific automated remediation run before a retry.

use crate::audit::{AuditEventType, AuditLog, AuditSeverity, details};
use crate::config::{NetworkConfig, ServiceConfig};
use crate::errors::{ErrorCategory, InstallError, RecoveryProcedure};
use crate::layout::InstallLayout;
use crate::orchestrator::ResourceTracker;
use crate::platform::{NetworkDiagnostics, ServiceManager, ServiceState};
use crate::rollback::CreatedResource;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Individual remediation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    ProbeReachability,
    FlushDnsCache,
    PurgeTempFiles,
    SelectAlternateInstallDir,
    TerminateOwnedProcesses,
    RemoveOrphanedService,
    PurgePartialDownloads,
    VerifyDownloadOrigin,
    RecreateConfigDirectory,
}

impl RecoveryAction {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProbeReachability => "probe_reachability",
            Self::FlushDnsCache => "flush_dns_cache",
            Self::PurgeTempFiles => "purge_temp_files",
            Self::SelectAlternateInstallDir => "select_alternate_install_dir",
            Self::TerminateOwnedProcesses => "terminate_owned_processes",
            Self::RemoveOrphanedService => "remove_orphaned_service",
            Self::PurgePartialDownloads => "purge_partial_downloads",
            Self::VerifyDownloadOrigin => "verify_download_origin",
            Self::RecreateConfigDirectory => "recreate_config_directory",
        }
    }

    /// Attempt cap for this action (1 to 3).
    pub const fn max_attempts(&self) -> u32 {
        match self {
            Self::FlushDnsCache | Self::SelectAlternateInstallDir => 1,
            Self::RemoveOrphanedService => 3,
            _ => 2,
        }
    }
}

/// Ordered actions making up a procedure.
pub const fn actions_for(procedure: RecoveryProcedure) -> &'static [RecoveryAction] {
    use RecoveryAction::*;
    match procedure {
        RecoveryProcedure::None => &[],
        RecoveryProcedure::Network => &[ProbeReachability, FlushDnsCache],
        RecoveryProcedure::Storage => &[PurgeTempFiles, SelectAlternateInstallDir],
        RecoveryProcedure::Service => &[TerminateOwnedProcesses, RemoveOrphanedService],
        RecoveryProcedure::Download => &[PurgePartialDownloads, VerifyDownloadOrigin],
        RecoveryProcedure::Configuration => &[RecreateConfigDirectory],
    }
}

/// What the failing step was doing when recovery was requested.
#[derive(Debug, Clone, Default)]
pub struct RecoveryContext {
    pub step: String,
    /// Origin URL to re-check for download failures.
    pub download_origin: Option<String>,
    /// Resources this run created; never treated as orphans. Recovery
    /// records what it creates here so rollback removes it too.
    pub resources: ResourceTracker,
}

pub struct RecoveryEngine {
    network: Arc<dyn NetworkDiagnostics>,
    services: Arc<dyn ServiceManager>,
    layout: Arc<InstallLayout>,
    audit: Arc<AuditLog>,
    network_config: NetworkConfig,
    service_config: ServiceConfig,
    action_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(
        network: Arc<dyn NetworkDiagnostics>,
        services: Arc<dyn ServiceManager>,
        layout: Arc<InstallLayout>,
        audit: Arc<AuditLog>,
        network_config: NetworkConfig,
        service_config: ServiceConfig,
    ) -> Self {
        Self {
            network,
            services,
            layout,
            audit,
            network_config,
            service_config,
            action_backoff: Duration::from_millis(500),
        }
    }

    /// Pause between attempts of the same action.
    pub fn with_action_backoff(mut self, backoff: Duration) -> Self {
        self.action_backoff = backoff;
        self
    }

    /// Run the procedure for `category`. True iff at least one action
    /// completed without error.
    pub async fn attempt(&self, category: ErrorCategory, context: &RecoveryContext) -> bool {
        let procedure = category.recovery_procedure();
        let actions = actions_for(procedure);
        if actions.is_empty() {
            debug!(%category, "No recovery procedure for category");
            self.audit.record(
                AuditEventType::RecoveryOutcome,
                AuditSeverity::Information,
                format!("No automated recovery for {category}"),
                details([("step", context.step.as_str()), ("category", category.name())]),
            );
            return false;
        }

        info!(%category, step = %context.step, "Attempting automated recovery");
        let mut any_succeeded = false;
        for action in actions {
            if self.run_action(*action, category, context).await {
                any_succeeded = true;
            }
        }

        self.audit.record(
            AuditEventType::RecoveryOutcome,
            if any_succeeded {
                AuditSeverity::Information
            } else {
                AuditSeverity::Warning
            },
            format!(
                "Recovery for {category} {}",
                if any_succeeded { "made progress" } else { "failed" }
            ),
            details([
                ("step", context.step.clone()),
                ("category", category.name().to_string()),
                ("succeeded", any_succeeded.to_string()),
            ]),
        );
        any_succeeded
    }

    async fn run_action(
        &self,
        action: RecoveryAction,
        category: ErrorCategory,
        context: &RecoveryContext,
    ) -> bool {
        let max_attempts = action.max_attempts();
        for attempt in 1..=max_attempts {
            let result = self.execute(action, context).await;
            let (severity, outcome) = match &result {
                Ok(()) => (AuditSeverity::Information, "succeeded".to_string()),
                Err(e) => (AuditSeverity::Warning, format!("failed: {e}")),
            };
            self.audit.record(
                AuditEventType::RecoveryAttempt,
                severity,
                format!("{} attempt {attempt}/{max_attempts} {outcome}", action.name()),
                details([
                    ("action", action.name().to_string()),
                    ("category", category.name().to_string()),
                    ("attempt", attempt.to_string()),
                    ("step", context.step.clone()),
                ]),
            );

            match result {
                Ok(()) => return true,
                Err(e) => {
                    warn!(action = action.name(), attempt, error = %e, "Recovery action failed");
                    if attempt < max_attempts && !self.action_backoff.is_zero() {
                        tokio::time::sleep(self.action_backoff).await;
                    }
                }
            }
        }
        false
    }

    async fn execute(
        &self,
        action: RecoveryAction,
        context: &RecoveryContext,
    ) -> Result<(), InstallError> {
        match action {
            RecoveryAction::ProbeReachability => self.probe_reachability().await,
            RecoveryAction::FlushDnsCache => self.network.flush_dns_cache().await,
            RecoveryAction::PurgeTempFiles => {
                purge_dir_contents(&self.layout.temp_dir, |_| true)
                    .map(|removed| debug!(removed, "Purged installer temp files"))
                    .map_err(|e| InstallError::io("purging temp files", e))
            }
            RecoveryAction::SelectAlternateInstallDir => {
                let (path, created) = self
                    .layout
                    .switch_to_alternate()
                    .map_err(|e| InstallError::io("selecting alternate install directory", e))?;
                if created {
                    context.resources.record(CreatedResource::Directory { path });
                }
                Ok(())
            }
            RecoveryAction::TerminateOwnedProcesses => {
                let binary = self.layout.binary_path(&self.service_config.binary_name);
                let killed = self.services.kill_processes(&binary).await?;
                debug!(killed, binary = %binary.display(), "Terminated owned processes");
                Ok(())
            }
            RecoveryAction::RemoveOrphanedService => self.remove_orphaned_service(context).await,
            RecoveryAction::PurgePartialDownloads => purge_dir_contents(&self.layout.download_dir, |p| {
                p.extension().is_some_and(|ext| ext == "partial")
            })
            .map(|removed| debug!(removed, "Purged partial downloads"))
            .map_err(|e| InstallError::io("purging partial downloads", e)),
            RecoveryAction::VerifyDownloadOrigin => match &context.download_origin {
                Some(origin) => {
                    self.network
                        .probe(origin, self.network_config.probe_timeout())
                        .await
                }
                None => Err(InstallError::Download(
                    "no download origin to verify".to_string(),
                )),
            },
            RecoveryAction::RecreateConfigDirectory => {
                let dir = &self.layout.config_dir;
                match fs::remove_dir_all(dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(InstallError::io("removing config directory", e)),
                }
                fs::create_dir_all(dir).map_err(|e| InstallError::io("creating config directory", e))
            }
        }
    }

    async fn probe_reachability(&self) -> Result<(), InstallError> {
        let timeout = self.network_config.probe_timeout();
        let probes = self
            .network_config
            .probe_endpoints
            .iter()
            .map(|url| self.network.probe(url, timeout));
        let results = futures::future::join_all(probes).await;

        let reachable = results.iter().filter(|r| r.is_ok()).count();
        let required = self.network_config.min_reachable.max(2);
        debug!(reachable, required, "Reachability probe finished");
        if reachable >= required {
            Ok(())
        } else {
            Err(InstallError::Network(format!(
                "only {reachable} of {} probe endpoints reachable, need {required}",
                results.len()
            )))
        }
    }

    async fn remove_orphaned_service(&self, context: &RecoveryContext) -> Result<(), InstallError> {
        let name = &self.service_config.name;
        let owned = context
            .resources
            .snapshot()
            .iter()
            .any(|r| matches!(r, CreatedResource::Service { name: n, .. } if n == name));
        if owned {
            debug!(service = %name, "Service was created by this run, not orphaned");
            return Ok(());
        }

        match self.services.status(name).await {
            Ok(ServiceState::NotInstalled) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            _ => {}
        }
        info!(service = %name, "Removing orphaned service registration");
        if let Err(e) = self
            .services
            .stop(name, self.service_config.stop_timeout())
            .await
        {
            debug!(service = %name, error = %e, "Stop before delete failed");
        }
        match self.services.delete(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove entries of `dir` accepted by `matches`, leaving `dir` itself.
/// A missing directory counts as already clean.
fn purge_dir_contents(dir: &Path, matches: impl Fn(&Path) -> bool) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !matches(&path) {
            continue;
        }
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallerConfig;
    use crate::testing::mocks::{MockNetworkDiagnostics, MockServiceManager};
    use uuid::Uuid;

    struct Harness {
        engine: RecoveryEngine,
        network: Arc<MockNetworkDiagnostics>,
        services: Arc<MockServiceManager>,
        layout: Arc<InstallLayout>,
        audit: Arc<AuditLog>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig::rooted_at(dir.path());
        let network = Arc::new(MockNetworkDiagnostics::new());
        let services = Arc::new(MockServiceManager::new());
        let layout = Arc::new(InstallLayout::from_config(&config.paths));
        let audit = Arc::new(AuditLog::new(Uuid::new_v4()));
        let engine = RecoveryEngine::new(
            network.clone(),
            services.clone(),
            layout.clone(),
            audit.clone(),
            config.network.clone(),
            config.service.clone(),
        )
        .with_action_backoff(Duration::ZERO);
        Harness {
            engine,
            network,
            services,
            layout,
            audit,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_network_recovery_needs_two_reachable() {
        let h = harness();
        let endpoints = InstallerConfig::default().network.probe_endpoints;
        h.network.set_unreachable(&endpoints[0]);
        h.network.set_unreachable(&endpoints[1]);
        h.network.fail_dns_flush(true);

        let ok = h
            .engine
            .attempt(ErrorCategory::Network, &RecoveryContext::default())
            .await;
        assert!(!ok);
        // Probe twice, flush once.
        assert_eq!(h.audit.count_of(AuditEventType::RecoveryAttempt), 3);

        h.network.set_reachable(&endpoints[1]);
        let ok = h
            .engine
            .attempt(ErrorCategory::Network, &RecoveryContext::default())
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_storage_recovery_purges_temp_and_switches_dir() {
        let h = harness();
        fs::create_dir_all(&h.layout.temp_dir).unwrap();
        fs::write(h.layout.temp_dir.join("leftover.bin"), b"x").unwrap();
        let original = h.layout.install_dir();

        assert!(
            h.engine
                .attempt(ErrorCategory::Storage, &RecoveryContext::default())
                .await
        );
        assert_eq!(fs::read_dir(&h.layout.temp_dir).unwrap().count(), 0);
        assert_ne!(h.layout.install_dir(), original);
    }

    #[tokio::test]
    async fn test_alternate_dir_created_by_recovery_is_tracked() {
        let h = harness();
        let alternate = h.layout.alternate_install_dir().unwrap().to_path_buf();
        let context = RecoveryContext {
            step: "install-binary".into(),
            ..RecoveryContext::default()
        };

        assert!(h.engine.attempt(ErrorCategory::Storage, &context).await);
        assert!(alternate.is_dir());
        assert_eq!(
            context.resources.snapshot(),
            vec![CreatedResource::Directory { path: alternate }]
        );
    }

    #[tokio::test]
    async fn test_existing_alternate_dir_is_not_tracked() {
        let h = harness();
        let alternate = h.layout.alternate_install_dir().unwrap().to_path_buf();
        fs::create_dir_all(&alternate).unwrap();
        let context = RecoveryContext::default();

        assert!(h.engine.attempt(ErrorCategory::Storage, &context).await);
        assert_eq!(h.layout.install_dir(), alternate);
        assert!(context.resources.is_empty());
    }

    #[tokio::test]
    async fn test_service_recovery_spares_own_service() {
        let h = harness();
        let name = InstallerConfig::default().service.name;
        h.services.install_existing(&name);

        let context = RecoveryContext {
            step: "start-service".into(),
            download_origin: None,
            resources: ResourceTracker::new(),
        };
        context.resources.record(CreatedResource::Service {
            name: name.clone(),
            binary_path: h.layout.binary_path("agent"),
        });
        assert!(h.engine.attempt(ErrorCategory::Service, &context).await);
        assert!(h.services.exists(&name));

        // Without ownership the registration is an orphan.
        assert!(
            h.engine
                .attempt(ErrorCategory::Service, &RecoveryContext::default())
                .await
        );
        assert!(!h.services.exists(&name));
    }

    #[tokio::test]
    async fn test_service_recovery_terminates_owned_processes() {
        let h = harness();
        let binary = h.layout.binary_path(&InstallerConfig::default().service.binary_name);
        h.services.spawn_processes(&binary, 2);

        assert!(
            h.engine
                .attempt(ErrorCategory::Service, &RecoveryContext::default())
                .await
        );
        assert!(h.services.calls().contains(&format!("kill {}", binary.display())));
        assert_eq!(h.services.kill_processes(&binary).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_download_recovery_purges_partials_only() {
        let h = harness();
        fs::create_dir_all(&h.layout.download_dir).unwrap();
        fs::write(h.layout.download_dir.join("agent.partial"), b"half").unwrap();
        fs::write(h.layout.download_dir.join("agent"), b"whole").unwrap();

        let context = RecoveryContext {
            step: "download-package".into(),
            download_origin: Some("https://downloads.example.com/agent".into()),
            resources: ResourceTracker::new(),
        };
        assert!(h.engine.attempt(ErrorCategory::Download, &context).await);
        assert!(!h.layout.download_dir.join("agent.partial").exists());
        assert!(h.layout.download_dir.join("agent").exists());
        assert_eq!(
            h.network.probed(),
            vec!["https://downloads.example.com/agent".to_string()]
        );
    }

    #[tokio::test]
    async fn test_configuration_recovery_recreates_directory() {
        let h = harness();
        fs::create_dir_all(&h.layout.config_dir).unwrap();
        fs::write(h.layout.config_dir.join("broken.toml"), b"[[").unwrap();

        assert!(
            h.engine
                .attempt(ErrorCategory::Configuration, &RecoveryContext::default())
                .await
        );
        assert!(h.layout.config_dir.is_dir());
        assert_eq!(fs::read_dir(&h.layout.config_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_categories_without_procedure_return_false() {
        let h = harness();
        for category in [
            ErrorCategory::SecurityViolation,
            ErrorCategory::Permission,
            ErrorCategory::Unknown,
        ] {
            assert!(
                !h.engine
                    .attempt(category, &RecoveryContext::default())
                    .await
            );
        }
        assert_eq!(h.audit.count_of(AuditEventType::RecoveryAttempt), 0);
        assert_eq!(h.audit.count_of(AuditEventType::RecoveryOutcome), 3);
    }

    #[test]
    fn test_action_caps_within_bounds() {
        for procedure in [
            RecoveryProcedure::Network,
            RecoveryProcedure::Storage,
            RecoveryProcedure::Service,
            RecoveryProcedure::Download,
            RecoveryProcedure::Configuration,
        ] {
            for action in actions_for(procedure) {
                assert!((1..=3).contains(&action.max_attempts()));
            }
        }
    }
}
