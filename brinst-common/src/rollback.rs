//! Reverse partial installation state.
//!
//! Undo order is fixed by phase, newest-first within a phase:
//!
//! | Phase | Resources                                   |
//! |-------|---------------------------------------------|
//! | 1     | services (stop, kill leftovers, delete)     |
//! | 2     | configuration (backed up, then removed)     |
//! | 3     | installed files and directories             |
//! | 4     | persisted state                             |
//! | 5     | log sources                                 |
//!
//! Every sub-step runs even after earlier ones fail. Resources that are
//! already gone count as undone-by-absence, so rolling back twice is safe.

use crate::audit::{AuditEventType, AuditLog, AuditSeverity, details};
use crate::platform::{ServiceManager, ServiceState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Something the installer created that rollback must undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreatedResource {
    Service { name: String, binary_path: PathBuf },
    /// Configuration file or directory.
    Config { path: PathBuf },
    File { path: PathBuf },
    Directory { path: PathBuf },
    PersistedState { path: PathBuf },
    LogSource { path: PathBuf },
}

impl CreatedResource {
    fn phase(&self) -> u8 {
        match self {
            Self::Service { .. } => 1,
            Self::Config { .. } => 2,
            Self::File { .. } | Self::Directory { .. } => 3,
            Self::PersistedState { .. } => 4,
            Self::LogSource { .. } => 5,
        }
    }

    /// Short human-readable identifier, e.g. `service bridge-agent`.
    pub fn label(&self) -> String {
        match self {
            Self::Service { name, .. } => format!("service {name}"),
            Self::Config { path } => format!("config {}", path.display()),
            Self::File { path } => format!("file {}", path.display()),
            Self::Directory { path } => format!("directory {}", path.display()),
            Self::PersistedState { path } => format!("state {}", path.display()),
            Self::LogSource { path } => format!("log source {}", path.display()),
        }
    }
}

/// What a failed run left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub completed_steps: Vec<String>,
    /// In creation order.
    pub resources: Vec<CreatedResource>,
}

impl RollbackPlan {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources in undo order.
    fn undo_order(self) -> Vec<CreatedResource> {
        let mut ordered: Vec<(usize, CreatedResource)> =
            self.resources.into_iter().enumerate().collect();
        ordered.sort_by(|(ia, a), (ib, b)| a.phase().cmp(&b.phase()).then(ib.cmp(ia)));
        ordered.into_iter().map(|(_, r)| r).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub success: bool,
    /// Labels of resources actually removed in this call.
    pub steps_undone: Vec<String>,
    pub already_absent: Vec<String>,
    pub errors: Vec<String>,
    /// Non-fatal problems, such as a directory that would not go away.
    pub warnings: Vec<String>,
}

enum Undo {
    Removed,
    Absent,
}

pub struct RollbackManager {
    services: Arc<dyn ServiceManager>,
    audit: Arc<AuditLog>,
    stop_timeout: Duration,
    backup_dir: Option<PathBuf>,
}

impl RollbackManager {
    pub fn new(services: Arc<dyn ServiceManager>, audit: Arc<AuditLog>) -> Self {
        Self {
            services,
            audit,
            stop_timeout: Duration::from_secs(30),
            backup_dir: None,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Copy configuration here before deleting it.
    pub fn with_backup_dir(mut self, dir: PathBuf) -> Self {
        self.backup_dir = Some(dir);
        self
    }

    pub async fn rollback(&self, plan: RollbackPlan, reason: &str) -> RollbackReport {
        info!(reason, resources = plan.resources.len(), "Starting rollback");
        self.audit.record(
            AuditEventType::RollbackStarted,
            AuditSeverity::Warning,
            format!("Rolling back: {reason}"),
            details([
                ("reason", reason.to_string()),
                ("completedSteps", plan.completed_steps.join(",")),
                ("resources", plan.resources.len().to_string()),
            ]),
        );

        let mut report = RollbackReport::default();
        for resource in plan.undo_order() {
            let label = resource.label();
            let outcome = match &resource {
                CreatedResource::Service { name, binary_path } => {
                    self.undo_service(name, binary_path, &mut report).await
                }
                CreatedResource::Config { path } => self.undo_config(path),
                CreatedResource::File { path }
                | CreatedResource::PersistedState { path }
                | CreatedResource::LogSource { path } => remove_path(path),
                CreatedResource::Directory { path } => match remove_path(path) {
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Could not remove directory");
                        report.warnings.push(format!("{label}: {e}"));
                        self.audit_action(&label, "left in place", AuditSeverity::Warning);
                        continue;
                    }
                    ok => ok,
                },
            };

            match outcome {
                Ok(Undo::Removed) => {
                    self.audit_action(&label, "removed", AuditSeverity::Information);
                    report.steps_undone.push(label);
                }
                Ok(Undo::Absent) => {
                    self.audit_action(&label, "already absent", AuditSeverity::Debug);
                    report.already_absent.push(label);
                }
                Err(e) => {
                    warn!(resource = %label, error = %e, "Rollback action failed");
                    self.audit_action(&label, &format!("failed: {e}"), AuditSeverity::Error);
                    report.errors.push(format!("{label}: {e}"));
                }
            }
        }

        report.success = report.errors.is_empty();
        self.audit.record(
            AuditEventType::RollbackCompleted,
            if report.success {
                AuditSeverity::Information
            } else {
                AuditSeverity::Error
            },
            format!(
                "Rollback {}: {} undone, {} absent, {} errors",
                if report.success { "succeeded" } else { "failed" },
                report.steps_undone.len(),
                report.already_absent.len(),
                report.errors.len()
            ),
            details([
                ("success", report.success.to_string()),
                ("stepsUndone", report.steps_undone.join(",")),
                ("errors", report.errors.join("; ")),
            ]),
        );
        info!(
            success = report.success,
            undone = report.steps_undone.len(),
            errors = report.errors.len(),
            "Rollback finished"
        );
        report
    }

    async fn undo_service(
        &self,
        name: &str,
        binary_path: &Path,
        report: &mut RollbackReport,
    ) -> io::Result<Undo> {
        match self.services.status(name).await {
            Ok(ServiceState::NotInstalled) => return Ok(Undo::Absent),
            Err(e) if e.is_not_found() => return Ok(Undo::Absent),
            Ok(_) => {}
            Err(e) => warn!(service = name, error = %e, "Could not query service state"),
        }

        let mut failures = Vec::new();
        if let Err(e) = self.services.stop(name, self.stop_timeout).await
            && !e.is_not_found()
        {
            warn!(service = name, error = %e, "Service did not stop cleanly");
            report
                .warnings
                .push(format!("service {name}: stop failed: {e}"));
        }
        match self.services.kill_processes(binary_path).await {
            Ok(0) => {}
            Ok(killed) => info!(service = name, killed, "Terminated lingering processes"),
            Err(e) => failures.push(format!("kill failed: {e}")),
        }
        match self.services.delete(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => failures.push(format!("delete failed: {e}")),
        }

        if failures.is_empty() {
            Ok(Undo::Removed)
        } else {
            Err(io::Error::other(failures.join("; ")))
        }
    }

    fn undo_config(&self, path: &Path) -> io::Result<Undo> {
        if !path.exists() {
            return Ok(Undo::Absent);
        }
        if let Some(backup_dir) = &self.backup_dir
            && let Err(e) = backup(path, backup_dir)
        {
            warn!(path = %path.display(), error = %e, "Config backup failed, removing anyway");
        }
        remove_path(path)
    }

    fn audit_action(&self, label: &str, outcome: &str, severity: AuditSeverity) {
        self.audit.record(
            AuditEventType::RollbackAction,
            severity,
            format!("{label}: {outcome}"),
            details([("resource", label), ("outcome", outcome)]),
        );
    }
}

fn remove_path(path: &Path) -> io::Result<Undo> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(Undo::Removed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Undo::Absent),
        Err(e) => Err(e),
    }
}

fn backup(path: &Path, backup_dir: &Path) -> io::Result<()> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let target = backup_dir.join(format!("config-{stamp}"));
    fs::create_dir_all(&target)?;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), target.join(entry.file_name()))?;
            }
        }
    } else if let Some(name) = path.file_name() {
        fs::copy(path, target.join(name))?;
    }
    Ok(())
}
