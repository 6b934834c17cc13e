//! Host readiness checks run before anything is written.

use brinst_common::config::ComplianceConfig;
use brinst_common::errors::InstallError;
use brinst_common::layout::ensure_writable;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// What was observed about the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFacts {
    pub os: String,
    /// `None` when elevation could not be determined.
    pub elevated: Option<bool>,
    /// Free space on the volume holding the install root, if measurable.
    pub free_disk_mb: Option<u64>,
    pub install_root: PathBuf,
    /// Error text when the install root rejected a write probe.
    pub install_root_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComplianceReport {
    pub checks: Vec<ComplianceCheck>,
}

impl ComplianceReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ComplianceCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// First failure as an installer error. Missing elevation is a
    /// permission problem; everything else is an unmet requirement.
    pub fn into_result(self) -> Result<(), InstallError> {
        let Some(failed) = self.checks.into_iter().find(|c| !c.passed) else {
            return Ok(());
        };
        let message = format!("{}: {}", failed.name, failed.detail);
        if failed.name == "elevation" {
            Err(InstallError::Permission(message))
        } else {
            Err(InstallError::Requirement(message))
        }
    }
}

/// Judge `facts` against `config`.
pub fn evaluate(config: &ComplianceConfig, facts: &SystemFacts) -> ComplianceReport {
    let mut checks = Vec::with_capacity(4);

    let supported = config.supported_os.iter().any(|os| os.eq_ignore_ascii_case(&facts.os));
    checks.push(ComplianceCheck {
        name: "operating_system",
        passed: supported,
        detail: if supported {
            format!("{} is supported", facts.os)
        } else {
            format!(
                "{} is not one of: {}",
                facts.os,
                config.supported_os.join(", ")
            )
        },
    });

    if config.require_elevation {
        let (passed, detail) = match facts.elevated {
            Some(true) => (true, "running with administrative privileges".to_string()),
            Some(false) => (false, "administrative privileges are required".to_string()),
            None => (false, "could not determine privilege level".to_string()),
        };
        checks.push(ComplianceCheck {
            name: "elevation",
            passed,
            detail,
        });
    }

    let (passed, detail) = match facts.free_disk_mb {
        Some(free) if free >= config.min_free_disk_mb => (
            true,
            format!("{free} MB free, {} MB required", config.min_free_disk_mb),
        ),
        Some(free) => (
            false,
            format!("only {free} MB free, {} MB required", config.min_free_disk_mb),
        ),
        // Unmeasurable space is not treated as a failure.
        None => (true, "free space could not be measured".to_string()),
    };
    checks.push(ComplianceCheck {
        name: "disk_space",
        passed,
        detail,
    });

    checks.push(match &facts.install_root_error {
        None => ComplianceCheck {
            name: "install_root",
            passed: true,
            detail: format!("{} is writable", facts.install_root.display()),
        },
        Some(error) => ComplianceCheck {
            name: "install_root",
            passed: false,
            detail: format!("{} is not writable: {error}", facts.install_root.display()),
        },
    });

    let report = ComplianceReport { checks };
    if report.passed() {
        info!("Compliance checks passed");
    } else {
        for failure in report.failures() {
            warn!(check = failure.name, detail = %failure.detail, "Compliance check failed");
        }
    }
    report
}

impl SystemFacts {
    /// Probe the running host for the directory that will hold the install.
    pub async fn gather(install_dir: &Path) -> Self {
        // Probe the closest existing ancestor so nothing is created here.
        let probe_dir = nearest_existing(install_dir);
        let install_root_error = ensure_writable(&probe_dir).err().map(|e| e.to_string());
        Self {
            os: std::env::consts::OS.to_string(),
            elevated: is_elevated().await,
            free_disk_mb: free_disk_mb(&probe_dir).await,
            install_root: install_dir.to_path_buf(),
            install_root_error,
        }
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            debug!(program, code = ?output.status.code(), "Probe command failed");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "Probe command unavailable");
            None
        }
    }
}

async fn is_elevated() -> Option<bool> {
    if cfg!(windows) {
        // `net session` only succeeds for administrators.
        let ok = Command::new("net")
            .arg("session")
            .output()
            .await
            .ok()?
            .status
            .success();
        Some(ok)
    } else {
        let uid = command_stdout("id", &["-u"]).await?;
        uid.trim().parse::<u32>().ok().map(|uid| uid == 0)
    }
}

async fn free_disk_mb(path: &Path) -> Option<u64> {
    if cfg!(windows) {
        let drive = path
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().trim_end_matches(':').to_string())?;
        let script = format!("(Get-PSDrive -Name '{drive}').Free");
        let out = command_stdout("powershell", &["-NoProfile", "-Command", &script]).await?;
        out.trim().parse::<u64>().ok().map(|bytes| bytes / (1024 * 1024))
    } else {
        let target = path.display().to_string();
        let out = command_stdout("df", &["-Pk", &target]).await?;
        parse_df_available_kb(&out).map(|kb| kb / 1024)
    }
}

/// Available kilobytes from POSIX `df -Pk` output.
pub fn parse_df_available_kb(output: &str) -> Option<u64> {
    let line = output.lines().nth(1)?;
    line.split_whitespace().nth(3)?.parse().ok()
}
