//! Service manager backed by the host's own tooling.
//!
//! Linux uses systemd unit files and `systemctl`; Windows uses `sc.exe` and
//! `taskkill`. Every command runs through `tokio::process` so a hung tool
//! never blocks the runtime.

use async_trait::async_trait;
use brinst_common::config::StartupType;
use brinst_common::platform::{ServiceError, ServiceManager, ServiceSpec, ServiceState};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// `sc.exe` exit code when the named service does not exist.
const SC_SERVICE_DOES_NOT_EXIST: i32 = 1060;
/// `sc.exe` exit code when the service is already registered.
const SC_SERVICE_EXISTS: i32 = 1073;
/// `sc.exe` exit code when starting a service that is already running.
const SC_ALREADY_RUNNING: i32 = 1056;
/// `sc.exe` exit code when stopping a service that is not started.
const SC_NOT_ACTIVE: i32 = 1062;

const SC_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backend {
    Systemd { unit_dir: PathBuf },
    ServiceControl,
    Unsupported(&'static str),
}

#[derive(Debug, Clone)]
pub struct SystemServiceManager {
    backend: Backend,
}

impl SystemServiceManager {
    /// Backend for the running OS.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            return Self::systemd(SYSTEMD_UNIT_DIR);
        }
        let backend = if cfg!(windows) {
            Backend::ServiceControl
        } else {
            Backend::Unsupported(std::env::consts::OS)
        };
        Self { backend }
    }

    /// systemd backend writing units into `unit_dir`.
    pub fn systemd(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Systemd {
                unit_dir: unit_dir.into(),
            },
        }
    }

    fn unit_path(unit_dir: &Path, name: &str) -> PathBuf {
        unit_dir.join(format!("{name}.service"))
    }
}

async fn run(program: &str, args: &[&str]) -> Result<Output, ServiceError> {
    debug!(program, ?args, "Running service command");
    Ok(Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?)
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn failed(program: &str, args: &[&str], output: &Output) -> ServiceError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    ServiceError::CommandFailed {
        command: command_line(program, args),
        code: output.status.code(),
        stderr: if stderr.is_empty() { stdout } else { stderr },
    }
}

async fn run_checked(program: &str, args: &[&str]) -> Result<Output, ServiceError> {
    let output = run(program, args).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(failed(program, args, &output))
    }
}

/// Quote one `ExecStart=` word when it contains whitespace or quotes.
fn quote_exec_word(word: &str) -> String {
    if word.is_empty() || word.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        word.to_string()
    }
}

/// systemd unit file for `spec`.
pub fn render_unit(spec: &ServiceSpec) -> String {
    let exec = std::iter::once(spec.binary_path.display().to_string())
        .chain(spec.args.iter().cloned())
        .map(|w| quote_exec_word(&w))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "[Unit]\n\
         Description={display}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        display = spec.display_name,
    )
}

/// `systemctl is-active` output to a state.
pub fn parse_is_active(stdout: &str) -> ServiceState {
    match stdout.trim() {
        "active" | "activating" | "reloading" => ServiceState::Running,
        "inactive" | "failed" | "deactivating" => ServiceState::Stopped,
        _ => ServiceState::Unknown,
    }
}

/// `sc.exe query` output to a state.
pub fn parse_sc_query(stdout: &str) -> ServiceState {
    let state_line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"));
    match state_line {
        Some(line) if line.contains("RUNNING") || line.contains("START_PENDING") => {
            ServiceState::Running
        }
        Some(line) if line.contains("STOPPED") || line.contains("STOP_PENDING") => {
            ServiceState::Stopped
        }
        _ => ServiceState::Unknown,
    }
}

/// Binary path plus arguments as `sc.exe create binPath=` expects it.
fn sc_bin_path(spec: &ServiceSpec) -> String {
    std::iter::once(format!("\"{}\"", spec.binary_path.display()))
        .chain(spec.args.iter().map(|a| {
            if a.contains(' ') {
                format!("\"{a}\"")
            } else {
                a.clone()
            }
        }))
        .collect::<Vec<_>>()
        .join(" ")
}

fn sc_start_type(startup: StartupType) -> &'static str {
    match startup {
        StartupType::Automatic => "auto",
        StartupType::Manual => "demand",
        StartupType::Disabled => "disabled",
    }
}

impl SystemServiceManager {
    async fn sc_state(&self, name: &str) -> Result<ServiceState, ServiceError> {
        let output = run("sc.exe", &["query", name]).await?;
        match output.status.code() {
            Some(0) => Ok(parse_sc_query(&String::from_utf8_lossy(&output.stdout))),
            Some(SC_SERVICE_DOES_NOT_EXIST) => Ok(ServiceState::NotInstalled),
            _ => Err(failed("sc.exe", &["query", name], &output)),
        }
    }

    async fn sc_stop(&self, name: &str) -> Result<(), ServiceError> {
        let output = run("sc.exe", &["stop", name]).await?;
        match output.status.code() {
            Some(0) | Some(SC_NOT_ACTIVE) => {}
            Some(SC_SERVICE_DOES_NOT_EXIST) => return Err(ServiceError::NotFound(name.into())),
            _ => return Err(failed("sc.exe", &["stop", name], &output)),
        }
        // sc.exe returns once the stop is requested, not when it settles.
        loop {
            match self.sc_state(name).await? {
                ServiceState::Stopped | ServiceState::NotInstalled => return Ok(()),
                _ => tokio::time::sleep(SC_POLL_INTERVAL).await,
            }
        }
    }

    async fn stop_and_wait(&self, name: &str) -> Result<(), ServiceError> {
        match &self.backend {
            Backend::Systemd { unit_dir } => {
                if !tokio::fs::try_exists(Self::unit_path(unit_dir, name)).await? {
                    return Err(ServiceError::NotFound(name.into()));
                }
                run_checked("systemctl", &["stop", name]).await?;
                Ok(())
            }
            Backend::ServiceControl => self.sc_stop(name).await,
            Backend::Unsupported(os) => Err(ServiceError::Unsupported(os.to_string())),
        }
    }
}


#[async_trait]
impl ServiceManager for SystemServiceManager {
    async fn create(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        match &self.backend {
            Backend::Systemd { unit_dir } => {
                let unit = Self::unit_path(unit_dir, &spec.name);
                if tokio::fs::try_exists(&unit).await? {
                    return Err(ServiceError::CommandFailed {
                        command: format!("create {}", spec.name),
                        code: None,
                        stderr: format!("unit {} already exists", unit.display()),
                    });
                }
                tokio::fs::create_dir_all(unit_dir).await?;
                tokio::fs::write(&unit, render_unit(spec)).await?;
                run_checked("systemctl", &["daemon-reload"]).await?;
                match spec.startup_type {
                    StartupType::Automatic => {
                        run_checked("systemctl", &["enable", &spec.name]).await?;
                    }
                    StartupType::Disabled => {
                        run_checked("systemctl", &["disable", &spec.name]).await?;
                    }
                    StartupType::Manual => {}
                }
            }
            Backend::ServiceControl => {
                let bin_path = sc_bin_path(spec);
                let args = [
                    "create",
                    spec.name.as_str(),
                    "binPath=",
                    bin_path.as_str(),
                    "start=",
                    sc_start_type(spec.startup_type),
                    "DisplayName=",
                    spec.display_name.as_str(),
                ];
                let output = run("sc.exe", &args).await?;
                if !output.status.success() {
                    let mut err = failed("sc.exe", &args, &output);
                    if output.status.code() == Some(SC_SERVICE_EXISTS)
                        && let ServiceError::CommandFailed { stderr, .. } = &mut err
                    {
                        *stderr = format!("service {} already exists", spec.name);
                    }
                    return Err(err);
                }
            }
            Backend::Unsupported(os) => return Err(ServiceError::Unsupported(os.to_string())),
        }
        info!(service = %spec.name, binary = %spec.binary_path.display(), startup = %spec.startup_type, "Service registered");
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), ServiceError> {
        match &self.backend {
            Backend::Systemd { unit_dir } => {
                if !tokio::fs::try_exists(Self::unit_path(unit_dir, name)).await? {
                    return Err(ServiceError::NotFound(name.into()));
                }
                run_checked("systemctl", &["start", name]).await?;
            }
            Backend::ServiceControl => {
                let output = run("sc.exe", &["start", name]).await?;
                match output.status.code() {
                    Some(0) | Some(SC_ALREADY_RUNNING) => {}
                    Some(SC_SERVICE_DOES_NOT_EXIST) => {
                        return Err(ServiceError::NotFound(name.into()));
                    }
                    _ => return Err(failed("sc.exe", &["start", name], &output)),
                }
            }
            Backend::Unsupported(os) => return Err(ServiceError::Unsupported(os.to_string())),
        }
        info!(service = %name, "Service started");
        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), ServiceError> {
        match tokio::time::timeout(timeout, self.stop_and_wait(name)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                name: name.into(),
                operation: "stop",
                timeout,
            }),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        match &self.backend {
            Backend::Systemd { unit_dir } => {
                let unit = Self::unit_path(unit_dir, name);
                if !tokio::fs::try_exists(&unit).await? {
                    return Err(ServiceError::NotFound(name.into()));
                }
                // A unit that was never enabled fails to disable; removal still proceeds.
                if let Err(e) = run_checked("systemctl", &["disable", name]).await {
                    debug!(service = %name, error = %e, "Disable before delete failed");
                }
                tokio::fs::remove_file(&unit).await?;
                run_checked("systemctl", &["daemon-reload"]).await?;
            }
            Backend::ServiceControl => {
                let output = run("sc.exe", &["delete", name]).await?;
                match output.status.code() {
                    Some(0) => {}
                    Some(SC_SERVICE_DOES_NOT_EXIST) => {
                        return Err(ServiceError::NotFound(name.into()));
                    }
                    _ => return Err(failed("sc.exe", &["delete", name], &output)),
                }
            }
            Backend::Unsupported(os) => return Err(ServiceError::Unsupported(os.to_string())),
        }
        info!(service = %name, "Service deleted");
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ServiceState, ServiceError> {
        match &self.backend {
            Backend::Systemd { unit_dir } => {
                if !tokio::fs::try_exists(Self::unit_path(unit_dir, name)).await? {
                    return Ok(ServiceState::NotInstalled);
                }
                // is-active exits non-zero for anything but "active"; stdout still names the state.
                let output = run("systemctl", &["is-active", name]).await?;
                Ok(parse_is_active(&String::from_utf8_lossy(&output.stdout)))
            }
            Backend::ServiceControl => self.sc_state(name).await,
            Backend::Unsupported(os) => Err(ServiceError::Unsupported(os.to_string())),
        }
    }

    async fn kill_processes(&self, binary_path: &Path) -> Result<usize, ServiceError> {
        match &self.backend {
            Backend::Systemd { .. } => {
                let pattern = binary_path.display().to_string();
                let found = run("pgrep", &["-f", &pattern]).await?;
                let count = String::from_utf8_lossy(&found.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count();
                if count == 0 {
                    return Ok(0);
                }
                let output = run("pkill", &["-KILL", "-f", &pattern]).await?;
                // pkill exits 1 when the processes are already gone.
                if !matches!(output.status.code(), Some(0) | Some(1)) {
                    return Err(failed("pkill", &["-KILL", "-f", &pattern], &output));
                }
                Ok(count)
            }
            Backend::ServiceControl => {
                let image = binary_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if image.is_empty() {
                    return Ok(0);
                }
                let output = run("taskkill", &["/F", "/IM", &image]).await?;
                Ok(String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .filter(|l| l.starts_with("SUCCESS"))
                    .count())
            }
            Backend::Unsupported(os) => Err(ServiceError::Unsupported(os.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "bridge-agent".into(),
            display_name: "Bridge Agent".into(),
            binary_path: PathBuf::from("/opt/bridge agent/bridge-agent"),
            args: vec!["--config".into(), "/etc/brinst/bridge.toml".into()],
            startup_type: StartupType::Automatic,
        }
    }

    #[test]
    fn test_render_unit_quotes_paths_with_spaces() {
        let unit = render_unit(&spec());
        assert!(unit.contains("Description=Bridge Agent\n"));
        assert!(unit.contains(
            "ExecStart=\"/opt/bridge agent/bridge-agent\" --config /etc/brinst/bridge.toml\n"
        ));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn test_parse_is_active() {
        assert_eq!(parse_is_active("active\n"), ServiceState::Running);
        assert_eq!(parse_is_active("inactive"), ServiceState::Stopped);
        assert_eq!(parse_is_active("failed"), ServiceState::Stopped);
        assert_eq!(parse_is_active(""), ServiceState::Unknown);
    }

    #[test]
    fn test_parse_sc_query() {
        let running = "SERVICE_NAME: bridge-agent\n        TYPE               : 10  WIN32_OWN_PROCESS\n        STATE              : 4  RUNNING\n";
        assert_eq!(parse_sc_query(running), ServiceState::Running);
        let stopped = "SERVICE_NAME: bridge-agent\n        STATE              : 1  STOPPED\n";
        assert_eq!(parse_sc_query(stopped), ServiceState::Stopped);
        assert_eq!(parse_sc_query("garbage"), ServiceState::Unknown);
    }

    #[test]
    fn test_sc_bin_path_quotes_binary() {
        let mut s = spec();
        s.binary_path = PathBuf::from(r"C:\Program Files\Bridge\bridge-agent.exe");
        s.args = vec!["--config".into(), r"C:\ProgramData\Bridge Agent\bridge.toml".into()];
        assert_eq!(
            sc_bin_path(&s),
            r#""C:\Program Files\Bridge\bridge-agent.exe" --config "C:\ProgramData\Bridge Agent\bridge.toml""#
        );
        assert_eq!(sc_start_type(StartupType::Manual), "demand");
    }

    #[tokio::test]
    async fn test_missing_unit_reports_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SystemServiceManager::systemd(dir.path());
        assert_eq!(
            manager.status("bridge-agent").await.unwrap(),
            ServiceState::NotInstalled
        );
        assert!(manager.delete("bridge-agent").await.unwrap_err().is_not_found());
        assert!(
            manager
                .stop("bridge-agent", Duration::from_secs(1))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
