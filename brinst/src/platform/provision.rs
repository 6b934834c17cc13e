//! On-disk artifacts of a bridge installation.
//!
//! Every helper records what it actually created in the run's
//! [`ResourceTracker`]; anything that already existed is left out so
//! rollback never removes it.

use brinst_common::InstallLayout;
use brinst_common::errors::InstallError;
use brinst_common::orchestrator::ResourceTracker;
use brinst_common::rollback::CreatedResource;
use brinst_common::types::InstallationCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const BRIDGE_CONFIG_FILE: &str = "bridge.toml";
pub const STATE_MARKER_FILE: &str = "installation.json";

/// Configuration handed to the bridge agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub endpoint: String,
    pub subject_id: String,
    pub pair_code: String,
    pub installation_id: Uuid,
    pub installed_at: DateTime<Utc>,
    pub log_dir: PathBuf,
}

/// Marker proving a completed installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMarker {
    pub installation_id: Uuid,
    pub installer_version: String,
    pub service_name: String,
    pub binary_path: PathBuf,
    pub package_sha256: Option<String>,
    pub installed_at: DateTime<Utc>,
}

fn io_err(action: &str, path: &Path) -> impl FnOnce(std::io::Error) -> InstallError {
    let context = format!("{action} {}", path.display());
    move |e| InstallError::io(context, e)
}

/// Create a directory, recording it only if this call made it.
fn create_tracked(path: &Path, tracker: &ResourceTracker, as_log_source: bool) -> Result<(), InstallError> {
    if path.is_dir() {
        debug!(path = %path.display(), "Directory already present");
        return Ok(());
    }
    fs::create_dir_all(path).map_err(io_err("creating", path))?;
    let path = path.to_path_buf();
    tracker.record(if as_log_source {
        CreatedResource::LogSource { path }
    } else {
        CreatedResource::Directory { path }
    });
    Ok(())
}

/// Install, config, state, log, temp and download directories.
///
/// The audit directory is created on demand by the report writer and is
/// never tracked, so rollback keeps the report.
pub fn create_directories(layout: &InstallLayout, tracker: &ResourceTracker) -> Result<(), InstallError> {
    let install_dir = layout.install_dir();
    for dir in [
        install_dir.as_path(),
        layout.config_dir.as_path(),
        layout.state_dir.as_path(),
        layout.temp_dir.as_path(),
        layout.download_dir.as_path(),
    ] {
        create_tracked(dir, tracker, false)?;
    }
    create_tracked(&layout.log_dir, tracker, true)?;
    info!(install_dir = %install_dir.display(), "Installation directories ready");
    Ok(())
}

/// Copy the downloaded package into the install directory.
pub fn install_binary(
    package: &Path,
    layout: &InstallLayout,
    binary_name: &str,
    tracker: &ResourceTracker,
) -> Result<PathBuf, InstallError> {
    let target = layout.binary_path(binary_name);
    if let Some(parent) = target.parent() {
        create_tracked(parent, tracker, false)?;
    }
    let staging = target.with_extension("installing");
    fs::copy(package, &staging).map_err(io_err("copying package to", &staging))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755))
            .map_err(io_err("marking executable", &staging))?;
    }

    fs::rename(&staging, &target).map_err(io_err("moving binary to", &target))?;
    tracker.record(CreatedResource::File {
        path: target.clone(),
    });
    info!(path = %target.display(), "Bridge binary installed");
    Ok(target)
}

fn write_private(path: &Path, content: &str) -> Result<(), InstallError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err("creating", parent))?;
    }
    fs::write(path, content).map_err(io_err("writing", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(io_err("restricting permissions on", path))?;
    }
    Ok(())
}

/// Write `bridge.toml` for the agent.
pub fn write_bridge_config(
    layout: &InstallLayout,
    cmd: &InstallationCommand,
    installation_id: Uuid,
    tracker: &ResourceTracker,
) -> Result<PathBuf, InstallError> {
    let config = BridgeConfig {
        endpoint: cmd.endpoint.clone(),
        subject_id: cmd.subject_id.clone(),
        pair_code: cmd.pair_code.clone(),
        installation_id,
        installed_at: Utc::now(),
        log_dir: layout.log_dir.clone(),
    };
    let content = toml::to_string(&config)
        .map_err(|e| InstallError::Configuration(format!("cannot encode bridge config: {e}")))?;
    let path = layout.config_dir.join(BRIDGE_CONFIG_FILE);
    let existed = path.exists();
    write_private(&path, &content)?;
    if !existed {
        tracker.record(CreatedResource::Config { path: path.clone() });
    }
    info!(path = %path.display(), "Bridge configuration written");
    Ok(path)
}

pub fn read_bridge_config(path: &Path) -> Result<BridgeConfig, InstallError> {
    let content = fs::read_to_string(path).map_err(io_err("reading", path))?;
    toml::from_str(&content)
        .map_err(|e| InstallError::Configuration(format!("{}: {e}", path.display())))
}

/// Record a completed installation under the state directory.
pub fn write_state_marker(
    layout: &InstallLayout,
    marker: &StateMarker,
    tracker: &ResourceTracker,
) -> Result<PathBuf, InstallError> {
    let json = serde_json::to_string_pretty(marker)
        .map_err(|e| InstallError::other(format!("cannot encode state marker: {e}")))?;
    let path = layout.state_dir.join(STATE_MARKER_FILE);
    let existed = path.exists();
    write_private(&path, &json)?;
    if !existed {
        tracker.record(CreatedResource::PersistedState { path: path.clone() });
    }
    Ok(path)
}
