//! On-disk locations used by one installation run.

use crate::config::PathsConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

/// Resolved directories for a run.
///
/// The install directory can move once, when storage recovery switches to
/// the alternate location; everything else is fixed.
#[derive(Debug)]
pub struct InstallLayout {
    install_dir: RwLock<PathBuf>,
    alternate_install_dir: Option<PathBuf>,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub download_dir: PathBuf,
    pub audit_dir: PathBuf,
}

impl InstallLayout {
    pub fn from_config(paths: &PathsConfig) -> Self {
        Self {
            install_dir: RwLock::new(paths.install_dir.clone()),
            alternate_install_dir: paths.alternate_install_dir.clone(),
            config_dir: paths.config_dir.clone(),
            state_dir: paths.state_dir.clone(),
            log_dir: paths.log_dir.clone(),
            temp_dir: paths.temp_dir.clone(),
            download_dir: paths.download_dir.clone(),
            audit_dir: paths.audit_dir.clone(),
        }
    }

    pub fn install_dir(&self) -> PathBuf {
        self.install_dir
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn binary_path(&self, binary_name: &str) -> PathBuf {
        self.install_dir().join(binary_name)
    }

    pub fn alternate_install_dir(&self) -> Option<&Path> {
        self.alternate_install_dir.as_deref()
    }

    /// Move installation to the alternate directory if it is writable.
    ///
    /// Returns the new directory and whether this call created it.
    pub fn switch_to_alternate(&self) -> io::Result<(PathBuf, bool)> {
        let alternate = self.alternate_install_dir.clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no alternate install directory")
        })?;
        if alternate == self.install_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "alternate install directory already in use",
            ));
        }
        let created = !alternate.is_dir();
        ensure_writable(&alternate)?;

        let mut current = self
            .install_dir
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(from = %current.display(), to = %alternate.display(), "Switching install directory");
        *current = alternate.clone();
        Ok((alternate, created))
    }
}

/// Create `dir` if needed and prove it accepts writes.
pub fn ensure_writable(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".brinst-write-probe-{}", std::process::id()));
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)
}
