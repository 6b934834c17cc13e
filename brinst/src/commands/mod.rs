//! Subcommand implementations.
//!
//! Each command returns the process exit code; `main` turns errors that
//! escape as `anyhow::Error` into a configuration failure.

pub mod check;
pub mod install;
pub mod verify_audit;

use anyhow::{Context, Result};
use brinst_common::InstallerConfig;
use std::path::Path;
use tracing::debug;

/// Load the installer config, optionally rebasing every directory under `root`.
pub fn load_config(path: Option<&Path>, root: Option<&Path>) -> Result<InstallerConfig> {
    let mut config = InstallerConfig::load(path).context("loading installer configuration")?;
    if let Some(root) = root {
        config.paths = InstallerConfig::rooted_at(root).paths;
        debug!(root = %root.display(), "Installation rooted under prefix");
    }
    Ok(config)
}
