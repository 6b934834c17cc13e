//! `brinst check`: compliance checks without installing anything.

use super::load_config;
use crate::platform::{SystemFacts, evaluate};
use anyhow::Result;
use brinst_common::{ExitCode, InstallLayout};
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Installer configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Place every installer directory under this prefix
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CheckArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref(), args.root.as_deref())?;
    let layout = InstallLayout::from_config(&config.paths);
    let facts = SystemFacts::gather(&layout.install_dir()).await;
    let report = evaluate(&config.compliance, &facts);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.checks {
            let mark = if check.passed { "PASS" } else { "FAIL" };
            println!("{mark}  {:<18} {}", check.name, check.detail);
        }
    }

    let code = match report.into_result() {
        Ok(()) => ExitCode::Success,
        Err(e) => e
            .exit_code_override()
            .unwrap_or(ExitCode::SystemRequirementsNotMet),
    };
    Ok(code.code())
}
