//! `brinst verify-audit`: re-check the hash chain of a written report.

use anyhow::{Context, Result};
use brinst_common::load_report;
use clap::Args;
use std::path::PathBuf;
use tracing::warn;

/// Exit code when the report fails verification.
pub const TAMPERED_EXIT: i32 = 1;

#[derive(Args, Debug)]
pub struct VerifyAuditArgs {
    /// Audit report written by `brinst install`
    pub report: PathBuf,
}

pub fn run(args: VerifyAuditArgs) -> Result<i32> {
    let summary = load_report(&args.report)
        .with_context(|| format!("reading audit report {}", args.report.display()))?;

    match summary.verify() {
        Ok(()) => {
            println!(
                "Audit report intact: installation {} {} ({} events, chain head {})",
                summary.installation_id,
                summary.result.label(),
                summary.total_events,
                summary.chain_head
            );
            Ok(0)
        }
        Err(violation) => {
            warn!(report = %args.report.display(), %violation, "Audit report failed verification");
            println!("Audit report TAMPERED: {violation}");
            Ok(TAMPERED_EXIT)
        }
    }
}
