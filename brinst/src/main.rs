//! Bridge Installer
//!
//! Validates a signed pairing command, then installs the bridge agent as a
//! background service with classified retries, automated recovery and
//! rollback. Every decision lands in a hash-chained audit report.

#![forbid(unsafe_code)]

mod commands;
mod pipeline;
mod platform;

use anyhow::Result;
use brinst_common::{ExitCode, LogConfig, LogFormat, init_logging};
use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser)]
#[command(name = "brinst")]
#[command(author, version, about = "Bridge installer - signed, audited agent installation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format on stderr: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pairing command and install the bridge agent
    Install(commands::install::InstallArgs),

    /// Run compliance checks only
    Check(commands::check::CheckArgs),

    /// Verify the hash chain of an audit report
    VerifyAudit(commands::verify_audit::VerifyAuditArgs),
}

async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Install(args) => commands::install::run(args).await,
        Commands::Check(args) => commands::check::run(args).await,
        Commands::VerifyAudit(args) => commands::verify_audit::run(args),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    let logging_guards = init_logging(&log_config)?;

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "brinst failed");
            eprintln!("error: {err:#}");
            ExitCode::ConfigurationFailed.code()
        }
    };
    if code != 0 {
        // exit() skips destructors; flush file logs first.
        drop(logging_guards);
        std::process::exit(code);
    }
    Ok(())
}
