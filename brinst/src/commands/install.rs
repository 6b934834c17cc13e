//! `brinst install`: validate the pairing command and install the agent.

use super::load_config;
use crate::pipeline::{InstallDeps, PackageSource, build_steps};
use crate::platform::{
    HttpNetworkDiagnostics, HttpSignatureOracle, PackageDownloader, SystemServiceManager,
};
use anyhow::{Context, Result};
use brinst_common::orchestrator::{PipelineReport, ProgressUpdate};
use brinst_common::platform::ServiceManager;
use brinst_common::signature::{HmacSignatureOracle, NonceStore, SignatureOracle};
use brinst_common::{
    EventSink, FanoutSink, InstallationCommand, InstallationContext, InstallerConfig, OracleMode,
    RecoveryEngine, RollbackManager, SignatureValidator, StepOrchestrator, ValidatorPolicy,
};
use brinst_telemetry::{TelemetryQueue, TelemetryWorker, build_sinks, resolve_host};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long telemetry may keep flushing after the pipeline ends.
const TELEMETRY_GRACE: Duration = Duration::from_secs(5);

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Pairing code shown in the platform console
    #[arg(long, env = "BRINST_PAIR_CODE")]
    pub pair_code: String,

    /// Base64 signature over the command
    #[arg(long, env = "BRINST_SIGNATURE")]
    pub signature: String,

    /// Single-use nonce
    #[arg(long, env = "BRINST_NONCE")]
    pub nonce: String,

    /// Subject (tenant) GUID
    #[arg(long, env = "BRINST_SUBJECT_ID")]
    pub subject_id: String,

    /// RFC 3339 expiration timestamp
    #[arg(long, env = "BRINST_EXPIRES_AT")]
    pub expires_at: String,

    /// Platform endpoint (https://)
    #[arg(long, env = "BRINST_ENDPOINT")]
    pub endpoint: String,

    /// Installer configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Package URL (https:// or file://); defaults to <endpoint>/downloads/<binary>
    #[arg(long)]
    pub package_url: Option<String>,

    /// Expected SHA-256 of the package (hex)
    #[arg(long)]
    pub package_sha256: Option<String>,

    /// Place every installer directory under this prefix
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Signature oracle: http or hmac
    #[arg(long)]
    pub oracle: Option<OracleMode>,

    /// Disable telemetry for this run
    #[arg(long)]
    pub no_telemetry: bool,

    /// Print the pipeline report as JSON
    #[arg(long)]
    pub json: bool,
}

impl InstallArgs {
    fn command(&self) -> InstallationCommand {
        InstallationCommand::new(
            self.pair_code.trim(),
            self.signature.trim(),
            self.nonce.trim(),
            self.subject_id.trim(),
            self.expires_at.trim(),
            self.endpoint.trim(),
        )
    }

    fn apply_overrides(&self, config: &mut InstallerConfig) {
        if let Some(mode) = self.oracle {
            config.oracle.mode = mode;
        }
        if let Some(url) = &self.package_url {
            config.package.url = Some(url.clone());
        }
        if let Some(sha) = &self.package_sha256 {
            config.package.sha256 = Some(sha.clone());
        }
        if self.no_telemetry {
            config.telemetry.enabled = false;
        }
    }
}

/// HTTP oracle at the configured base URL.
fn http_oracle(config: &InstallerConfig) -> Result<HttpSignatureOracle> {
    let base = config
        .oracle
        .trusted_base_url()
        .context("configuring signature oracle")?;
    HttpSignatureOracle::new(base, config.oracle.timeout()).context("configuring signature oracle")
}

fn build_oracle(config: &InstallerConfig) -> Result<Arc<dyn SignatureOracle>> {
    Ok(match config.oracle.mode {
        OracleMode::Http => {
            let oracle = http_oracle(config)?;
            info!(oracle = %oracle.base_url(), "Verifying commands against remote oracle");
            Arc::new(oracle)
        }
        OracleMode::Hmac => {
            let oracle = match &config.oracle.hmac_key_file {
                Some(path) => HmacSignatureOracle::from_key_file(path),
                None => HmacSignatureOracle::from_env(&config.oracle.hmac_key_env),
            }
            .context("loading HMAC signing key")?;
            Arc::new(oracle)
        }
    })
}

fn start_telemetry(
    config: &InstallerConfig,
    endpoint: &str,
) -> Result<Option<(TelemetryQueue, TelemetryWorker)>> {
    if !config.telemetry.enabled {
        return Ok(None);
    }
    let sinks = build_sinks(&config.telemetry, Some(endpoint), &config.paths.log_dir)
        .context("configuring telemetry")?;
    if sinks.is_empty() {
        return Ok(None);
    }
    Ok(Some(TelemetryQueue::spawn(
        config.telemetry.queue_capacity,
        resolve_host(),
        sinks,
    )))
}

fn print_progress(update: &ProgressUpdate) {
    println!(
        "[{:>3}%] {} ({}/{})",
        update.percent,
        update.step,
        (update.index + 1).min(update.total),
        update.total
    );
}

fn print_report(report: &PipelineReport) {
    match &report.failure {
        None => println!("Installation succeeded."),
        Some(failure) => {
            println!(
                "Installation {} at step '{}' (exit code {}).",
                report.final_result.label(),
                failure.step,
                report.exit_code.code()
            );
            println!("{}", failure.message);
            println!("{}", failure.remediation);
        }
    }
    if let Some(rollback) = &report.rollback {
        println!(
            "Rollback {}: {} undone, {} already absent, {} errors.",
            if rollback.success { "completed" } else { "incomplete" },
            rollback.steps_undone.len(),
            rollback.already_absent.len(),
            rollback.errors.len()
        );
    }
}

pub async fn run(args: InstallArgs) -> Result<i32> {
    let mut config = load_config(args.config.as_deref(), args.root.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate().context("validating installer configuration")?;

    let command = args.command();
    let oracle = build_oracle(&config)?;
    let nonces = Arc::new(
        NonceStore::open(&config.nonce_store_path(), config.security.nonce_retention_days)
            .context("opening nonce store")?,
    );
    let package = PackageSource::resolve(
        config.package.url.clone(),
        config.package.sha256.clone(),
        &command.endpoint,
        &config.service.binary_name,
    );

    let telemetry = start_telemetry(&config, &command.endpoint)?;
    let mut events = FanoutSink::new();
    if let Some((queue, _)) = &telemetry {
        events = events.with(Arc::new(queue.clone()));
    }
    let events: Arc<dyn EventSink> = Arc::new(events);

    let ctx = InstallationContext::new(config, events);
    info!(installation_id = %ctx.installation_id, endpoint = %command.endpoint, "Starting bridge installation");

    let services: Arc<dyn ServiceManager> = Arc::new(SystemServiceManager::detect());
    let network = Arc::new(HttpNetworkDiagnostics::new()?);
    let downloader = Arc::new(PackageDownloader::new(
        ctx.layout.download_dir.clone(),
        Duration::from_secs(ctx.config.package.timeout_secs),
    )?);
    let validator = Arc::new(SignatureValidator::new(
        oracle,
        nonces,
        ctx.audit.clone(),
        ValidatorPolicy::from_config(&ctx.config),
    ));

    let recovery = Arc::new(RecoveryEngine::new(
        network.clone(),
        services.clone(),
        ctx.layout.clone(),
        ctx.audit.clone(),
        ctx.config.network.clone(),
        ctx.config.service.clone(),
    ));
    let rollback = RollbackManager::new(services.clone(), ctx.audit.clone())
        .with_stop_timeout(ctx.config.service.stop_timeout())
        .with_backup_dir(ctx.layout.state_dir.join("rollback-backup"));

    let deps = InstallDeps {
        ctx: ctx.clone(),
        command: Arc::new(command),
        validator,
        services,
        network,
        downloader,
        package,
    };
    let mut orchestrator =
        StepOrchestrator::new(&ctx, recovery, rollback).on_progress(Box::new(print_progress));
    for step in build_steps(&deps) {
        orchestrator.add_step(step);
    }

    let report = orchestrator.run().await;

    let summary = ctx.audit.finalize(report.final_result.clone());
    match ctx.audit.write_report(&summary, &ctx.layout.audit_dir) {
        Ok(path) => println!("Audit report: {}", path.display()),
        Err(e) => warn!(error = %e, "Could not write audit report"),
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if let Some((_, worker)) = telemetry {
        let stats = worker.shutdown(TELEMETRY_GRACE).await;
        debug!(?stats, "Telemetry flushed");
    }

    Ok(report.exit_code.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use brinst_common::signature::VerifyRequest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Oracle stand-in that answers every request with `is_valid`.
    async fn oracle_server(is_valid: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = format!(r#"{{"isValid":{is_valid}}}"#);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_http_mode_without_base_url_is_refused() {
        let config = InstallerConfig::default();
        let err = build_oracle(&config).err().expect("oracle built without a trusted url");
        assert!(format!("{err:#}").contains("oracle.base_url"), "{err:#}");
    }

    #[tokio::test]
    async fn test_command_endpoint_never_answers_verification() {
        let trusted = oracle_server(false).await;
        let forged_endpoint = oracle_server(true).await;

        let mut config = InstallerConfig::default();
        config.oracle.base_url = Some(trusted.clone());
        let oracle = http_oracle(&config).unwrap();
        assert_eq!(oracle.base_url(), trusted);
        assert_ne!(oracle.base_url(), forged_endpoint);

        let response = build_oracle(&config)
            .unwrap()
            .verify(&VerifyRequest {
                message: format!("PAIR-ABC123|nonce-0000000001|id|t|{forged_endpoint}"),
                signature: "Zm9yZ2VkLXNpZ25hdHVyZS1mb3JnZWQtc2lnbmF0dXJl".into(),
                nonce: "nonce-0000000001".into(),
                subject_id: "0f8fad5b-d9cb-469f-a165-70867728950e".into(),
                timestamp: "2030-01-01T00:00:00Z".into(),
            })
            .await
            .unwrap();
        assert!(!response.is_valid);
    }
}
