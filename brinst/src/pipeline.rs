//! The bridge installation as an ordered list of steps.

use crate::platform::provision::{self, StateMarker};
use crate::platform::network::health_url;
use crate::platform::{
    DownloadedPackage, HttpNetworkDiagnostics, PackageDownloader, SystemFacts, evaluate,
};
use brinst_common::errors::InstallError;
use brinst_common::orchestrator::{InstallationStep, StepContext};
use brinst_common::platform::{ServiceManager, ServiceSpec};
use brinst_common::rollback::CreatedResource;
use brinst_common::types::{ExitCode, InstallationCommand, ValidationErrorCode};
use brinst_common::{InstallationContext, SignatureValidator};
use chrono::Utc;
use std::sync::{Arc, Mutex};

pub const VALIDATE_COMMAND: &str = "validate-command";
pub const CHECK_COMPLIANCE: &str = "check-compliance";
pub const CREATE_DIRECTORIES: &str = "create-directories";
pub const DOWNLOAD_PACKAGE: &str = "download-package";
pub const INSTALL_BINARY: &str = "install-binary";
pub const WRITE_CONFIGURATION: &str = "write-configuration";
pub const REGISTER_SERVICE: &str = "register-service";
pub const START_SERVICE: &str = "start-service";
pub const TEST_CONNECTION: &str = "test-connection";
pub const RECORD_STATE: &str = "record-state";

/// Where the agent package comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSource {
    pub url: String,
    pub sha256: Option<String>,
}

impl PackageSource {
    /// Configured URL, or `<endpoint>/downloads/<binary_name>`.
    pub fn resolve(
        url: Option<String>,
        sha256: Option<String>,
        endpoint: &str,
        binary_name: &str,
    ) -> Self {
        let url = url.unwrap_or_else(|| {
            format!("{}/downloads/{binary_name}", endpoint.trim_end_matches('/'))
        });
        Self { url, sha256 }
    }
}

/// Collaborators the steps close over.
#[derive(Clone)]
pub struct InstallDeps {
    pub ctx: InstallationContext,
    pub command: Arc<InstallationCommand>,
    pub validator: Arc<SignatureValidator>,
    pub services: Arc<dyn ServiceManager>,
    pub network: Arc<HttpNetworkDiagnostics>,
    pub downloader: Arc<PackageDownloader>,
    pub package: PackageSource,
}

/// Output of one step that a later step consumes.
type Slot<T> = Arc<Mutex<Option<T>>>;

fn put<T>(slot: &Slot<T>, value: T) {
    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(value);
}

fn get<T: Clone>(slot: &Slot<T>, what: &str) -> Result<T, InstallError> {
    slot.lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
        .ok_or_else(|| InstallError::other(format!("{what} is not available")))
}

/// Every installation step in execution order.
pub fn build_steps(deps: &InstallDeps) -> Vec<InstallationStep> {
    let package: Slot<DownloadedPackage> = Arc::new(Mutex::new(None));
    let config_path: Slot<std::path::PathBuf> = Arc::new(Mutex::new(None));

    vec![
        validate_command(deps),
        check_compliance(deps),
        create_directories(deps),
        download_package(deps, package.clone()),
        install_binary(deps, package.clone()),
        write_configuration(deps, config_path.clone()),
        register_service(deps, config_path),
        start_service(deps),
        test_connection(deps),
        record_state(deps, package),
    ]
}

fn validate_command(deps: &InstallDeps) -> InstallationStep {
    let validator = deps.validator.clone();
    let command = deps.command.clone();
    InstallationStep::new(VALIDATE_COMMAND, move |_| {
        let validator = validator.clone();
        let command = command.clone();
        async move {
            let result = validator.validate(&command).await;
            if result.is_valid() {
                return Ok(());
            }
            let code = result
                .error_code()
                .unwrap_or(ValidationErrorCode::InvalidSignature);
            Err(InstallError::security(code, result.error_message()))
        }
    })
    .with_max_retries(0)
    .with_recovery(false)
    .with_failure_code(ExitCode::InvalidSignature)
}

fn check_compliance(deps: &InstallDeps) -> InstallationStep {
    let ctx = deps.ctx.clone();
    InstallationStep::new(CHECK_COMPLIANCE, move |_| {
        let ctx = ctx.clone();
        async move {
            let facts = SystemFacts::gather(&ctx.layout.install_dir()).await;
            evaluate(&ctx.config.compliance, &facts).into_result()
        }
    })
    .with_max_retries(0)
    .with_recovery(false)
    .with_failure_code(ExitCode::SystemRequirementsNotMet)
}

fn create_directories(deps: &InstallDeps) -> InstallationStep {
    let ctx = deps.ctx.clone();
    InstallationStep::new(CREATE_DIRECTORIES, move |step: StepContext| {
        let ctx = ctx.clone();
        async move { provision::create_directories(&ctx.layout, &step.resources) }
    })
}

fn download_package(deps: &InstallDeps, slot: Slot<DownloadedPackage>) -> InstallationStep {
    let downloader = deps.downloader.clone();
    let source = deps.package.clone();
    let file_name = deps.ctx.config.service.binary_name.clone();
    InstallationStep::new(DOWNLOAD_PACKAGE, move |step: StepContext| {
        let downloader = downloader.clone();
        let source = source.clone();
        let file_name = file_name.clone();
        let slot = slot.clone();
        async move {
            let downloaded = downloader
                .download(&source.url, source.sha256.as_deref(), &file_name)
                .await?;
            step.resources.record(CreatedResource::File {
                path: downloaded.path.clone(),
            });
            put(&slot, downloaded);
            Ok(())
        }
    })
    .with_max_retries(3)
    .with_failure_code(ExitCode::DownloadFailed)
    .with_download_origin(deps.package.url.clone())
}

fn install_binary(deps: &InstallDeps, slot: Slot<DownloadedPackage>) -> InstallationStep {
    let ctx = deps.ctx.clone();
    InstallationStep::new(INSTALL_BINARY, move |step: StepContext| {
        let ctx = ctx.clone();
        let slot = slot.clone();
        async move {
            let package = get(&slot, "downloaded package")?;
            provision::install_binary(
                &package.path,
                &ctx.layout,
                &ctx.config.service.binary_name,
                &step.resources,
            )
            .map(|_| ())
        }
    })
}

fn write_configuration(deps: &InstallDeps, slot: Slot<std::path::PathBuf>) -> InstallationStep {
    let ctx = deps.ctx.clone();
    let command = deps.command.clone();
    InstallationStep::new(WRITE_CONFIGURATION, move |step: StepContext| {
        let ctx = ctx.clone();
        let command = command.clone();
        let slot = slot.clone();
        async move {
            let path = provision::write_bridge_config(
                &ctx.layout,
                &command,
                ctx.installation_id,
                &step.resources,
            )?;
            // Read back what the agent will load.
            let written = provision::read_bridge_config(&path)?;
            if written.subject_id != command.subject_id || written.endpoint != command.endpoint {
                return Err(InstallError::Configuration(format!(
                    "{} does not match the pairing command",
                    path.display()
                )));
            }
            put(&slot, path);
            Ok(())
        }
    })
    .with_failure_code(ExitCode::ConfigurationFailed)
}

fn register_service(deps: &InstallDeps, config_path: Slot<std::path::PathBuf>) -> InstallationStep {
    let ctx = deps.ctx.clone();
    let services = deps.services.clone();
    InstallationStep::new(REGISTER_SERVICE, move |step: StepContext| {
        let ctx = ctx.clone();
        let services = services.clone();
        let config_path = config_path.clone();
        async move {
            let config_path = get(&config_path, "bridge configuration")?;
            let service = &ctx.config.service;
            let spec = ServiceSpec {
                name: service.name.clone(),
                display_name: service.display_name.clone(),
                binary_path: ctx.layout.binary_path(&service.binary_name),
                args: vec!["--config".to_string(), config_path.display().to_string()],
                startup_type: service.startup_type,
            };
            // Tracked first so a half-registered service is still rolled back.
            step.resources.record(CreatedResource::Service {
                name: spec.name.clone(),
                binary_path: spec.binary_path.clone(),
            });
            services.create(&spec).await?;
            Ok(())
        }
    })
    .with_failure_code(ExitCode::ServiceInstallationFailed)
}

fn start_service(deps: &InstallDeps) -> InstallationStep {
    let services = deps.services.clone();
    let name = deps.ctx.config.service.name.clone();
    InstallationStep::new(START_SERVICE, move |_| {
        let services = services.clone();
        let name = name.clone();
        async move { services.start(&name).await.map_err(InstallError::from) }
    })
    .with_failure_code(ExitCode::ServiceInstallationFailed)
}

fn test_connection(deps: &InstallDeps) -> InstallationStep {
    let network = deps.network.clone();
    let url = deps
        .ctx
        .config
        .network
        .health_url
        .clone()
        .unwrap_or_else(|| health_url(&deps.command.endpoint));
    let timeout = deps.ctx.config.network.connection_test_timeout();
    InstallationStep::new(TEST_CONNECTION, move |_| {
        let network = network.clone();
        let url = url.clone();
        async move { network.check_health(&url, timeout).await }
    })
    .with_failure_code(ExitCode::ConnectionTestFailed)
}

fn record_state(deps: &InstallDeps, package: Slot<DownloadedPackage>) -> InstallationStep {
    let ctx = deps.ctx.clone();
    InstallationStep::new(RECORD_STATE, move |step: StepContext| {
        let ctx = ctx.clone();
        let package = package.clone();
        async move {
            let marker = StateMarker {
                installation_id: ctx.installation_id,
                installer_version: env!("CARGO_PKG_VERSION").to_string(),
                service_name: ctx.config.service.name.clone(),
                binary_path: ctx.layout.binary_path(&ctx.config.service.binary_name),
                package_sha256: get(&package, "downloaded package").ok().map(|p| p.sha256),
                installed_at: Utc::now(),
            };
            provision::write_state_marker(&ctx.layout, &marker, &step.resources).map(|_| ())
        }
    })
}
