//! Installer configuration.
//!
//! Resolution order, later wins:
//! 1. Built-in defaults
//! 2. TOML file passed with `--config`
//! 3. `BRINST_*` environment variables
//!
//! The merged result is validated before use; every problem is reported in
//! one [`ConfigError`].

pub mod env;

pub use env::{EnvError, EnvParser};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", join(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

fn join(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Complete installer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    pub oracle: OracleConfig,
    pub retry: RetryConfig,
    pub paths: PathsConfig,
    pub service: ServiceConfig,
    pub security: SecurityConfig,
    pub telemetry: TelemetryConfig,
    pub network: NetworkConfig,
    pub package: PackageConfig,
    pub compliance: ComplianceConfig,
}

/// Which signature oracle verifies commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OracleMode {
    #[default]
    Http,
    Hmac,
}

impl FromStr for OracleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "hmac" => Ok(Self::Hmac),
            other => Err(format!("unknown oracle mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OracleConfig {
    pub mode: OracleMode,
    /// Verification service base URL. Required in http mode.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub attempts: u32,
    /// Linear backoff step between oracle attempts.
    pub backoff_ms: u64,
    /// File holding the HMAC key (base64) for the local oracle.
    pub hmac_key_file: Option<PathBuf>,
    /// Environment variable holding the HMAC key (base64).
    pub hmac_key_env: String,
    /// Consult the remote nonce-usage service before the local store.
    pub check_remote_nonce: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            mode: OracleMode::Http,
            base_url: None,
            timeout_secs: 15,
            attempts: 3,
            backoff_ms: 500,
            hmac_key_file: None,
            hmac_key_env: "BRINST_HMAC_KEY".to_string(),
            check_remote_nonce: true,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Base URL of the verification service for http mode.
    ///
    /// The endpoint named inside a command is never a fallback: it is part
    /// of the input being verified.
    pub fn trusted_base_url(&self) -> Result<&str, ConfigError> {
        self.base_url.as_deref().ok_or_else(|| {
            ConfigError::Invalid(vec![
                "oracle.base_url is required in http mode (set [oracle] base_url or BRINST_ORACLE_URL)"
                    .to_string(),
            ])
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub backoff_base: f64,
    pub max_delay_ms: u64,
    /// Fractional jitter; 0.2 means a factor in [0.8, 1.2].
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            backoff_base: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub install_dir: PathBuf,
    /// Used by storage recovery when `install_dir` is unusable.
    pub alternate_install_dir: Option<PathBuf>,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Installer-owned scratch space; purged by storage recovery.
    pub temp_dir: PathBuf,
    pub download_dir: PathBuf,
    pub audit_dir: PathBuf,
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("brinst")
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = data_root();
        Self {
            install_dir: root.join("bin"),
            alternate_install_dir: dirs::home_dir().map(|h| h.join(".brinst").join("bin")),
            config_dir: dirs::config_dir()
                .unwrap_or_else(|| root.clone())
                .join("brinst"),
            state_dir: root.join("state"),
            log_dir: root.join("logs"),
            temp_dir: std::env::temp_dir().join("brinst"),
            download_dir: dirs::cache_dir()
                .unwrap_or_else(|| root.clone())
                .join("brinst")
                .join("downloads"),
            audit_dir: root.join("audit"),
        }
    }
}

/// Service start mode passed to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartupType {
    #[default]
    Automatic,
    Manual,
    Disabled,
}

impl fmt::Display for StartupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Disabled => "disabled",
        })
    }
}

impl FromStr for StartupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "automatic" | "auto" => Ok(Self::Automatic),
            "manual" | "demand" => Ok(Self::Manual),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!("unknown startup type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub display_name: String,
    pub binary_name: String,
    pub startup_type: StartupType,
    pub stop_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "bridge-agent".to_string(),
            display_name: "Bridge Agent".to_string(),
            binary_name: if cfg!(windows) {
                "bridge-agent.exe".to_string()
            } else {
                "bridge-agent".to_string()
            },
            startup_type: StartupType::Automatic,
            stop_timeout_secs: 30,
        }
    }
}

impl ServiceConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Defaults to `<state_dir>/nonces.jsonl`.
    pub nonce_store_path: Option<PathBuf>,
    pub nonce_retention_days: u32,
    /// Maximum distance of `expiresAt` from now, in either direction.
    pub max_expiry_window_hours: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            nonce_store_path: None,
            nonce_retention_days: 7,
            max_expiry_window_hours: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// HTTP sink URL. Defaults to `<endpoint>/telemetry` when unset.
    pub url: Option<String>,
    pub queue_capacity: usize,
    pub timeout_secs: u64,
    /// Local JSONL copy. Defaults to `<log_dir>/telemetry.jsonl`.
    pub jsonl_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            queue_capacity: 256,
            timeout_secs: 10,
            jsonl_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Independent endpoints probed by network recovery.
    pub probe_endpoints: Vec<String>,
    pub min_reachable: usize,
    pub probe_timeout_secs: u64,
    pub connection_test_timeout_secs: u64,
    /// Connection test target. Defaults to `<endpoint>/health`.
    pub health_url: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_endpoints: vec![
                "https://www.google.com/generate_204".to_string(),
                "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
                "https://www.microsoft.com".to_string(),
            ],
            min_reachable: 2,
            probe_timeout_secs: 10,
            connection_test_timeout_secs: 15,
            health_url: None,
        }
    }
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connection_test_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_test_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    /// Defaults to `<endpoint>/downloads/<binary_name>`.
    pub url: Option<String>,
    /// Expected SHA-256 (hex). Verification is skipped when unset.
    pub sha256: Option<String>,
    /// Per-request and per-chunk timeout.
    pub timeout_secs: u64,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            url: None,
            sha256: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComplianceConfig {
    pub supported_os: Vec<String>,
    pub require_elevation: bool,
    pub min_free_disk_mb: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            supported_os: vec!["linux".to_string(), "windows".to_string()],
            require_elevation: true,
            min_free_disk_mb: 500,
        }
    }
}

impl InstallerConfig {
    /// Load from an optional file, apply process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, &mut EnvParser::new())
    }

    /// As [`InstallerConfig::load`] with an explicit environment source.
    pub fn load_with(path: Option<&Path>, env: &mut EnvParser) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env);
        let env_errors = env.take_errors();
        if !env_errors.is_empty() {
            return Err(ConfigError::Env(env_errors));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded installer config");
        Ok(config)
    }

    /// Apply `BRINST_*` overrides. Errors stay in the parser.
    pub fn apply_env(&mut self, env: &mut EnvParser) {
        if let Some(v) = env.get_parsed("ORACLE_MODE", "http or hmac") {
            self.oracle.mode = v;
        }
        if let Some(v) = env.get_string("ORACLE_URL") {
            self.oracle.base_url = Some(v);
        }
        if let Some(v) = env.get_u64_range("ORACLE_TIMEOUT_SECS", 1, 60) {
            self.oracle.timeout_secs = v;
        }
        if let Some(v) = env.get_path("HMAC_KEY_FILE") {
            self.oracle.hmac_key_file = Some(v);
        }
        if let Some(v) = env.get_bool("CHECK_REMOTE_NONCE") {
            self.oracle.check_remote_nonce = v;
        }

        if let Some(v) = env.get_u64_range("RETRY_INITIAL_DELAY_MS", 1, 600_000) {
            self.retry.initial_delay_ms = v;
        }
        if let Some(v) = env.get_u64_range("RETRY_MAX_DELAY_MS", 1, 3_600_000) {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = env.get_f64_range("RETRY_BACKOFF_BASE", 1.0, 10.0) {
            self.retry.backoff_base = v;
        }
        if let Some(v) = env.get_f64_range("RETRY_JITTER", 0.0, 0.5) {
            self.retry.jitter = v;
        }

        if let Some(v) = env.get_path("INSTALL_DIR") {
            self.paths.install_dir = v;
        }
        if let Some(v) = env.get_path("CONFIG_DIR") {
            self.paths.config_dir = v;
        }
        if let Some(v) = env.get_path("STATE_DIR") {
            self.paths.state_dir = v;
        }
        if let Some(v) = env.get_path("AUDIT_DIR") {
            self.paths.audit_dir = v;
        }

        if let Some(v) = env.get_string("SERVICE_NAME") {
            self.service.name = v;
        }
        if let Some(v) = env.get_parsed("SERVICE_STARTUP", "automatic, manual or disabled") {
            self.service.startup_type = v;
        }

        if let Some(v) = env.get_bool("TELEMETRY_ENABLED") {
            self.telemetry.enabled = v;
        }
        if let Some(v) = env.get_string("TELEMETRY_URL") {
            self.telemetry.url = Some(v);
        }
        if let Some(v) = env.get_u32_range("TELEMETRY_QUEUE", 1, 65_536) {
            self.telemetry.queue_capacity = v as usize;
        }

        if let Some(v) = env.get_string("PACKAGE_URL") {
            self.package.url = Some(v);
        }
        if let Some(v) = env.get_string("PACKAGE_SHA256") {
            self.package.sha256 = Some(v);
        }

        if let Some(v) = env.get_string("HEALTH_URL") {
            self.network.health_url = Some(v);
        }

        if let Some(v) = env.get_u64_range("MIN_FREE_DISK_MB", 0, 1_048_576) {
            self.compliance.min_free_disk_mb = v;
        }
        if let Some(v) = env.get_bool("REQUIRE_ELEVATION") {
            self.compliance.require_elevation = v;
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.oracle.attempts == 0 || self.oracle.attempts > 10 {
            problems.push(format!(
                "oracle.attempts must be 1..=10, got {}",
                self.oracle.attempts
            ));
        }
        if !(1..=60).contains(&self.oracle.timeout_secs) {
            problems.push("oracle.timeout_secs must be 1..=60".to_string());
        }
        if let Some(url) = &self.oracle.base_url
            && !url.starts_with("https://")
        {
            problems.push(format!("oracle.base_url must use https, got '{url}'"));
        }

        if self.retry.initial_delay_ms == 0 {
            problems.push("retry.initial_delay_ms must be positive".to_string());
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            problems.push("retry.max_delay_ms must be >= retry.initial_delay_ms".to_string());
        }
        if self.retry.backoff_base.is_nan() || self.retry.backoff_base < 1.0 {
            problems.push("retry.backoff_base must be >= 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            problems.push("retry.jitter must be in [0.0, 1.0)".to_string());
        }

        let name_ok = !self.service.name.is_empty()
            && self
                .service
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !name_ok {
            problems.push(format!("service.name '{}' is not valid", self.service.name));
        }
        if self.service.binary_name.is_empty()
            || self.service.binary_name.contains(['/', '\\'])
        {
            problems.push("service.binary_name must be a bare file name".to_string());
        }

        if self.security.nonce_retention_days == 0 {
            problems.push("security.nonce_retention_days must be positive".to_string());
        }

        if self.telemetry.queue_capacity == 0 {
            problems.push("telemetry.queue_capacity must be positive".to_string());
        }
        if let Some(url) = &self.telemetry.url
            && !(url.starts_with("https://") || url.starts_with("http://"))
        {
            problems.push(format!("telemetry.url must be an http(s) URL, got '{url}'"));
        }

        if self.network.min_reachable == 0 {
            problems.push("network.min_reachable must be positive".to_string());
        }
        if self.network.probe_endpoints.len() < self.network.min_reachable {
            problems.push(format!(
                "network.probe_endpoints has {} entries, fewer than min_reachable ({})",
                self.network.probe_endpoints.len(),
                self.network.min_reachable
            ));
        }

        if let Some(sha) = &self.package.sha256
            && (sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()))
        {
            problems.push("package.sha256 must be 64 hex characters".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Path of the local nonce store.
    pub fn nonce_store_path(&self) -> PathBuf {
        self.security
            .nonce_store_path
            .clone()
            .unwrap_or_else(|| self.paths.state_dir.join("nonces.jsonl"))
    }

    /// Configuration rooted entirely under `root`, for tests and sandboxes.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths = PathsConfig {
            install_dir: root.join("bin"),
            alternate_install_dir: Some(root.join("alt-bin")),
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            log_dir: root.join("logs"),
            temp_dir: root.join("tmp"),
            download_dir: root.join("downloads"),
            audit_dir: root.join("audit"),
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = InstallerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.oracle.attempts, 3);
        assert_eq!(config.oracle.timeout_secs, 15);
        assert_eq!(config.security.nonce_retention_days, 7);
        assert_eq!(config.service.stop_timeout_secs, 30);
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "from-file"

[retry]
initial_delay_ms = 250
"#
        )
        .unwrap();

        let mut env = EnvParser::from_pairs(&[("BRINST_SERVICE_NAME", "from-env")]);
        let config = InstallerConfig::load_with(Some(file.path()), &mut env).unwrap();
        assert_eq!(config.service.name, "from-env");
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 30_000);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service]\nnmae = \"typo\"").unwrap();
        let err = InstallerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_errors_reported_together() {
        let mut env = EnvParser::from_pairs(&[
            ("BRINST_ORACLE_TIMEOUT_SECS", "0"),
            ("BRINST_TELEMETRY_ENABLED", "perhaps"),
            ("BRINST_ORACLE_MODE", "carrier-pigeon"),
        ]);
        match InstallerConfig::load_with(None, &mut env) {
            Err(ConfigError::Env(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected env errors, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_collects_problems() {
        let mut config = InstallerConfig::default();
        config.oracle.base_url = Some("http://insecure".to_string());
        config.retry.max_delay_ms = 10;
        config.network.min_reachable = 5;
        config.package.sha256 = Some("abc".to_string());

        match config.validate() {
            Err(ConfigError::Invalid(problems)) => {
                assert_eq!(problems.len(), 4, "{problems:?}");
                assert!(problems.iter().any(|p| p.contains("https")));
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_http_oracle_needs_configured_url() {
        let mut config = InstallerConfig::default();
        match config.oracle.trusted_base_url() {
            Err(ConfigError::Invalid(problems)) => {
                assert!(problems[0].contains("oracle.base_url"));
            }
            other => panic!("expected missing base_url, got {other:?}"),
        }

        let mut env = EnvParser::from_pairs(&[("BRINST_ORACLE_URL", "https://verify.example.com")]);
        config.apply_env(&mut env);
        assert_eq!(
            config.oracle.trusted_base_url().unwrap(),
            "https://verify.example.com"
        );
    }

    #[test]
    fn test_enum_env_parsing() {
        let mut env = EnvParser::from_pairs(&[
            ("BRINST_ORACLE_MODE", "HMAC"),
            ("BRINST_SERVICE_STARTUP", "demand"),
        ]);
        let config = InstallerConfig::load_with(None, &mut env).unwrap();
        assert_eq!(config.oracle.mode, OracleMode::Hmac);
        assert_eq!(config.service.startup_type, StartupType::Manual);
    }

    #[test]
    fn test_rooted_paths_and_nonce_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig::rooted_at(dir.path());
        assert!(config.paths.install_dir.starts_with(dir.path()));
        assert_eq!(
            config.nonce_store_path(),
            dir.path().join("state").join("nonces.jsonl")
        );
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = InstallerConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: InstallerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
