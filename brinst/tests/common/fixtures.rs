use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use brinst_common::InstallationCommand;
use brinst_common::signature::{HmacSignatureOracle, canonical_message};
use chrono::{Duration, SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const SUBJECT_ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";
const ENDPOINT: &str = "https://bridge.example.com";

/// Isolated install root plus an HMAC key the binary is told to trust.
pub struct InstallFixture {
    pub dir: TempDir,
    key: Vec<u8>,
}

impl InstallFixture {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating install root");
        let dir = TempDir::new().expect("Failed to create temp dir");
        let key = (0u8..48).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect();
        Self { dir, key }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root().join("audit")
    }

    /// Write an installer config next to the root and return its path.
    pub fn write_config(&self, toml: &str) -> PathBuf {
        let path = self.root().join("brinst.toml");
        fs::write(&path, toml).expect("Failed to write config");
        path
    }

    /// Command signed with the fixture key, expiring `expires_in` from now.
    pub fn signed_command(&self, nonce: &str, expires_in: Duration) -> InstallationCommand {
        let expires_at = (Utc::now() + expires_in).to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut cmd = InstallationCommand::new(
            "PAIR-ABC123",
            "",
            nonce,
            SUBJECT_ID,
            expires_at,
            ENDPOINT,
        );
        let oracle = HmacSignatureOracle::new(self.key.clone()).expect("key too short");
        cmd.signature = oracle
            .sign(&canonical_message(&cmd))
            .expect("Failed to sign command");
        cmd
    }

    /// The binary with an isolated environment.
    pub fn brinst(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_brinst"));
        command
            .env("BRINST_HMAC_KEY", STANDARD.encode(&self.key))
            .env("BRINST_LOG", "warn")
            .env_remove("BRINST_LOG_DIR")
            .env_remove("BRINST_ORACLE_MODE")
            .env_remove("BRINST_ORACLE_URL");
        command
    }

    /// `brinst install` for `cmd` against the local HMAC oracle.
    pub fn install(&self, cmd: &InstallationCommand, extra: &[&str]) -> Output {
        let root = self.root().display().to_string();
        self.brinst()
            .args(["install", "--oracle", "hmac", "--no-telemetry", "--root", &root])
            .args(["--pair-code", &cmd.pair_code])
            .args(["--signature", &cmd.signature])
            .args(["--nonce", &cmd.nonce])
            .args(["--subject-id", &cmd.subject_id])
            .args(["--expires-at", &cmd.expires_at])
            .args(["--endpoint", &cmd.endpoint])
            .args(extra)
            .output()
            .expect("Failed to run brinst install")
    }

    /// The single audit report written so far.
    pub fn audit_report(&self) -> PathBuf {
        let mut reports: Vec<PathBuf> = fs::read_dir(self.audit_dir())
            .expect("audit directory missing")
            .map(|e| e.expect("bad dir entry").path())
            .collect();
        reports.sort();
        reports.pop().expect("no audit report written")
    }
}
