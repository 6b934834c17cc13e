//! Structured logs for test runs.
//!
//! Tests call [`init_test_logging`] to route tracing output to the libtest
//! writer and to `<target>/test-logs/brinst_tests.jsonl`. A [`TestLogger`]
//! additionally keeps one JSONL file per test with phase markers, and can
//! replay an installation's audit trail into it so a failed CI run shows
//! exactly which decisions the engine made.

use crate::audit::{AuditLog, verify_chain};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{LineWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const GLOBAL_LOG_FILE: &str = "brinst_tests.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
    Teardown,
}

impl TestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory for test log files.
///
/// `BRINST_TEST_LOG_DIR` wins, then `$CARGO_TARGET_DIR/test-logs`, then the
/// workspace `target/test-logs`.
fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("BRINST_TEST_LOG_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(target) = std::env::var_os("CARGO_TARGET_DIR") {
        return PathBuf::from(target).join("test-logs");
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("target")
        .join("test-logs")
}

fn open_log(name: &str) -> Option<File> {
    let dir = log_dir();
    fs::create_dir_all(&dir).ok()?;
    File::create(dir.join(name)).ok()
}

/// Install the process-wide test subscriber once; later calls are no-ops.
///
/// The filter comes from `BRINST_TEST_LOG` (a full directive such as
/// `brinst_common=debug`) and defaults to `info` for the workspace crates.
pub fn init_test_logging() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let directive = std::env::var("BRINST_TEST_LOG").unwrap_or_else(|_| {
            "brinst=info,brinst_common=info,brinst_telemetry=info".to_string()
        });
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

        let jsonl = open_log(GLOBAL_LOG_FILE).map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_thread_names(true)
        });
        let console = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .compact();

        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(jsonl)
            .with(console)
            .try_init();
    });
}

/// One line of a per-test log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    pub test: String,
    pub phase: TestPhase,
    pub elapsed_ms: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Phase-marked log for a single test.
pub struct TestLogger {
    test: String,
    started: Instant,
    entries: Mutex<Vec<TestLogEntry>>,
    file: Option<Mutex<LineWriter<File>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TestLogger {
    /// Start a logger for `test` (usually `module::name`) and mark the start.
    pub fn for_test(test: &str) -> Self {
        init_test_logging();
        let file_name = format!("{}.jsonl", test.replace("::", "__").replace(['/', '\\'], "_"));
        let logger = Self {
            test: test.to_string(),
            started: Instant::now(),
            entries: Mutex::new(Vec::new()),
            file: open_log(&file_name).map(|f| Mutex::new(LineWriter::new(f))),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.push(phase, message.into(), None);
    }

    /// Replay every audit event, then the result of a chain check.
    pub fn log_audit(&self, audit: &AuditLog) {
        let events = audit.events();
        for event in &events {
            self.push(
                TestPhase::Verify,
                format!(
                    "audit #{} {} {}",
                    event.sequence,
                    event.event_type.as_str(),
                    event.message
                ),
                serde_json::to_value(event).ok(),
            );
        }
        let chain = match verify_chain(&events) {
            Ok(()) => format!("audit chain intact ({} events)", events.len()),
            Err(violation) => format!("audit chain broken: {violation}"),
        };
        self.log(TestPhase::Verify, chain);
    }

    pub fn entries(&self) -> Vec<TestLogEntry> {
        lock(&self.entries).clone()
    }

    pub fn pass(self) {
        self.log(TestPhase::Teardown, "TEST PASS");
    }

    fn push(&self, phase: TestPhase, message: String, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            test: self.test.clone(),
            phase,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            message,
            data,
        };
        tracing::info!(test = %entry.test, phase = %phase, elapsed_ms = entry.elapsed_ms, "{}", entry.message);

        if let Some(file) = &self.file
            && let Ok(line) = serde_json::to_string(&entry)
        {
            let _ = writeln!(lock(file), "{line}");
        }
        lock(&self.entries).push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditSeverity, details};

    #[test]
    fn test_entries_keep_phase_order() {
        let logger = TestLogger::for_test("testing::log::order");
        logger.log(TestPhase::Execute, "running");
        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "TEST START");
        assert_eq!(entries[1].phase, TestPhase::Execute);
        assert!(entries[0].elapsed_ms <= entries[1].elapsed_ms);
        logger.pass();
    }

    #[test]
    fn test_audit_replay_ends_with_chain_check() {
        let logger = TestLogger::for_test("testing::log::audit");
        let audit = AuditLog::new(uuid::Uuid::new_v4());
        audit.record(
            AuditEventType::ComplianceCheck,
            AuditSeverity::Information,
            "disk ok",
            details([("check", "disk_space")]),
        );
        logger.log_audit(&audit);

        let entries = logger.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries[1].message.ends_with("disk ok"));
        assert_eq!(entries[1].data.as_ref().unwrap()["sequence"], 0);
        assert_eq!(entries[2].message, "audit chain intact (1 events)");
    }
}
