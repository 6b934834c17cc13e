//! Tamper-evident audit trail for an installation run.
//!
//! Events are append-only. Each event stores a BLAKE3 hash over its
//! canonical serialization, which includes the previous event's hash, so
//! editing, reordering or dropping any recorded event is detectable by
//! [`verify_chain`].

use crate::types::FinalResult;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hash that the first event in a chain links to.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    InstallationStarted,
    InstallationCompleted,
    SignatureValidation,
    ReplayCheck,
    TamperCheck,
    SecurityViolation,
    ComplianceCheck,
    StepStarted,
    StepSucceeded,
    StepFailed,
    RetryAttempt,
    RetryExhausted,
    RecoveryAttempt,
    RecoveryOutcome,
    RollbackStarted,
    RollbackAction,
    RollbackCompleted,
}

impl AuditEventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InstallationStarted => "installation_started",
            Self::InstallationCompleted => "installation_completed",
            Self::SignatureValidation => "signature_validation",
            Self::ReplayCheck => "replay_check",
            Self::TamperCheck => "tamper_check",
            Self::SecurityViolation => "security_violation",
            Self::ComplianceCheck => "compliance_check",
            Self::StepStarted => "step_started",
            Self::StepSucceeded => "step_succeeded",
            Self::StepFailed => "step_failed",
            Self::RetryAttempt => "retry_attempt",
            Self::RetryExhausted => "retry_exhausted",
            Self::RecoveryAttempt => "recovery_attempt",
            Self::RecoveryOutcome => "recovery_outcome",
            Self::RollbackStarted => "rollback_started",
            Self::RollbackAction => "rollback_action",
            Self::RollbackCompleted => "rollback_completed",
        }
    }
}

/// Audit severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Information => "information",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// A single recorded audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEvent {
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub message: String,
    pub details: BTreeMap<String, String>,
    /// Integrity hash of the preceding event.
    pub previous_hash: String,
    /// BLAKE3 over every other field of this event.
    pub integrity_hash: String,
}

#[derive(Serialize)]
struct CanonicalEvent<'a> {
    sequence: u64,
    event_id: &'a Uuid,
    timestamp: String,
    event_type: AuditEventType,
    severity: AuditSeverity,
    message: &'a str,
    details: &'a BTreeMap<String, String>,
    previous_hash: &'a str,
}

impl AuditEvent {
    /// Recompute the integrity hash from the current field values.
    pub fn compute_hash(&self) -> String {
        let canonical = CanonicalEvent {
            sequence: self.sequence,
            event_id: &self.event_id,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            event_type: self.event_type,
            severity: self.severity,
            message: &self.message,
            details: &self.details,
            previous_hash: &self.previous_hash,
        };
        // Field order is fixed by the struct and BTreeMap keys are sorted.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Whether the stored hash still matches the event content.
    pub fn is_intact(&self) -> bool {
        self.compute_hash() == self.integrity_hash
    }
}

/// Reasons a recorded chain fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    #[error("event {sequence} content does not match its integrity hash")]
    HashMismatch { sequence: u64 },

    #[error("event {sequence} does not link to the preceding event")]
    BrokenLink { sequence: u64 },

    #[error("expected event sequence {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
}

/// Verify every event hash and every link in a recorded chain.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), ChainViolation> {
    let mut previous = GENESIS_HASH;
    for (index, event) in events.iter().enumerate() {
        let expected = index as u64;
        if event.sequence != expected {
            return Err(ChainViolation::SequenceGap {
                expected,
                found: event.sequence,
            });
        }
        if event.previous_hash != previous {
            return Err(ChainViolation::BrokenLink {
                sequence: event.sequence,
            });
        }
        if !event.is_intact() {
            return Err(ChainViolation::HashMismatch {
                sequence: event.sequence,
            });
        }
        previous = &event.integrity_hash;
    }
    Ok(())
}

/// Build a details map from key/value pairs.
pub fn details<K, V, I>(pairs: I) -> BTreeMap<String, String>
where
    K: Into<String>,
    V: ToString,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

/// Immutable end-of-run summary, also the on-disk report format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub installation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: FinalResult,
    pub total_events: usize,
    pub counts_by_type: BTreeMap<String, usize>,
    pub counts_by_severity: BTreeMap<String, usize>,
    /// Integrity hash of the last event in the chain.
    pub chain_head: String,
    pub events: Vec<AuditEvent>,
}

impl AuditSummary {
    pub fn verify(&self) -> Result<(), ChainViolation> {
        verify_chain(&self.events)?;
        let head = self
            .events
            .last()
            .map(|e| e.integrity_hash.as_str())
            .unwrap_or(GENESIS_HASH);
        if head != self.chain_head {
            return Err(ChainViolation::BrokenLink {
                sequence: self.events.len() as u64,
            });
        }
        Ok(())
    }
}

/// Errors writing or reading the audit report artifact.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit report already written at {0}")]
    AlreadyWritten(PathBuf),

    #[error("failed to write audit report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read audit report {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("audit report is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

struct AuditState {
    events: Vec<AuditEvent>,
    head: String,
    summary: Option<Arc<AuditSummary>>,
}

/// Append-only audit log shared by every component of a run.
pub struct AuditLog {
    installation_id: Uuid,
    started_at: DateTime<Utc>,
    state: Mutex<AuditState>,
}

impl AuditLog {
    pub fn new(installation_id: Uuid) -> Self {
        Self {
            installation_id,
            started_at: Utc::now(),
            state: Mutex::new(AuditState {
                events: Vec::new(),
                head: GENESIS_HASH.to_string(),
                summary: None,
            }),
        }
    }

    pub fn installation_id(&self) -> Uuid {
        self.installation_id
    }

    fn lock(&self) -> MutexGuard<'_, AuditState> {
        // A panic while holding the lock cannot leave a half-written event:
        // the push is the last operation under the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event and return its id.
    pub fn record(
        &self,
        event_type: AuditEventType,
        severity: AuditSeverity,
        message: impl Into<String>,
        details: BTreeMap<String, String>,
    ) -> Uuid {
        let message = message.into();
        let event_id = Uuid::new_v4();

        let (sequence, hash) = {
            let mut state = self.lock();
            let mut event = AuditEvent {
                sequence: state.events.len() as u64,
                event_id,
                timestamp: Utc::now(),
                event_type,
                severity,
                message: message.clone(),
                details,
                previous_hash: state.head.clone(),
                integrity_hash: String::new(),
            };
            event.integrity_hash = event.compute_hash();
            state.head = event.integrity_hash.clone();
            let sequence = event.sequence;
            let hash = event.integrity_hash.clone();
            state.events.push(event);
            (sequence, hash)
        };

        let kind = event_type.as_str();
        match severity {
            AuditSeverity::Debug => debug!(audit = kind, sequence, hash = %hash, "{}", message),
            AuditSeverity::Information => {
                info!(audit = kind, sequence, hash = %hash, "{}", message)
            }
            AuditSeverity::Warning => warn!(audit = kind, sequence, hash = %hash, "{}", message),
            AuditSeverity::Error | AuditSeverity::Critical => {
                error!(audit = kind, sequence, severity = severity.as_str(), "{}", message)
            }
        }

        event_id
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count recorded events of one type.
    pub fn count_of(&self, event_type: AuditEventType) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Produce the run summary. The first call freezes it; later calls
    /// return the same summary regardless of `result`.
    pub fn finalize(&self, result: FinalResult) -> AuditSummary {
        let mut state = self.lock();
        if let Some(summary) = &state.summary {
            return summary.as_ref().clone();
        }

        let finished_at = Utc::now();
        let mut counts_by_type = BTreeMap::new();
        let mut counts_by_severity = BTreeMap::new();
        for event in &state.events {
            *counts_by_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
            *counts_by_severity
                .entry(event.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        let summary = AuditSummary {
            installation_id: self.installation_id,
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds().max(0) as u64,
            result,
            total_events: state.events.len(),
            counts_by_type,
            counts_by_severity,
            chain_head: state.head.clone(),
            events: state.events.clone(),
        };
        state.summary = Some(Arc::new(summary.clone()));
        summary
    }

    /// Write the summary as `audit-<installation-id>.json` under `dir`.
    ///
    /// The artifact is written once; a second write fails.
    pub fn write_report(&self, summary: &AuditSummary, dir: &Path) -> Result<PathBuf, AuditError> {
        let path = dir.join(format!("audit-{}.json", self.installation_id));
        if path.exists() {
            return Err(AuditError::AlreadyWritten(path));
        }
        fs::create_dir_all(dir).map_err(|source| AuditError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let json = serde_json::to_vec_pretty(summary)?;
        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|source| AuditError::Write {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), events = summary.total_events, "Audit report written");
        Ok(path)
    }
}

/// Load a previously written report.
pub fn load_report(path: &Path) -> Result<AuditSummary, AuditError> {
    let content = fs::read_to_string(path).map_err(|source| AuditError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}
