//! Core engine of the bridge installer.
//!
//! Validates signed installation commands, runs the installation steps with
//! classified retries, automated recovery and ordered rollback, and keeps a
//! hash-chained audit trail of everything that happened.
//!
//! Platform effects (service manager, network, signature oracle) are behind
//! traits in [`platform`] and [`signature::oracle`]; the `brinst` binary
//! supplies the real implementations.

pub mod audit;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod layout;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod recovery;
pub mod retry;
pub mod rollback;
pub mod signature;
pub mod testing;
pub mod types;

pub use audit::{
    AuditError, AuditEvent, AuditEventType, AuditLog, AuditSeverity, AuditSummary,
    ChainViolation, GENESIS_HASH, details, load_report, verify_chain,
};
pub use config::{ConfigError, InstallerConfig, OracleMode, StartupType};
pub use context::InstallationContext;
pub use errors::{CategoryEntry, ErrorCategory, ErrorClassifier, InstallError, RecoveryProcedure};
pub use events::{EventBus, EventSink, FanoutSink, InstallEvent, NullEventSink, TimedEvent};
pub use layout::InstallLayout;
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use orchestrator::{
    FailureSummary, InstallationStep, PipelineReport, ProgressUpdate, ResourceTracker,
    StepContext, StepOrchestrator, StepOutcome, StepStatus,
};
pub use platform::{NetworkDiagnostics, ServiceError, ServiceManager, ServiceSpec, ServiceState};
pub use recovery::{RecoveryAction, RecoveryContext, RecoveryEngine};
pub use retry::{RetryAttempt, RetryExecutor, RetryFailure, RetryObserver, RetryPolicy, RetrySuccess};
pub use rollback::{CreatedResource, RollbackManager, RollbackPlan, RollbackReport};
pub use signature::{SignatureValidator, ValidatorPolicy};
pub use types::{
    ExitCode, FinalResult, InstallationCommand, Severity, ValidationErrorCode, ValidationResult,
};
