//! Sequential installation pipeline.
//!
//! Each step runs inside the retry executor. On the first retry of a step
//! with recovery enabled, the recovery engine gets one chance to repair the
//! environment. A step that still fails aborts the pipeline; if it allows
//! rollback and the fault is High or Critical, everything created so far is
//! undone.

use crate::audit::{AuditEventType, AuditSeverity, details};
use crate::context::InstallationContext;
use crate::errors::{ErrorCategory, ErrorClassifier, InstallError};
use crate::events::InstallEvent;
use crate::recovery::{RecoveryContext, RecoveryEngine};
use crate::retry::{RetryAttempt, RetryExecutor, RetryObserver};
use crate::rollback::{CreatedResource, RollbackManager, RollbackPlan, RollbackReport};
use crate::types::{ExitCode, FinalResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

pub type StepFuture = BoxFuture<'static, Result<(), InstallError>>;
pub type StepAction = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;
pub type ProgressCallback = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Shared list of resources created during the run, in creation order.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    inner: Arc<Mutex<Vec<CreatedResource>>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Registering the same resource twice is a no-op.
    pub fn record(&self, resource: CreatedResource) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.contains(&resource) {
            guard.push(resource);
        }
    }

    pub fn snapshot(&self) -> Vec<CreatedResource> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handed to a step action on every attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub resources: ResourceTracker,
}

/// A named unit of installation work.
#[derive(Clone)]
pub struct InstallationStep {
    pub name: String,
    /// 1-based position, assigned when the step is added to a pipeline.
    pub ordinal: u32,
    pub action: StepAction,
    pub max_retries: u32,
    pub recovery_enabled: bool,
    pub rollback_on_failure: bool,
    /// Exit code reported when this step fails without a more specific one.
    pub failure_code: ExitCode,
    /// Origin re-checked by download recovery.
    pub download_origin: Option<String>,
}

impl fmt::Debug for InstallationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationStep")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .field("max_retries", &self.max_retries)
            .field("recovery_enabled", &self.recovery_enabled)
            .field("rollback_on_failure", &self.rollback_on_failure)
            .field("failure_code", &self.failure_code)
            .finish_non_exhaustive()
    }
}

impl InstallationStep {
    /// New step with two retries, recovery and rollback enabled.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), InstallError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            ordinal: 0,
            action: Arc::new(move |ctx| Box::pin(action(ctx))),
            max_retries: 2,
            recovery_enabled: true,
            rollback_on_failure: true,
            failure_code: ExitCode::InstallationFailed,
            download_origin: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    pub fn with_failure_code(mut self, code: ExitCode) -> Self {
        self.failure_code = code;
        self
    }

    pub fn with_download_origin(mut self, origin: impl Into<String>) -> Self {
        self.download_origin = Some(origin.into());
        self
    }
}

/// Step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Recovering,
    Succeeded,
    Failed,
    RolledBack,
}

impl StepStatus {
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Recovering)
                | (Running, Failed)
                | (Retrying, Running)
                | (Retrying, Recovering)
                | (Recovering, Running)
                | (Failed, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Recovering => "recovering",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Per-step result, owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub ordinal: u32,
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub last_error: Option<String>,
    pub category: Option<ErrorCategory>,
    /// Every status the step has been in, oldest first.
    pub history: Vec<StepStatus>,
    pub recovery_attempted: bool,
    pub recovery_succeeded: Option<bool>,
}

impl StepOutcome {
    fn pending(step: &InstallationStep) -> Self {
        Self {
            step: step.name.clone(),
            ordinal: step.ordinal,
            status: StepStatus::Pending,
            attempts: 0,
            duration_ms: 0,
            last_error: None,
            category: None,
            history: vec![StepStatus::Pending],
            recovery_attempted: false,
            recovery_succeeded: None,
        }
    }

    /// Apply a transition. Illegal transitions are logged and ignored.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            error!(
                step = %self.step,
                from = self.status.as_str(),
                to = next.as_str(),
                "Illegal step transition ignored"
            );
            return false;
        }
        self.status = next;
        self.history.push(next);
        true
    }
}

/// Progress notification emitted when a step starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub step: String,
    /// 0-based index of the step.
    pub index: usize,
    pub total: usize,
    pub percent: u8,
}

/// Operator-facing description of the step that stopped the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub step: String,
    pub category: ErrorCategory,
    pub message: String,
    /// Catalog text with numbered remediation steps.
    pub remediation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub outcomes: Vec<StepOutcome>,
    pub final_result: FinalResult,
    pub exit_code: ExitCode,
    pub rollback: Option<RollbackReport>,
    pub failure: Option<FailureSummary>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.final_result.is_success()
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step == step)
    }
}

/// Runs recovery once, on the first retry, and keeps the step's status in
/// step with the retry executor.
struct RecoveryHook<'a> {
    outcome: &'a mut StepOutcome,
    engine: &'a RecoveryEngine,
    enabled: bool,
    resources: ResourceTracker,
    download_origin: Option<String>,
}

#[async_trait]
impl RetryObserver for RecoveryHook<'_> {
    async fn on_retry(&mut self, attempt: &RetryAttempt) {
        self.outcome.transition(StepStatus::Retrying);
        self.outcome.last_error = Some(attempt.error.clone());

        if self.enabled && !self.outcome.recovery_attempted {
            self.outcome.transition(StepStatus::Recovering);
            self.outcome.recovery_attempted = true;
            let context = RecoveryContext {
                step: self.outcome.step.clone(),
                download_origin: self.download_origin.clone(),
                resources: self.resources.clone(),
            };
            let recovered = self.engine.attempt(attempt.category, &context).await;
            self.outcome.recovery_succeeded = Some(recovered);
        }

        self.outcome.transition(StepStatus::Running);
    }
}

pub struct StepOrchestrator {
    ctx: InstallationContext,
    retry: RetryExecutor,
    recovery: Arc<RecoveryEngine>,
    rollback: RollbackManager,
    classifier: ErrorClassifier,
    steps: Vec<InstallationStep>,
    resources: ResourceTracker,
    progress: Option<ProgressCallback>,
}

impl StepOrchestrator {
    pub fn new(
        ctx: &InstallationContext,
        recovery: Arc<RecoveryEngine>,
        rollback: RollbackManager,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            retry: ctx.retry_executor(),
            recovery,
            rollback,
            classifier: ErrorClassifier::new(),
            steps: Vec::new(),
            resources: ResourceTracker::new(),
            progress: None,
        }
    }

    /// Replace the retry executor, e.g. with a faster backoff schedule.
    pub fn with_retry_executor(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn add_step(&mut self, mut step: InstallationStep) -> &mut Self {
        step.ordinal = self.steps.len() as u32 + 1;
        self.steps.push(step);
        self
    }

    pub fn with_step(mut self, step: InstallationStep) -> Self {
        self.add_step(step);
        self
    }

    pub fn steps(&self) -> &[InstallationStep] {
        &self.steps
    }

    /// Tracker that step actions record created resources into.
    pub fn resources(&self) -> ResourceTracker {
        self.resources.clone()
    }

    fn emit_progress(&self, step: &str, index: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            ((index * 100) / total).min(100) as u8
        };
        let update = ProgressUpdate {
            step: step.to_string(),
            index,
            total,
            percent,
        };
        info!(step, index, total, percent, "Installation progress");
        if let Some(callback) = &self.progress {
            callback(&update);
        }
        self.ctx.events.publish(InstallEvent::Progress {
            installation_id: self.ctx.installation_id,
            step: update.step,
            index,
            total,
            percent,
        });
    }

    /// Run every step in order, stopping at the first unrecoverable failure.
    pub async fn run(&self) -> PipelineReport {
        let total = self.steps.len();
        let mut outcomes: Vec<StepOutcome> = self.steps.iter().map(StepOutcome::pending).collect();
        let mut completed_steps = Vec::new();
        let mut report_failure = None;

        for (index, step) in self.steps.iter().enumerate() {
            self.emit_progress(&step.name, index, total);

            let outcome = &mut outcomes[index];
            outcome.transition(StepStatus::Running);
            self.ctx.audit.record(
                AuditEventType::StepStarted,
                AuditSeverity::Information,
                format!("Step {} ({}/{total}) started", step.name, step.ordinal),
                details([
                    ("step", step.name.clone()),
                    ("ordinal", step.ordinal.to_string()),
                    ("maxRetries", step.max_retries.to_string()),
                ]),
            );

            let started = Instant::now();
            let action = step.action.clone();
            let step_name = step.name.clone();
            let tracker = self.resources.clone();

            let mut hook = RecoveryHook {
                outcome,
                engine: self.recovery.as_ref(),
                enabled: step.recovery_enabled,
                resources: self.resources.clone(),
                download_origin: step.download_origin.clone(),
            };
            let result = self
                .retry
                .run(
                    &step.name,
                    step.max_retries,
                    |attempt| {
                        action(StepContext {
                            step_name: step_name.clone(),
                            attempt,
                            resources: tracker.clone(),
                        })
                    },
                    Some(&mut hook),
                )
                .await;

            let outcome = &mut outcomes[index];
            outcome.duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(success) => {
                    outcome.attempts = success.attempts;
                    outcome.transition(StepStatus::Succeeded);
                    completed_steps.push(step.name.clone());
                    self.ctx.audit.record(
                        AuditEventType::StepSucceeded,
                        AuditSeverity::Information,
                        format!("Step {} succeeded", step.name),
                        details([
                            ("step", step.name.clone()),
                            ("attempts", success.attempts.to_string()),
                            ("durationMs", outcome.duration_ms.to_string()),
                        ]),
                    );
                    self.publish_step(outcome);
                }
                Err(failure) => {
                    outcome.attempts = failure.attempts;
                    outcome.category = Some(failure.category);
                    outcome.last_error = Some(failure.error.to_string());
                    outcome.transition(StepStatus::Failed);
                    report_failure = Some((index, failure));
                    break;
                }
            }
        }

        let Some((index, failure)) = report_failure else {
            self.emit_progress("complete", total, total);
            return self.finish(outcomes, FinalResult::Succeeded, ExitCode::Success, None, None);
        };

        let step = &self.steps[index];
        let category = failure.category;
        let entry = category.entry();
        let message = failure.error.to_string();
        let severity = if category.severity() >= crate::types::Severity::Critical {
            AuditSeverity::Critical
        } else {
            AuditSeverity::Error
        };

        error!(step = %step.name, %category, attempts = failure.attempts, error = %message, "Installation step failed");
        warn!("{}", entry.format_full());
        self.ctx.audit.record(
            AuditEventType::StepFailed,
            severity,
            format!("Step {} failed: {message}", step.name),
            details([
                ("step", step.name.clone()),
                ("category", category.name().to_string()),
                ("severity", category.severity().to_string()),
                ("attempts", failure.attempts.to_string()),
                ("exhausted", failure.exhausted.to_string()),
            ]),
        );

        if let InstallError::SecurityViolation { code, .. } = &failure.error {
            self.ctx.events.publish(InstallEvent::Security {
                installation_id: self.ctx.installation_id,
                code: code.as_str().to_string(),
                severity: category.severity().to_string(),
                message: message.clone(),
            });
        }

        let mut exit_code = failure
            .error
            .exit_code_override()
            .unwrap_or(step.failure_code);
        let mut final_result = FinalResult::Failed {
            step: step.name.clone(),
            exit_code: exit_code.code(),
        };
        let mut rollback_report = None;

        if step.rollback_on_failure && category.severity().warrants_rollback() {
            let plan = RollbackPlan {
                completed_steps: completed_steps.clone(),
                resources: self.resources.snapshot(),
            };
            let report = self
                .rollback
                .rollback(plan, &format!("step {} failed: {message}", step.name))
                .await;

            self.ctx.events.publish(InstallEvent::Rollback {
                installation_id: self.ctx.installation_id,
                step: step.name.clone(),
                success: report.success,
                steps_undone: report.steps_undone.len(),
                errors: report.errors.len(),
            });

            if report.success {
                outcomes[index].transition(StepStatus::RolledBack);
                final_result = FinalResult::RolledBack {
                    step: step.name.clone(),
                    exit_code: exit_code.code(),
                };
            } else {
                exit_code = ExitCode::RollbackFailed;
                final_result = FinalResult::RollbackFailed {
                    step: step.name.clone(),
                };
            }
            rollback_report = Some(report);
        } else {
            info!(step = %step.name, %category, "Rollback not required for this failure");
        }

        self.publish_step(&outcomes[index]);
        let failure_summary = FailureSummary {
            step: step.name.clone(),
            category,
            message,
            remediation: entry.format_full(),
        };
        self.finish(
            outcomes,
            final_result,
            exit_code,
            rollback_report,
            Some(failure_summary),
        )
    }

    fn publish_step(&self, outcome: &StepOutcome) {
        self.ctx.events.publish(InstallEvent::StepCompleted {
            installation_id: self.ctx.installation_id,
            step: outcome.step.clone(),
            status: outcome.status.as_str().to_string(),
            attempts: outcome.attempts,
            duration_ms: outcome.duration_ms,
        });
    }

    fn finish(
        &self,
        outcomes: Vec<StepOutcome>,
        final_result: FinalResult,
        exit_code: ExitCode,
        rollback: Option<RollbackReport>,
        failure: Option<FailureSummary>,
    ) -> PipelineReport {
        self.ctx.audit.record(
            AuditEventType::InstallationCompleted,
            if final_result.is_success() {
                AuditSeverity::Information
            } else {
                AuditSeverity::Error
            },
            format!("Installation {}", final_result.label()),
            details([
                ("result", final_result.label().to_string()),
                ("exitCode", exit_code.code().to_string()),
            ]),
        );
        self.ctx.events.publish(InstallEvent::Completed {
            installation_id: self.ctx.installation_id,
            result: final_result.label().to_string(),
            exit_code: exit_code.code(),
            duration_ms: self.ctx.elapsed_ms(),
        });
        info!(result = final_result.label(), exit_code = exit_code.code(), "Installation finished");

        PipelineReport {
            outcomes,
            final_result,
            exit_code,
            rollback,
            failure,
        }
    }
}
