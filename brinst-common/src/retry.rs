//! Bounded retry with exponential backoff and jitter.
//!
//! Attempts run `1..=max_retries + 1`. A failure is classified before any
//! retry decision; categories marked non-retryable propagate immediately.

use crate::audit::{AuditEventType, AuditLog, AuditSeverity, details};
use crate::config::RetryConfig;
use crate::errors::{ErrorCategory, ErrorClassifier, InstallError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_base: f64,
    pub max_delay: Duration,
    /// Jitter fraction; the delay is scaled by a factor in `[1 - j, 1 + j]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_base: config.backoff_base,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Pre-jitter delay before the retry that follows failed attempt
    /// `attempt` (1-based): `min(initial * base^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_secs = self.max_delay.as_secs_f64().max(0.0);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_base.max(1.0).powi(exponent);
        let secs = if scaled.is_finite() {
            scaled.min(max_secs)
        } else {
            max_secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Scale `base` by the jitter factor for `sample` in `[0, 1)`, then
    /// clamp to `max_delay` again.
    pub fn apply_jitter(&self, base: Duration, sample: f64) -> Duration {
        if self.jitter <= 0.0 || base.is_zero() {
            return base.min(self.max_delay);
        }
        let factor = 1.0 + (sample.clamp(0.0, 1.0) * 2.0 - 1.0) * self.jitter;
        let secs = (base.as_secs_f64() * factor).max(0.0);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.base_delay(attempt), fastrand::f64())
    }
}

/// Details of a failed attempt that will be retried.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub label: String,
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub category: ErrorCategory,
    pub error: String,
}

/// Hook invoked before each backoff sleep.
#[async_trait]
pub trait RetryObserver: Send {
    async fn on_retry(&mut self, attempt: &RetryAttempt);
}

#[derive(Debug)]
pub struct RetrySuccess<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct RetryFailure {
    pub error: InstallError,
    pub category: ErrorCategory,
    pub attempts: u32,
    /// False when the error was not retryable and attempts remained.
    pub exhausted: bool,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    audit: Arc<AuditLog>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, audit: Arc<AuditLog>) -> Self {
        Self {
            policy,
            classifier: ErrorClassifier::new(),
            audit,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `action` until it succeeds, fails with a non-retryable category,
    /// or `max_retries + 1` attempts have been made.
    ///
    /// `action` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        max_retries: u32,
        mut action: F,
        mut observer: Option<&mut (dyn RetryObserver + '_)>,
    ) -> Result<RetrySuccess<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InstallError>>,
    {
        let max_attempts = max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            debug!(label, attempt, max_attempts, "Starting attempt");

            let error = match action(attempt).await {
                Ok(value) => {
                    self.audit.record(
                        AuditEventType::RetryAttempt,
                        AuditSeverity::Debug,
                        format!("{label}: attempt {attempt} succeeded"),
                        details([
                            ("operation", label.to_string()),
                            ("attempt", attempt.to_string()),
                            ("outcome", "succeeded".to_string()),
                        ]),
                    );
                    if attempt > 1 {
                        info!(label, attempt, "Succeeded after retry");
                    }
                    return Ok(RetrySuccess {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            let category = self.classifier.classify(&error);
            let retryable = category.retryable();
            self.audit.record(
                AuditEventType::RetryAttempt,
                AuditSeverity::Warning,
                format!("{label}: attempt {attempt} failed: {error}"),
                details([
                    ("operation", label.to_string()),
                    ("attempt", attempt.to_string()),
                    ("outcome", "failed".to_string()),
                    ("category", category.name().to_string()),
                    ("retryable", retryable.to_string()),
                ]),
            );

            if !retryable {
                warn!(label, attempt, %category, error = %error, "Attempt failed (non-retryable)");
                return Err(RetryFailure {
                    error,
                    category,
                    attempts: attempt,
                    exhausted: attempt >= max_attempts,
                });
            }

            if attempt >= max_attempts {
                warn!(label, attempt, %category, error = %error, "Retries exhausted");
                self.audit.record(
                    AuditEventType::RetryExhausted,
                    AuditSeverity::Error,
                    format!("{label}: gave up after {attempt} attempts"),
                    details([
                        ("operation", label.to_string()),
                        ("attempts", attempt.to_string()),
                        ("category", category.name().to_string()),
                        ("error", error.to_string()),
                    ]),
                );
                return Err(RetryFailure {
                    error,
                    category,
                    attempts: attempt,
                    exhausted: true,
                });
            }

            let delay = self.policy.jittered_delay(attempt);
            warn!(label, attempt, %category, delay_ms = delay.as_millis() as u64, error = %error, "Attempt failed, retrying");

            if let Some(observer) = observer.as_deref_mut() {
                let info = RetryAttempt {
                    label: label.to_string(),
                    attempt,
                    max_attempts,
                    delay,
                    category,
                    error: error.to_string(),
                };
                observer.on_retry(&info).await;
            }

            sleep(delay).await;
            attempt += 1;
        }
    }
}
