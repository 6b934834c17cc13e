//! Fault model for the installer.
//!
//! Installation steps raise [`InstallError`]. The [`ErrorClassifier`] maps a
//! fault onto an [`ErrorCategory`] from the static catalog, which carries the
//! severity, retryability, remediation steps and recovery procedure used by
//! the retry, recovery and rollback machinery.
//!
//! # Classification Order
//!
//! | Priority | Category        | Severity | Retryable |
//! |----------|-----------------|----------|-----------|
//! | 0        | SecurityViolation | Critical | no      |
//! | 1        | Network         | Medium   | yes       |
//! | 2        | Permission      | High     | no        |
//! | 3        | Storage         | High     | yes       |
//! | 4        | Service         | High     | yes       |
//! | 5        | Configuration   | Medium   | yes       |
//! | 6        | Download        | High     | yes       |
//! | 7        | Timeout         | Medium   | yes       |
//! | 8        | Unknown         | Medium   | yes       |

pub mod catalog;
pub mod classify;
pub mod fault;

pub use catalog::{CategoryEntry, ErrorCategory, RecoveryProcedure};
pub use classify::ErrorClassifier;
pub use fault::InstallError;
