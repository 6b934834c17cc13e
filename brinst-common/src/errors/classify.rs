//! Maps raised faults onto catalog categories.

use super::catalog::ErrorCategory;
use super::fault::InstallError;
use regex::Regex;
use std::io;
use std::sync::LazyLock;

/// Message patterns per category, in classification order.
static MESSAGE_PATTERNS: LazyLock<Vec<(ErrorCategory, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorCategory::Network,
            r"(?i)network|connection (refused|reset|closed|aborted)|unreachable|\bdns\b|name resolution|could not resolve|no route to host|socket|\btls\b|\bssl\b|proxy",
        ),
        (
            ErrorCategory::Permission,
            r"(?i)access (is )?denied|permission denied|unauthori[sz]ed|forbidden|privilege|administrator|elevat|not permitted",
        ),
        (
            ErrorCategory::Storage,
            r"(?i)disk (is )?full|no space|insufficient (disk|storage)|disk space|quota|read-only file ?system|file (is )?(in use|locked)|being used by another process|path too long",
        ),
        (
            ErrorCategory::Service,
            r"(?i)\bservice\b|systemctl|sc\.exe|daemon|\bunit\b|startup type",
        ),
        (
            ErrorCategory::Configuration,
            r"(?i)config|invalid (setting|value|format)|\bparse\b|malformed|missing (key|field)",
        ),
        (
            ErrorCategory::Download,
            r"(?i)download|checksum|hash mismatch|integrity|corrupt|truncated|http (status )?[45]\d\d",
        ),
        (
            ErrorCategory::Timeout,
            r"(?i)timed? ?out|deadline|took too long",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        let regex = Regex::new(pattern).unwrap_or_else(|e| panic!("invalid pattern {pattern}: {e}"));
        (category, regex)
    })
    .collect()
});

/// Stateless classifier over the static category table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a fault. Typed variants win over I/O kinds, which win over
    /// message patterns; anything unmatched is [`ErrorCategory::Unknown`].
    pub fn classify(&self, err: &InstallError) -> ErrorCategory {
        match err {
            InstallError::SecurityViolation { .. } => ErrorCategory::SecurityViolation,
            InstallError::Network(_) => ErrorCategory::Network,
            InstallError::Permission(_) => ErrorCategory::Permission,
            InstallError::Storage(_) => ErrorCategory::Storage,
            InstallError::Service(_) => ErrorCategory::Service,
            InstallError::Configuration(_) => ErrorCategory::Configuration,
            InstallError::Download(_) | InstallError::Integrity(_) => ErrorCategory::Download,
            InstallError::Timeout(_) => ErrorCategory::Timeout,
            InstallError::Io { context, source } => classify_io_kind(source.kind())
                .unwrap_or_else(|| self.classify_message(&format!("{context}: {source}"))),
            InstallError::Requirement(message) | InstallError::Other(message) => {
                self.classify_message(message)
            }
        }
    }

    /// Match free-form text against the category patterns.
    pub fn classify_message(&self, message: &str) -> ErrorCategory {
        MESSAGE_PATTERNS
            .iter()
            .find(|(_, regex)| regex.is_match(message))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<ErrorCategory> {
    use io::ErrorKind::*;
    match kind {
        PermissionDenied => Some(ErrorCategory::Permission),
        TimedOut => Some(ErrorCategory::Timeout),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
        | AddrNotAvailable | AddrInUse | BrokenPipe | NetworkUnreachable | HostUnreachable
        | NetworkDown => Some(ErrorCategory::Network),
        StorageFull | ReadOnlyFilesystem | QuotaExceeded | FileTooLarge | WriteZero
        | DirectoryNotEmpty | NotADirectory | IsADirectory | ResourceBusy => {
            Some(ErrorCategory::Storage)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValidationErrorCode;

    fn classify(err: InstallError) -> ErrorCategory {
        ErrorClassifier::new().classify(&err)
    }

    #[test]
    fn test_typed_variants() {
        assert_eq!(
            classify(InstallError::security(ValidationErrorCode::TamperDetected, "x")),
            ErrorCategory::SecurityViolation
        );
        assert_eq!(classify(InstallError::Network("x".into())), ErrorCategory::Network);
        assert_eq!(
            classify(InstallError::Integrity("sha".into())),
            ErrorCategory::Download
        );
        assert_eq!(classify(InstallError::Timeout("x".into())), ErrorCategory::Timeout);
    }

    #[test]
    fn test_io_kinds() {
        let err = InstallError::io(
            "writing binary",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(classify(err), ErrorCategory::Permission);

        let err = InstallError::io("writing binary", io::Error::from(io::ErrorKind::StorageFull));
        assert_eq!(classify(err), ErrorCategory::Storage);

        let err = InstallError::io(
            "probing endpoint",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(classify(err), ErrorCategory::Network);
    }

    #[test]
    fn test_io_falls_back_to_message() {
        let err = InstallError::io(
            "reading config",
            io::Error::new(io::ErrorKind::InvalidData, "malformed toml"),
        );
        assert_eq!(classify(err), ErrorCategory::Configuration);
    }

    #[test]
    fn test_message_patterns_follow_priority() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify_message("connection timed out"),
            ErrorCategory::Timeout
        );
        // Network keywords outrank the timeout pattern.
        assert_eq!(
            classifier.classify_message("connection refused by proxy, timed out"),
            ErrorCategory::Network
        );
        assert_eq!(
            classifier.classify_message("Access is denied."),
            ErrorCategory::Permission
        );
        assert_eq!(
            classifier.classify_message("There is not enough disk space"),
            ErrorCategory::Storage
        );
        assert_eq!(
            classifier.classify_message("The service did not respond"),
            ErrorCategory::Service
        );
        assert_eq!(
            classifier.classify_message("checksum mismatch for bridge.exe"),
            ErrorCategory::Download
        );
    }

    #[test]
    fn test_unmatched_is_unknown() {
        assert_eq!(
            classify(InstallError::other("something odd happened")),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_requirement_uses_message() {
        assert_eq!(
            classify(InstallError::Requirement("only 120 MB disk space free".into())),
            ErrorCategory::Storage
        );
    }
}
