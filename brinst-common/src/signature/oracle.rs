//! Signature verification oracles.
//!
//! The remote HTTP oracle lives in the binary crate. The HMAC oracle here
//! verifies locally against a key supplied at runtime.

use super::constant_time_eq;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted HMAC key length in bytes.
pub const MIN_HMAC_KEY_LEN: usize = 32;

/// Body of `POST /verify-signature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub message: String,
    pub signature: String,
    pub nonce: String,
    pub subject_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Body of `POST /check-nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceCheckRequest {
    pub nonce: String,
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceCheckResponse {
    pub is_used: bool,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failure: {0}")]
    Transport(String),

    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),

    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("oracle response could not be decoded: {0}")]
    Decode(String),

    #[error("signing key unavailable: {0}")]
    Key(String),
}

/// Remote (or local) authority on signature validity and nonce usage.
#[async_trait]
pub trait SignatureOracle: Send + Sync {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, OracleError>;

    async fn check_nonce(
        &self,
        request: &NonceCheckRequest,
    ) -> Result<NonceCheckResponse, OracleError>;
}

/// Call budget for oracle requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OraclePolicy {
    pub attempts: u32,
    /// Linear step: attempt `n` waits `n * backoff` before the next try.
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for OraclePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Final answer from the verification oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// The oracle answered and rejected the signature.
    Rejected(String),
    /// No definitive answer after all attempts.
    Unavailable(String),
}

/// Verify with bounded attempts. A definitive answer is never retried.
pub async fn verify_with_retry(
    oracle: &dyn SignatureOracle,
    request: &VerifyRequest,
    policy: OraclePolicy,
) -> Verdict {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, oracle.verify(request)).await {
            Ok(Ok(response)) if response.is_valid => return Verdict::Valid,
            Ok(Ok(response)) => {
                return Verdict::Rejected(
                    response
                        .error_message
                        .unwrap_or_else(|| "signature rejected".to_string()),
                );
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = OracleError::Timeout(policy.timeout).to_string(),
        }

        warn!(attempt, attempts, error = %last_error, "Signature oracle call failed");
        if attempt < attempts {
            tokio::time::sleep(policy.backoff * attempt).await;
        }
    }

    Verdict::Unavailable(last_error)
}

/// Single best-effort nonce lookup. `None` when the oracle cannot answer.
pub async fn nonce_used_remotely(
    oracle: &dyn SignatureOracle,
    request: &NonceCheckRequest,
    timeout: Duration,
) -> Option<bool> {
    match tokio::time::timeout(timeout, oracle.check_nonce(request)).await {
        Ok(Ok(response)) => Some(response.is_used),
        Ok(Err(e)) => {
            debug!(error = %e, "Nonce oracle unavailable, using local store only");
            None
        }
        Err(_) => {
            debug!(?timeout, "Nonce oracle timed out, using local store only");
            None
        }
    }
}

/// Local HMAC-SHA256 oracle.
///
/// The key is loaded at runtime from a file or environment variable and is
/// never compiled in.
pub struct HmacSignatureOracle {
    key: Vec<u8>,
}

impl std::fmt::Debug for HmacSignatureOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSignatureOracle")
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}

impl HmacSignatureOracle {
    pub fn new(key: Vec<u8>) -> Result<Self, OracleError> {
        if key.len() < MIN_HMAC_KEY_LEN {
            return Err(OracleError::Key(format!(
                "key is {} bytes, minimum is {MIN_HMAC_KEY_LEN}",
                key.len()
            )));
        }
        Ok(Self { key })
    }

    /// Key given as base64 text.
    pub fn from_base64(encoded: &str) -> Result<Self, OracleError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| OracleError::Key(format!("key is not valid base64: {e}")))?;
        Self::new(key)
    }

    pub fn from_key_file(path: &Path) -> Result<Self, OracleError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OracleError::Key(format!("cannot read {}: {e}", path.display())))?;
        Self::from_base64(&content)
    }

    pub fn from_env(var: &str) -> Result<Self, OracleError> {
        let value =
            std::env::var(var).map_err(|_| OracleError::Key(format!("{var} is not set")))?;
        Self::from_base64(&value)
    }

    fn mac(&self, message: &str) -> Result<Vec<u8>, OracleError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| OracleError::Key(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Base64 signature for `message`.
    pub fn sign(&self, message: &str) -> Result<String, OracleError> {
        Ok(STANDARD.encode(self.mac(message)?))
    }
}

#[async_trait]
impl SignatureOracle for HmacSignatureOracle {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, OracleError> {
        let expected = self.mac(&request.message)?;
        let provided = match STANDARD.decode(request.signature.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Ok(VerifyResponse {
                    is_valid: false,
                    error_message: Some("signature is not valid base64".to_string()),
                });
            }
        };

        if constant_time_eq(&expected, &provided) {
            Ok(VerifyResponse {
                is_valid: true,
                error_message: None,
            })
        } else {
            Ok(VerifyResponse {
                is_valid: false,
                error_message: Some("signature does not match".to_string()),
            })
        }
    }

    async fn check_nonce(
        &self,
        _request: &NonceCheckRequest,
    ) -> Result<NonceCheckResponse, OracleError> {
        // A local key has no shared usage ledger.
        Ok(NonceCheckResponse { is_used: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockOracle;

    fn key() -> Vec<u8> {
        (0u8..32).collect()
    }

    fn request(oracle: &HmacSignatureOracle, message: &str) -> VerifyRequest {
        VerifyRequest {
            message: message.to_string(),
            signature: oracle.sign(message).unwrap(),
            nonce: "bm9uY2UtMDAwMDAwMDAx".into(),
            subject_id: "6f1c2a9e-3b7d-4c1e-9a8f-0d2b4e6f8a10".into(),
            timestamp: "2030-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(
            HmacSignatureOracle::new(vec![1; 8]),
            Err(OracleError::Key(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let oracle = HmacSignatureOracle::new(key()).unwrap();
        assert_eq!(
            format!("{oracle:?}"),
            "HmacSignatureOracle { key: <32 bytes> }"
        );
    }

    #[tokio::test]
    async fn test_hmac_accepts_own_signature() {
        let oracle = HmacSignatureOracle::new(key()).unwrap();
        let response = oracle.verify(&request(&oracle, "a|b|c")).await.unwrap();
        assert!(response.is_valid);
    }

    #[tokio::test]
    async fn test_hmac_rejects_altered_message() {
        let oracle = HmacSignatureOracle::new(key()).unwrap();
        let mut req = request(&oracle, "a|b|c");
        req.message = "a|b|d".into();
        let response = oracle.verify(&req).await.unwrap();
        assert!(!response.is_valid);
        assert_eq!(
            response.error_message.as_deref(),
            Some("signature does not match")
        );
    }

    #[test]
    fn test_from_base64_round_trip() {
        let encoded = STANDARD.encode(key());
        let a = HmacSignatureOracle::from_base64(&encoded).unwrap();
        let b = HmacSignatureOracle::new(key()).unwrap();
        assert_eq!(a.sign("m").unwrap(), b.sign("m").unwrap());
    }

    #[tokio::test]
    async fn test_retry_stops_on_definitive_rejection() {
        let oracle = MockOracle::new();
        oracle.push_verify(Ok(VerifyResponse {
            is_valid: false,
            error_message: Some("bad".into()),
        }));
        let policy = OraclePolicy {
            attempts: 3,
            backoff: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        let verdict = verify_with_retry(&oracle, &sample_request(), policy).await;
        assert_eq!(verdict, Verdict::Rejected("bad".into()));
        assert_eq!(oracle.verify_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_fails_closed_after_transport_errors() {
        let oracle = MockOracle::new();
        for _ in 0..3 {
            oracle.push_verify(Err(OracleError::Transport("connection refused".into())));
        }
        let policy = OraclePolicy {
            attempts: 3,
            backoff: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        let verdict = verify_with_retry(&oracle, &sample_request(), policy).await;
        assert!(matches!(verdict, Verdict::Unavailable(msg) if msg.contains("connection refused")));
        assert_eq!(oracle.verify_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_on_second_attempt() {
        let oracle = MockOracle::new();
        oracle.push_verify(Err(OracleError::Status {
            status: 503,
            body: "busy".into(),
        }));
        oracle.push_verify(Ok(VerifyResponse {
            is_valid: true,
            error_message: None,
        }));
        let policy = OraclePolicy {
            attempts: 3,
            backoff: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            verify_with_retry(&oracle, &sample_request(), policy).await,
            Verdict::Valid
        );
    }

    #[tokio::test]
    async fn test_slow_oracle_times_out_and_fails_closed() {
        let oracle = MockOracle::new();
        oracle.delay_verify(Duration::from_millis(200));
        let policy = OraclePolicy {
            attempts: 2,
            backoff: Duration::ZERO,
            timeout: Duration::from_millis(20),
        };
        let verdict = verify_with_retry(&oracle, &sample_request(), policy).await;
        assert!(matches!(verdict, Verdict::Unavailable(_)));
        assert_eq!(oracle.verify_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_nonce_lookup_is_best_effort() {
        let oracle = MockOracle::new();
        oracle.push_nonce(Err(OracleError::Transport("down".into())));
        let req = NonceCheckRequest {
            nonce: "n".into(),
            subject_id: "s".into(),
        };
        assert_eq!(
            nonce_used_remotely(&oracle, &req, Duration::from_secs(1)).await,
            None
        );
        oracle.push_nonce(Ok(NonceCheckResponse { is_used: true }));
        assert_eq!(
            nonce_used_remotely(&oracle, &req, Duration::from_secs(1)).await,
            Some(true)
        );
    }

    fn sample_request() -> VerifyRequest {
        VerifyRequest {
            message: "m".into(),
            signature: "s".into(),
            nonce: "n".into(),
            subject_id: "id".into(),
            timestamp: "t".into(),
        }
    }
}
