//! Remote signature verification over HTTPS.

use async_trait::async_trait;
use brinst_common::signature::{
    NonceCheckRequest, NonceCheckResponse, OracleError, SignatureOracle, VerifyRequest,
    VerifyResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Longest error body kept from a failed oracle response.
const MAX_ERROR_BODY: usize = 512;

/// JSON client for `POST /verify-signature` and `POST /check-nonce`.
pub struct HttpSignatureOracle {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSignatureOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
            return Err(OracleError::Transport(format!(
                "oracle url must be http(s), got '{base_url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("brinst/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, OracleError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "Calling signature oracle");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            OracleError::Timeout(self.timeout)
        } else {
            OracleError::Transport(err.to_string())
        }
    }
}

/// Keep at most [`MAX_ERROR_BODY`] bytes, cutting on a character boundary.
fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl SignatureOracle for HttpSignatureOracle {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, OracleError> {
        self.post("/verify-signature", request).await
    }

    async fn check_nonce(
        &self,
        request: &NonceCheckRequest,
    ) -> Result<NonceCheckResponse, OracleError> {
        self.post("/check-nonce", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response to every connection.
    async fn canned_server(status: u16, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    fn verify_request() -> VerifyRequest {
        VerifyRequest {
            message: "m".into(),
            signature: "s".into(),
            nonce: "n".into(),
            subject_id: "id".into(),
            timestamp: "t".into(),
        }
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = format!("{}é", "a".repeat(MAX_ERROR_BODY - 1));
        let cut = truncate_body(body);
        assert_eq!(cut.len(), MAX_ERROR_BODY - 1);
        assert!(cut.chars().all(|c| c == 'a'));

        assert_eq!(truncate_body("short".into()), "short");
    }

    #[tokio::test]
    async fn test_multibyte_error_body_is_status_error() {
        let body = format!("{}é", "a".repeat(MAX_ERROR_BODY - 1));
        let url = canned_server(500, body).await;
        let oracle = HttpSignatureOracle::new(url, Duration::from_secs(5)).unwrap();

        let err = oracle.verify(&verify_request()).await.unwrap_err();
        match err {
            OracleError::Status { status, body } => {
                assert_eq!(status, 500);
                assert!(body.len() <= MAX_ERROR_BODY);
                assert!(body.starts_with("aaaa"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_decodes_oracle_answer() {
        let url = canned_server(200, r#"{"isValid":false,"errorMessage":"revoked"}"#.into()).await;
        let oracle = HttpSignatureOracle::new(url, Duration::from_secs(5)).unwrap();
        let response = oracle.verify(&verify_request()).await.unwrap();
        assert!(!response.is_valid);
        assert_eq!(response.error_message.as_deref(), Some("revoked"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let oracle =
            HttpSignatureOracle::new("https://bridge.example.com/api/", Duration::from_secs(5))
                .unwrap();
        assert_eq!(oracle.base_url(), "https://bridge.example.com/api");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            HttpSignatureOracle::new("file:///etc/passwd", Duration::from_secs(5)),
            Err(OracleError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_oracle_is_transport_error() {
        let oracle =
            HttpSignatureOracle::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = oracle
            .check_nonce(&NonceCheckRequest {
                nonce: "n-1".into(),
                subject_id: "s-1".into(),
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, OracleError::Transport(_) | OracleError::Timeout(_)),
            "{err:?}"
        );
    }
}
