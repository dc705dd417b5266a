//! HTTP transport layer
//!
//! One long-lived pooled client per logical upstream (tool plane, backend,
//! LLM) so the hot tool fan-out path never pays TLS setup. Every call is
//! tagged with trace and call ids; failures come back as tagged error kinds
//! and never panic across the boundary. Callers decide policy.

use crate::config::AgentConfig;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Backoff schedule between retry attempts; with the attempt ceiling at 3,
/// only the first two delays are ever reached.
pub const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Maximum transport attempts per call (initial + retries).
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Network,
    Auth,
    Client4xx,
    Server5xx,
    Decode,
    PoolExhausted,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Network => "network",
            TransportErrorKind::Auth => "auth",
            TransportErrorKind::Client4xx => "client_4xx",
            TransportErrorKind::Server5xx => "server_5xx",
            TransportErrorKind::Decode => "decode",
            TransportErrorKind::PoolExhausted => "pool_exhausted",
        }
    }
}

/// Retries apply to transient failures only; semantic rejections are final.
pub fn is_retryable(kind: TransportErrorKind) -> bool {
    matches!(
        kind,
        TransportErrorKind::Timeout
            | TransportErrorKind::Network
            | TransportErrorKind::Server5xx
            | TransportErrorKind::PoolExhausted
    )
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub attempts: usize,
}

impl TransportError {
    fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), attempts: 1 }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (attempts={})", self.kind.as_str(), self.message, self.attempts)
    }
}

pub type TransportResult = std::result::Result<Value, TransportError>;

fn classify_status(status: StatusCode) -> TransportErrorKind {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TransportErrorKind::Auth
    } else if status.is_client_error() {
        TransportErrorKind::Client4xx
    } else {
        TransportErrorKind::Server5xx
    }
}

fn classify_reqwest(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_decode() {
        TransportErrorKind::Decode
    } else {
        TransportErrorKind::Network
    }
}

/// Ensure the gateway endpoint addresses the JSON-RPC mount point.
pub fn gateway_rpc_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with("/mcp") {
        trimmed.to_string()
    } else {
        format!("{}/mcp", trimmed)
    }
}

fn bearer_header(token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    if token.to_lowercase().starts_with("bearer ") {
        Some(token.to_string())
    } else {
        Some(format!("Bearer {}", token))
    }
}

/// Pooled clients for the three logical upstreams.
pub struct HttpTransport {
    gateway: Client,
    backend: Client,
    llm: Client,
    gateway_endpoint: String,
    backend_api_base: String,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> crate::Result<Self> {
        let pool = config.http_pool_maxsize;
        let gateway = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool)
            .timeout(config.gateway_timeout)
            .build()?;
        let backend = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool)
            .timeout(config.backend_timeout)
            .build()?;
        let llm = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool)
            .connect_timeout(config.llm_connect_timeout)
            .timeout(config.llm_read_timeout)
            .build()?;

        Ok(Self {
            gateway,
            backend,
            llm,
            gateway_endpoint: config.gateway_endpoint.trim_end_matches('/').to_string(),
            backend_api_base: config.backend_api_base.trim_end_matches('/').to_string(),
        })
    }

    /// JSON-RPC 2.0 call against the tool plane.
    pub async fn gateway_rpc(
        &self,
        method: &str,
        params: Value,
        token: &str,
        trace_id: &str,
        call_id: Uuid,
        timeout_override: Option<Duration>,
    ) -> TransportResult {
        if self.gateway_endpoint.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Network,
                "gateway endpoint not configured",
            ));
        }
        let url = gateway_rpc_url(&self.gateway_endpoint);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": call_id.to_string(),
            "method": method,
            "params": params,
        });

        let body = self
            .send_with_retry(&self.gateway, &url, &envelope, token, trace_id, call_id, timeout_override)
            .await?;

        // JSON-RPC semantic errors are final; they are not transport faults.
        if let Some(error) = body.get("error") {
            return Err(TransportError::new(
                TransportErrorKind::Client4xx,
                format!("json-rpc error: {}", error),
            ));
        }
        Ok(body)
    }

    /// REST POST against the banking backend.
    pub async fn backend_post(
        &self,
        path: &str,
        payload: &Value,
        token: &str,
        trace_id: &str,
    ) -> TransportResult {
        let url = format!("{}{}", self.backend_api_base, path);
        self.send_with_retry(&self.backend, &url, payload, token, trace_id, Uuid::new_v4(), None)
            .await
    }

    /// Request/response call against the LLM service.
    pub async fn llm_invoke(
        &self,
        endpoint: &str,
        payload: &Value,
        token: &str,
        trace_id: &str,
    ) -> TransportResult {
        if endpoint.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Network,
                "llm endpoint not configured",
            ));
        }
        self.send_with_retry(&self.llm, endpoint, payload, token, trace_id, Uuid::new_v4(), None)
            .await
    }

    async fn send_with_retry(
        &self,
        client: &Client,
        url: &str,
        payload: &Value,
        token: &str,
        trace_id: &str,
        call_id: Uuid,
        timeout_override: Option<Duration>,
    ) -> TransportResult {
        let mut last_error = TransportError::new(TransportErrorKind::Network, "no attempt made");

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF[attempt - 1]).await;
                debug!(url, attempt = attempt + 1, "retrying transport call");
            }

            match self
                .send_once(client, url, payload, token, trace_id, call_id, timeout_override)
                .await
            {
                Ok(body) => return Ok(body),
                Err(mut error) => {
                    error.attempts = attempt + 1;
                    let retry = is_retryable(error.kind) && attempt + 1 < MAX_ATTEMPTS;
                    warn!(
                        url,
                        kind = error.kind.as_str(),
                        attempt = attempt + 1,
                        retry,
                        "transport call failed"
                    );
                    last_error = error;
                    if !retry {
                        return Err(last_error);
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn send_once(
        &self,
        client: &Client,
        url: &str,
        payload: &Value,
        token: &str,
        trace_id: &str,
        call_id: Uuid,
        timeout_override: Option<Duration>,
    ) -> TransportResult {
        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Trace-Id", trace_id)
            .header("X-Call-Id", call_id.to_string())
            .json(payload);
        if let Some(auth) = bearer_header(token) {
            request = request.header("Authorization", auth);
        }
        if let Some(timeout) = timeout_override {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::new(classify_reqwest(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                classify_status(status),
                format!("{}: {}", status, text),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Decode, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(is_retryable(TransportErrorKind::Timeout));
        assert!(is_retryable(TransportErrorKind::Network));
        assert!(is_retryable(TransportErrorKind::Server5xx));
        assert!(is_retryable(TransportErrorKind::PoolExhausted));
        assert!(!is_retryable(TransportErrorKind::Auth));
        assert!(!is_retryable(TransportErrorKind::Client4xx));
        assert!(!is_retryable(TransportErrorKind::Decode));
    }

    #[test]
    fn test_attempt_ceiling() {
        assert_eq!(MAX_ATTEMPTS, 3);
        assert_eq!(RETRY_BACKOFF[0], Duration::from_secs(1));
        assert_eq!(RETRY_BACKOFF[1], Duration::from_secs(2));
        assert_eq!(RETRY_BACKOFF[2], Duration::from_secs(4));
    }

    #[test]
    fn test_gateway_rpc_url_normalization() {
        assert_eq!(gateway_rpc_url("https://gw.example.com"), "https://gw.example.com/mcp");
        assert_eq!(gateway_rpc_url("https://gw.example.com/"), "https://gw.example.com/mcp");
        assert_eq!(gateway_rpc_url("https://gw.example.com/mcp"), "https://gw.example.com/mcp");
    }

    #[test]
    fn test_bearer_header_shapes() {
        assert_eq!(bearer_header(""), None);
        assert_eq!(bearer_header("abc"), Some("Bearer abc".to_string()));
        assert_eq!(bearer_header("Bearer xyz"), Some("Bearer xyz".to_string()));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), TransportErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), TransportErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), TransportErrorKind::Client4xx);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), TransportErrorKind::Server5xx);
    }
}
