//! Audit surface
//!
//! The core is stateless per request; completed envelopes are handed to an
//! external audit sink and mirrored into the structured log. Response
//! hashes make records tamper-evident and cheap to compare.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::models::{ResponseEnvelope, ToolResult};
use crate::transport::HttpTransport;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// SHA-256 of a serializable record, streamed without an intermediate
/// string buffer.
pub fn compute_hash<T: Serialize>(record: &T) -> String {
    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), record).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Trait for the external audit/store interface
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, user_id: &str, envelope: &ResponseEnvelope) -> Result<()>;
}

/// Production sink: POST /audit on the banking backend. Audit delivery
/// failures never fail the request; the local log keeps the record.
pub struct BackendAuditSink {
    transport: Arc<HttpTransport>,
    config: AgentConfig,
}

impl BackendAuditSink {
    pub fn new(transport: Arc<HttpTransport>, config: AgentConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl AuditSink for BackendAuditSink {
    async fn write(&self, user_id: &str, envelope: &ResponseEnvelope) -> Result<()> {
        let body = json!({
            "trace_id": envelope.trace_id,
            "event_type": "agent_summary",
            "payload": {
                "user_id": user_id,
                "summary": envelope.body,
                "tool_calls": envelope.tool_calls,
                "response_hash": envelope.response_hash,
                "routing_meta": envelope.routing_meta,
                "response_meta": envelope.response_meta,
            },
        });
        if let Err(error) = self
            .transport
            .backend_post("/audit", &body, &self.config.default_user_token, &envelope.trace_id)
            .await
        {
            warn!(trace_id = %envelope.trace_id, %error, "audit write failed");
        }
        Ok(())
    }
}

/// In-memory sink for development & testing
pub struct InMemoryAuditSink {
    records: RwLock<Vec<(String, ResponseEnvelope)>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self { records: RwLock::new(Vec::new()) }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn last(&self) -> Option<(String, ResponseEnvelope)> {
        self.records.read().await.last().cloned()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn write(&self, user_id: &str, envelope: &ResponseEnvelope) -> Result<()> {
        let mut records = self.records.write().await;
        records.push((user_id.to_string(), envelope.clone()));
        Ok(())
    }
}

/// Structured completion record for every finished request.
pub fn log_completion(envelope: &ResponseEnvelope, results: &[ToolResult]) {
    let tool_stats: Vec<String> = results
        .iter()
        .map(|result| {
            format!(
                "{}={:?}({}ms)",
                result.base_name, result.status, result.elapsed_ms
            )
        })
        .collect();
    info!(
        trace_id = %envelope.trace_id,
        intent = %envelope.routing_meta.intent,
        clarify_reasons = ?envelope.routing_meta.reason_codes,
        tools = ?tool_stats,
        response_mode = %envelope.response_meta.response_mode,
        response_fallback = ?envelope.response_meta.response_fallback,
        response_hash = %envelope.response_hash,
        "request completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_hex() {
        let record = json!({"body": "x", "trace": "trc_1"});
        let first = compute_hash(&record);
        let second = compute_hash(&record);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let first = compute_hash(&json!({"body": "x"}));
        let second = compute_hash(&json!({"body": "y"}));
        assert_ne!(first, second);
    }
}
