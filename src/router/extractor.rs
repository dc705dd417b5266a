//! LLM-backed intent extraction
//!
//! One structured-output call per request, prompt version
//! `intent_extraction_v1`. The reply is treated as untrusted: fenced or
//! chatty output is salvaged, the payload is sanitized, and contract
//! violations surface as `RouterExtractionError` so the policy layer can
//! degrade to rule-only classification.

use super::IntentExtractor;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::models::IntentExtraction;
use crate::transport::HttpTransport;
use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PROMPT_VERSION: &str = "intent_extraction_v1";

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*(\{.*\})\s*```").unwrap());

/// Pull one JSON object out of a possibly fenced or chatty LLM reply.
pub(crate) fn parse_json_object(raw: &str) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = serde_json::from_str::<Value>(text) {
        if parsed.is_object() {
            return Some(parsed);
        }
    }
    if let Some(captures) = FENCED_JSON.captures(text) {
        if let Ok(parsed) = serde_json::from_str::<Value>(&captures[1]) {
            if parsed.is_object() {
                return Some(parsed);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn build_extraction_prompt(user_prompt: &str) -> String {
    format!(
        "You are an intent+slot extractor for a fintech advisor.\n\
         Return ONLY one valid JSON object.\n\
         Do not add markdown, comments, or explanation.\n\
         Use schema_version='intent_extraction_v1'.\n\
         Allowed intent values: summary, risk, planning, scenario, invest, out_of_scope.\n\
         top2 must contain exactly two intent+score entries.\n\
         scores must be between 0 and 1.\n\
         domain_relevance must be between 0 and 1 and represent how related the prompt is to personal-finance advisory scope.\n\
         slots should include structured values when present.\n\
         Classify as scenario only for explicit what-if/counterfactual prompts.\n\
         If user asks current-state analysis by period (30/60/90 days) without hypothetical changes, prefer summary or risk.\n\
         If user asks feasibility of goals (buy house/save target), prefer planning unless explicit what-if deltas are requested.\n\
         If prompt is not about personal finance advisory, classify as out_of_scope.\n\
         For scenario intent, extract if possible: horizon_months, income_delta_pct, spend_delta_pct, income_delta_amount_vnd, spend_delta_amount_vnd.\n\
         If user states risk preference, extract slots.risk_appetite with one of: conservative, moderate, aggressive.\n\
         If missing values, keep slots empty rather than hallucinating.\n\
         Output JSON fields: schema_version, intent, sub_intent, confidence, domain_relevance, top2, slots, scenario_confidence, reason.\n\
         User prompt: {}",
        user_prompt
    )
}

/// Fill defaults and derive `domain_relevance` when the model omits it.
pub(crate) fn sanitize_extraction_payload(payload: &Value) -> Value {
    let mut normalized = payload.as_object().cloned().unwrap_or_default();

    if normalized.get("sub_intent").map(Value::is_null).unwrap_or(true) {
        normalized.insert("sub_intent".to_string(), Value::from(""));
    }
    if normalized.get("reason").map(Value::is_null).unwrap_or(true) {
        normalized.insert("reason".to_string(), Value::from(""));
    }
    if normalized.get("scenario_confidence").map(Value::is_null).unwrap_or(false) {
        normalized.remove("scenario_confidence");
    }

    let has_relevance = normalized
        .get("domain_relevance")
        .and_then(Value::as_f64)
        .is_some();
    if !has_relevance {
        let out_of_scope_score = normalized
            .get("top2")
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find_map(|item| {
                    let intent = item.get("intent").and_then(Value::as_str)?;
                    if intent == "out_of_scope" {
                        item.get("score").and_then(Value::as_f64)
                    } else {
                        None
                    }
                })
            })
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let relevance = if out_of_scope_score > 0.0 {
            1.0 - out_of_scope_score
        } else if normalized.get("intent").and_then(Value::as_str) == Some("out_of_scope") {
            0.2
        } else {
            normalized
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0)
        };
        normalized.insert("domain_relevance".to_string(), Value::from(relevance));
    } else if let Some(relevance) = normalized.get("domain_relevance").and_then(Value::as_f64) {
        normalized.insert(
            "domain_relevance".to_string(),
            Value::from(relevance.clamp(0.0, 1.0)),
        );
    }

    let cleaned_slots = normalized.get("slots").and_then(Value::as_object).map(|slots| {
        slots
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<serde_json::Map<String, Value>>()
    });
    if let Some(cleaned) = cleaned_slots {
        normalized.insert("slots".to_string(), Value::Object(cleaned));
    }

    Value::Object(normalized)
}

fn check_extraction_contract(extraction: &IntentExtraction) -> Result<()> {
    if extraction.top2.len() != 2 {
        return Err(AgentError::RouterExtractionError(
            "top2 must contain exactly 2 candidates".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&extraction.confidence) {
        return Err(AgentError::RouterExtractionError(
            "confidence out of range".to_string(),
        ));
    }
    Ok(())
}

/// Production extractor backed by the shared LLM transport.
pub struct LlmIntentExtractor {
    transport: Arc<HttpTransport>,
    config: AgentConfig,
}

impl LlmIntentExtractor {
    pub fn new(transport: Arc<HttpTransport>, config: AgentConfig) -> Self {
        Self { transport, config }
    }

    fn reply_text(body: &Value) -> Option<String> {
        // The service either returns the JSON document directly or wraps
        // raw model text under "output".
        if body.get("intent").is_some() {
            return serde_json::to_string(body).ok();
        }
        body.get("output")
            .and_then(Value::as_str)
            .map(|text| text.to_string())
    }
}

#[async_trait]
impl IntentExtractor for LlmIntentExtractor {
    async fn extract(&self, prompt: &str, trace_id: &str) -> Result<IntentExtraction> {
        if self.config.llm_endpoint.is_empty() {
            return Err(AgentError::RouterExtractionError(
                "model_not_configured".to_string(),
            ));
        }

        let payload = json!({
            "prompt_version": PROMPT_VERSION,
            "schema_version": "intent_extraction_v1",
            "system": "You extract structured fintech advisory intents.",
            "user": build_extraction_prompt(prompt),
            "constraints": {
                "model_id": self.config.llm_model_id,
                "temperature": 0.0,
                "max_tokens": 400,
            },
        });

        let body = self
            .transport
            .llm_invoke(&self.config.llm_endpoint, &payload, &self.config.default_user_token, trace_id)
            .await
            .map_err(|e| AgentError::RouterExtractionError(format!("llm_invoke_error:{}", e)))?;

        let raw_text = Self::reply_text(&body).unwrap_or_default();
        let parsed = parse_json_object(&raw_text).ok_or_else(|| {
            warn!(trace_id, "intent extraction returned non-JSON output");
            AgentError::RouterExtractionError("invalid_json".to_string())
        })?;

        let sanitized = sanitize_extraction_payload(&parsed);
        let extraction: IntentExtraction = serde_json::from_value(sanitized)
            .map_err(|e| AgentError::RouterExtractionError(format!("invalid_contract:{}", e)))?;
        check_extraction_contract(&extraction)?;

        debug!(
            trace_id,
            intent = %extraction.intent,
            confidence = extraction.confidence,
            "intent extracted"
        );
        Ok(extraction)
    }
}
