//! Answer-plan synthesis
//!
//! One LLM call constrained to the `answer_plan_v2` JSON schema, fed only
//! the evidence pack, deterministic insights and action candidates — never
//! raw tool payloads. The reply is parsed, schema-checked, then grounding-
//! checked; one retry carries the validator's error report back into the
//! prompt. Both failures drop the request to the facts-only fallback.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::models::{AdvisoryContext, AnswerPlan, Language};
use crate::router::extractor::parse_json_object;
use crate::transport::HttpTransport;
use crate::validator::{extract_numeric_tokens, validate_answer_grounding};
use crate::Result;
use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

//
// ================= Schema =================
//

static ANSWER_PLAN_SCHEMA_JSON: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": [
            "schema_version",
            "language",
            "summary_lines",
            "key_metrics",
            "actions",
            "assumptions",
            "limitations",
            "disclaimer",
            "used_fact_ids",
            "used_insight_ids",
            "used_action_ids"
        ],
        "properties": {
            "schema_version": {"const": "answer_plan_v2"},
            "language": {"type": "string", "enum": ["vi", "en"]},
            "summary_lines": {
                "type": "array",
                "minItems": 3,
                "maxItems": 5,
                "items": {"type": "string", "minLength": 1}
            },
            "key_metrics": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["fact_id"],
                    "properties": {
                        "fact_id": {"type": "string", "minLength": 1},
                        "label": {"type": "string"}
                    },
                    "additionalProperties": false
                }
            },
            "actions": {
                "type": "array",
                "minItems": 2,
                "maxItems": 4,
                "items": {"type": "string", "minLength": 1}
            },
            "assumptions": {"type": "array", "items": {"type": "string"}},
            "limitations": {"type": "array", "items": {"type": "string"}},
            "disclaimer": {"type": "string", "minLength": 1},
            "used_fact_ids": {"type": "array", "items": {"type": "string", "minLength": 1}},
            "used_insight_ids": {"type": "array", "items": {"type": "string", "minLength": 1}},
            "used_action_ids": {"type": "array", "items": {"type": "string", "minLength": 1}}
        },
        "additionalProperties": false
    })
});

static ANSWER_PLAN_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&ANSWER_PLAN_SCHEMA_JSON)
        .expect("answer_plan_v2 schema must compile")
});

/// Validate a candidate plan payload; empty means conformant.
pub fn validate_answer_plan_schema(payload: &Value) -> Vec<String> {
    match ANSWER_PLAN_SCHEMA.validate(payload) {
        Ok(()) => Vec::new(),
        Err(errors) => {
            let mut messages: Vec<String> = errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    let location = if path.is_empty() { "$".to_string() } else { path };
                    format!("{}: {}", location, error)
                })
                .collect();
            messages.sort();
            messages
        }
    }
}

//
// ================= Synthesizer Seam =================
//

/// Trait for answer-plan generation (LLM controlled)
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn complete(&self, prompt: &str, trace_id: &str) -> Result<String>;
}

/// Production synthesizer backed by the shared LLM transport.
pub struct LlmAnswerSynthesizer {
    transport: Arc<HttpTransport>,
    config: AgentConfig,
}

impl LlmAnswerSynthesizer {
    pub fn new(transport: Arc<HttpTransport>, config: AgentConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl AnswerSynthesizer for LlmAnswerSynthesizer {
    async fn complete(&self, prompt: &str, trace_id: &str) -> Result<String> {
        if self.config.llm_endpoint.is_empty() {
            return Err(AgentError::LlmError("model_not_configured".to_string()));
        }
        let payload = json!({
            "prompt_version": self.config.response_prompt_version,
            "schema_version": self.config.response_schema_version,
            "system": "You are a grounded fintech advisory writer.",
            "user": prompt,
            "constraints": {
                "model_id": self.config.llm_model_id,
                "temperature": 0.2,
                "max_tokens": 1400,
            },
        });
        let body = self
            .transport
            .llm_invoke(&self.config.llm_endpoint, &payload, &self.config.default_user_token, trace_id)
            .await
            .map_err(|e| AgentError::LlmError(format!("llm_invoke_error:{}", e)))?;

        if let Some(text) = body.get("output").and_then(Value::as_str) {
            return Ok(text.to_string());
        }
        serde_json::to_string(&body).map_err(AgentError::from)
    }
}

/// Scripted synthesizer for development & testing.
pub struct MockAnswerSynthesizer {
    replies: std::sync::Mutex<Vec<String>>,
}

impl MockAnswerSynthesizer {
    pub fn new(replies: Vec<String>) -> Self {
        Self { replies: std::sync::Mutex::new(replies) }
    }
}

#[async_trait]
impl AnswerSynthesizer for MockAnswerSynthesizer {
    async fn complete(&self, _prompt: &str, _trace_id: &str) -> Result<String> {
        let mut replies = self.replies.lock().expect("mock lock");
        if replies.is_empty() {
            return Err(AgentError::LlmError("mock exhausted".to_string()));
        }
        Ok(replies.remove(0))
    }
}

//
// ================= Prompt =================

fn build_synthesis_prompt(
    context: &AdvisoryContext,
    config: &AgentConfig,
    user_prompt: &str,
    disclaimer: &str,
    validator_report: &[String],
) -> String {
    let language = match context.language {
        Language::Vi => "vi",
        Language::En => "en",
    };
    let mut sections: Vec<String> = Vec::new();
    sections.push(format!(
        "You write the advisory answer plan for a fintech assistant.\n\
         Return ONLY one JSON object conforming to schema {schema} (no markdown).\n\
         language must be '{language}'.\n\
         summary_lines: 3-5 lines. actions: 2-4 entries.\n\
         Reference evidence ONLY via [F:<fact_id>] placeholders; never write numbers, amounts or dates yourself.\n\
         Reference recommended actions via their action ids in used_action_ids.\n\
         Do not instruct the user to buy or sell any investment asset.\n\
         Include the disclaimer verbatim.\n\
         Policy version: {policy}.",
        schema = config.response_schema_version,
        language = language,
        policy = config.response_policy_version,
    ));

    sections.push(format!("User question: {}", user_prompt));

    let facts: Vec<String> = context
        .facts
        .iter()
        .map(|fact| {
            format!(
                "- {} | {} | {} {} | timeframe={}",
                fact.fact_id, fact.label, fact.value_text, fact.unit, fact.timeframe
            )
        })
        .collect();
    sections.push(format!("Facts (the only allowed evidence):\n{}", facts.join("\n")));

    let insights: Vec<String> = context
        .insights
        .iter()
        .map(|insight| {
            format!(
                "- {} [{}] {}",
                insight.insight_id,
                serde_json::to_string(&insight.severity).unwrap_or_default(),
                insight.message_seed
            )
        })
        .collect();
    sections.push(format!("Deterministic insights:\n{}", insights.join("\n")));

    let actions: Vec<String> = context
        .actions
        .iter()
        .map(|action| format!("- {} ({}) {}", action.action_id, action.action_type, action.params))
        .collect();
    sections.push(format!("Action candidates:\n{}", actions.join("\n")));

    sections.push(format!("Disclaimer to include verbatim: {}", disclaimer));

    if !validator_report.is_empty() {
        sections.push(format!(
            "Your previous reply failed validation with these errors, fix ALL of them:\n{}",
            validator_report.join("\n")
        ));
    }
    sections.join("\n\n")
}

//
// ================= Pipeline =================
//

#[derive(Debug)]
pub struct SynthesisOutcome {
    pub plan: Option<AnswerPlan>,
    pub attempts: usize,
    pub errors: Vec<String>,
}

/// Run the synthesize → validate loop: one initial attempt plus up to
/// `RESPONSE_MAX_RETRIES` retries with the error report appended.
pub async fn run_synthesis(
    synthesizer: &dyn AnswerSynthesizer,
    context: &AdvisoryContext,
    config: &AgentConfig,
    user_prompt: &str,
    disclaimer: &str,
    education_only: bool,
    trace_id: &str,
) -> SynthesisOutcome {
    let allowed_prompt_tokens = extract_numeric_tokens(user_prompt);
    let max_attempts = 1 + config.response_max_retries;
    let mut all_errors: Vec<String> = Vec::new();
    let mut last_report: Vec<String> = Vec::new();

    for attempt in 1..=max_attempts {
        let prompt =
            build_synthesis_prompt(context, config, user_prompt, disclaimer, &last_report);
        let raw = match synthesizer.complete(&prompt, trace_id).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(trace_id, attempt, %error, "synthesis call failed");
                all_errors.push(format!("llm_error:{}", error));
                last_report = vec![format!("llm_error:{}", error)];
                continue;
            }
        };

        let Some(payload) = parse_json_object(&raw) else {
            warn!(trace_id, attempt, "synthesis returned non-JSON output");
            all_errors.push("invalid_json".to_string());
            last_report = vec!["invalid_json: reply was not a JSON object".to_string()];
            continue;
        };

        let schema_errors = validate_answer_plan_schema(&payload);
        if !schema_errors.is_empty() {
            warn!(trace_id, attempt, errors = ?schema_errors, "plan failed schema validation");
            all_errors.push("schema_invalid".to_string());
            last_report = schema_errors;
            continue;
        }

        let plan: AnswerPlan = match serde_json::from_value(payload) {
            Ok(plan) => plan,
            Err(error) => {
                all_errors.push(format!("contract_invalid:{}", error));
                last_report = vec![format!("contract_invalid:{}", error)];
                continue;
            }
        };

        let grounding_errors =
            validate_answer_grounding(&plan, context, education_only, &allowed_prompt_tokens);
        if grounding_errors.is_empty() {
            debug!(trace_id, attempt, "answer plan validated");
            return SynthesisOutcome { plan: Some(plan), attempts: attempt, errors: all_errors };
        }
        warn!(trace_id, attempt, errors = ?grounding_errors, "plan failed grounding validation");
        all_errors.extend(grounding_errors.clone());
        last_report = grounding_errors;
    }

    SynthesisOutcome { plan: None, attempts: max_attempts, errors: all_errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fact, Intent};

    fn context() -> AdvisoryContext {
        AdvisoryContext {
            schema_version: "advisory_context_v1".to_string(),
            intent: Intent::Summary,
            language: Language::Vi,
            facts: vec![Fact {
                fact_id: "spend.total_spend.30d".to_string(),
                label: "Tổng chi tiêu".to_string(),
                value: json!(14_200_000.0),
                value_text: "14,200,000".to_string(),
                unit: "VND".to_string(),
                timeframe: "30d".to_string(),
                source_tool: "spend_analytics_v1".to_string(),
                source_path: "total_spend".to_string(),
            }],
            insights: Vec::new(),
            actions: Vec::new(),
            citations: Vec::new(),
            policy_flags: serde_json::Map::new(),
        }
    }

    fn valid_plan_json() -> String {
        json!({
            "schema_version": "answer_plan_v2",
            "language": "vi",
            "summary_lines": [
                "Tổng chi tiêu của bạn là [F:spend.total_spend.30d].",
                "Dòng tiền trong kỳ nhìn chung ổn định.",
                "Không có cảnh báo lớn trong dữ liệu hiện có."
            ],
            "key_metrics": [{"fact_id": "spend.total_spend.30d", "label": "Tổng chi tiêu"}],
            "actions": [
                "Theo dõi nhóm chi lớn nhất theo tuần.",
                "Cập nhật dữ liệu giao dịch thường xuyên."
            ],
            "assumptions": [],
            "limitations": [],
            "disclaimer": "Educational guidance only.",
            "used_fact_ids": ["spend.total_spend.30d"],
            "used_insight_ids": [],
            "used_action_ids": []
        })
        .to_string()
    }

    #[test]
    fn test_schema_accepts_valid_plan() {
        let payload: Value = serde_json::from_str(&valid_plan_json()).unwrap();
        assert!(validate_answer_plan_schema(&payload).is_empty());
    }

    #[test]
    fn test_schema_rejects_short_summary() {
        let mut payload: Value = serde_json::from_str(&valid_plan_json()).unwrap();
        payload["summary_lines"] = json!(["only one line"]);
        let errors = validate_answer_plan_schema(&payload);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_schema_rejects_missing_disclaimer() {
        let mut payload: Value = serde_json::from_str(&valid_plan_json()).unwrap();
        payload.as_object_mut().unwrap().remove("disclaimer");
        assert!(!validate_answer_plan_schema(&payload).is_empty());
    }

    #[test]
    fn test_schema_rejects_unknown_fields() {
        let mut payload: Value = serde_json::from_str(&valid_plan_json()).unwrap();
        payload["surprise"] = json!(true);
        assert!(!validate_answer_plan_schema(&payload).is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_happy_path() {
        let synthesizer = MockAnswerSynthesizer::new(vec![valid_plan_json()]);
        let outcome = run_synthesis(
            &synthesizer,
            &context(),
            &AgentConfig::default(),
            "Tóm tắt chi tiêu",
            "Educational guidance only.",
            false,
            "trc_1",
        )
        .await;
        assert!(outcome.plan.is_some());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_synthesis_retries_once_then_succeeds() {
        let ungrounded = json!({
            "schema_version": "answer_plan_v2",
            "language": "vi",
            "summary_lines": ["Bạn đã chi 99,999,999 tháng này.", "x", "y"],
            "key_metrics": [],
            "actions": ["a", "b"],
            "assumptions": [],
            "limitations": [],
            "disclaimer": "Educational guidance only.",
            "used_fact_ids": [],
            "used_insight_ids": [],
            "used_action_ids": []
        })
        .to_string();
        let synthesizer = MockAnswerSynthesizer::new(vec![ungrounded, valid_plan_json()]);
        let outcome = run_synthesis(
            &synthesizer,
            &context(),
            &AgentConfig::default(),
            "Tóm tắt chi tiêu",
            "Educational guidance only.",
            false,
            "trc_1",
        )
        .await;
        assert!(outcome.plan.is_some());
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.errors.contains(&"ungrounded_numeric_tokens".to_string()));
    }

    #[tokio::test]
    async fn test_synthesis_exhaustion_reports_errors() {
        let synthesizer =
            MockAnswerSynthesizer::new(vec!["not json".to_string(), "still not json".to_string()]);
        let outcome = run_synthesis(
            &synthesizer,
            &context(),
            &AgentConfig::default(),
            "Tóm tắt chi tiêu",
            "Educational guidance only.",
            false,
            "trc_1",
        )
        .await;
        assert!(outcome.plan.is_none());
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.errors.contains(&"invalid_json".to_string()));
    }
}
