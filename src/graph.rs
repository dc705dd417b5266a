//! Graph runtime
//!
//! The per-request state machine:
//! `encoding_gate → intent_router → suitability_guard → (short-circuit |
//! decision_engine) → reasoning → memory_update`. Early exits produce the
//! only user-visible failure shapes: retry-prompt, clarify, refusal, rich
//! advisory, or the compact facts-only fallback — every one carries the
//! trace id and the disclaimer.

use crate::advisory::build_advisory_context;
use crate::audit::{compute_hash, log_completion, AuditSink};
use crate::config::{AgentConfig, ResponseMode, RouterMode};
use crate::encoding::apply_prompt_encoding_gate;
use crate::evidence::build_evidence_pack;
use crate::guard::SuitabilityGuard;
use crate::models::{
    AdvisoryContext, AgentRequest, AnswerPlan, EncodingReport, EvidencePack, Intent,
    IntentExtraction, Language, ResponseEnvelope, ResponseMeta, RouteConfidences, RouteDecision,
    RoutingMeta, SuitabilityDecision, ToolCall, ToolResult, DEFAULT_DISCLAIMER,
};
use crate::registry::ToolRegistry;
use crate::render::{render_answer_plan, render_facts_only_compact};
use crate::router::policy::{build_route_decision, rule_classify};
use crate::router::IntentExtractor;
use crate::scheduler::{ToolPlane, ToolScheduler};
use crate::synthesizer::{run_synthesis, AnswerSynthesizer};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const KB_TOOL: &str = "retrieve_from_aws_kb";

/// Per-request record threaded through the nodes. Owned exclusively by
/// the driver; tool workers only ever see their own call.
struct GraphState {
    trace_id: String,
    prompt: String,
    language: Language,
    encoding: EncodingReport,
    extractor_errors: Vec<String>,
    tool_results: Vec<ToolResult>,
    education_only: bool,
    reason_codes: Vec<String>,
}

pub struct AgentGraph {
    config: AgentConfig,
    registry: Arc<ToolRegistry>,
    extractor: Arc<dyn IntentExtractor>,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    plane: Arc<dyn ToolPlane>,
    scheduler: ToolScheduler,
    guard: SuitabilityGuard,
    audit: Arc<dyn AuditSink>,
}

fn new_trace_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("trc_{}", &hex[..8])
}

/// Records a `client_canceled` outcome when the request future is dropped
/// mid-flight (stream closed); in-flight tool tasks abort with it.
struct CancelGuard {
    trace_id: String,
    completed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(trace_id = %self.trace_id, outcome = "client_canceled", "request canceled");
        }
    }
}

fn empty_evidence(intent: Intent, language: Language) -> EvidencePack {
    EvidencePack {
        schema_version: "evidence_pack_v1".to_string(),
        intent,
        language,
        facts: Vec::new(),
        citations: Vec::new(),
        policy_flags: serde_json::Map::new(),
        snapshot_newest: None,
        snapshot_oldest: None,
    }
}

fn empty_advisory(intent: Intent, language: Language) -> AdvisoryContext {
    AdvisoryContext {
        schema_version: "advisory_context_v1".to_string(),
        intent,
        language,
        facts: Vec::new(),
        insights: Vec::new(),
        actions: Vec::new(),
        citations: Vec::new(),
        policy_flags: serde_json::Map::new(),
    }
}

fn fallback_routing_meta(config: &AgentConfig, reason: &str) -> RoutingMeta {
    RoutingMeta {
        mode: config.router_mode.as_str().to_string(),
        policy_version: config.router_policy_version.clone(),
        intent: Intent::OutOfScope,
        confidences: RouteConfidences { intent: 0.0, top2_gap: 0.0, scenario: None },
        reason_codes: vec![reason.to_string()],
        override_reason: None,
        timeframe_days: None,
        extractor_errors: Vec::new(),
    }
}

fn retry_prompt_body(language: Language) -> String {
    match language {
        Language::Vi => "Tin nhắn của bạn có vẻ bị lỗi mã hóa ký tự nên hệ thống không đọc được \
                         nội dung. Vui lòng gửi lại câu hỏi bằng tiếng Việt có dấu hoặc tiếng Anh."
            .to_string(),
        Language::En => "Your message appears to be garbled by a character-encoding issue, so it \
                         could not be read. Please resend your question."
            .to_string(),
    }
}

fn refusal_body(language: Language) -> String {
    match language {
        Language::Vi => "Yêu cầu này nằm ngoài phạm vi tư vấn được phép của trợ lý. Hệ thống \
                         không thể hỗ trợ thực hiện yêu cầu này."
            .to_string(),
        Language::En => "This request falls outside the assistant's permitted advisory scope and \
                         cannot be carried out."
            .to_string(),
    }
}

fn clarify_body(route: &RouteDecision, language: Language) -> String {
    let vi = language == Language::Vi;
    let mut lines: Vec<String> = Vec::new();
    lines.push(if vi { "**Cần Làm Rõ Thêm**" } else { "**Need A Quick Clarification**" }.to_string());
    for (index, question) in route.clarify_questions.iter().enumerate() {
        lines.push(format!("{}. {}", index + 1, question.question_text));
        for option in &question.options {
            lines.push(format!("   - {}", option));
        }
    }
    lines.join("\n")
}

impl AgentGraph {
    pub fn new(
        config: AgentConfig,
        registry: Arc<ToolRegistry>,
        extractor: Arc<dyn IntentExtractor>,
        synthesizer: Arc<dyn AnswerSynthesizer>,
        plane: Arc<dyn ToolPlane>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let scheduler =
            ToolScheduler::new(Arc::clone(&plane), Arc::clone(&registry), config.clone());
        let guard =
            SuitabilityGuard::new(Arc::clone(&plane), Arc::clone(&registry), config.clone());
        Self { config, registry, extractor, synthesizer, plane, scheduler, guard, audit }
    }

    /// Drive one request through the graph under the request-wide budget.
    pub async fn run(&self, request: AgentRequest) -> ResponseEnvelope {
        let trace_id = new_trace_id();
        let language = Language::from_locale(request.locale.as_deref());
        let mut cancel_guard = CancelGuard { trace_id: trace_id.clone(), completed: false };

        let envelope = match tokio::time::timeout(
            self.config.agent_timeout,
            self.run_inner(&request, &trace_id, language),
        )
        .await
        {
            Ok(envelope) => envelope,
            Err(_) => {
                warn!(trace_id, "request-wide deadline exceeded");
                self.deadline_envelope(&trace_id, language)
            }
        };

        if let Err(error) = self.audit.write(&request.user_id, &envelope).await {
            warn!(trace_id = %envelope.trace_id, %error, "audit sink rejected envelope");
        }
        cancel_guard.completed = true;
        envelope
    }

    async fn run_inner(
        &self,
        request: &AgentRequest,
        trace_id: &str,
        language: Language,
    ) -> ResponseEnvelope {
        // === ENCODING GATE ===
        let (normalized_prompt, encoding) =
            apply_prompt_encoding_gate(&request.prompt, &self.config);
        let mut state = GraphState {
            trace_id: trace_id.to_string(),
            prompt: normalized_prompt,
            language,
            encoding,
            extractor_errors: Vec::new(),
            tool_results: Vec::new(),
            education_only: false,
            reason_codes: Vec::new(),
        };

        if state.encoding.decision == crate::models::EncodingVerdict::FailFast {
            info!(trace_id, "encoding gate failed fast");
            return self.terminal_envelope(
                &state,
                retry_prompt_body(language),
                fallback_routing_meta(&self.config, "encoding_fail_fast"),
                "retry_prompt",
                vec!["encoding_fail_fast".to_string()],
            );
        }
        if state.encoding.repair_applied {
            state.reason_codes.push("encoding_repaired".to_string());
        }

        // === INTENT ROUTER ===
        let extraction = self.extract_intent(&mut state).await;
        let source = if state.extractor_errors.is_empty()
            && self.config.router_mode != RouterMode::Rule
        {
            "semantic"
        } else {
            "rule"
        };
        let route =
            build_route_decision(&extraction, &state.prompt, &self.config, source, 0);
        info!(
            trace_id,
            intent = %route.intent,
            clarify = route.clarify,
            bundle = ?route.tool_bundle,
            "route decided"
        );

        if route.clarify {
            let body = clarify_body(&route, language);
            return self.terminal_envelope(
                &state,
                body,
                self.routing_meta(&state, &route),
                "clarify",
                route.reason_codes.clone(),
            );
        }

        if !self.registry.is_initialized().await {
            state.reason_codes.push("registry_empty".to_string());
        }

        // === SUITABILITY SHORT-CIRCUIT ===
        let token = request
            .authorization
            .clone()
            .unwrap_or_else(|| self.config.default_user_token.clone());
        let suitability = self.guard.check(&route, &state.prompt, trace_id, &token).await;
        state.reason_codes.extend(suitability.reason_codes.clone());
        match suitability.decision {
            SuitabilityDecision::DenyExecution => {
                info!(trace_id, "suitability guard denied execution");
                return self.terminal_envelope(
                    &state,
                    refusal_body(language),
                    self.routing_meta(&state, &route),
                    "refusal",
                    state.reason_codes.clone(),
                );
            }
            SuitabilityDecision::EducationOnly => {
                state.education_only = true;
            }
            SuitabilityDecision::Allow => {}
        }

        // === DECISION ENGINE ===
        let bundle: Vec<String> = route
            .tool_bundle
            .iter()
            .filter(|name| name.as_str() != "suitability_guard_v1")
            .cloned()
            .collect();
        let mut engine_route = route.clone();
        engine_route.tool_bundle = bundle;
        let mut results = self
            .scheduler
            .execute_bundle(&engine_route, &state.prompt, trace_id, &token)
            .await;
        // The guard already ran; surface its payload as evidence without a
        // second remote call.
        if route.tool_bundle.iter().any(|name| name == "suitability_guard_v1") {
            results.insert(
                0,
                ToolResult {
                    call_id: Uuid::new_v4(),
                    base_name: "suitability_guard_v1".to_string(),
                    status: crate::models::ToolStatus::Ok,
                    payload: suitability.raw.clone(),
                    error: None,
                    elapsed_ms: 0,
                    started_at: chrono::Utc::now(),
                },
            );
        }
        let executed_any = !results.is_empty();
        let all_failed = executed_any && results.iter().all(|result| !result.is_ok());
        if all_failed {
            state.reason_codes.push("tool_plane_unavailable".to_string());
        }
        if let Some(reason) = &route.fallback_reason {
            state.reason_codes.push(reason.clone());
        }
        state.tool_results = results;

        // === REASONING ===
        let kb = self.retrieve_kb(&state, trace_id, &token).await;
        let mut policy_flags = serde_json::Map::new();
        policy_flags.insert("education_only".to_string(), Value::from(state.education_only));
        if let Some(appetite) = route.slots.get("risk_appetite") {
            policy_flags.insert("risk_appetite".to_string(), appetite.clone());
        }
        let (evidence, evidence_reasons) = build_evidence_pack(
            route.intent,
            language,
            &state.tool_results,
            &kb,
            policy_flags,
            &route.slots,
        );
        state.reason_codes.extend(evidence_reasons);
        let (advisory, advisory_reasons) =
            build_advisory_context(&evidence, &self.config.response_policy_version);
        state.reason_codes.extend(advisory_reasons);

        let skip_synthesis = all_failed || route.fallback_reason.is_some();
        let (body, answer_plan, response_mode, response_fallback, synth_attempts) =
            self.reason(&state, &advisory, skip_synthesis, trace_id).await;

        let routing_meta = self.routing_meta(&state, &route);
        let response_meta = ResponseMeta {
            response_mode,
            response_fallback: response_fallback.clone(),
            reason_codes: dedupe(state.reason_codes.clone()),
            synth_attempts,
            prompt_version: self.config.response_prompt_version.clone(),
            schema_version: self.config.response_schema_version.clone(),
            disclaimer_effective: DEFAULT_DISCLAIMER.to_string(),
        };

        let tool_calls: Vec<String> = std::iter::once("suitability_guard_v1".to_string())
            .chain(
                state
                    .tool_results
                    .iter()
                    .map(|result| result.base_name.clone())
                    .filter(|name| name != "suitability_guard_v1"),
            )
            .collect();

        let mut envelope = ResponseEnvelope {
            body,
            citations: evidence.citations.clone(),
            disclaimer: DEFAULT_DISCLAIMER.to_string(),
            trace_id: trace_id.to_string(),
            routing_meta,
            response_meta,
            evidence_pack: evidence,
            advisory_context: advisory,
            answer_plan,
            tool_calls,
            response_hash: String::new(),
        };
        envelope.response_hash = compute_hash(&json!({
            "body": envelope.body,
            "trace_id": envelope.trace_id,
            "citations": envelope.citations,
        }));
        log_completion(&envelope, &state.tool_results);
        envelope
    }

    /// Reasoning tail: synthesize → validate → render, or drop to the
    /// deterministic compact template.
    async fn reason(
        &self,
        state: &GraphState,
        advisory: &AdvisoryContext,
        skip_synthesis: bool,
        trace_id: &str,
    ) -> (String, Option<AnswerPlan>, String, Option<String>, usize) {
        let mode = self.config.response_mode;
        if mode == ResponseMode::Template {
            let body =
                render_facts_only_compact(advisory, DEFAULT_DISCLAIMER, &state.trace_id);
            return (body, None, mode.as_str().to_string(), None, 0);
        }
        if skip_synthesis {
            let body =
                render_facts_only_compact(advisory, DEFAULT_DISCLAIMER, &state.trace_id);
            return (
                body,
                None,
                mode.as_str().to_string(),
                Some("facts_only_compact".to_string()),
                0,
            );
        }

        let outcome = run_synthesis(
            self.synthesizer.as_ref(),
            advisory,
            &self.config,
            &state.prompt,
            DEFAULT_DISCLAIMER,
            state.education_only,
            trace_id,
        )
        .await;

        match outcome.plan {
            Some(plan) => {
                let (body, unresolved) = render_answer_plan(&plan, advisory);
                if unresolved.is_empty() {
                    (body, Some(plan), mode.as_str().to_string(), None, outcome.attempts)
                } else {
                    // Invariant violation: a validated placeholder failed to
                    // bind. Sentinel already substituted; flag the response.
                    (
                        body,
                        Some(plan),
                        mode.as_str().to_string(),
                        Some("placeholder_sentinel".to_string()),
                        outcome.attempts,
                    )
                }
            }
            None => {
                warn!(trace_id, errors = ?outcome.errors, "synthesis failed; using fallback");
                let body =
                    render_facts_only_compact(advisory, DEFAULT_DISCLAIMER, &state.trace_id);
                (
                    body,
                    None,
                    mode.as_str().to_string(),
                    Some("facts_only_compact".to_string()),
                    outcome.attempts,
                )
            }
        }
    }

    async fn extract_intent(&self, state: &mut GraphState) -> IntentExtraction {
        if self.config.router_mode == RouterMode::Rule {
            return rule_classify(&state.prompt);
        }
        match self.extractor.extract(&state.prompt, &state.trace_id).await {
            Ok(extraction) => extraction,
            Err(error) => {
                warn!(trace_id = %state.trace_id, %error, "extractor failed; rule fallback");
                state.extractor_errors.push(error.to_string());
                state.reason_codes.push("extractor_degraded_to_rules".to_string());
                rule_classify(&state.prompt)
            }
        }
    }

    /// Citations-only KB lookup; absence of the KB tool is not an error.
    async fn retrieve_kb(&self, state: &GraphState, trace_id: &str, token: &str) -> Value {
        let Some(resolved_name) = self.registry.resolve(KB_TOOL).await else {
            return Value::Null;
        };
        let call = ToolCall {
            base_name: KB_TOOL.to_string(),
            resolved_name,
            arguments: json!({"query": state.prompt, "n": 3}),
            call_id: Uuid::new_v4(),
            trace_id: trace_id.to_string(),
            timeout_ms: self.config.gateway_timeout.as_millis() as u64,
        };
        let result = self.plane.call_tool(&call, token).await;
        if !result.is_ok() {
            return Value::Null;
        }
        // Normalize {chunks: [...]} into the matches shape citations use.
        if let Some(chunks) = result.payload.get("chunks").and_then(Value::as_array) {
            let matches: Vec<Value> = chunks
                .iter()
                .map(|chunk| {
                    json!({
                        "id": chunk.get("id").cloned().unwrap_or(Value::Null),
                        "text": chunk.get("snippet").cloned().unwrap_or(Value::Null),
                        "citation": chunk
                            .get("source")
                            .or_else(|| chunk.get("id"))
                            .cloned()
                            .unwrap_or(Value::from("KB")),
                        "score": chunk.get("score").cloned().unwrap_or(Value::from(0)),
                    })
                })
                .collect();
            return json!({"matches": matches});
        }
        result.payload
    }

    fn routing_meta(&self, state: &GraphState, route: &RouteDecision) -> RoutingMeta {
        RoutingMeta {
            mode: route.mode.clone(),
            policy_version: route.policy_version.clone(),
            intent: route.intent,
            confidences: route.confidences,
            reason_codes: route.reason_codes.clone(),
            override_reason: route
                .reason_codes
                .iter()
                .find(|code| code.starts_with("intent_override:"))
                .cloned(),
            timeframe_days: route.timeframe_days,
            extractor_errors: state.extractor_errors.clone(),
        }
    }

    /// Early-exit envelope: retry-prompt, clarify, refusal.
    fn terminal_envelope(
        &self,
        state: &GraphState,
        body: String,
        routing_meta: RoutingMeta,
        mode_tag: &str,
        reason_codes: Vec<String>,
    ) -> ResponseEnvelope {
        let intent = routing_meta.intent;
        let response_meta = ResponseMeta {
            response_mode: mode_tag.to_string(),
            response_fallback: None,
            reason_codes: dedupe(reason_codes),
            synth_attempts: 0,
            prompt_version: self.config.response_prompt_version.clone(),
            schema_version: self.config.response_schema_version.clone(),
            disclaimer_effective: DEFAULT_DISCLAIMER.to_string(),
        };
        let mut envelope = ResponseEnvelope {
            body,
            citations: Vec::new(),
            disclaimer: DEFAULT_DISCLAIMER.to_string(),
            trace_id: state.trace_id.clone(),
            routing_meta,
            response_meta,
            evidence_pack: empty_evidence(intent, state.language),
            advisory_context: empty_advisory(intent, state.language),
            answer_plan: None,
            tool_calls: if mode_tag == "refusal" {
                vec!["suitability_guard_v1".to_string()]
            } else {
                Vec::new()
            },
            response_hash: String::new(),
        };
        envelope.response_hash = compute_hash(&json!({
            "body": envelope.body,
            "trace_id": envelope.trace_id,
        }));
        log_completion(&envelope, &state.tool_results);
        envelope
    }

    fn deadline_envelope(&self, trace_id: &str, language: Language) -> ResponseEnvelope {
        let advisory = empty_advisory(Intent::OutOfScope, language);
        let body = render_facts_only_compact(&advisory, DEFAULT_DISCLAIMER, trace_id);
        let response_meta = ResponseMeta {
            response_mode: self.config.response_mode.as_str().to_string(),
            response_fallback: Some("facts_only_compact".to_string()),
            reason_codes: vec!["deadline_exceeded".to_string()],
            synth_attempts: 0,
            prompt_version: self.config.response_prompt_version.clone(),
            schema_version: self.config.response_schema_version.clone(),
            disclaimer_effective: DEFAULT_DISCLAIMER.to_string(),
        };
        let mut envelope = ResponseEnvelope {
            body,
            citations: Vec::new(),
            disclaimer: DEFAULT_DISCLAIMER.to_string(),
            trace_id: trace_id.to_string(),
            routing_meta: fallback_routing_meta(&self.config, "deadline_exceeded"),
            response_meta,
            evidence_pack: empty_evidence(Intent::OutOfScope, language),
            advisory_context: advisory,
            answer_plan: None,
            tool_calls: Vec::new(),
            response_hash: String::new(),
        };
        envelope.response_hash = compute_hash(&json!({
            "body": envelope.body,
            "trace_id": envelope.trace_id,
        }));
        envelope
    }
}

fn dedupe(mut codes: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    codes.retain(|code| seen.insert(code.clone()));
    codes
}
