//! Core data contracts for the advisory agent graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Disclaimer applied when no policy override is present
pub const DEFAULT_DISCLAIMER: &str =
    "Educational guidance only. We do not provide investment advice.";

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Summary,
    Risk,
    Planning,
    Scenario,
    Invest,
    OutOfScope,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Summary => "summary",
            Intent::Risk => "risk",
            Intent::Planning => "planning",
            Intent::Scenario => "scenario",
            Intent::Invest => "invest",
            Intent::OutOfScope => "out_of_scope",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Vi,
    En,
}

impl Language {
    /// Map a BCP-47 locale tag onto a supported response language.
    pub fn from_locale(locale: Option<&str>) -> Self {
        match locale {
            Some(tag) if tag.to_lowercase().starts_with("en") => Language::En,
            _ => Language::Vi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Vi => "vi",
            Language::En => "en",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncodingVerdict {
    Pass,
    Repaired,
    FailFast,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuitabilityDecision {
    Allow,
    EducationOnly,
    DenyExecution,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Timeout,
    ClientError,
    ServerError,
    ValidationError,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::High => 0,
            Severity::Medium => 1,
            Severity::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HitlBand {
    Auto,
    Confirm,
    Block,
}

//
// ================= Request =================
//

/// Inbound request; immutable after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    pub user_id: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub authorization: Option<String>,
}

//
// ================= Encoding =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingReport {
    pub decision: EncodingVerdict,
    pub mojibake_score: f64,
    pub repair_applied: bool,
    pub encoding_guess: String,
    pub reason_codes: Vec<String>,
    pub input_fingerprint: String,
}

//
// ================= Router =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopIntentScore {
    pub intent: Intent,
    pub score: f64,
}

/// Structured output of the LLM intent extractor (`intent_extraction_v1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentExtraction {
    #[serde(default = "IntentExtraction::default_schema_version")]
    pub schema_version: String,
    pub intent: Intent,
    #[serde(default)]
    pub sub_intent: String,
    pub confidence: f64,
    #[serde(default = "IntentExtraction::default_domain_relevance")]
    pub domain_relevance: f64,
    pub top2: Vec<TopIntentScore>,
    #[serde(default)]
    pub slots: serde_json::Map<String, Value>,
    #[serde(default)]
    pub scenario_confidence: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

impl IntentExtraction {
    fn default_schema_version() -> String {
        "intent_extraction_v1".to_string()
    }

    fn default_domain_relevance() -> f64 {
        1.0
    }

    pub fn top2_gap(&self) -> f64 {
        if self.top2.len() < 2 {
            return 0.0;
        }
        self.top2[0].score - self.top2[1].score
    }

    pub fn top2_score(&self, intent: Intent) -> f64 {
        self.top2
            .iter()
            .find(|item| item.intent == intent)
            .map(|item| item.score)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarifyingQuestion {
    pub question_id: String,
    pub question_text: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RouteConfidences {
    pub intent: f64,
    pub top2_gap: f64,
    #[serde(default)]
    pub scenario: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub mode: String,
    pub policy_version: String,
    pub intent: Intent,
    pub tool_bundle: Vec<String>,
    pub clarify: bool,
    pub clarify_questions: Vec<ClarifyingQuestion>,
    pub confidences: RouteConfidences,
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub fallback_reason: Option<String>,
    pub source: String,
    /// Effective analysis window in days, when the prompt names one.
    #[serde(default)]
    pub timeframe_days: Option<u32>,
    #[serde(default)]
    pub slots: serde_json::Map<String, Value>,
}

//
// ================= Tool Execution =================
//

/// One-shot outbound tool call; discarded after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub base_name: String,
    pub resolved_name: String,
    pub arguments: Value,
    pub call_id: Uuid,
    pub trace_id: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: Uuid,
    pub base_name: String,
    pub status: ToolStatus,
    pub payload: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

//
// ================= Evidence =================
//

/// A single tool-derived evidence item. `fact_id` is deterministic from
/// `{tool, metric, timeframe}`; values never originate from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub label: String,
    pub value: Value,
    pub value_text: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub timeframe: String,
    pub source_tool: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    pub schema_version: String,
    pub intent: Intent,
    pub language: Language,
    pub facts: Vec<Fact>,
    pub citations: Vec<String>,
    pub policy_flags: serde_json::Map<String, Value>,
    /// Freshness bounds over per-tool `sql_snapshot_ts` stamps.
    #[serde(default)]
    pub snapshot_newest: Option<String>,
    #[serde(default)]
    pub snapshot_oldest: Option<String>,
}

impl EvidencePack {
    pub fn fact(&self, fact_id: &str) -> Option<&Fact> {
        self.facts.iter().find(|fact| fact.fact_id == fact_id)
    }

    pub fn fact_by_prefix(&self, prefix: &str) -> Option<&Fact> {
        self.facts.iter().find(|fact| fact.fact_id.starts_with(prefix))
    }
}

//
// ================= Advisory Context =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: String,
    pub kind: String,
    pub severity: Severity,
    pub message_seed: String,
    pub supporting_fact_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCandidate {
    pub action_id: String,
    pub priority: u8,
    pub action_type: String,
    pub params: Value,
    pub hitl_band: HitlBand,
    pub supporting_insight_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryContext {
    pub schema_version: String,
    pub intent: Intent,
    pub language: Language,
    pub facts: Vec<Fact>,
    pub insights: Vec<Insight>,
    pub actions: Vec<ActionCandidate>,
    pub citations: Vec<String>,
    pub policy_flags: serde_json::Map<String, Value>,
}

impl AdvisoryContext {
    pub fn fact(&self, fact_id: &str) -> Option<&Fact> {
        self.facts.iter().find(|fact| fact.fact_id == fact_id)
    }

    pub fn fact_by_prefix(&self, prefix: &str) -> Option<&Fact> {
        self.facts.iter().find(|fact| fact.fact_id.starts_with(prefix))
    }
}

//
// ================= Answer Plan =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetric {
    pub fact_id: String,
    #[serde(default)]
    pub label: String,
}

/// Schema-constrained synthesis output (`answer_plan_v2`). Text slots may
/// reference evidence only through `[F:<fact_id>]` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPlan {
    pub schema_version: String,
    pub language: Language,
    pub summary_lines: Vec<String>,
    #[serde(default)]
    pub key_metrics: Vec<KeyMetric>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub limitations: Vec<String>,
    pub disclaimer: String,
    #[serde(default)]
    pub used_fact_ids: Vec<String>,
    #[serde(default)]
    pub used_insight_ids: Vec<String>,
    #[serde(default)]
    pub used_action_ids: Vec<String>,
}

impl AnswerPlan {
    /// Every free-text slot of the plan, in render order.
    pub fn text_sections(&self) -> impl Iterator<Item = &String> {
        self.summary_lines
            .iter()
            .chain(self.actions.iter())
            .chain(self.assumptions.iter())
            .chain(self.limitations.iter())
    }
}

//
// ================= Suitability =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuitabilityOutcome {
    pub decision: SuitabilityDecision,
    pub reason_codes: Vec<String>,
    pub raw: Value,
}

//
// ================= Response Envelope =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMeta {
    pub mode: String,
    pub policy_version: String,
    pub intent: Intent,
    pub confidences: RouteConfidences,
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub override_reason: Option<String>,
    #[serde(default)]
    pub timeframe_days: Option<u32>,
    #[serde(default)]
    pub extractor_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub response_mode: String,
    #[serde(default)]
    pub response_fallback: Option<String>,
    pub reason_codes: Vec<String>,
    pub synth_attempts: usize,
    pub prompt_version: String,
    pub schema_version: String,
    pub disclaimer_effective: String,
}

/// The final per-request record emitted to the caller and the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub body: String,
    pub citations: Vec<String>,
    pub disclaimer: String,
    pub trace_id: String,
    pub routing_meta: RoutingMeta,
    pub response_meta: ResponseMeta,
    pub evidence_pack: EvidencePack,
    pub advisory_context: AdvisoryContext,
    #[serde(default)]
    pub answer_plan: Option<AnswerPlan>,
    pub tool_calls: Vec<String>,
    pub response_hash: String,
}
