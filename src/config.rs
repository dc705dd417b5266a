//! Environment-driven configuration
//!
//! All tunables live here and are read once at startup. Post-init writes
//! are not supported; the graph receives an immutable snapshot.

use std::env;
use std::time::Duration;

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_float(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_int(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Router operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    Rule,
    SemanticShadow,
    SemanticEnforce,
}

impl RouterMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "rule" => RouterMode::Rule,
            "semantic_shadow" => RouterMode::SemanticShadow,
            _ => RouterMode::SemanticEnforce,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouterMode::Rule => "rule",
            RouterMode::SemanticShadow => "semantic_shadow",
            RouterMode::SemanticEnforce => "semantic_enforce",
        }
    }
}

/// Response generation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Template,
    LlmShadow,
    LlmEnforce,
}

impl ResponseMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "template" => ResponseMode::Template,
            "llm_enforce" => ResponseMode::LlmEnforce,
            _ => ResponseMode::LlmShadow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Template => "template",
            ResponseMode::LlmShadow => "llm_shadow",
            ResponseMode::LlmEnforce => "llm_enforce",
        }
    }
}

const NORMALIZATION_FORMS: &[&str] = &["NFC", "NFD", "NFKC", "NFKD"];

/// Immutable configuration snapshot for one process
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Upstreams
    pub gateway_endpoint: String,
    pub backend_api_base: String,
    pub llm_endpoint: String,
    pub llm_model_id: String,
    pub default_user_token: String,

    // Routing
    pub router_mode: RouterMode,
    pub router_policy_version: String,
    pub router_intent_conf_min: f64,
    pub router_top2_gap_min: f64,
    pub router_scenario_conf_min: f64,
    pub router_max_clarify_questions: usize,

    // Response
    pub response_mode: ResponseMode,
    pub response_prompt_version: String,
    pub response_schema_version: String,
    pub response_policy_version: String,
    pub response_max_retries: usize,

    // Encoding gate
    pub encoding_gate_enabled: bool,
    pub encoding_repair_enabled: bool,
    pub encoding_repair_score_min: f64,
    pub encoding_failfast_score_min: f64,
    pub encoding_repair_min_delta: f64,
    pub encoding_normalization_form: String,

    // Timeouts
    pub agent_timeout: Duration,
    pub gateway_timeout: Duration,
    pub backend_timeout: Duration,
    pub llm_connect_timeout: Duration,
    pub llm_read_timeout: Duration,
    pub tool_execution_timeout: Duration,

    // Connection pooling
    pub http_pool_connections: usize,
    pub http_pool_maxsize: usize,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let normalization_form = env_string("ENCODING_NORMALIZATION_FORM", "NFC")
            .trim()
            .to_uppercase();
        let normalization_form = if NORMALIZATION_FORMS.contains(&normalization_form.as_str()) {
            normalization_form
        } else {
            "NFC".to_string()
        };

        Self {
            gateway_endpoint: env_string("GATEWAY_ENDPOINT", ""),
            backend_api_base: env_string("BACKEND_API_BASE", "http://localhost:8010"),
            llm_endpoint: env_string("LLM_ENDPOINT", ""),
            llm_model_id: env_string("LLM_MODEL_ID", ""),
            default_user_token: env_string("DEFAULT_USER_TOKEN", ""),

            router_mode: RouterMode::parse(&env_string("ROUTER_MODE", "semantic_enforce")),
            router_policy_version: env_string("ROUTER_POLICY_VERSION", "v1"),
            router_intent_conf_min: env_float("ROUTER_INTENT_CONF_MIN", 0.70),
            router_top2_gap_min: env_float("ROUTER_TOP2_GAP_MIN", 0.15),
            router_scenario_conf_min: env_float("ROUTER_SCENARIO_CONF_MIN", 0.75),
            router_max_clarify_questions: env_int("ROUTER_MAX_CLARIFY_QUESTIONS", 2).max(1)
                as usize,

            response_mode: ResponseMode::parse(&env_string("RESPONSE_MODE", "llm_shadow")),
            response_prompt_version: env_string("RESPONSE_PROMPT_VERSION", "answer_synth_v2"),
            response_schema_version: env_string("RESPONSE_SCHEMA_VERSION", "answer_plan_v2"),
            response_policy_version: env_string("RESPONSE_POLICY_VERSION", "advice_policy_v1"),
            response_max_retries: env_int("RESPONSE_MAX_RETRIES", 1).max(0) as usize,

            encoding_gate_enabled: env_bool("ENCODING_GATE_ENABLED", true),
            encoding_repair_enabled: env_bool("ENCODING_REPAIR_ENABLED", true),
            encoding_repair_score_min: env_float("ENCODING_REPAIR_SCORE_MIN", 0.12),
            encoding_failfast_score_min: env_float("ENCODING_FAILFAST_SCORE_MIN", 0.45),
            encoding_repair_min_delta: env_float("ENCODING_REPAIR_MIN_DELTA", 0.10),
            encoding_normalization_form: normalization_form,

            agent_timeout: Duration::from_secs(env_int("AGENT_TIMEOUT_SECONDS", 120).max(1) as u64),
            gateway_timeout: Duration::from_secs(
                env_int("GATEWAY_TIMEOUT_SECONDS", 25).max(1) as u64
            ),
            backend_timeout: Duration::from_secs(
                env_int("BACKEND_TIMEOUT_SECONDS", 20).max(1) as u64
            ),
            llm_connect_timeout: Duration::from_secs(
                env_int("BEDROCK_CONNECT_TIMEOUT", 10).max(1) as u64,
            ),
            llm_read_timeout: Duration::from_secs(
                env_int("BEDROCK_READ_TIMEOUT", 120).max(1) as u64
            ),
            tool_execution_timeout: Duration::from_secs(
                env_int("TOOL_EXECUTION_TIMEOUT", 120).max(1) as u64,
            ),

            http_pool_connections: env_int("HTTP_POOL_CONNECTIONS", 10).max(1) as usize,
            http_pool_maxsize: env_int("HTTP_POOL_MAXSIZE", 20).max(1) as usize,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_endpoint: String::new(),
            backend_api_base: "http://localhost:8010".to_string(),
            llm_endpoint: String::new(),
            llm_model_id: String::new(),
            default_user_token: String::new(),
            router_mode: RouterMode::SemanticEnforce,
            router_policy_version: "v1".to_string(),
            router_intent_conf_min: 0.70,
            router_top2_gap_min: 0.15,
            router_scenario_conf_min: 0.75,
            router_max_clarify_questions: 2,
            response_mode: ResponseMode::LlmShadow,
            response_prompt_version: "answer_synth_v2".to_string(),
            response_schema_version: "answer_plan_v2".to_string(),
            response_policy_version: "advice_policy_v1".to_string(),
            response_max_retries: 1,
            encoding_gate_enabled: true,
            encoding_repair_enabled: true,
            encoding_repair_score_min: 0.12,
            encoding_failfast_score_min: 0.45,
            encoding_repair_min_delta: 0.10,
            encoding_normalization_form: "NFC".to_string(),
            agent_timeout: Duration::from_secs(120),
            gateway_timeout: Duration::from_secs(25),
            backend_timeout: Duration::from_secs(20),
            llm_connect_timeout: Duration::from_secs(10),
            llm_read_timeout: Duration::from_secs(120),
            tool_execution_timeout: Duration::from_secs(120),
            http_pool_connections: 10,
            http_pool_maxsize: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_mode_parse() {
        assert_eq!(RouterMode::parse("rule"), RouterMode::Rule);
        assert_eq!(RouterMode::parse("semantic_shadow"), RouterMode::SemanticShadow);
        assert_eq!(RouterMode::parse("semantic_enforce"), RouterMode::SemanticEnforce);
        // Unknown values coerce to the enforcing default
        assert_eq!(RouterMode::parse("bogus"), RouterMode::SemanticEnforce);
    }

    #[test]
    fn test_response_mode_parse() {
        assert_eq!(ResponseMode::parse("template"), ResponseMode::Template);
        assert_eq!(ResponseMode::parse("llm_enforce"), ResponseMode::LlmEnforce);
        assert_eq!(ResponseMode::parse("anything"), ResponseMode::LlmShadow);
    }

    #[test]
    fn test_default_thresholds() {
        let config = AgentConfig::default();
        assert!((config.router_intent_conf_min - 0.70).abs() < f64::EPSILON);
        assert!((config.router_top2_gap_min - 0.15).abs() < f64::EPSILON);
        assert_eq!(config.router_max_clarify_questions, 2);
        assert_eq!(config.gateway_timeout, Duration::from_secs(25));
        assert_eq!(config.encoding_normalization_form, "NFC");
    }
}
