//! Suitability short-circuit
//!
//! Always the first tool call of a request. The guard can end the graph
//! before any fan-out: `deny_execution` emits a refusal, `education_only`
//! restricts the route to the education path and the renderer's phrasing.

use crate::config::AgentConfig;
use crate::models::{
    Intent, RouteDecision, SuitabilityDecision, SuitabilityOutcome, ToolCall, ToolStatus,
};
use crate::registry::ToolRegistry;
use crate::scheduler::{build_tool_arguments, ToolPlane};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const GUARD_TOOL: &str = "suitability_guard_v1";

pub struct SuitabilityGuard {
    plane: Arc<dyn ToolPlane>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
}

/// Read the guard's verdict out of its payload. Tools report either a
/// `decision` string or `allow`/`education_only` booleans.
fn parse_guard_payload(payload: &Value) -> Option<SuitabilityDecision> {
    if let Some(decision) = payload.get("decision").and_then(Value::as_str) {
        return match decision {
            "allow" => Some(SuitabilityDecision::Allow),
            "education_only" => Some(SuitabilityDecision::EducationOnly),
            "deny_execution" | "deny" => Some(SuitabilityDecision::DenyExecution),
            _ => None,
        };
    }
    match payload.get("allow").and_then(Value::as_bool) {
        Some(false) => Some(SuitabilityDecision::DenyExecution),
        Some(true) => {
            if payload.get("education_only").and_then(Value::as_bool) == Some(true) {
                Some(SuitabilityDecision::EducationOnly)
            } else {
                Some(SuitabilityDecision::Allow)
            }
        }
        None => None,
    }
}

/// Safe default when the guard itself is unreachable: investment-adjacent
/// intents stay education-only, everything else proceeds.
fn degraded_decision(intent: Intent) -> (SuitabilityDecision, &'static str) {
    match intent {
        Intent::Invest | Intent::OutOfScope => (
            SuitabilityDecision::EducationOnly,
            "guard_unavailable_education_fallback",
        ),
        _ => (SuitabilityDecision::Allow, "guard_unavailable_allow"),
    }
}

impl SuitabilityGuard {
    pub fn new(plane: Arc<dyn ToolPlane>, registry: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self { plane, registry, config }
    }

    pub async fn check(
        &self,
        route: &RouteDecision,
        prompt: &str,
        trace_id: &str,
        token: &str,
    ) -> SuitabilityOutcome {
        let resolved_name = self
            .registry
            .resolve(GUARD_TOOL)
            .await
            .unwrap_or_else(|| GUARD_TOOL.to_string());

        let call = ToolCall {
            base_name: GUARD_TOOL.to_string(),
            resolved_name,
            arguments: build_tool_arguments(GUARD_TOOL, route, prompt),
            call_id: Uuid::new_v4(),
            trace_id: trace_id.to_string(),
            timeout_ms: self.config.tool_execution_timeout.as_millis() as u64,
        };

        let result = self.plane.call_tool(&call, token).await;
        if result.status != ToolStatus::Ok {
            let (decision, reason) = degraded_decision(route.intent);
            warn!(
                intent = %route.intent,
                status = ?result.status,
                fallback = reason,
                "suitability guard unavailable"
            );
            return SuitabilityOutcome {
                decision,
                reason_codes: vec![reason.to_string()],
                raw: result.payload,
            };
        }

        let decision = match parse_guard_payload(&result.payload) {
            Some(decision) => decision,
            None => {
                let (decision, _) = degraded_decision(route.intent);
                decision
            }
        };

        let mut reason_codes: Vec<String> = result
            .payload
            .get("reason_codes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|code| code.to_string())
                    .collect()
            })
            .unwrap_or_default();
        if route.intent == Intent::Invest && decision == SuitabilityDecision::Allow {
            // Investment advice never executes; clamp to education.
            reason_codes.push("invest_clamped_education_only".to_string());
            info!(trace_id, "invest intent clamped to education_only");
            return SuitabilityOutcome {
                decision: SuitabilityDecision::EducationOnly,
                reason_codes,
                raw: result.payload,
            };
        }

        SuitabilityOutcome {
            decision,
            reason_codes,
            raw: result.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RouteConfidences, ToolResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    struct FixedPlane {
        payload: Value,
        status: ToolStatus,
    }

    #[async_trait]
    impl ToolPlane for FixedPlane {
        async fn call_tool(&self, call: &ToolCall, _token: &str) -> ToolResult {
            ToolResult {
                call_id: call.call_id,
                base_name: call.base_name.clone(),
                status: self.status,
                payload: self.payload.clone(),
                error: None,
                elapsed_ms: 1,
                started_at: Utc::now(),
            }
        }
    }

    fn route(intent: Intent) -> RouteDecision {
        RouteDecision {
            mode: "semantic_enforce".to_string(),
            policy_version: "v1".to_string(),
            intent,
            tool_bundle: Vec::new(),
            clarify: false,
            clarify_questions: Vec::new(),
            confidences: RouteConfidences { intent: 0.9, top2_gap: 0.5, scenario: None },
            reason_codes: Vec::new(),
            fallback_reason: None,
            source: "semantic".to_string(),
            timeframe_days: None,
            slots: serde_json::Map::new(),
        }
    }

    fn guard(payload: Value, status: ToolStatus) -> SuitabilityGuard {
        SuitabilityGuard::new(
            Arc::new(FixedPlane { payload, status }),
            Arc::new(ToolRegistry::with_tools(vec![(GUARD_TOOL.to_string(), None)])),
            AgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_allow_passes_through() {
        let guard = guard(json!({"decision": "allow"}), ToolStatus::Ok);
        let outcome = guard.check(&route(Intent::Summary), "p", "trc", "tok").await;
        assert_eq!(outcome.decision, SuitabilityDecision::Allow);
    }

    #[tokio::test]
    async fn test_deny_is_terminal_decision() {
        let guard = guard(
            json!({"decision": "deny_execution", "reason_codes": ["policy_block"]}),
            ToolStatus::Ok,
        );
        let outcome = guard.check(&route(Intent::OutOfScope), "p", "trc", "tok").await;
        assert_eq!(outcome.decision, SuitabilityDecision::DenyExecution);
        assert_eq!(outcome.reason_codes, vec!["policy_block"]);
    }

    #[tokio::test]
    async fn test_invest_allow_clamps_to_education() {
        let guard = guard(json!({"decision": "allow"}), ToolStatus::Ok);
        let outcome = guard.check(&route(Intent::Invest), "p", "trc", "tok").await;
        assert_eq!(outcome.decision, SuitabilityDecision::EducationOnly);
        assert!(outcome
            .reason_codes
            .contains(&"invest_clamped_education_only".to_string()));
    }

    #[tokio::test]
    async fn test_boolean_payload_shape() {
        let guard = guard(json!({"allow": true, "education_only": true}), ToolStatus::Ok);
        let outcome = guard.check(&route(Intent::Summary), "p", "trc", "tok").await;
        assert_eq!(outcome.decision, SuitabilityDecision::EducationOnly);
    }

    #[tokio::test]
    async fn test_unavailable_guard_degrades_safely() {
        let invest_guard = guard(Value::Null, ToolStatus::ServerError);
        let outcome = invest_guard.check(&route(Intent::Invest), "p", "trc", "tok").await;
        assert_eq!(outcome.decision, SuitabilityDecision::EducationOnly);

        let summary_guard = guard(Value::Null, ToolStatus::Timeout);
        let outcome = summary_guard.check(&route(Intent::Summary), "p", "trc", "tok").await;
        assert_eq!(outcome.decision, SuitabilityDecision::Allow);
        assert_eq!(outcome.reason_codes, vec!["guard_unavailable_allow"]);
    }
}
