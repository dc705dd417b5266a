//! Decision engine / tool scheduler
//!
//! Executes a route's tool bundle with bounded parallel fan-out. Sibling
//! calls run concurrently, write distinct result slots, and never cancel
//! each other; a failed tool becomes a placeholder result downstream stages
//! treat as "no facts from this tool". The LLM stays out of this module.

use crate::config::AgentConfig;
use crate::models::{Intent, RouteDecision, ToolCall, ToolResult, ToolStatus};
use crate::registry::{sanitize_arguments, ToolRegistry};
use crate::router::timeframe::clamp_days;
use crate::transport::{HttpTransport, TransportErrorKind};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Concurrency ceiling for sibling tool calls.
pub const MAX_PARALLEL_TOOLS: usize = 9;

/// Trait for the remote tool plane (JSON-RPC `tools/call`)
#[async_trait]
pub trait ToolPlane: Send + Sync {
    async fn call_tool(&self, call: &ToolCall, token: &str) -> ToolResult;
}

//
// ================= Gateway Implementation =================
//

pub struct GatewayToolPlane {
    transport: Arc<HttpTransport>,
}

impl GatewayToolPlane {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }
}

/// Tool replies are wrapped as `{result: {content: [{type: "text",
/// text: "<json>"}]}}`; the inner text is the tool's own envelope.
pub fn unwrap_tool_payload(body: &Value) -> Value {
    let content_text = body
        .get("result")
        .and_then(|result| result.get("content"))
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find_map(|item| {
                item.get("text").and_then(Value::as_str)
            })
        });
    if let Some(text) = content_text {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            return parsed;
        }
    }
    body.get("result").cloned().unwrap_or_else(|| body.clone())
}

fn status_for_kind(kind: TransportErrorKind) -> ToolStatus {
    match kind {
        TransportErrorKind::Timeout => ToolStatus::Timeout,
        TransportErrorKind::Auth
        | TransportErrorKind::Client4xx
        | TransportErrorKind::Decode => ToolStatus::ClientError,
        TransportErrorKind::Network
        | TransportErrorKind::Server5xx
        | TransportErrorKind::PoolExhausted => ToolStatus::ServerError,
    }
}

#[async_trait]
impl ToolPlane for GatewayToolPlane {
    async fn call_tool(&self, call: &ToolCall, token: &str) -> ToolResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let params = json!({
            "name": call.resolved_name,
            "arguments": call.arguments,
        });

        let outcome = self
            .transport
            .gateway_rpc(
                "tools/call",
                params,
                token,
                &call.trace_id,
                call.call_id,
                Some(std::time::Duration::from_millis(call.timeout_ms)),
            )
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(body) => ToolResult {
                call_id: call.call_id,
                base_name: call.base_name.clone(),
                status: ToolStatus::Ok,
                payload: unwrap_tool_payload(&body),
                error: None,
                elapsed_ms,
                started_at,
            },
            Err(error) => {
                warn!(
                    tool = %call.base_name,
                    kind = error.kind.as_str(),
                    attempts = error.attempts,
                    "tool call failed"
                );
                ToolResult {
                    call_id: call.call_id,
                    base_name: call.base_name.clone(),
                    status: status_for_kind(error.kind),
                    payload: Value::Null,
                    error: Some(error.to_string()),
                    elapsed_ms,
                    started_at,
                }
            }
        }
    }
}

//
// ================= Argument Mapping =================
//

fn slot_f64(route: &RouteDecision, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| route.slots.get(*key).and_then(Value::as_f64))
}

fn slot_value(route: &RouteDecision, key: &str) -> Option<Value> {
    route.slots.get(key).cloned()
}

/// Map the route onto one tool's arguments. The effective timeframe is
/// clamped to each tool's accepted bounds; absence means tool defaults.
pub fn build_tool_arguments(base_name: &str, route: &RouteDecision, prompt: &str) -> Value {
    let days = route.timeframe_days;
    let args = match base_name {
        "spend_analytics_v1" => json!({
            "range": days.map(|d| format!("{}d", clamp_days(d, 1, 365))),
        }),
        "cashflow_forecast_v1" => json!({
            "range": days.map(|d| format!("{}d", clamp_days(d.max(90), 90, 365))),
        }),
        "anomaly_signals_v1" => json!({
            "lookback_days": days.map(|d| clamp_days(d, 30, 365)),
        }),
        "risk_profile_non_investment_v1" => json!({
            "lookback_days": days.map(|d| clamp_days(d, 60, 720)),
        }),
        "recurring_cashflow_detect_v1" => json!({
            "lookback_months": days.map(|d| (d / 30).clamp(3, 24)),
        }),
        "goal_feasibility_v1" => json!({
            "target_amount": slot_f64(route, &[
                "target_amount_vnd", "target_amount", "goal_target_amount",
                "savings_goal_vnd", "goal_amount", "savings_target_vnd",
            ]),
            "horizon_months": slot_f64(route, &[
                "horizon_months", "goal_horizon_months", "time_horizon_months",
                "duration_months", "saving_horizon_months",
            ]).map(|v| v as i64),
        }),
        "jar_allocation_suggest_v1" => json!({
            "range": days.map(|d| format!("{}d", clamp_days(d, 1, 365))),
        }),
        "what_if_scenario_v1" => json!({
            "horizon_months": slot_f64(route, &["horizon_months"]).map(|v| v as i64),
            "income_delta_pct": slot_value(route, "income_delta_pct"),
            "spend_delta_pct": slot_value(route, "spend_delta_pct"),
            "income_delta_amount_vnd": slot_value(route, "income_delta_amount_vnd"),
            "spend_delta_amount_vnd": slot_value(route, "spend_delta_amount_vnd"),
            "variants": slot_value(route, "variants"),
        }),
        "suitability_guard_v1" => json!({
            "intent": route.intent.as_str(),
            "requested_action": requested_action_for_intent(route.intent),
            "prompt": prompt,
        }),
        _ => json!({}),
    };
    sanitize_arguments(&args)
}

pub fn requested_action_for_intent(intent: Intent) -> &'static str {
    match intent {
        Intent::Invest => "invest_execution",
        Intent::OutOfScope => "out_of_scope_request",
        _ => "advisory_analysis",
    }
}

//
// ================= Scheduler =================
//

pub struct ToolScheduler {
    plane: Arc<dyn ToolPlane>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl ToolScheduler {
    pub fn new(plane: Arc<dyn ToolPlane>, registry: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self { plane, registry, config }
    }

    fn placeholder(call: &ToolCall, status: ToolStatus, error: String) -> ToolResult {
        ToolResult {
            call_id: call.call_id,
            base_name: call.base_name.clone(),
            status,
            payload: Value::Null,
            error: Some(error),
            elapsed_ms: 0,
            started_at: Utc::now(),
        }
    }

    /// Execute the route's bundle concurrently; results come back in
    /// deterministic bundle order regardless of completion order.
    pub async fn execute_bundle(
        &self,
        route: &RouteDecision,
        prompt: &str,
        trace_id: &str,
        token: &str,
    ) -> Vec<ToolResult> {
        let registry_ready = self.registry.is_initialized().await;
        let timeout_ms = self.config.tool_execution_timeout.as_millis() as u64;

        let mut calls: Vec<(usize, ToolCall)> = Vec::with_capacity(route.tool_bundle.len());
        let mut local_failures: Vec<(usize, ToolResult)> = Vec::new();

        for (index, base_name) in route.tool_bundle.iter().enumerate() {
            let arguments = build_tool_arguments(base_name, route, prompt);
            let resolved_name = match self.registry.resolve(base_name).await {
                Some(name) => name,
                // Empty registry passes names through for lazy discovery by
                // the plane itself; a populated registry that does not know
                // the tool rejects locally.
                None if !registry_ready => base_name.clone(),
                None => {
                    let call = ToolCall {
                        base_name: base_name.clone(),
                        resolved_name: base_name.clone(),
                        arguments: arguments.clone(),
                        call_id: Uuid::new_v4(),
                        trace_id: trace_id.to_string(),
                        timeout_ms,
                    };
                    local_failures.push((
                        index,
                        Self::placeholder(
                            &call,
                            ToolStatus::ValidationError,
                            "tool not present in registry".to_string(),
                        ),
                    ));
                    continue;
                }
            };

            let call = ToolCall {
                base_name: base_name.clone(),
                resolved_name,
                arguments,
                call_id: Uuid::new_v4(),
                trace_id: trace_id.to_string(),
                timeout_ms,
            };

            if let Err(errors) = self.registry.validate(base_name, &call.arguments).await {
                warn!(tool = %base_name, ?errors, "argument validation failed");
                local_failures.push((
                    index,
                    Self::placeholder(&call, ToolStatus::ValidationError, errors.join("; ")),
                ));
                continue;
            }

            calls.push((index, call));
        }

        let mut slots: Vec<Option<ToolResult>> = vec![None; route.tool_bundle.len()];
        for (index, result) in local_failures {
            slots[index] = Some(result);
        }

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            MAX_PARALLEL_TOOLS.min(route.tool_bundle.len().max(1)),
        ));
        let mut join_set: JoinSet<(usize, ToolResult)> = JoinSet::new();
        for (index, call) in calls {
            let plane = Arc::clone(&self.plane);
            let semaphore = Arc::clone(&semaphore);
            let token = token.to_string();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = plane.call_tool(&call, &token).await;
                (index, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    debug!(
                        tool = %result.base_name,
                        status = ?result.status,
                        elapsed_ms = result.elapsed_ms,
                        "tool completed"
                    );
                    slots[index] = Some(result);
                }
                Err(join_error) => {
                    warn!(%join_error, "tool task aborted");
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| ToolResult {
                    call_id: Uuid::new_v4(),
                    base_name: route.tool_bundle[index].clone(),
                    status: ToolStatus::ServerError,
                    payload: Value::Null,
                    error: Some("tool task aborted".to_string()),
                    elapsed_ms: 0,
                    started_at: Utc::now(),
                })
            })
            .collect()
    }
}
