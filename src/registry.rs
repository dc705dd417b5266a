//! Tool registry
//!
//! Eagerly discovers tool names and input schemas from the tool plane at
//! startup so the hot fan-out path never pays lazy discovery. The registry
//! is written only during (re)initialization; readers observe either the
//! empty pre-init state or a fully populated snapshot.

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::transport::HttpTransport;
use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

struct DiscoveredTool {
    name: String,
    input_schema: Option<Value>,
    compiled: Option<JSONSchema>,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<DiscoveredTool>,
    initialized: bool,
}

/// Shared, read-mostly tool catalog.
pub struct ToolRegistry {
    inner: RwLock<RegistryState>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(RegistryState::default()) }
    }

    /// Build a registry from a fixed tool list. Used by tests and by
    /// deployments without a reachable discovery endpoint.
    pub fn with_tools(tools: Vec<(String, Option<Value>)>) -> Self {
        let entries = tools
            .into_iter()
            .map(|(name, schema)| {
                let compiled = schema.as_ref().and_then(compile_schema);
                DiscoveredTool { name, input_schema: schema, compiled }
            })
            .collect();
        Self {
            inner: RwLock::new(RegistryState { entries, initialized: true }),
        }
    }

    /// Discover tools via JSON-RPC `tools/list` and cache their schemas.
    pub async fn initialize(
        &self,
        transport: &HttpTransport,
        config: &AgentConfig,
        trace_id: &str,
    ) -> Result<usize> {
        let body = transport
            .gateway_rpc(
                "tools/list",
                json!({}),
                &config.default_user_token,
                trace_id,
                Uuid::new_v4(),
                None,
            )
            .await
            .map_err(|e| AgentError::RegistryError(format!("tools/list failed: {}", e)))?;

        let tools = body
            .get("result")
            .and_then(|result| result.get("tools"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(tools.len());
        for tool in &tools {
            let Some(name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            let input_schema = tool
                .get("inputSchema")
                .or_else(|| tool.get("input_schema"))
                .cloned();
            let compiled = input_schema.as_ref().and_then(compile_schema);
            entries.push(DiscoveredTool {
                name: name.to_string(),
                input_schema,
                compiled,
            });
        }

        let count = entries.len();
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        info!(count, tools = ?names, "tool registry initialized");

        let mut state = self.inner.write().await;
        state.entries = entries;
        state.initialized = true;
        Ok(count)
    }

    /// Lazy fallback for processes that started before the plane was up.
    pub async fn initialize_if_empty(
        &self,
        transport: &HttpTransport,
        config: &AgentConfig,
        trace_id: &str,
    ) {
        if self.is_initialized().await {
            return;
        }
        if let Err(error) = self.initialize(transport, config, trace_id).await {
            warn!(%error, "lazy registry initialization failed");
        }
    }

    pub async fn is_initialized(&self) -> bool {
        let state = self.inner.read().await;
        state.initialized && !state.entries.is_empty()
    }

    pub async fn known_tools(&self) -> Vec<String> {
        let state = self.inner.read().await;
        state.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    /// Resolve a base tool name to its remote (possibly prefixed) name.
    /// Exact matches win; otherwise the first `___`-prefixed suffix match
    /// in discovery order is used.
    pub async fn resolve(&self, base_name: &str) -> Option<String> {
        let state = self.inner.read().await;
        resolve_in(&state.entries, base_name)
    }

    pub async fn schema(&self, base_name: &str) -> Option<Value> {
        let state = self.inner.read().await;
        find_entry(&state.entries, base_name).and_then(|entry| entry.input_schema.clone())
    }

    /// Validate arguments against the cached schema. A missing schema is a
    /// pass-through with a warning, never a rejection.
    pub async fn validate(
        &self,
        base_name: &str,
        arguments: &Value,
    ) -> std::result::Result<(), Vec<String>> {
        let state = self.inner.read().await;
        let Some(entry) = find_entry(&state.entries, base_name) else {
            warn!(tool = base_name, "no registry entry; skipping validation");
            return Ok(());
        };
        let Some(compiled) = entry.compiled.as_ref() else {
            warn!(tool = base_name, "no cached schema; skipping validation");
            return Ok(());
        };
        if let Err(errors) = compiled.validate(arguments) {
            let messages: Vec<String> = errors
                .map(|error| format!("{} at {}", error, error.instance_path))
                .collect();
            return Err(messages);
        }
        Ok(())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_schema(schema: &Value) -> Option<JSONSchema> {
    match JSONSchema::options().with_draft(Draft::Draft7).compile(schema) {
        Ok(compiled) => Some(compiled),
        Err(error) => {
            warn!(%error, "tool schema failed to compile; validation disabled for it");
            None
        }
    }
}

fn resolve_in(entries: &[DiscoveredTool], base_name: &str) -> Option<String> {
    if let Some(entry) = entries.iter().find(|entry| entry.name == base_name) {
        return Some(entry.name.clone());
    }
    let suffix = format!("___{}", base_name);
    entries
        .iter()
        .find(|entry| entry.name.ends_with(&suffix))
        .map(|entry| entry.name.clone())
}

fn find_entry<'a>(entries: &'a [DiscoveredTool], base_name: &str) -> Option<&'a DiscoveredTool> {
    let suffix = format!("___{}", base_name);
    entries
        .iter()
        .find(|entry| entry.name == base_name)
        .or_else(|| entries.iter().find(|entry| entry.name.ends_with(&suffix)))
}

/// Drop null members everywhere in the argument tree. Absence means "use
/// the tool default"; `null` must never cross the JSON-RPC boundary.
pub fn sanitize_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, value) in map {
                if value.is_null() {
                    continue;
                }
                cleaned.insert(key.clone(), sanitize_arguments(value));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(sanitize_arguments).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::with_tools(vec![
            ("spend_analytics_v1".to_string(), None),
            ("kb___retrieve_from_aws_kb".to_string(), None),
            ("retrieve_from_aws_kb".to_string(), None),
            (
                "goal_feasibility_v1".to_string(),
                Some(json!({
                    "type": "object",
                    "required": ["target_amount"],
                    "properties": {
                        "target_amount": {"type": "number"},
                        "horizon_months": {"type": "integer"}
                    }
                })),
            ),
        ])
    }

    #[tokio::test]
    async fn test_resolve_prefers_exact_match() {
        let registry = registry();
        assert_eq!(
            registry.resolve("retrieve_from_aws_kb").await.as_deref(),
            Some("retrieve_from_aws_kb")
        );
        assert_eq!(
            registry.resolve("spend_analytics_v1").await.as_deref(),
            Some("spend_analytics_v1")
        );
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_prefixed_suffix() {
        let registry = ToolRegistry::with_tools(vec![
            ("kb___retrieve_from_aws_kb".to_string(), None),
        ]);
        assert_eq!(
            registry.resolve("retrieve_from_aws_kb").await.as_deref(),
            Some("kb___retrieve_from_aws_kb")
        );
        assert_eq!(registry.resolve("unknown_tool").await, None);
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_required() {
        let registry = registry();
        let errors = registry
            .validate("goal_feasibility_v1", &json!({"horizon_months": 12}))
            .await
            .unwrap_err();
        assert!(!errors.is_empty());
        assert!(errors[0].contains("target_amount"));

        registry
            .validate("goal_feasibility_v1", &json!({"target_amount": 1_500_000_000.0}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate_passes_through_without_schema() {
        let registry = registry();
        registry
            .validate("spend_analytics_v1", &json!({"anything": true}))
            .await
            .unwrap();
        registry.validate("never_seen", &json!({})).await.unwrap();
    }

    #[test]
    fn test_sanitize_drops_nulls_recursively() {
        let raw = json!({
            "range": "30d",
            "unused": null,
            "nested": {"keep": 1, "drop": null},
            "list": [{"a": null, "b": 2}],
        });
        let cleaned = sanitize_arguments(&raw);
        assert_eq!(
            cleaned,
            json!({
                "range": "30d",
                "nested": {"keep": 1},
                "list": [{"b": 2}],
            })
        );
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let raw = json!({"a": null, "b": {"c": null, "d": 4}, "e": [null, 1]});
        let once = sanitize_arguments(&raw);
        let twice = sanitize_arguments(&once);
        assert_eq!(once, twice);
    }
}
