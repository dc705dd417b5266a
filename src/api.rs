//! HTTP surface for the advisory agent
//!
//! `POST /invoke` runs the graph and streams the response as Server-Sent
//! Events: the body split on line boundaries, then the metadata lines
//! (`Trace:`, `Citations:`, `Disclaimer:`, `Tools:`, `ResponseMode:`,
//! `ResponseFallback:`, `ResponseReasonCodes:`), blank line terminating
//! the event.

use crate::graph::AgentGraph;
use crate::models::{AgentRequest, ResponseEnvelope};
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub graph: Arc<AgentGraph>,
}

/// Flatten an envelope into the SSE `data:` lines, in wire order.
pub fn envelope_event_lines(envelope: &ResponseEnvelope) -> Vec<String> {
    let mut lines: Vec<String> = envelope.body.lines().map(|line| line.to_string()).collect();
    lines.push(format!("Trace: {}", envelope.trace_id));
    lines.push(format!("Citations: {}", envelope.citations.join(", ")));
    lines.push(format!("Disclaimer: {}", envelope.disclaimer));
    lines.push(format!("Tools: {}", envelope.tool_calls.join(", ")));
    lines.push(format!("ResponseMode: {}", envelope.response_meta.response_mode));
    lines.push(format!(
        "ResponseFallback: {}",
        envelope.response_meta.response_fallback.as_deref().unwrap_or("none")
    ));
    lines.push(format!(
        "ResponseReasonCodes: {}",
        envelope.response_meta.reason_codes.join(",")
    ));
    lines
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn invoke(
    State(state): State<ApiState>,
    Json(request): Json<AgentRequest>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    info!(user_id = %request.user_id, "invoke request received");
    let envelope = state.graph.run(request).await;
    let lines = envelope_event_lines(&envelope);
    let stream = tokio_stream::iter(
        lines
            .into_iter()
            .map(|line| Ok::<_, Infallible>(Event::default().data(line))),
    );
    Sse::new(stream)
}

pub fn create_router(graph: Arc<AgentGraph>) -> Router {
    let state = ApiState { graph };
    Router::new()
        .route("/health", get(health))
        .route("/invoke", post(invoke))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn start_server(
    graph: Arc<AgentGraph>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(graph);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("advisory agent listening on http://0.0.0.0:{}", port);
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AdvisoryContext, EvidencePack, Intent, Language, ResponseMeta, RouteConfidences,
        RoutingMeta,
    };

    fn envelope() -> ResponseEnvelope {
        ResponseEnvelope {
            body: "**Tổng Quan Chính**\n- Dòng tiền ổn định.".to_string(),
            citations: vec!["policy_a.md".to_string(), "policy_b.md".to_string()],
            disclaimer: "Educational guidance only.".to_string(),
            trace_id: "trc_12345678".to_string(),
            routing_meta: RoutingMeta {
                mode: "semantic_enforce".to_string(),
                policy_version: "v1".to_string(),
                intent: Intent::Summary,
                confidences: RouteConfidences { intent: 0.9, top2_gap: 0.5, scenario: None },
                reason_codes: Vec::new(),
                override_reason: None,
                timeframe_days: Some(24),
                extractor_errors: Vec::new(),
            },
            response_meta: ResponseMeta {
                response_mode: "llm_enforce".to_string(),
                response_fallback: None,
                reason_codes: vec!["encoding_repaired".to_string()],
                synth_attempts: 1,
                prompt_version: "answer_synth_v2".to_string(),
                schema_version: "answer_plan_v2".to_string(),
                disclaimer_effective: "Educational guidance only.".to_string(),
            },
            evidence_pack: EvidencePack {
                schema_version: "evidence_pack_v1".to_string(),
                intent: Intent::Summary,
                language: Language::Vi,
                facts: Vec::new(),
                citations: Vec::new(),
                policy_flags: serde_json::Map::new(),
                snapshot_newest: None,
                snapshot_oldest: None,
            },
            advisory_context: AdvisoryContext {
                schema_version: "advisory_context_v1".to_string(),
                intent: Intent::Summary,
                language: Language::Vi,
                facts: Vec::new(),
                insights: Vec::new(),
                actions: Vec::new(),
                citations: Vec::new(),
                policy_flags: serde_json::Map::new(),
            },
            answer_plan: None,
            tool_calls: vec!["suitability_guard_v1".to_string(), "spend_analytics_v1".to_string()],
            response_hash: "abc123".to_string(),
        }
    }

    #[test]
    fn test_event_lines_split_body_on_line_boundaries() {
        let lines = envelope_event_lines(&envelope());
        assert_eq!(lines[0], "**Tổng Quan Chính**");
        assert_eq!(lines[1], "- Dòng tiền ổn định.");
        assert!(lines.iter().all(|line| !line.contains('\n')));
    }

    #[test]
    fn test_event_lines_metadata_order() {
        let lines = envelope_event_lines(&envelope());
        let tail: Vec<&str> = lines[lines.len() - 7..]
            .iter()
            .map(|line| line.split(':').next().unwrap())
            .collect();
        assert_eq!(
            tail,
            vec![
                "Trace",
                "Citations",
                "Disclaimer",
                "Tools",
                "ResponseMode",
                "ResponseFallback",
                "ResponseReasonCodes"
            ]
        );
        assert!(lines.contains(&"Trace: trc_12345678".to_string()));
        assert!(lines.contains(&"Citations: policy_a.md, policy_b.md".to_string()));
        assert!(lines.contains(&"ResponseFallback: none".to_string()));
        assert!(lines.contains(&"ResponseReasonCodes: encoding_repaired".to_string()));
    }
}
