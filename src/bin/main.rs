use fintech_advisory_agent::{
    audit::InMemoryAuditSink,
    config::AgentConfig,
    graph::AgentGraph,
    models::AgentRequest,
    registry::ToolRegistry,
    router::LlmIntentExtractor,
    scheduler::GatewayToolPlane,
    synthesizer::LlmAnswerSynthesizer,
    transport::HttpTransport,
};
use std::sync::Arc;
use tracing::info;

/// One-shot CLI run: send a single prompt through the graph and print the
/// envelope summary. Useful for smoke-testing a deployment.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();
    let config = AgentConfig::from_env();

    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.trim().is_empty() {
        "Tóm tắt chi tiêu tháng này".to_string()
    } else {
        prompt
    };

    let transport = Arc::new(HttpTransport::new(&config)?);
    let registry = Arc::new(ToolRegistry::new());
    if let Err(error) = registry.initialize(&transport, &config, "trc_cli").await {
        info!(%error, "registry unavailable; continuing with lazy resolution");
    }

    let audit = Arc::new(InMemoryAuditSink::new());
    let graph = AgentGraph::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::new(LlmIntentExtractor::new(Arc::clone(&transport), config.clone())),
        Arc::new(LlmAnswerSynthesizer::new(Arc::clone(&transport), config.clone())),
        Arc::new(GatewayToolPlane::new(Arc::clone(&transport))),
        Arc::clone(&audit) as Arc<dyn fintech_advisory_agent::audit::AuditSink>,
    );

    info!(%prompt, "running advisory graph");
    let envelope = graph
        .run(AgentRequest {
            prompt,
            user_id: "cli-user".to_string(),
            locale: Some("vi-VN".to_string()),
            authorization: None,
        })
        .await;

    println!("\n=== RESPONSE ===");
    println!("{}", envelope.body);
    println!("\nTrace: {}", envelope.trace_id);
    println!("Intent: {}", envelope.routing_meta.intent);
    println!("Tools: {}", envelope.tool_calls.join(", "));
    println!("Mode: {}", envelope.response_meta.response_mode);
    if let Some(fallback) = &envelope.response_meta.response_fallback {
        println!("Fallback: {}", fallback);
    }
    Ok(())
}
