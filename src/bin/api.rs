use fintech_advisory_agent::{
    api::start_server,
    audit::BackendAuditSink,
    config::AgentConfig,
    graph::AgentGraph,
    registry::ToolRegistry,
    router::LlmIntentExtractor,
    scheduler::GatewayToolPlane,
    synthesizer::LlmAnswerSynthesizer,
    transport::HttpTransport,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv::dotenv().ok();
    let config = AgentConfig::from_env();

    let port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let transport = Arc::new(HttpTransport::new(&config)?);
    let registry = Arc::new(ToolRegistry::new());

    // Eager discovery; the process still starts on failure and falls back
    // to lazy per-call resolution.
    match registry.initialize(&transport, &config, "trc_startup").await {
        Ok(count) => info!(count, "tool registry ready"),
        Err(error) => warn!(%error, "tool registry initialization failed; lazy fallback"),
    }

    let graph = Arc::new(AgentGraph::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::new(LlmIntentExtractor::new(Arc::clone(&transport), config.clone())),
        Arc::new(LlmAnswerSynthesizer::new(Arc::clone(&transport), config.clone())),
        Arc::new(GatewayToolPlane::new(Arc::clone(&transport))),
        Arc::new(BackendAuditSink::new(Arc::clone(&transport), config.clone())),
    ));

    info!("advisory agent initialized");
    start_server(graph, port).await?;
    Ok(())
}
