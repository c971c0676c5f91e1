use anyhow::Context;
use meshline_agent::{AgentConfig, ServiceFactory};
use meshline_control::{AppState, ControlConfig, router};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let agent_config = AgentConfig::from_env();
    let control_config = ControlConfig::from_env();
    let factory = ServiceFactory::from_config(&agent_config)
        .await
        .context("initialize services")?;

    if control_config.webhook_secret.is_none() {
        tracing::warn!("MESHLINE_WEBHOOK_SECRET is unset; webhook signatures are not checked");
    }
    let state = AppState::new(&factory, control_config.webhook_secret.as_deref());
    let app = router(state);

    let addr = control_config.listen_addr;
    tracing::info!(%addr, "meshline-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
