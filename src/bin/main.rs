use page_bridge::create_app;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    page_bridge::config::ensure_config_dir();

    let (state, app) = create_app().await?;
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("page-bridge listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
