use std::sync::Arc;

use optimo_worker::config::Config;
use optimo_worker::http::build_router;
use optimo_worker::lifecycle::LifecycleController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("optimo-worker starting");

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let controller = Arc::new(LifecycleController::new(config));
    let router = build_router(controller);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "listening");

    axum::serve(listener, router)
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("optimo-worker shutting down");
    Ok(())
}
