use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use prompt_relay::{build_router, AppState, Cli, Config, LanguageModel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "prompt_relay=debug,tower_http=debug"
    } else {
        "prompt_relay=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("prompt-relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        family = %config.model.resolved_family(),
        backend = ?config.model.backend,
        n_ctx = config.model.n_ctx,
        "Configuration loaded"
    );

    info!(
        temperature = config.generation.temperature,
        max_new_tokens = config.generation.max_new_tokens,
        stop = ?config.generation.stop,
        "Generation defaults"
    );

    // Load the model. Without it there is nothing to serve.
    let model = LanguageModel::load(&config).context("model load failed, not serving")?;

    let state = Arc::new(AppState::new(model, config.clone())?);
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
