//! llm-serve - OpenAI-compatible gateway in front of an inference engine.

use std::env;
use std::sync::Arc;

use serve_gateway::{create_router, logging, AppState, Config, OllamaFactory, ServingRegistry};
use tokio::net::TcpListener;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: &str = match option_env!("GIT_HASH") {
    Some(hash) => hash,
    None => "unknown",
};

fn print_version() {
    println!("llm-serve {} ({})", VERSION, GIT_HASH);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Check config.toml or the LLM_SERVE__SECTION__KEY environment variables.",
            e
        )
    })?;

    logging::init_tracing(&config.logging.level);

    config
        .deployment
        .validate()
        .map_err(|e| format!("Invalid deployment descriptor: {}", e))?;

    tracing::info!(
        "Starting llm-serve {}: model={} engine={}",
        VERSION,
        config.engine.model,
        config.engine.base_url
    );

    let factory = Arc::new(OllamaFactory::new(config.generation.stream_buffer));
    let registry = Arc::new(ServingRegistry::new(factory));

    // The server comes up even if the engine does not; /ready reports 503
    // until a reconfigure succeeds.
    if let Err(e) = registry.reconfigure(config.engine.clone()).await {
        tracing::error!("Initial engine load failed: {}", e);
    }

    let state = Arc::new(AppState::new(config.clone(), registry.clone()));
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.teardown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
