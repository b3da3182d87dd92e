//! eventsse - event ingest and SSE notification server.

use std::net::SocketAddr;

use eventsse_core::BrokerRegistry;
use eventsse_server::{create_server, AppState, ServerConfig};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}

fn init_tracing(config: &ServerConfig) {
    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    let mut filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    for target in ["eventsse", "eventsse_core", "eventsse_server"] {
        filter = filter.add_directive(crate_directive(target, level));
    }

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn crate_directive(target: &str, level: Level) -> Directive {
    format!("{target}={level}")
        .parse()
        .unwrap_or_else(|_| level.into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env();
    init_tracing(&config);

    let addr: SocketAddr = config.bind_address().parse()?;
    let registry = BrokerRegistry::with_defaults();
    let state = AppState::from_config(config, &registry)?;

    // Sweeper or ingest workers
    let background = state.start_background().await?;

    let app = create_server(state.clone());

    info!(
        address = %addr,
        ttl_secs = state.config().ttl_secs,
        broker = state.delivery().is_broker(),
        "Starting eventsse"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Serve with graceful shutdown
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
            shutdown_state.begin_shutdown();
        })
        .await?;

    state.shutdown(background).await;

    info!("Server stopped cleanly");
    Ok(())
}
