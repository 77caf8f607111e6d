use std::time::Duration;

use hub::{build_router, spawn_heartbeat_sweeper, Config, HubError, HubState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    let bind_addr = config.bind_addr();
    let state = HubState::new(config);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(source) => {
            let err = HubError::Bind {
                addr: bind_addr,
                source,
            };
            error!(error = %err, "hub failed to start");
            std::process::exit(1);
        }
    };

    info!(addr = %bind_addr, "hub listening");

    let sweeper = spawn_heartbeat_sweeper(&state);
    let router = build_router(state.clone());

    if let Err(source) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
    {
        let err = HubError::Serve(source);
        error!(error = %err, "hub exited with an error");
        sweeper.abort();
        std::process::exit(1);
    }

    sweeper.abort();
    info!("hub shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C, then drives `HubState::shutdown` (stop
/// accepting, close every live connection, drain the registry) before
/// returning control to `axum::serve`.
async fn shutdown_signal(state: HubState) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    state.shutdown(Duration::from_secs(10)).await;
}
