use std::sync::Arc;

use signaling_relay::bridge::HttpSessionBackend;
use signaling_relay::config::Config;
use signaling_relay::observability::{init_tracing, instance_id};
use signaling_relay::state::AppState;

#[tokio::main]
async fn main() {
    init_tracing();
    let config = Config::from_env();

    let backend = match HttpSessionBackend::new(&config.backend_base_url, config.backend_timeout) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(component = "bootstrap", error = %e, "failed to build session backend client");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(component = "bootstrap", addr = %config.bind_addr, error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        component = "bootstrap",
        instance_id = %instance_id(),
        addr = %config.bind_addr,
        backend = %config.backend_base_url,
        "signaling relay listening"
    );

    let state = AppState::new(config, Arc::new(backend));
    let app = signaling_relay::app(state.clone());

    let shutdown_state = state.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!(
                component = "bootstrap",
                open_connections = shutdown_state.registry.count_all(),
                "shutdown signal received; closing connections"
            );
            shutdown_state.begin_shutdown();
        })
        .await;

    if let Err(e) = served {
        tracing::error!(component = "bootstrap", error = %e, "server exited with error");
        std::process::exit(1);
    }
    tracing::info!(component = "bootstrap", "shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
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
