use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{oneshot, Notify};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::coordinator::Tower;
use crate::http::{health_handler, metrics_handler, stats_handler};
use crate::liveness::spawn_monitor;
use crate::socket::ws_handler;

pub const SHUTDOWN_MESSAGE: &str = "Server is shutting down";

pub struct AppState {
    pub tower: Tower,
    pub config: ServerConfig,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(tower: Tower, config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            tower,
            config,
            metrics,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `signal` resolves, then tell every client the server is
/// going away and let in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let tower = state.tower.clone();
    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.await;
        let closed = tower.with(|coord| coord.shutdown(SHUTDOWN_MESSAGE));
        info!(closed, "notified connections of shutdown");
    })
    .await
    .context("server shutdown with error")
}

/// Bind, serve and run the liveness monitor until a shutdown signal or an
/// uncaught panic. Exits the process if draining exceeds the grace period.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let tower = Tower::new();
    let monitor = spawn_monitor(tower.clone(), config.heartbeat_interval);
    let fault = Arc::new(Notify::new());
    install_fault_hook(fault.clone());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("flight-tower listening on {}", config.listen_addr);

    let grace = config.shutdown_grace;
    let state = Arc::new(AppState::new(tower, config, metrics));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = fault.notified() => error!("uncaught fault; shutting down"),
        joined = &mut server => {
            monitor.abort();
            return joined.context("server task failed")?;
        }
    }

    let _ = stop_tx.send(());
    monitor.abort();
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => {
            joined.context("server task failed")??;
            info!("graceful shutdown complete");
            Ok(())
        }
        Err(_) => {
            error!(
                grace_seconds = grace.as_secs(),
                "shutdown did not finish in time; forcing exit"
            );
            std::process::exit(1);
        }
    }
}

fn install_fault_hook(fault: Arc<Notify>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "uncaught panic");
        fault.notify_one();
        previous(info);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
