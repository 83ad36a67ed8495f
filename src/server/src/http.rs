use crate::fetcher::KimoProcess;
use crate::Server;

use anyhow::anyhow;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use common::ShutdownMessage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Read-only view layer over the published snapshot. Nothing here ever
/// triggers a fetch; poll failures surface through `/health` only.
pub async fn serve(server: Arc<Server>, shutdown_rx: Receiver<ShutdownMessage>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(index_get))
        .route("/procs", get(procs_get).layer(CorsLayer::permissive()))
        .route("/metrics", get(metrics_get))
        .route("/health", get(health_get))
        .with_state(Arc::clone(&server))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));

    let listener = tokio::net::TcpListener::bind(&server.config.listen_address).await?;
    let graceful = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_cancel(shutdown_rx.clone()));

    tokio::select! {
        rs = graceful => rs.map_err(|e| anyhow!(e.to_string())),
        _ = grace_elapsed(shutdown_rx) => {
            warn!("KimoServer shutdown grace period elapsed, closing remaining connections.");
            Ok(())
        }
    }
}

async fn wait_cancel(mut shutdown_rx: Receiver<ShutdownMessage>) {
    let changed_rs = shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("KimoServer receive shutdown msg {msg}");
        }
    }
}

async fn grace_elapsed(shutdown_rx: Receiver<ShutdownMessage>) {
    wait_cancel(shutdown_rx).await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}

#[derive(Serialize)]
struct ProcsResponse {
    processes: Vec<KimoProcess>,
}

async fn procs_get(State(server): State<Arc<Server>>) -> Json<ProcsResponse> {
    Json(ProcsResponse {
        processes: server.processes(),
    })
}

#[axum_macros::debug_handler]
async fn metrics_get(State(server): State<Arc<Server>>) -> impl IntoResponse {
    let body = server.metric.render(&server.processes());
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn health_get(State(server): State<Arc<Server>>) -> StatusCode {
    if server.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn index_get() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}
