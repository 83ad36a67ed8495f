use crate::conns::{self, ConnEntry};
use crate::Agent;

use anyhow::anyhow;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::types::{AgentProcess, ProcResponse, HOSTNAME_HEADER};
use common::ShutdownMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn serve(agent: Arc<Agent>, shutdown_rx: Receiver<ShutdownMessage>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/proc", get(proc_get))
        .with_state(Arc::clone(&agent))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));

    let listener = tokio::net::TcpListener::bind(&agent.config.listen_address).await?;
    let graceful = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_cancel(shutdown_rx.clone()));

    tokio::select! {
        rs = graceful => rs.map_err(|e| anyhow!(e.to_string())),
        _ = grace_elapsed(shutdown_rx) => {
            warn!("KimoAgent shutdown grace period elapsed, closing remaining connections.");
            Ok(())
        }
    }
}

async fn wait_cancel(mut shutdown_rx: Receiver<ShutdownMessage>) {
    let changed_rs = shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("KimoAgent receive shutdown msg {msg}");
        }
    }
}

async fn grace_elapsed(shutdown_rx: Receiver<ShutdownMessage>) {
    wait_cancel(shutdown_rx).await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}

/// `GET /proc?ports=P1,P2,...` returns the processes owning the requested
/// local ports. An empty intersection is a 200 with an empty list; a missing
/// or unparseable `ports` parameter is a 400. Every response carries the
/// agent's hostname header, errors included.
async fn proc_get(
    Query(params): Query<HashMap<String, String>>,
    State(agent): State<Arc<Agent>>,
) -> Response {
    let mut response = match params.get("ports") {
        None => (StatusCode::BAD_REQUEST, "ports param is required").into_response(),
        Some(raw) => match parse_ports(raw) {
            Err(e) => {
                debug!("Rejecting ports param {raw:?}. cause by {e:?}");
                (StatusCode::BAD_REQUEST, "ports param is invalid").into_response()
            }
            Ok(ports) => {
                let matching = filter_conns(&agent.get_conns(), &ports);
                Json(build_response(matching)).into_response()
            }
        },
    };
    if let Ok(value) = HeaderValue::from_str(&agent.hostname) {
        response.headers_mut().insert(HOSTNAME_HEADER, value);
    }
    response
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, std::num::ParseIntError> {
    raw.split(',').map(|token| token.trim().parse()).collect()
}

fn filter_conns(conns: &[ConnEntry], ports: &[u16]) -> Vec<ConnEntry> {
    conns
        .iter()
        .filter(|conn| ports.contains(&conn.port))
        .cloned()
        .collect()
}

/// Process lookups run here, after the snapshot lock is already released.
/// A pid that exited between snapshot and response assembly is skipped.
fn build_response(matching: Vec<ConnEntry>) -> ProcResponse {
    let mut processes = Vec::new();
    for conn in matching {
        let Some(info) = conns::resolve_process(conn.pid) else {
            debug!("Process {} disappeared, skipping port {}.", conn.pid, conn.port);
            continue;
        };
        processes.push(AgentProcess {
            status: conn.status,
            pid: conn.pid,
            port: conn.port,
            name: info.name,
            cmdline: info.cmdline,
        });
    }
    ProcResponse { processes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, pid: u32) -> ConnEntry {
        ConnEntry {
            port,
            pid,
            status: "ESTABLISHED".to_string(),
        }
    }

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports("44123").unwrap(), vec![44123]);
        assert_eq!(parse_ports("80, 443").unwrap(), vec![80, 443]);
        assert!(parse_ports("").is_err());
        assert!(parse_ports("80,x").is_err());
        assert!(parse_ports("80,,443").is_err());
        assert!(parse_ports("99999").is_err());
    }

    #[test]
    fn test_filter_conns_keeps_requested_ports_only() {
        let conns = vec![entry(44123, 812), entry(50000, 900), entry(44123, 813)];
        let matching = filter_conns(&conns, &[44123]);
        assert_eq!(matching.len(), 2);
        assert!(matching.iter().all(|c| c.port == 44123));
    }

    #[test]
    fn test_filter_conns_empty_intersection() {
        let conns = vec![entry(44123, 812)];
        assert!(filter_conns(&conns, &[1]).is_empty());
    }
}
