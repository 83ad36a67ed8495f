use crate::fetcher::to_kimo_processes;
use crate::Server;

use common::ShutdownMessage;
use std::sync::Arc;
use tokio::sync::watch::Receiver;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Drives the fetcher on the configured interval. The first cycle fires
/// immediately; a tick arriving while a cycle is still running is skipped, so
/// at most one FetchAll runs at a time.
pub async fn run(server: Arc<Server>, mut shutdown_rx: Receiver<ShutdownMessage>) {
    info!("Polling every {:?}...", server.poll_interval());
    let mut interval = tokio::time::interval(server.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                poll_once(&server).await;
            }
            _ = shutdown_rx.changed() => {
                info!("KimoServer poller stopped.");
                break;
            }
        }
    }
}

/// One cycle. A failed cycle never touches the published snapshot, it only
/// records the error for `/health`.
pub async fn poll_once(server: &Server) {
    match server.fetcher.fetch_all().await {
        Ok(rps) => {
            let processes = to_kimo_processes(rps);
            debug!("{} processes are generated.", processes.len());
            server.publish(processes);
        }
        Err(e) => {
            error!("Poll failed. cause by {e:?}");
            server.record_poll_error(e.to_string());
        }
    }
}
