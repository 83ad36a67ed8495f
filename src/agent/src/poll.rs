use crate::{conns, Agent};

use common::ShutdownMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Walking /proc is expensive on busy hosts, so one refresh gets a hard budget.
const REFRESH_BUDGET: Duration = Duration::from_secs(5);

/// Refresh loop for the connection snapshot. The first refresh fires
/// immediately, then once per configured interval. A failed or slow refresh
/// keeps the previous snapshot.
pub async fn run(agent: Arc<Agent>, mut shutdown_rx: Receiver<ShutdownMessage>) {
    let mut interval = tokio::time::interval(Duration::from_secs(agent.config.poll_interval));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                refresh(&agent).await;
            }
            _ = shutdown_rx.changed() => {
                info!("KimoAgent snapshot poller stopped.");
                break;
            }
        }
    }
}

async fn refresh(agent: &Agent) {
    let walk = tokio::task::spawn_blocking(conns::snapshot);
    match tokio::time::timeout(REFRESH_BUDGET, walk).await {
        Err(_elapsed) => {
            warn!(
                "Connection snapshot exceeded {:?}, keeping previous snapshot.",
                REFRESH_BUDGET
            );
        }
        Ok(Err(join_err)) => {
            warn!("Connection snapshot task failed. cause by {join_err:?}");
        }
        Ok(Ok(Err(e))) => {
            warn!("Connection snapshot failed, keeping previous snapshot. cause by {e:?}");
        }
        Ok(Ok(Ok(conns))) => {
            debug!("Connection snapshot refreshed. {} entries.", conns.len());
            agent.set_conns(conns);
        }
    }
}
