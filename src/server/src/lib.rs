pub mod agent_client;
pub mod fetcher;
pub mod http;
pub mod metric;
pub mod mysql;
pub mod poller;
pub mod tcpproxy;

use crate::fetcher::{Fetcher, KimoProcess};
use crate::metric::PrometheusMetric;

use common::config::ServerConfig;
use common::ShutdownMessage;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch::Receiver;
use tracing::info;

#[derive(Debug, Default)]
struct Health {
    last_successful_poll: Option<Instant>,
    last_poll_error: Option<String>,
}

/// Correlation server. The published snapshot and the health fields are the
/// only shared mutable state; the poller writes them, HTTP handlers read.
pub struct Server {
    pub config: ServerConfig,
    pub(crate) fetcher: Fetcher,
    pub(crate) metric: PrometheusMetric,
    processes: RwLock<Vec<KimoProcess>>,
    health: RwLock<Health>,
}

impl Server {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let metric = PrometheusMetric::new(&config.metric.cmdline_patterns)?;
        let fetcher = Fetcher::new(&config);
        Ok(Self {
            config,
            fetcher,
            metric,
            processes: RwLock::new(Vec::new()),
            health: RwLock::new(Health::default()),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval)
    }

    pub fn processes(&self) -> Vec<KimoProcess> {
        self.processes.read().clone()
    }

    /// Atomically replaces the snapshot and marks the cycle successful.
    pub fn publish(&self, processes: Vec<KimoProcess>) {
        *self.processes.write() = processes;
        let mut health = self.health.write();
        health.last_successful_poll = Some(Instant::now());
        health.last_poll_error = None;
    }

    /// A failed cycle leaves the previous snapshot in place.
    pub fn record_poll_error(&self, error: String) {
        self.health.write().last_poll_error = Some(error);
    }

    pub fn is_healthy(&self) -> bool {
        self.health_check(Instant::now())
    }

    /// Healthy iff a poll has succeeded, at most three intervals ago, and the
    /// latest cycle did not err.
    fn health_check(&self, now: Instant) -> bool {
        let health = self.health.read();
        let Some(last) = health.last_successful_poll else {
            return false;
        };
        now.duration_since(last) <= self.poll_interval() * 3 && health.last_poll_error.is_none()
    }

    pub async fn run(self, shutdown_rx: Receiver<ShutdownMessage>) -> anyhow::Result<()> {
        info!("KimoServer starting on {}", self.config.listen_address);
        let server = Arc::new(self);

        let poller_server = Arc::clone(&server);
        let poller_shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            poller::run(poller_server, poller_shutdown_rx).await;
        });

        http::serve(server, shutdown_rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Server {
        Server::new(ServerConfig::default()).unwrap()
    }

    #[test]
    fn test_never_polled_is_unhealthy() {
        assert!(!test_server().is_healthy());
    }

    #[test]
    fn test_successful_poll_is_healthy() {
        let server = test_server();
        server.publish(Vec::new());
        assert!(server.is_healthy());
    }

    #[test]
    fn test_poll_error_degrades_health_and_keeps_snapshot() {
        let server = test_server();
        server.publish(vec![KimoProcess {
            id: 17,
            ..KimoProcess::default()
        }]);
        assert!(server.is_healthy());

        server.record_poll_error("mysql fetch timed out".to_string());
        assert!(!server.is_healthy());
        // stale data is still served
        assert_eq!(server.processes().len(), 1);
        assert_eq!(server.processes()[0].id, 17);
    }

    #[test]
    fn test_staleness_degrades_health() {
        let server = test_server();
        server.publish(Vec::new());
        let staleness = server.poll_interval() * 3 + Duration::from_secs(1);
        assert!(!server.health_check(Instant::now() + staleness));
    }

    #[test]
    fn test_next_success_clears_error() {
        let server = test_server();
        server.record_poll_error("tcpproxy returned status 500".to_string());
        assert!(!server.is_healthy());
        server.publish(Vec::new());
        assert!(server.is_healthy());
    }
}
