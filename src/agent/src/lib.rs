pub mod conns;
pub mod http;
pub mod poll;

use crate::conns::ConnEntry;

use common::config::AgentConfig;
use common::sys_utils::sys::hostname;
use common::ShutdownMessage;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch::Receiver;
use tracing::info;

/// Per-host daemon answering "which process owns local port P".
///
/// The connection snapshot is refreshed by a background poller and read by
/// concurrent `/proc` handlers, so it lives behind an RwLock. Handlers only
/// take the read lock to copy matching entries; process name/cmdline lookups
/// happen outside the lock.
pub struct Agent {
    pub config: AgentConfig,
    pub hostname: String,
    conns: RwLock<Vec<ConnEntry>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            hostname: hostname(),
            conns: RwLock::new(Vec::new()),
        }
    }

    pub fn get_conns(&self) -> Vec<ConnEntry> {
        self.conns.read().clone()
    }

    /// Swaps in a fresh snapshot. Write lock is held only for the swap.
    pub fn set_conns(&self, conns: Vec<ConnEntry>) {
        *self.conns.write() = conns;
    }

    pub async fn run(self, shutdown_rx: Receiver<ShutdownMessage>) -> anyhow::Result<()> {
        info!(
            "KimoAgent starting on {} hostname={}",
            self.config.listen_address, self.hostname
        );
        let agent = Arc::new(self);

        let poller_agent = Arc::clone(&agent);
        let poller_shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            poll::run(poller_agent, poller_shutdown_rx).await;
        });

        http::serve(agent, shutdown_rx).await
    }
}
