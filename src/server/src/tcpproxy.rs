use common::types::IPPort;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One live connection through the tcpproxy. A real client connected from
/// `client_out` to the proxy's `proxy_in`; the proxy opened its own
/// connection from `proxy_out` to MySQL's `server_in`. MySQL therefore sees
/// the connection as originating from `proxy_out`, and `client_out` is the
/// true originator this server must surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConn {
    pub client_out: IPPort,
    pub proxy_in: IPPort,
    pub proxy_out: IPPort,
    pub server_in: IPPort,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnsResponse {
    conns: Vec<ProxyConn>,
}

pub struct TcpProxy {
    mgmt_address: String,
    client: reqwest::Client,
}

impl TcpProxy {
    pub fn new(mgmt_address: impl Into<String>) -> Self {
        Self {
            mgmt_address: mgmt_address.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetches the proxy's live connection table. Any failure here is a hard
    /// failure of the poll cycle when the proxy is enabled.
    pub async fn get(&self) -> anyhow::Result<Vec<ProxyConn>> {
        let url = format!("http://{}/conns?json=true", self.mgmt_address);
        info!("Requesting to tcpproxy {url}");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("tcpproxy returned status {status}"));
        }
        let body: ConnsResponse = response.json().await?;
        info!("Got {} tcpproxy conns.", body.conns.len());
        Ok(body.conns)
    }
}
