use common::types::{AgentProcess, ProcResponse, HOSTNAME_HEADER};

use tracing::debug;

/// Outcome of one agent query. Exactly one variant holds per request; the
/// join downstream derives the `detail` string and the `host` fallback from
/// it. The client never retries, the poller's next tick is the retry.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Ok {
        hostname: String,
        processes: Vec<AgentProcess>,
    },
    /// Dial refused, DNS failure, no route, or a timed-out request.
    CantConnect,
    HttpError {
        status: u16,
        hostname: Option<String>,
    },
    DecodeError {
        hostname: Option<String>,
    },
}

pub struct AgentClient {
    ip: String,
    port: u16,
    client: reqwest::Client,
}

impl AgentClient {
    /// The http client is built once at server startup and shared across
    /// cycles; cloning it reuses the same connection pool.
    pub fn new(ip: impl Into<String>, port: u16, client: reqwest::Client) -> Self {
        Self {
            ip: ip.into(),
            port,
            client,
        }
    }

    /// One request carries every port of interest on this agent's host.
    pub async fn get(&self, ports: &[u16]) -> AgentOutcome {
        let csv = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("http://{}:{}/proc?ports={}", self.ip, self.port, csv);
        debug!("Requesting to {url}");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Can't connect to agent {}. cause by {e:?}", self.ip);
                return AgentOutcome::CantConnect;
            }
        };

        let hostname = response
            .headers()
            .get(HOSTNAME_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let status = response.status();
        if !status.is_success() {
            return AgentOutcome::HttpError {
                status: status.as_u16(),
                hostname,
            };
        }

        match response.json::<ProcResponse>().await {
            Ok(body) => AgentOutcome::Ok {
                hostname: hostname.unwrap_or_default(),
                processes: body.processes,
            },
            Err(e) => {
                debug!("Can't decode agent response from {}. cause by {e:?}", self.ip);
                AgentOutcome::DecodeError { hostname }
            }
        }
    }
}
