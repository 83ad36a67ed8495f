use serde::{Deserialize, Serialize};
use std::fmt;

/// Response header carrying the answering agent's hostname
/// (canonically `X-Kimo-Hostname`; kept lowercase for the http crate).
pub const HOSTNAME_HEADER: &str = "x-kimo-hostname";

/// Network endpoint as seen by MySQL, the tcpproxy or an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IPPort {
    pub ip: String,
    pub port: u16,
}

impl IPPort {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for IPPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// One process-to-port attribution as observed by an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProcess {
    pub status: String,
    pub pid: u32,
    pub port: u16,
    pub name: String,
    pub cmdline: String,
}

/// Body of the agent's `/proc` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcResponse {
    pub processes: Vec<AgentProcess>,
}
