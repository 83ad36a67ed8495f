use crate::agent_client::{AgentClient, AgentOutcome};
use crate::mysql::{Mysql, MysqlRow};
use crate::tcpproxy::{ProxyConn, TcpProxy};

use anyhow::anyhow;
use common::config::ServerConfig;
use common::types::{AgentProcess, IPPort};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

const MYSQL_TIMEOUT: Duration = Duration::from_secs(3);
const TCPPROXY_TIMEOUT: Duration = Duration::from_secs(3);
const AGENT_FANOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a row could not be fully enriched. Empty text means it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detail {
    Found,
    ProxyNotFound,
    AgentNotFound,
    CantConnect,
    AgentError(String),
}

impl fmt::Display for Detail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detail::Found => Ok(()),
            Detail::ProxyNotFound => write!(f, "no connection found on tcpproxy"),
            Detail::AgentNotFound => write!(f, "no process for port"),
            Detail::CantConnect => write!(f, "can't connect to agent"),
            Detail::AgentError(msg) => write!(f, "agent error: {msg}"),
        }
    }
}

/// Per-cycle join record combining one MySQL row with the tcpproxy conn and
/// agent process that were correlated to it.
#[derive(Debug, Clone)]
pub struct RawProcess {
    pub row: MysqlRow,
    pub proxy_conn: Option<ProxyConn>,
    pub process: Option<AgentProcess>,
    pub hostname: Option<String>,
    pub detail: Detail,
    pub tcp_proxy_enabled: bool,
}

impl RawProcess {
    pub fn new(row: MysqlRow, tcp_proxy_enabled: bool) -> Self {
        Self {
            row,
            proxy_conn: None,
            process: None,
            hostname: None,
            detail: Detail::Found,
            tcp_proxy_enabled,
        }
    }

    /// Where this row's agent lives. Computed, never stored: the proxy's
    /// client_out when a proxy conn matched, the MySQL-reported address
    /// otherwise.
    pub fn agent_addr(&self) -> IPPort {
        match &self.proxy_conn {
            Some(conn) => conn.client_out.clone(),
            None => self.row.address.clone(),
        }
    }

    /// Agent hostname if known, the agent IP if an agent was addressed, a
    /// placeholder when no tcpproxy conn classified the row.
    pub fn host(&self) -> String {
        if let Some(hostname) = &self.hostname {
            if !hostname.is_empty() {
                return hostname.clone();
            }
        }
        if self.detail == Detail::ProxyNotFound {
            return "UNKNOWN".to_string();
        }
        self.agent_addr().ip
    }
}

/// Flat outward-facing record served on `/procs` and mapped to metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KimoProcess {
    pub id: i32,
    pub mysql_user: String,
    pub db: String,
    pub command: String,
    pub time: u32,
    pub state: String,
    pub info: String,
    pub cmdline: String,
    pub status: String,
    pub pid: u32,
    pub host: String,
    pub detail: String,
}

impl KimoProcess {
    pub fn from_raw(rp: RawProcess) -> Self {
        let host = rp.host();
        let detail = rp.detail.to_string();
        let time = match rp.row.time.parse::<u32>() {
            Ok(time) => time,
            Err(_) => {
                error!("time {:?} could not be converted to int", rp.row.time);
                0
            }
        };
        let (pid, cmdline, status) = match rp.process {
            Some(process) => (process.pid, process.cmdline, process.status.to_lowercase()),
            None => (0, String::new(), String::new()),
        };
        Self {
            id: rp.row.id,
            mysql_user: rp.row.user,
            db: rp.row.db.unwrap_or_default(),
            command: rp.row.command,
            time,
            state: rp.row.state.unwrap_or_default(),
            info: rp.row.info.unwrap_or_default(),
            cmdline,
            status,
            pid,
            host,
            detail,
        }
    }
}

pub fn to_kimo_processes(rps: Vec<RawProcess>) -> Vec<KimoProcess> {
    rps.into_iter().map(KimoProcess::from_raw).collect()
}

/// Single-cycle pipeline: MySQL rows, optional tcpproxy correlation, then one
/// batched agent lookup per distinct agent IP.
pub struct Fetcher {
    mysql: Mysql,
    tcpproxy: Option<TcpProxy>,
    agent_port: u16,
    agent_http_client: reqwest::Client,
    max_concurrent_lookups: usize,
}

impl Fetcher {
    pub fn new(config: &ServerConfig) -> Self {
        let tcpproxy = config
            .tcpproxy
            .enabled()
            .then(|| TcpProxy::new(&config.tcpproxy.mgmt_address));
        Self {
            mysql: Mysql::new(&config.mysql.dsn),
            tcpproxy,
            agent_port: config.agent.port,
            agent_http_client: reqwest::Client::new(),
            max_concurrent_lookups: config.agent.max_concurrent_lookups.max(1),
        }
    }

    pub async fn fetch_all(&self) -> anyhow::Result<Vec<RawProcess>> {
        debug!("Fetching...");
        let rows = tokio::time::timeout(MYSQL_TIMEOUT, self.mysql.get())
            .await
            .map_err(|_| anyhow!("mysql fetch timed out after {MYSQL_TIMEOUT:?}"))??;

        let tcp_proxy_enabled = self.tcpproxy.is_some();
        let mut rps: Vec<RawProcess> = rows
            .into_iter()
            .map(|row| RawProcess::new(row, tcp_proxy_enabled))
            .collect();

        if let Some(tcpproxy) = &self.tcpproxy {
            let conns = tokio::time::timeout(TCPPROXY_TIMEOUT, tcpproxy.get())
                .await
                .map_err(|_| anyhow!("tcpproxy fetch timed out after {TCPPROXY_TIMEOUT:?}"))??;
            attach_proxy_conns(&mut rps, &conns).await;
        }

        self.attach_agent_processes(&mut rps).await;
        Ok(rps)
    }

    /// One agent call per distinct agent IP, all concurrent, capped by the
    /// configured semaphore. Each call gets the full fan-out budget; a slow
    /// agent classifies as can't-connect without discarding the others.
    async fn attach_agent_processes(&self, rps: &mut [RawProcess]) {
        let ports_by_ip = group_ports_by_ip(rps);
        if ports_by_ip.is_empty() {
            return;
        }

        info!("Visiting {} agents...", ports_by_ip.len());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_lookups));
        let lookups = ports_by_ip.into_iter().map(|(ip, ports)| {
            let semaphore = Arc::clone(&semaphore);
            let agent_port = self.agent_port;
            let http_client = self.agent_http_client.clone();
            async move {
                let _permit = semaphore.acquire().await.ok();
                let client = AgentClient::new(ip.clone(), agent_port, http_client);
                let outcome = match tokio::time::timeout(AGENT_FANOUT_TIMEOUT, client.get(&ports))
                    .await
                {
                    Ok(outcome) => outcome,
                    // timeouts are the transport-failure class
                    Err(_) => AgentOutcome::CantConnect,
                };
                (ip, outcome)
            }
        });
        let replies: HashMap<String, AgentOutcome> =
            futures::future::join_all(lookups).await.into_iter().collect();
        info!("All agents are visited.");

        for rp in rps.iter_mut() {
            if rp.detail == Detail::ProxyNotFound {
                continue;
            }
            let addr = rp.agent_addr();
            match replies.get(&addr.ip) {
                None | Some(AgentOutcome::CantConnect) => {
                    rp.detail = Detail::CantConnect;
                }
                Some(AgentOutcome::Ok {
                    hostname,
                    processes,
                }) => {
                    if !hostname.is_empty() {
                        rp.hostname = Some(hostname.clone());
                    }
                    match processes.iter().find(|p| p.port == addr.port) {
                        Some(process) => {
                            rp.process = Some(process.clone());
                            rp.detail = Detail::Found;
                        }
                        None => {
                            rp.detail = Detail::AgentNotFound;
                        }
                    }
                }
                Some(AgentOutcome::HttpError { status, hostname }) => {
                    rp.hostname = hostname.clone();
                    rp.detail = Detail::AgentError(format!("status {status}"));
                }
                Some(AgentOutcome::DecodeError { hostname }) => {
                    rp.hostname = hostname.clone();
                    rp.detail = Detail::AgentError("invalid response body".to_string());
                }
            }
        }
    }
}

/// Batching boundary: the fan-out visits each distinct agent IP once, with
/// every port of interest on that host. Rows the proxy could not classify are
/// left out, their detail is already settled.
fn group_ports_by_ip(rps: &[RawProcess]) -> HashMap<String, Vec<u16>> {
    let mut ports_by_ip: HashMap<String, Vec<u16>> = HashMap::new();
    for rp in rps {
        if rp.detail == Detail::ProxyNotFound {
            continue;
        }
        let addr = rp.agent_addr();
        let ports = ports_by_ip.entry(addr.ip).or_default();
        if !ports.contains(&addr.port) {
            ports.push(addr.port);
        }
    }
    ports_by_ip
}

/// Matches each row to the proxy conn whose server-facing source equals the
/// row's MySQL-reported address. Hostnames resolve via DNS once per cycle and
/// every resolved address is a match candidate.
async fn attach_proxy_conns(rps: &mut [RawProcess], conns: &[ProxyConn]) {
    let mut resolved: HashMap<String, Vec<IpAddr>> = HashMap::new();
    for rp in rps.iter_mut() {
        let address = rp.row.address.clone();
        let ips = match resolved.get(&address.ip) {
            Some(ips) => ips.clone(),
            None => {
                let ips = resolve_host(&address.ip).await;
                resolved.insert(address.ip.clone(), ips.clone());
                ips
            }
        };
        match find_proxy_conn(&address, &ips, conns) {
            Some(conn) => rp.proxy_conn = Some(conn.clone()),
            None => rp.detail = Detail::ProxyNotFound,
        }
    }
}

async fn resolve_host(host: &str) -> Vec<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![ip];
    }
    match tokio::net::lookup_host((host, 0u16)).await {
        Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
        Err(e) => {
            debug!("Failed to resolve {host}. cause by {e:?}");
            Vec::new()
        }
    }
}

fn find_proxy_conn<'a>(
    address: &IPPort,
    candidate_ips: &[IpAddr],
    conns: &'a [ProxyConn],
) -> Option<&'a ProxyConn> {
    conns.iter().find(|conn| {
        conn.proxy_out.port == address.port
            && candidate_ips
                .iter()
                .any(|ip| ip.to_string() == conn.proxy_out.ip)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i32, ip: &str, port: u16) -> MysqlRow {
        MysqlRow {
            id,
            user: "app".to_string(),
            db: Some("orders".to_string()),
            command: "Query".to_string(),
            time: "4".to_string(),
            state: Some("Sending data".to_string()),
            info: Some("SELECT 1".to_string()),
            address: IPPort::new(ip, port),
        }
    }

    fn proxy_conn(client_ip: &str, client_port: u16, out_ip: &str, out_port: u16) -> ProxyConn {
        ProxyConn {
            client_out: IPPort::new(client_ip, client_port),
            proxy_in: IPPort::new(out_ip, 3306),
            proxy_out: IPPort::new(out_ip, out_port),
            server_in: IPPort::new("10.0.2.8", 3306),
        }
    }

    #[test]
    fn test_agent_addr_prefers_proxy_client_out() {
        let mut rp = RawProcess::new(row(1, "10.0.1.9", 33000), true);
        assert_eq!(rp.agent_addr(), IPPort::new("10.0.1.9", 33000));
        rp.proxy_conn = Some(proxy_conn("10.0.4.2", 51200, "10.0.1.9", 33000));
        assert_eq!(rp.agent_addr(), IPPort::new("10.0.4.2", 51200));
    }

    #[tokio::test]
    async fn test_attach_proxy_conns_matches_on_proxy_out() {
        let conns = vec![proxy_conn("10.0.4.2", 51200, "10.0.1.9", 33000)];
        let mut rps = vec![
            RawProcess::new(row(1, "10.0.1.9", 33000), true),
            RawProcess::new(row(2, "10.0.1.9", 33001), true),
        ];
        attach_proxy_conns(&mut rps, &conns).await;
        assert_eq!(rps[0].detail, Detail::Found);
        assert_eq!(
            rps[0].proxy_conn.as_ref().unwrap().client_out,
            IPPort::new("10.0.4.2", 51200)
        );
        assert_eq!(rps[1].detail, Detail::ProxyNotFound);
        assert!(rps[1].proxy_conn.is_none());
    }

    #[tokio::test]
    async fn test_attach_proxy_conns_empty_table_marks_every_row() {
        let mut rps = vec![RawProcess::new(row(1, "10.0.0.5", 44123), true)];
        attach_proxy_conns(&mut rps, &[]).await;
        assert_eq!(rps[0].detail, Detail::ProxyNotFound);
        let kp = KimoProcess::from_raw(rps.remove(0));
        assert!(kp.detail.contains("tcpproxy"));
        assert_eq!(kp.pid, 0);
        assert_eq!(kp.host, "UNKNOWN");
    }

    #[test]
    fn test_kimo_process_success_shape() {
        // Scenario: direct row fully enriched by its agent.
        let mut rp = RawProcess::new(row(17, "10.0.0.5", 44123), false);
        rp.hostname = Some("host-a".to_string());
        rp.process = Some(AgentProcess {
            status: "ESTABLISHED".to_string(),
            pid: 812,
            port: 44123,
            name: "worker".to_string(),
            cmdline: "/usr/bin/worker --id=7 secret=abc".to_string(),
        });
        rp.detail = Detail::Found;

        let kp = KimoProcess::from_raw(rp);
        assert_eq!(kp.id, 17);
        assert_eq!(kp.mysql_user, "app");
        assert_eq!(kp.db, "orders");
        assert_eq!(kp.time, 4);
        assert_eq!(kp.status, "established");
        assert_eq!(kp.pid, 812);
        assert_eq!(kp.host, "host-a");
        assert_eq!(kp.cmdline, "/usr/bin/worker --id=7 secret=abc");
        assert_eq!(kp.detail, "");
    }

    #[test]
    fn test_kimo_process_cant_connect_falls_back_to_ip() {
        let mut rp = RawProcess::new(row(17, "10.0.0.5", 44123), false);
        rp.detail = Detail::CantConnect;
        let kp = KimoProcess::from_raw(rp);
        assert_eq!(kp.pid, 0);
        assert_eq!(kp.host, "10.0.0.5");
        assert!(kp.detail.contains("can't connect"));
    }

    #[test]
    fn test_kimo_process_agent_error_keeps_header_hostname() {
        let mut rp = RawProcess::new(row(3, "10.0.0.5", 44123), false);
        rp.hostname = Some("host-a".to_string());
        rp.detail = Detail::AgentError("status 500".to_string());
        let kp = KimoProcess::from_raw(rp);
        assert_eq!(kp.host, "host-a");
        assert_eq!(kp.detail, "agent error: status 500");
    }

    #[test]
    fn test_kimo_process_bad_time_publishes_zero() {
        let mut mysql_row = row(1, "10.0.0.5", 44123);
        mysql_row.time = "not-a-number".to_string();
        let mut rp = RawProcess::new(mysql_row, false);
        rp.detail = Detail::AgentNotFound;
        let kp = KimoProcess::from_raw(rp);
        assert_eq!(kp.time, 0);
        assert_eq!(kp.detail, "no process for port");
    }

    #[test]
    fn test_pid_and_detail_are_mutually_exclusive() {
        let cases = vec![
            {
                let mut rp = RawProcess::new(row(1, "10.0.0.5", 44123), false);
                rp.process = Some(AgentProcess {
                    status: "ESTABLISHED".to_string(),
                    pid: 812,
                    port: 44123,
                    name: "worker".to_string(),
                    cmdline: String::new(),
                });
                rp
            },
            {
                let mut rp = RawProcess::new(row(2, "10.0.0.5", 44124), false);
                rp.detail = Detail::CantConnect;
                rp
            },
            {
                let mut rp = RawProcess::new(row(3, "10.0.0.5", 44125), true);
                rp.detail = Detail::ProxyNotFound;
                rp
            },
        ];
        for kp in to_kimo_processes(cases) {
            assert!(
                (kp.pid > 0 && kp.detail.is_empty()) || (kp.pid == 0 && !kp.detail.is_empty()),
                "pid={} detail={:?}",
                kp.pid,
                kp.detail
            );
        }
    }

    #[test]
    fn test_find_proxy_conn_by_literal_ip() {
        let conns = vec![proxy_conn("10.0.4.2", 51200, "10.0.1.9", 33000)];
        let ips = vec!["10.0.1.9".parse().unwrap()];
        let found = find_proxy_conn(&IPPort::new("10.0.1.9", 33000), &ips, &conns);
        assert!(found.is_some());
        let missed = find_proxy_conn(&IPPort::new("10.0.1.9", 33001), &ips, &conns);
        assert!(missed.is_none());
    }

    #[tokio::test]
    async fn test_resolve_host_literal_ip_skips_dns() {
        let ips = resolve_host("10.0.1.9").await;
        assert_eq!(ips, vec!["10.0.1.9".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_grouping_is_per_distinct_ip() {
        let rps = vec![
            RawProcess::new(row(1, "10.0.0.5", 44123), false),
            RawProcess::new(row(2, "10.0.0.5", 44124), false),
            RawProcess::new(row(3, "10.0.0.6", 50000), false),
        ];
        let ports_by_ip = group_ports_by_ip(&rps);
        assert_eq!(ports_by_ip.len(), 2);
        assert_eq!(ports_by_ip["10.0.0.5"], vec![44123, 44124]);
        assert_eq!(ports_by_ip["10.0.0.6"], vec![50000]);
    }

    #[test]
    fn test_grouping_skips_proxy_unmatched_rows_and_dedupes() {
        let mut unmatched = RawProcess::new(row(1, "10.0.0.5", 44123), true);
        unmatched.detail = Detail::ProxyNotFound;
        let rps = vec![
            unmatched,
            RawProcess::new(row(2, "10.0.0.6", 50000), true),
            RawProcess::new(row(3, "10.0.0.6", 50000), true),
        ];
        let ports_by_ip = group_ports_by_ip(&rps);
        assert_eq!(ports_by_ip.len(), 1);
        assert_eq!(ports_by_ip["10.0.0.6"], vec![50000]);
    }
}
