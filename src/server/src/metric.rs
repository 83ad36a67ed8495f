use crate::fetcher::KimoProcess;

use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, IntGauge, Opts, Registry, TextEncoder};
use regex::Regex;
use tracing::error;

/// Gauges exposed on `/metrics`, owned by the server and rebuilt from the
/// published snapshot on every exposition.
pub struct PrometheusMetric {
    registry: Registry,
    conns_total: IntGauge,
    connections: GaugeVec,
    cmdline_patterns: Vec<Regex>,
    render_lock: Mutex<()>,
}

impl PrometheusMetric {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let cmdline_patterns = patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let registry = Registry::new();
        let conns_total = IntGauge::new(
            "kimo_mysql_conns_total",
            "Total number of MySQL connections.",
        )?;
        registry.register(Box::new(conns_total.clone()))?;
        let connections = GaugeVec::new(
            Opts::new(
                "kimo_mysql_connection",
                "MySQL connections by db, host, command, state and cmdline.",
            ),
            &["db", "host", "command", "state", "cmdline"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self {
            registry,
            conns_total,
            connections,
            cmdline_patterns,
            render_lock: Mutex::new(()),
        })
    }

    /// Clears and repopulates both gauges from the snapshot, then renders the
    /// text exposition. Label sets from earlier snapshots do not survive the
    /// reset. Expositions serialize through a lock so concurrent scrapes
    /// cannot interleave reset and repopulation.
    pub fn render(&self, processes: &[KimoProcess]) -> String {
        let _guard = self.render_lock.lock();
        self.connections.reset();
        self.conns_total.set(processes.len() as i64);
        for process in processes {
            let cmdline = self.sanitize_cmdline(&process.cmdline);
            self.connections
                .with_label_values(&[
                    process.db.as_str(),
                    process.host.as_str(),
                    process.command.as_str(),
                    process.state.as_str(),
                    cmdline.as_str(),
                ])
                .inc();
        }

        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics. cause by {e:?}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// A cmdline becomes a label verbatim only when an allow-pattern matches.
    /// Everything else is cut down to its first two tokens so secret-bearing
    /// arguments never reach the exposition.
    fn sanitize_cmdline(&self, cmdline: &str) -> String {
        if self.cmdline_patterns.iter().any(|re| re.is_match(cmdline)) {
            return cmdline.to_string();
        }
        let mut tokens = cmdline.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(argv0), Some(argv1)) => format!("{argv0} {argv1} <params>"),
            (Some(argv0), None) => argv0.to_string(),
            _ => String::new(),
        }
    }
}
