use common::types::IPPort;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, Row, Value};
use tracing::{debug, error, info};

/// Projection of one `information_schema.PROCESSLIST` row. The address is the
/// client side of the MySQL connection as MySQL sees it. Rows without a
/// `host:port` host field (unix socket, localhost) never become a MysqlRow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlRow {
    pub id: i32,
    pub user: String,
    pub db: Option<String>,
    pub command: String,
    /// TIME column carried as its string rendering; parsed to u32 lazily.
    pub time: String,
    pub state: Option<String>,
    pub info: Option<String>,
    pub address: IPPort,
}

pub struct Mysql {
    dsn: String,
}

impl Mysql {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self { dsn: dsn.into() }
    }

    /// Snapshots the PROCESSLIST. One connection per call, closed on every
    /// exit path. Any driver error aborts the whole poll cycle.
    pub async fn get(&self) -> anyhow::Result<Vec<MysqlRow>> {
        info!("Requesting PROCESSLIST from mysql...");
        let opts = Opts::from_url(&self.dsn)?;
        let mut conn = Conn::new(opts).await?;
        let query_rs: Result<Vec<Row>, _> = conn
            .query("SELECT * FROM information_schema.PROCESSLIST")
            .await;
        let disconnect_rs = conn.disconnect().await;
        let raw_rows = query_rs?;
        disconnect_rs?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for row in raw_rows {
            if let Some(parsed) = parse_row(&row) {
                rows.push(parsed);
            }
        }
        info!("Got {} mysql rows.", rows.len());
        Ok(rows)
    }
}

/// Columns are scanned positionally: id, user, host, db, command, time,
/// state, info.
fn parse_row(row: &Row) -> Option<MysqlRow> {
    let host: String = row.get(2).unwrap_or_default();
    let address = parse_address(&host)?;
    Some(MysqlRow {
        id: row.get(0).unwrap_or_default(),
        user: row.get(1).unwrap_or_default(),
        db: row.get::<Option<String>, _>(3).flatten(),
        command: row.get(4).unwrap_or_default(),
        time: row
            .get::<Value, _>(5)
            .and_then(column_text)
            .unwrap_or_default(),
        state: row.get::<Option<String>, _>(6).flatten(),
        info: row.get::<Option<String>, _>(7).flatten(),
        address,
    })
}

pub(crate) fn parse_address(host: &str) -> Option<IPPort> {
    let Some((ip, port_raw)) = host.split_once(':') else {
        // unix socket or localhost, cannot be resolved to a remote agent
        debug!("Skipping mysql row without host:port. host={host:?}");
        return None;
    };
    match port_raw.parse::<u16>() {
        Ok(port) => Some(IPPort::new(ip, port)),
        Err(e) => {
            error!("Skipping mysql row, port is not numeric. host={host:?} cause by {e:?}");
            None
        }
    }
}

/// PROCESSLIST columns arrive as strings or integers depending on the server;
/// both render to the same text.
fn column_text(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        other => Some(other.as_sql(true)),
    }
}
