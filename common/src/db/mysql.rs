// MySQL backend built on mysql_async

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, Connector, ExecResult, PoolBackend, Row, SqlValue};
use crate::errors::DatabaseError;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Value};
use tracing::{debug, warn};

/// Builds [`MySqlBackend`] pools from [`DatabaseConfig`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }

    fn opts(config: &DatabaseConfig) -> Result<OptsBuilder, DatabaseError> {
        let constraints = PoolConstraints::new(1, config.max_connections).ok_or_else(|| {
            DatabaseError::Config(format!(
                "invalid pool size: max_connections = {}",
                config.max_connections
            ))
        })?;
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_inactive_connection_ttl(config.idle_timeout());

        let mut opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()))
            .pool_opts(pool_opts);
        if config.keep_alive {
            opts = opts.tcp_keepalive(Some(config.idle_timeout_ms.min(u32::MAX as u64) as u32));
        }
        Ok(opts)
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Backend = MySqlBackend;

    #[tracing::instrument(skip(self, config), fields(database_type = "mysql", host = %config.host, port = config.port))]
    async fn connect(&self, config: &DatabaseConfig) -> Result<MySqlBackend, DatabaseError> {
        let opts = Self::opts(config)?;
        debug!("Creating MySQL connection pool");
        Ok(MySqlBackend {
            pool: Pool::new(opts),
        })
    }
}

/// A `mysql_async` pool
#[derive(Debug)]
pub struct MySqlBackend {
    pool: Pool,
}

#[async_trait]
impl PoolBackend for MySqlBackend {
    type Conn = MySqlConnection;

    async fn get_conn(&self) -> Result<MySqlConnection, DatabaseError> {
        let conn = self.pool.get_conn().await?;
        Ok(MySqlConnection { conn })
    }

    fn recycle(&self, conn: MySqlConnection) {
        // Dropping a Conn hands it back to its pool
        drop(conn);
    }

    fn discard(&self, conn: MySqlConnection) {
        let session_id = conn.conn.id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.conn.disconnect().await {
                        debug!(session_id = session_id, error = %e, "Error closing discarded connection");
                    }
                });
            }
            Err(_) => drop(conn),
        }
    }

    async fn disconnect(&self) -> Result<(), DatabaseError> {
        self.pool.clone().disconnect().await.map_err(|e| {
            warn!(error = %e, "Failed to disconnect from MySQL");
            DatabaseError::from(e)
        })
    }
}

/// One MySQL session
#[derive(Debug)]
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    /// Run a statement through the text protocol
    async fn simple(&mut self, sql: &str) -> Result<(), DatabaseError> {
        self.conn.query_drop(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    fn session_id(&self) -> u32 {
        self.conn.id()
    }

    async fn ping(&mut self) -> Result<(), DatabaseError> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<ExecResult, DatabaseError> {
        if params.is_empty() {
            // DDL and session statements are not all preparable
            self.conn.query_drop(sql).await?;
        } else {
            self.conn.exec_drop(sql, to_params(params)).await?;
        }
        Ok(ExecResult {
            affected_rows: self.conn.affected_rows(),
            last_insert_id: self.conn.last_insert_id(),
        })
    }

    async fn query(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, DatabaseError> {
        let rows: Vec<mysql_async::Row> = if params.is_empty() {
            self.conn.query(sql).await?
        } else {
            self.conn.exec(sql, to_params(params)).await?
        };
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn begin(&mut self) -> Result<(), DatabaseError> {
        self.simple("START TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.simple("ROLLBACK").await
    }
}

fn to_params(params: Vec<SqlValue>) -> Params {
    Params::Positional(params.into_iter().map(to_value).collect())
}

fn to_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Int(v) => Value::Int(v),
        SqlValue::UInt(v) => Value::UInt(v),
        SqlValue::Float(v) => Value::Double(v),
        SqlValue::Text(v) => Value::Bytes(v.into_bytes()),
        SqlValue::Bytes(v) => Value::Bytes(v),
    }
}

fn from_value(value: &Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(v) => SqlValue::Int(*v),
        Value::UInt(v) => SqlValue::UInt(*v),
        Value::Float(v) => SqlValue::Float(f64::from(*v)),
        Value::Double(v) => SqlValue::Float(*v),
        Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => SqlValue::Text(text),
            Err(e) => SqlValue::Bytes(e.into_bytes()),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => SqlValue::Text(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, minute, second, micros
        )),
        Value::Time(negative, days, hours, minutes, seconds, micros) => SqlValue::Text(format!(
            "{}{}:{:02}:{:02}.{:06}",
            if *negative { "-" } else { "" },
            u64::from(*days) * 24 + u64::from(*hours),
            minutes,
            seconds,
            micros
        )),
    }
}

fn convert_row(row: &mysql_async::Row) -> Row {
    let columns = row
        .columns_ref()
        .iter()
        .map(|column| column.name_str().to_string())
        .collect::<Vec<_>>();
    let values = (0..columns.len())
        .map(|i| row.as_ref(i).map(from_value).unwrap_or(SqlValue::Null))
        .collect();
    Row { columns, values }
}
