// Driver seam: the traits a database backend implements to sit under the pool manager

use crate::config::DatabaseConfig;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use serde::Serialize;

/// A positional statement parameter or a result column value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            SqlValue::Text(s) => s.parse().ok(),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::UInt(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::UInt(v as u64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A single result row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Row {
    /// Look a value up by column name (case-insensitive)
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }
}

/// Outcome of a statement that does not return rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub affected_rows: u64,
    pub last_insert_id: Option<u64>,
}

/// A native connection checked out of a backend pool
#[async_trait]
pub trait Connection: Send + 'static {
    /// Server-side session (thread) id, used in logs
    fn session_id(&self) -> u32;

    /// Round trip to verify the connection is alive
    async fn ping(&mut self) -> Result<(), DatabaseError>;

    async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<ExecResult, DatabaseError>;

    async fn query(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, DatabaseError>;

    async fn begin(&mut self) -> Result<(), DatabaseError> {
        self.execute("START TRANSACTION", Vec::new()).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.execute("COMMIT", Vec::new()).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.execute("ROLLBACK", Vec::new()).await.map(|_| ())
    }
}

/// A native connection pool owned by the pool manager
#[async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    type Conn: Connection;

    /// Wait for a free native connection
    async fn get_conn(&self) -> Result<Self::Conn, DatabaseError>;

    /// Return a healthy connection for reuse
    fn recycle(&self, conn: Self::Conn);

    /// Throw away a connection that can no longer be trusted
    fn discard(&self, conn: Self::Conn) {
        drop(conn);
    }

    /// Close every connection; called once during shutdown or failed init
    async fn disconnect(&self) -> Result<(), DatabaseError>;
}

/// Factory that builds a native pool from configuration
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Backend: PoolBackend;

    async fn connect(&self, config: &DatabaseConfig) -> Result<Self::Backend, DatabaseError>;
}
