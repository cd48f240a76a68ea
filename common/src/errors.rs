// Error handling framework for the database access layer

use crate::pattern;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// MySQL server error: deadlock found when trying to get lock
pub const ER_LOCK_DEADLOCK: u16 = 1213;
/// MySQL server error: lock wait timeout exceeded
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
/// MySQL server error: table already exists
pub const ER_TABLE_EXISTS: u16 = 1050;
/// MySQL server error: duplicate column name
pub const ER_DUP_FIELDNAME: u16 = 1060;
/// MySQL server error: duplicate key name
pub const ER_DUP_KEYNAME: u16 = 1061;
/// MySQL server error: duplicate foreign key constraint name
pub const ER_FK_DUP_NAME: u16 = 1826;

/// Errors raised by the pool manager, the transaction executor and the
/// schema bootstrapper
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Invalid database configuration: {0}")]
    Config(String),

    #[error("Database pool initialization failed: {0}")]
    PoolInit(String),

    #[error("No connection available within {timeout_ms} ms")]
    AcquireTimeout { timeout_ms: u64 },

    #[error("Database pool unavailable (state: {state})")]
    PoolUnavailable { state: String },

    #[error("Queue limit reached: {limit} callers already waiting for a connection")]
    QueueLimitReached { limit: usize },

    #[error("Database connection lost: {0}")]
    ConnectionLost(String),

    #[error("Statement timed out after {timeout_ms} ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Database driver error: {0}")]
    Driver(String),

    #[error("Transaction failed: {cause}")]
    TransactionFailed {
        #[source]
        cause: Box<DatabaseError>,
    },

    #[error("Maximum retries ({attempts}) exceeded, last error: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last_error: Box<DatabaseError>,
    },

    #[error("Schema bootstrap failed at statement #{index} ({statement}): {cause}")]
    SchemaBootstrap {
        index: usize,
        statement: String,
        #[source]
        cause: Box<DatabaseError>,
    },

    #[error("Statement #{index} is not idempotent: {reason}")]
    NonIdempotentStatement { index: usize, reason: String },

    #[error("Identifier rejected: {0}")]
    InvalidIdentifier(String),
}

impl DatabaseError {
    /// Build a server error from a MySQL error code and message
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        DatabaseError::Server {
            code,
            message: message.into(),
        }
    }

    /// Whether retrying the whole transaction from scratch is expected to succeed
    ///
    /// Matches deadlocks and lock wait timeouts by server code, and by message
    /// for errors that arrive without a code (e.g. raised by a unit of work).
    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::Server { code, message } => {
                matches!(*code, ER_LOCK_DEADLOCK | ER_LOCK_WAIT_TIMEOUT)
                    || transient_signature().is_match(message)
            }
            DatabaseError::Driver(message) => transient_signature().is_match(message),
            _ => false,
        }
    }

    /// Whether the error reports an object that already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            DatabaseError::Server { code, .. }
                if matches!(*code, ER_TABLE_EXISTS | ER_DUP_FIELDNAME | ER_DUP_KEYNAME | ER_FK_DUP_NAME)
        )
    }

    /// Whether the connection that produced this error can no longer be trusted
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            DatabaseError::ConnectionLost(_) | DatabaseError::QueryTimeout { .. }
        )
    }
}

/// Message signature of transient lock conflicts
fn transient_signature() -> &'static Regex {
    static SIGNATURE: OnceLock<Regex> = OnceLock::new();
    pattern::cached(&SIGNATURE, r"(?i)deadlock found|lock wait timeout exceeded")
}

impl From<mysql_async::Error> for DatabaseError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server_err) => DatabaseError::Server {
                code: server_err.code,
                message: server_err.message,
            },
            mysql_async::Error::Io(io_err) => DatabaseError::ConnectionLost(io_err.to_string()),
            mysql_async::Error::Url(url_err) => DatabaseError::Config(url_err.to_string()),
            other => DatabaseError::Driver(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for DatabaseError {
    fn from(err: config::ConfigError) -> Self {
        DatabaseError::Config(err.to_string())
    }
}
