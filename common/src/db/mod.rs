// Database layer module
// Pool manager, transaction executor and schema bootstrapper over a
// pluggable driver (MySQL in production, in-memory for tests)

pub mod connection;
pub mod ident;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod mysql;
pub mod pool;
pub mod schema;
pub mod transaction;

pub use connection::{Connection, Connector, ExecResult, PoolBackend, Row, SqlValue};
pub use ident::IdentifierAllowlist;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemoryDatabase};
pub use mysql::MySqlConnector;
pub use pool::{ManagedConnection, PoolManager, PoolState, PoolStatsSnapshot, PooledConnection};
pub use schema::{MigrationOutcome, SchemaBootstrapper, SchemaScript};
pub use transaction::TransactionExecutor;
