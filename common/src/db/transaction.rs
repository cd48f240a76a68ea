// Transactional operation executor
// Runs a unit of work inside one transaction, retrying whole transactions on
// deadlocks and lock wait timeouts with linear backoff.

use crate::config::TransactionConfig;
use crate::db::connection::Connector;
use crate::db::pool::{ManagedConnection, PoolManager};
use crate::errors::DatabaseError;
use crate::retry::{LinearBackoff, RetryStrategy};
use crate::telemetry;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default time to wait for a pooled connection
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

/// Executes units of work against connections from a shared [`PoolManager`]
///
/// A unit of work only runs statements on the connection it is given. It must
/// never issue `COMMIT`/`ROLLBACK` itself, and it must be safe to run again
/// from scratch because a retried attempt starts on a fresh connection.
pub struct TransactionExecutor<K: Connector> {
    pool: Arc<PoolManager<K>>,
    retry: LinearBackoff,
    acquire_timeout_ms: u64,
}

impl<K: Connector> Clone for TransactionExecutor<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            retry: self.retry.clone(),
            acquire_timeout_ms: self.acquire_timeout_ms,
        }
    }
}

impl<K: Connector> TransactionExecutor<K> {
    /// Executor with 3 attempts and 100 ms base backoff
    pub fn new(pool: Arc<PoolManager<K>>) -> Self {
        Self {
            pool,
            retry: LinearBackoff::default(),
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
        }
    }

    pub fn from_config(pool: Arc<PoolManager<K>>, config: &TransactionConfig) -> Self {
        Self {
            pool,
            retry: LinearBackoff::from_config(config),
            acquire_timeout_ms: config.acquire_timeout_ms,
        }
    }

    pub fn with_retry(mut self, retry: LinearBackoff) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = acquire_timeout_ms;
        self
    }

    pub fn pool(&self) -> &Arc<PoolManager<K>> {
        &self.pool
    }

    /// Run `work` inside a transaction, committing on success
    ///
    /// Pool errors (acquire timeout, unavailable pool) are returned as-is and
    /// never retried. Transient conflicts are retried on a fresh connection
    /// until attempts run out (`MaxRetriesExceeded`); any other failure is
    /// returned as `TransactionFailed` after rollback.
    pub async fn run_in_transaction<T, F>(&self, work: F) -> Result<T, DatabaseError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut ManagedConnection<K>) -> BoxFuture<'c, Result<T, DatabaseError>>
            + Send
            + Sync,
    {
        self.run_in_transaction_with(&self.retry, work).await
    }

    /// [`run_in_transaction`](Self::run_in_transaction) with a per-call retry policy
    #[instrument(skip_all, fields(transaction_id = %Uuid::new_v4(), max_attempts = retry.max_attempts()))]
    pub async fn run_in_transaction_with<T, F>(
        &self,
        retry: &LinearBackoff,
        work: F,
    ) -> Result<T, DatabaseError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut ManagedConnection<K>) -> BoxFuture<'c, Result<T, DatabaseError>>
            + Send
            + Sync,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            telemetry::record_transaction_attempt(attempt > 1);

            let mut conn = self.pool.acquire(self.acquire_timeout_ms).await?;
            debug!(
                attempt = attempt,
                session_id = conn.session_id(),
                "Transaction attempt started"
            );

            let outcome = attempt_once::<K, T, F>(&mut conn, &work).await;
            self.pool.release(&mut conn).await;

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Transaction committed after retry");
                    } else {
                        debug!("Transaction committed");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!(attempt = attempt, error = %err, "Transaction failed");
                return Err(DatabaseError::TransactionFailed {
                    cause: Box::new(err),
                });
            }

            match retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = retry.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient conflict, retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(attempts = attempt, error = %err, "Transaction retries exhausted");
                    return Err(DatabaseError::MaxRetriesExceeded {
                        attempts: attempt,
                        last_error: Box::new(err),
                    });
                }
            }
        }
    }

    /// Run `work` in autocommit mode on one connection, releasing it afterwards
    #[instrument(skip_all)]
    pub async fn run<T, F>(&self, work: F) -> Result<T, DatabaseError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ManagedConnection<K>) -> BoxFuture<'c, Result<T, DatabaseError>>
            + Send,
    {
        let mut conn = self.pool.acquire(self.acquire_timeout_ms).await?;
        let outcome = work(&mut conn).await;
        self.pool.release(&mut conn).await;
        outcome
    }
}

/// One begin → work → commit/rollback cycle on an already acquired connection
async fn attempt_once<K, T, F>(conn: &mut ManagedConnection<K>, work: &F) -> Result<T, DatabaseError>
where
    K: Connector,
    T: Send,
    F: for<'c> Fn(&'c mut ManagedConnection<K>) -> BoxFuture<'c, Result<T, DatabaseError>>
        + Send
        + Sync,
{
    let err = match conn.begin().await {
        Ok(()) => match work(&mut *conn).await {
            Ok(value) => match conn.commit().await {
                Ok(()) => return Ok(value),
                Err(e) => e,
            },
            Err(e) => e,
        },
        Err(e) => e,
    };

    rollback_best_effort::<K>(conn).await;
    Err(err)
}

/// Roll back without masking the error that caused it
async fn rollback_best_effort<K: Connector>(conn: &mut ManagedConnection<K>) {
    if conn.is_broken() {
        // The server discards the transaction along with the session
        debug!(session_id = conn.session_id(), "Skipping rollback on broken connection");
        return;
    }
    if let Err(e) = conn.rollback().await {
        warn!(session_id = conn.session_id(), error = %e, "Rollback failed");
        conn.mark_broken();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::connection::SqlValue;
    use crate::db::memory::MemoryConnector;
    use crate::errors::{ER_LOCK_DEADLOCK, ER_LOCK_WAIT_TIMEOUT};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn setup(connector: MemoryConnector) -> TransactionExecutor<MemoryConnector> {
        let mut config = DatabaseConfig::new("memory", "storefront", "secret", "storefront");
        config.max_connections = 2;
        config.query_timeout_ms = 200;
        let pool = Arc::new(PoolManager::new(connector));
        pool.initialize(config).await.unwrap();

        let executor = TransactionExecutor::new(pool).with_retry(LinearBackoff::new(3, 5));
        executor
            .run(|conn| {
                Box::pin(async move {
                    conn.execute(
                        "CREATE TABLE IF NOT EXISTS products (id INT AUTO_INCREMENT, name VARCHAR(255), PRIMARY KEY (id))",
                        vec![],
                    )
                    .await
                })
            })
            .await
            .unwrap();
        executor
    }

    #[tokio::test]
    async fn test_insert_returns_id_and_is_visible() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;

        let id = executor
            .run_in_transaction(|conn| {
                Box::pin(async move {
                    let result = conn
                        .execute("INSERT INTO products (name) VALUES (?)", vec!["Desk".into()])
                        .await?;
                    Ok::<_, DatabaseError>(result.last_insert_id)
                })
            })
            .await
            .unwrap();
        assert_eq!(id, Some(1));

        let rows = executor
            .run_in_transaction(|conn| {
                Box::pin(async move {
                    conn.query("SELECT name FROM products WHERE id = ?", vec![SqlValue::UInt(1)])
                        .await
                })
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").and_then(SqlValue::as_str), Some("Desk"));

        let stats = executor.pool().stats();
        assert_eq!(stats.acquired, stats.released);
    }

    #[tokio::test]
    async fn test_retries_deadlock_until_success() {
        let executor = setup(MemoryConnector::new()).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let result = executor
            .run_in_transaction(|conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    conn.execute("INSERT INTO products (name) VALUES (?)", vec!["Chair".into()])
                        .await?;
                    if n < 3 {
                        return Err(DatabaseError::Driver(
                            "Deadlock found when trying to get lock; try restarting transaction"
                                .to_string(),
                        ));
                    }
                    Ok::<_, DatabaseError>(n)
                })
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Rolled back attempts left nothing behind
        let rows = executor
            .run(|conn| Box::pin(async move { conn.query("SELECT * FROM products", vec![]).await }))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let stats = executor.pool().stats();
        assert_eq!(stats.acquired, stats.released);
    }

    #[tokio::test]
    async fn test_always_deadlocking_work_exhausts_retries() {
        let executor = setup(MemoryConnector::new()).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let err = executor
            .run_in_transaction(|_conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DatabaseError::server(ER_LOCK_DEADLOCK, "Deadlock found"))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match err {
            DatabaseError::MaxRetriesExceeded { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_transient());
            }
            other => panic!("Expected MaxRetriesExceeded, got: {:?}", other),
        }

        let stats = executor.pool().stats();
        assert_eq!(stats.acquired, stats.released);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let executor = setup(MemoryConnector::new()).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let err = executor
            .run_in_transaction(|conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    conn.execute("INSERT INTO missing_table (id) VALUES (1)", vec![]).await
                })
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match err {
            DatabaseError::TransactionFailed { cause } => {
                assert!(matches!(*cause, DatabaseError::Server { code: 1146, .. }));
            }
            other => panic!("Expected TransactionFailed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_write_failure_rolls_back_first() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;

        let result = executor
            .run_in_transaction(|conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO products (id, name) VALUES (?, ?)", vec![10i64.into(), "A".into()])
                        .await?;
                    conn.execute("INSERT INTO products (id, name) VALUES (?, ?)", vec![10i64.into(), "B".into()])
                        .await?;
                    Ok::<_, DatabaseError>(())
                })
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::TransactionFailed { .. })));
        assert!(connector.database().rows("products").is_empty());
    }

    #[tokio::test]
    async fn test_commit_lock_wait_timeout_is_retried() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;
        connector
            .database()
            .fail_on("COMMIT", ER_LOCK_WAIT_TIMEOUT, "Lock wait timeout exceeded", 1);

        executor
            .run_in_transaction(|conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO products (name) VALUES ('Shelf')", vec![])
                        .await
                        .map(|_| ())
                })
            })
            .await
            .unwrap();

        assert_eq!(connector.database().rows("products").len(), 1);
        assert_eq!(connector.database().executed("START TRANSACTION"), 2);
    }

    #[tokio::test]
    async fn test_connection_loss_is_not_retried_and_connection_discarded() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;
        connector.database().lose_connection_on("INSERT", 1);

        let err = executor
            .run_in_transaction(|conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO products (name) VALUES ('Bed')", vec![])
                        .await
                        .map(|_| ())
                })
            })
            .await
            .unwrap_err();

        match err {
            DatabaseError::TransactionFailed { cause } => assert!(cause.is_connection_loss()),
            other => panic!("Expected TransactionFailed, got: {:?}", other),
        }
        assert_eq!(connector.discarded(), 1);
        assert_eq!(connector.database().executed("ROLLBACK"), 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;
        connector.database().fail_on("ROLLBACK", 2013, "Lost connection during query", 1);

        let err = executor
            .run_in_transaction(|_conn| {
                Box::pin(async move {
                    Err::<(), _>(DatabaseError::server(1452, "Cannot add or update a child row"))
                })
            })
            .await
            .unwrap_err();

        match err {
            DatabaseError::TransactionFailed { cause } => {
                assert!(matches!(*cause, DatabaseError::Server { code: 1452, .. }));
            }
            other => panic!("Expected TransactionFailed, got: {:?}", other),
        }
        assert_eq!(connector.discarded(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_not_retried() {
        let connector = MemoryConnector::new();
        let executor = setup(connector).await.with_acquire_timeout(30);

        let mut first = executor.pool().acquire(100).await.unwrap();
        let mut second = executor.pool().acquire(100).await.unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let err = executor
            .run_in_transaction(|_conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DatabaseError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::AcquireTimeout { timeout_ms: 30 }));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        executor.pool().release(&mut first).await;
        executor.pool().release(&mut second).await;
    }

    #[tokio::test]
    async fn test_per_call_retry_policy_overrides_executor() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;
        connector
            .database()
            .fail_on("INSERT INTO products", ER_LOCK_DEADLOCK, "Deadlock found", 10);

        let err = executor
            .run_in_transaction_with(&LinearBackoff::new(5, 1), |conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO products (name) VALUES (?)", vec!["Shelf".into()])
                        .await?;
                    Ok::<_, DatabaseError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::MaxRetriesExceeded { attempts: 5, .. }));
        assert_eq!(connector.database().executed("START TRANSACTION"), 5);
    }

    #[tokio::test]
    async fn test_cancelled_transaction_discards_connection() {
        let connector = MemoryConnector::new();
        let executor = setup(connector.clone()).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            executor.run_in_transaction(|conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO products (name) VALUES (?)", vec!["Lamp".into()])
                        .await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, DatabaseError>(())
                })
            }),
        )
        .await;
        assert!(cancelled.is_err());

        // The open transaction goes away with the session
        assert_eq!(connector.discarded(), 1);
        assert!(connector.database().rows("products").is_empty());
        let stats = executor.pool().stats();
        assert_eq!(stats.acquired, stats.released);
        assert_eq!(connector.available_connections(), Some(2));
    }
}
