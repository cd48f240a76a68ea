// Connection pool manager
// One native pool per manager, health-checked acquisition, graceful shutdown

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, Connector, ExecResult, PoolBackend, Row, SqlValue};
use crate::errors::DatabaseError;
use crate::telemetry::{self, PoolEvent};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::error::Elapsed;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of the pool owned by a [`PoolManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Initializing,
    /// The only state in which connections are handed out
    Ready,
    ShuttingDown,
    Closed,
}

impl PoolState {
    fn code(self) -> u8 {
        match self {
            PoolState::Uninitialized => 0,
            PoolState::Initializing => 1,
            PoolState::Ready => 2,
            PoolState::ShuttingDown => 3,
            PoolState::Closed => 4,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Initializing => "initializing",
            PoolState::Ready => "ready",
            PoolState::ShuttingDown => "shutting_down",
            PoolState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Monotonic diagnostic counters; they never influence pool behavior
#[derive(Debug, Default)]
pub struct PoolStats {
    acquired: AtomicU64,
    released: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    late_reclaimed: AtomicU64,
    pools_constructed: AtomicU64,
}

impl PoolStats {
    fn record(&self, event: PoolEvent) {
        let counter = match event {
            PoolEvent::Acquired => &self.acquired,
            PoolEvent::Released => &self.released,
            PoolEvent::Error => &self.errors,
            PoolEvent::Timeout => &self.timeouts,
            PoolEvent::LateReclaimed => &self.late_reclaimed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_pool_event(event);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_reclaimed: self.late_reclaimed.load(Ordering::Relaxed),
            pools_constructed: self.pools_constructed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub acquired: u64,
    pub released: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub late_reclaimed: u64,
    pub pools_constructed: u64,
}

impl PoolStatsSnapshot {
    /// Connections handed out and not yet released
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

struct PoolSlot<B> {
    state: PoolState,
    backend: Option<Arc<B>>,
    /// Last configuration passed to `initialize` (or the manager constructor)
    config: Option<DatabaseConfig>,
    /// Bumped on every successful initialization
    generation: u64,
}

/// Owner of the process' database pool
///
/// Startup code creates one manager, wraps it in an `Arc` and hands it to the
/// executor and anything else that needs connections.
pub struct PoolManager<K: Connector> {
    connector: K,
    slot: RwLock<PoolSlot<K::Backend>>,
    init_lock: Mutex<()>,
    stats: Arc<PoolStats>,
    /// Callers inside `acquire` plus connections checked out
    claims: Arc<AtomicUsize>,
    /// Generation of the `Ready` pool, 0 while none is
    live_generation: Arc<AtomicU64>,
}

/// Connection type handed out by a manager built on connector `K`
pub type ManagedConnection<K> = PooledConnection<<K as Connector>::Backend>;

impl<K: Connector> PoolManager<K> {
    /// Create a manager with no known configuration; `initialize` must be called first
    pub fn new(connector: K) -> Self {
        Self::build(connector, None)
    }

    /// Create a manager that initializes itself lazily on first `acquire`
    pub fn with_config(connector: K, config: DatabaseConfig) -> Self {
        Self::build(connector, Some(config))
    }

    fn build(connector: K, config: Option<DatabaseConfig>) -> Self {
        Self {
            connector,
            slot: RwLock::new(PoolSlot {
                state: PoolState::Uninitialized,
                backend: None,
                config,
                generation: 0,
            }),
            init_lock: Mutex::new(()),
            stats: Arc::new(PoolStats::default()),
            claims: Arc::new(AtomicUsize::new(0)),
            live_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn state(&self) -> PoolState {
        self.slot.read().await.state
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Construct the pool and verify it with one acquire → ping → release probe
    ///
    /// Idempotent while `Ready`. Concurrent callers are serialized so only one
    /// native pool is ever built. On probe failure the pool is torn down and
    /// the manager returns to the state it was in before the call.
    #[instrument(skip(self, config), fields(host = %config.host, database = %config.database, max_connections = config.max_connections))]
    pub async fn initialize(&self, config: DatabaseConfig) -> Result<(), DatabaseError> {
        config.validate()?;

        let _init_guard = self.init_lock.lock().await;

        let resting_state = {
            let mut slot = self.slot.write().await;
            match slot.state {
                PoolState::Ready => {
                    debug!("Database pool already initialized");
                    return Ok(());
                }
                PoolState::ShuttingDown => {
                    return Err(DatabaseError::PoolUnavailable {
                        state: slot.state.to_string(),
                    });
                }
                PoolState::Uninitialized | PoolState::Initializing | PoolState::Closed => {}
            }
            let resting_state = match slot.state {
                PoolState::Closed => PoolState::Closed,
                _ => PoolState::Uninitialized,
            };
            slot.state = PoolState::Initializing;
            slot.config = Some(config.clone());
            telemetry::record_pool_state(slot.state.code());
            resting_state
        };

        info!("Initializing database connection pool");
        let constructed = self.construct(&config).await;

        let mut slot = self.slot.write().await;
        match constructed {
            Ok(backend) if slot.state == PoolState::Initializing => {
                slot.generation += 1;
                slot.backend = Some(Arc::new(backend));
                slot.state = PoolState::Ready;
                self.live_generation.store(slot.generation, Ordering::SeqCst);
                telemetry::record_pool_state(slot.state.code());
                info!(
                    generation = slot.generation,
                    max_connections = config.max_connections,
                    "Database connection pool initialized successfully"
                );
                Ok(())
            }
            Ok(backend) => {
                // shutdown() ran while we were probing
                let state = slot.state;
                drop(slot);
                warn!(state = %state, "Pool shut down during initialization, discarding it");
                if let Err(e) = backend.disconnect().await {
                    warn!(error = %e, "Failed to disconnect discarded pool");
                }
                Err(DatabaseError::PoolUnavailable {
                    state: state.to_string(),
                })
            }
            Err(e) => {
                if slot.state == PoolState::Initializing {
                    slot.state = resting_state;
                    telemetry::record_pool_state(slot.state.code());
                }
                tracing::error!(error = %e, "Failed to initialize database pool");
                Err(e)
            }
        }
    }

    async fn construct(&self, config: &DatabaseConfig) -> Result<K::Backend, DatabaseError> {
        let backend = self.connector.connect(config).await.map_err(|e| {
            self.stats.record(PoolEvent::Error);
            DatabaseError::PoolInit(format!("failed to create pool: {}", e))
        })?;
        self.stats.pools_constructed.fetch_add(1, Ordering::Relaxed);

        let probe = tokio::time::timeout(config.connect_timeout(), health_probe(&backend)).await;
        let failure = match probe {
            Ok(Ok(())) => {
                debug!("Database health probe passed");
                return Ok(backend);
            }
            Ok(Err(e)) => format!("health probe failed: {}", e),
            Err(_) => format!(
                "health probe timed out after {} ms",
                config.connect_timeout_ms
            ),
        };

        self.stats.record(PoolEvent::Error);
        if let Err(e) = backend.disconnect().await {
            warn!(error = %e, "Failed to tear down pool after failed probe");
        }
        Err(DatabaseError::PoolInit(failure))
    }

    /// Check out a live connection, waiting at most `timeout_ms`
    ///
    /// The native acquisition runs in its own task raced against a timer. If
    /// the timer wins, a connection that shows up later is handed straight
    /// back to the pool.
    #[instrument(skip(self))]
    pub async fn acquire(&self, timeout_ms: u64) -> Result<ManagedConnection<K>, DatabaseError> {
        let (backend, generation, query_timeout) = self.ready_backend().await?;
        let claim = self.claim().await?;

        let started = Instant::now();
        let task_backend = backend.clone();
        let mut native = tokio::spawn(async move {
            let mut conn = task_backend.get_conn().await?;
            if let Err(e) = conn.ping().await {
                task_backend.discard(conn);
                return Err(DatabaseError::ConnectionLost(format!("ping failed: {}", e)));
            }
            Ok(conn)
        });

        tokio::select! {
            joined = &mut native => {
                let conn = match joined {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        self.stats.record(PoolEvent::Error);
                        warn!(error = %e, "Failed to acquire database connection");
                        return Err(e);
                    }
                    Err(join_err) => {
                        self.stats.record(PoolEvent::Error);
                        return Err(DatabaseError::Driver(format!(
                            "connection acquisition task failed: {}",
                            join_err
                        )));
                    }
                };
                self.stats.record(PoolEvent::Acquired);
                let session_id = conn.session_id();
                debug!(
                    session_id = session_id,
                    wait_ms = started.elapsed().as_millis() as u64,
                    "Connection acquired"
                );
                Ok(PooledConnection {
                    conn: Some(conn),
                    backend,
                    stats: self.stats.clone(),
                    claim: Some(claim),
                    live_generation: self.live_generation.clone(),
                    generation,
                    session_id,
                    query_timeout,
                    broken: false,
                })
            }
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                self.stats.record(PoolEvent::Timeout);
                warn!(timeout_ms = timeout_ms, "Timed out waiting for a database connection");

                let stats = self.stats.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(conn)) = native.await {
                        let session_id = conn.session_id();
                        backend.recycle(conn);
                        stats.record(PoolEvent::LateReclaimed);
                        debug!(session_id = session_id, "Returned late connection to the pool");
                    }
                });

                Err(DatabaseError::AcquireTimeout { timeout_ms })
            }
        }
    }

    /// Resolve the live backend, initializing lazily from the last known config
    async fn ready_backend(&self) -> Result<(Arc<K::Backend>, u64, Duration), DatabaseError> {
        let lazy_config = {
            let slot = self.slot.read().await;
            match (slot.state, &slot.backend, &slot.config) {
                (PoolState::Ready, Some(backend), Some(config)) => {
                    return Ok((backend.clone(), slot.generation, config.query_timeout()));
                }
                (PoolState::Uninitialized | PoolState::Initializing, _, Some(config)) => {
                    config.clone()
                }
                (state, _, _) => {
                    return Err(DatabaseError::PoolUnavailable {
                        state: state.to_string(),
                    });
                }
            }
        };

        info!("Database pool not initialized, initializing on first use");
        self.initialize(lazy_config).await?;

        let slot = self.slot.read().await;
        match (slot.state, &slot.backend, &slot.config) {
            (PoolState::Ready, Some(backend), Some(config)) => {
                Ok((backend.clone(), slot.generation, config.query_timeout()))
            }
            (state, _, _) => Err(DatabaseError::PoolUnavailable {
                state: state.to_string(),
            }),
        }
    }

    /// Reserve a place among the pool's users
    ///
    /// Only callers beyond `max_connections` are waiting for a connection, so
    /// only they count against `queue_limit`.
    async fn claim(&self) -> Result<Claim, DatabaseError> {
        let (capacity, limit) = self
            .slot
            .read()
            .await
            .config
            .as_ref()
            .map(|c| (c.max_connections, c.queue_limit))
            .unwrap_or((0, 0));

        let claimed = self.claims.fetch_add(1, Ordering::SeqCst);
        let claim = Claim {
            claims: self.claims.clone(),
        };
        if limit > 0 && claimed >= capacity && claimed - capacity >= limit {
            self.stats.record(PoolEvent::Error);
            return Err(DatabaseError::QueueLimitReached { limit });
        }
        Ok(claim)
    }

    /// Return a connection to the pool
    ///
    /// Releasing twice, after shutdown began, or into a newer pool generation
    /// is a logged no-op. Broken connections are discarded instead of reused.
    pub async fn release(&self, conn: &mut ManagedConnection<K>) {
        let Some(native) = conn.conn.take() else {
            debug!(session_id = conn.session_id, "Connection already released");
            return;
        };
        drop(conn.claim.take());

        let (state, generation) = {
            let slot = self.slot.read().await;
            (slot.state, slot.generation)
        };
        if state != PoolState::Ready || generation != conn.generation {
            debug!(
                session_id = conn.session_id,
                state = %state,
                "Release after pool teardown ignored"
            );
            conn.backend.discard(native);
            return;
        }

        if conn.broken {
            debug!(session_id = conn.session_id, "Discarding broken connection");
            conn.backend.discard(native);
        } else {
            conn.backend.recycle(native);
        }
        self.stats.record(PoolEvent::Released);
        debug!(session_id = conn.session_id, "Connection released");
    }

    /// Stop handing out connections and close the pool; safe to call repeatedly
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let backend = {
            let mut slot = self.slot.write().await;
            match slot.state {
                PoolState::ShuttingDown | PoolState::Closed => {
                    debug!(state = %slot.state, "Database pool already shut down");
                    return;
                }
                PoolState::Uninitialized => {
                    slot.state = PoolState::Closed;
                    telemetry::record_pool_state(slot.state.code());
                    return;
                }
                PoolState::Initializing | PoolState::Ready => {}
            }
            slot.state = PoolState::ShuttingDown;
            self.live_generation.store(0, Ordering::SeqCst);
            telemetry::record_pool_state(slot.state.code());
            slot.backend.take()
        };

        info!("Closing database connection pool");
        if let Some(backend) = backend {
            if let Err(e) = backend.disconnect().await {
                warn!(error = %e, "Error while disconnecting database pool");
            }
        }

        let mut slot = self.slot.write().await;
        slot.state = PoolState::Closed;
        telemetry::record_pool_state(slot.state.code());
        info!(stats = ?self.stats.snapshot(), "Database connection pool closed");
    }
}

async fn health_probe<B: PoolBackend>(backend: &B) -> Result<(), DatabaseError> {
    let mut conn = backend.get_conn().await?;
    match conn.ping().await {
        Ok(()) => {
            backend.recycle(conn);
            Ok(())
        }
        Err(e) => {
            backend.discard(conn);
            Err(e)
        }
    }
}

/// One caller in `acquire` or one checked out connection
struct Claim {
    claims: Arc<AtomicUsize>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection checked out of a [`PoolManager`]
///
/// Statements race against the configured query timeout; a timed out or
/// dropped connection is marked broken and discarded on release. Dropping an
/// unreleased handle discards it, since it may still hold an open transaction.
pub struct PooledConnection<B: PoolBackend> {
    conn: Option<B::Conn>,
    backend: Arc<B>,
    stats: Arc<PoolStats>,
    claim: Option<Claim>,
    live_generation: Arc<AtomicU64>,
    generation: u64,
    session_id: u32,
    query_timeout: Duration,
    broken: bool,
}

impl<B: PoolBackend> fmt::Debug for PooledConnection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .field("released", &self.conn.is_none())
            .field("broken", &self.broken)
            .finish()
    }
}

impl<B: PoolBackend> PooledConnection<B> {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Prevent this connection from being reused after release
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn native(&mut self) -> Result<&mut B::Conn, DatabaseError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DatabaseError::ConnectionLost("connection already released".to_string()))
    }

    fn settle<T>(
        &mut self,
        outcome: Result<Result<T, DatabaseError>, Elapsed>,
    ) -> Result<T, DatabaseError> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_connection_loss() {
                    self.broken = true;
                }
                Err(e)
            }
            Err(_) => {
                self.broken = true;
                Err(DatabaseError::QueryTimeout {
                    timeout_ms: self.query_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn ping(&mut self) -> Result<(), DatabaseError> {
        let timeout = self.query_timeout;
        let outcome = {
            let conn = self.native()?;
            tokio::time::timeout(timeout, conn.ping()).await
        };
        self.settle(outcome.map(|r| {
            r.map_err(|e| DatabaseError::ConnectionLost(format!("ping failed: {}", e)))
        }))
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<ExecResult, DatabaseError> {
        let timeout = self.query_timeout;
        let outcome = {
            let conn = self.native()?;
            tokio::time::timeout(timeout, conn.execute(sql, params)).await
        };
        self.settle(outcome)
    }

    pub async fn query(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, DatabaseError> {
        let timeout = self.query_timeout;
        let outcome = {
            let conn = self.native()?;
            tokio::time::timeout(timeout, conn.query(sql, params)).await
        };
        self.settle(outcome)
    }

    pub(crate) async fn begin(&mut self) -> Result<(), DatabaseError> {
        let timeout = self.query_timeout;
        let outcome = {
            let conn = self.native()?;
            tokio::time::timeout(timeout, conn.begin()).await
        };
        self.settle(outcome)
    }

    pub(crate) async fn commit(&mut self) -> Result<(), DatabaseError> {
        let timeout = self.query_timeout;
        let outcome = {
            let conn = self.native()?;
            tokio::time::timeout(timeout, conn.commit()).await
        };
        self.settle(outcome)
    }

    pub(crate) async fn rollback(&mut self) -> Result<(), DatabaseError> {
        let timeout = self.query_timeout;
        let outcome = {
            let conn = self.native()?;
            tokio::time::timeout(timeout, conn.rollback()).await
        };
        self.settle(outcome)
    }
}

impl<B: PoolBackend> Drop for PooledConnection<B> {
    fn drop(&mut self) {
        if let Some(native) = self.conn.take() {
            warn!(
                session_id = self.session_id,
                "Connection dropped without release, discarding it"
            );
            self.backend.discard(native);
            if self.live_generation.load(Ordering::SeqCst) == self.generation {
                self.stats.record(PoolEvent::Released);
            }
        }
    }
}
