// In-process database backend for tests and local development
//
// Understands a small MySQL dialect: CREATE/DROP TABLE, INSERT [IGNORE] with
// optional ON DUPLICATE KEY UPDATE, SELECT/DELETE with a single equality
// filter, and START TRANSACTION/COMMIT/ROLLBACK. The first column of a table
// is its primary key. Faults can be scripted per statement pattern.
//
// Transactions are not isolated from each other: COMMIT copies every table
// the transaction touched back over the shared state, so concurrent writers
// to the same table lose updates.

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, Connector, ExecResult, PoolBackend, Row, SqlValue};
use crate::errors::DatabaseError;
use crate::pattern;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    next_id: u64,
}

#[derive(Debug, Clone)]
enum FaultKind {
    Server { code: u16, message: String },
    ConnectionLost,
    Hang,
}

#[derive(Debug)]
struct Fault {
    pattern: String,
    remaining: u32,
    kind: FaultKind,
}

#[derive(Debug, Default)]
struct DatabaseState {
    tables: BTreeMap<String, Table>,
    faults: Vec<Fault>,
    statements: Vec<String>,
    next_session: u32,
}

/// Shared committed state of the in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_fault(&self, pattern: &str, times: u32, kind: FaultKind) {
        self.lock().faults.push(Fault {
            pattern: pattern.to_ascii_uppercase(),
            remaining: times,
            kind,
        });
    }

    /// Fail the next `times` statements containing `pattern` with a server error
    pub fn fail_on(&self, pattern: &str, code: u16, message: &str, times: u32) {
        self.push_fault(
            pattern,
            times,
            FaultKind::Server {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Drop the connection on the next `times` statements containing `pattern`
    pub fn lose_connection_on(&self, pattern: &str, times: u32) {
        self.push_fault(pattern, times, FaultKind::ConnectionLost);
    }

    /// Never answer the next `times` statements containing `pattern`
    pub fn hang_on(&self, pattern: &str, times: u32) {
        self.push_fault(pattern, times, FaultKind::Hang);
    }

    fn take_fault(&self, sql: &str) -> Option<FaultKind> {
        let upper = sql.to_ascii_uppercase();
        let mut state = self.lock();
        let index = state
            .faults
            .iter()
            .position(|f| f.remaining > 0 && upper.contains(&f.pattern))?;
        let fault = &mut state.faults[index];
        fault.remaining -= 1;
        let kind = fault.kind.clone();
        if fault.remaining == 0 {
            state.faults.remove(index);
        }
        Some(kind)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.lock().tables.contains_key(&normalize_ident(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    /// Committed rows of `table`, empty when the table does not exist
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.lock();
        state
            .tables
            .get(&normalize_ident(table))
            .map(|t| {
                t.rows
                    .iter()
                    .map(|values| Row {
                        columns: t.columns.clone(),
                        values: values.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of executed statements containing `pattern` (case-insensitive)
    pub fn executed(&self, pattern: &str) -> usize {
        let pattern = pattern.to_ascii_uppercase();
        self.lock()
            .statements
            .iter()
            .filter(|s| s.to_ascii_uppercase().contains(&pattern))
            .count()
    }

    fn next_session(&self) -> u32 {
        let mut state = self.lock();
        state.next_session += 1;
        state.next_session
    }
}

/// Builds [`MemoryBackend`] pools over one shared [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    database: MemoryDatabase,
    constructions: Arc<AtomicUsize>,
    ping_fails: Arc<AtomicBool>,
    discarded: Arc<AtomicUsize>,
    current_permits: Arc<Mutex<Option<Arc<Semaphore>>>>,
    connect_delay: Duration,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_database(MemoryDatabase::new())
    }

    pub fn with_database(database: MemoryDatabase) -> Self {
        Self {
            database,
            constructions: Arc::new(AtomicUsize::new(0)),
            ping_fails: Arc::new(AtomicBool::new(false)),
            discarded: Arc::new(AtomicUsize::new(0)),
            current_permits: Arc::new(Mutex::new(None)),
            connect_delay: Duration::from_millis(5),
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    /// Shared counter of native pools built by this connector
    pub fn constructions(&self) -> Arc<AtomicUsize> {
        self.constructions.clone()
    }

    /// Make every ping (including the init probe) fail
    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Free connections in the most recently built pool
    pub fn available_connections(&self) -> Option<usize> {
        self.current_permits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|permits| permits.available_permits())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Backend = MemoryBackend;

    async fn connect(&self, config: &DatabaseConfig) -> Result<MemoryBackend, DatabaseError> {
        tokio::time::sleep(self.connect_delay).await;
        self.constructions.fetch_add(1, Ordering::SeqCst);

        let permits = Arc::new(Semaphore::new(config.max_connections));
        *self
            .current_permits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(permits.clone());

        Ok(MemoryBackend {
            database: self.database.clone(),
            permits,
            ping_fails: self.ping_fails.clone(),
            discarded: self.discarded.clone(),
        })
    }
}

/// Bounded pool of [`MemoryConnection`]s
#[derive(Debug)]
pub struct MemoryBackend {
    database: MemoryDatabase,
    permits: Arc<Semaphore>,
    ping_fails: Arc<AtomicBool>,
    discarded: Arc<AtomicUsize>,
}

#[async_trait]
impl PoolBackend for MemoryBackend {
    type Conn = MemoryConnection;

    async fn get_conn(&self) -> Result<MemoryConnection, DatabaseError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DatabaseError::ConnectionLost("pool is closed".to_string()))?;

        Ok(MemoryConnection {
            database: self.database.clone(),
            session_id: self.database.next_session(),
            ping_fails: self.ping_fails.clone(),
            staged: None,
            _permit: permit,
        })
    }

    fn recycle(&self, conn: MemoryConnection) {
        // Releasing the permit frees the slot
        drop(conn);
    }

    fn discard(&self, conn: MemoryConnection) {
        drop(conn);
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnect(&self) -> Result<(), DatabaseError> {
        self.permits.close();
        Ok(())
    }
}

/// Tables as seen by an open transaction
#[derive(Debug)]
struct Staged {
    tables: BTreeMap<String, Table>,
    touched: BTreeSet<String>,
}

/// One session against a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryConnection {
    database: MemoryDatabase,
    session_id: u32,
    ping_fails: Arc<AtomicBool>,
    staged: Option<Staged>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Default)]
struct Outcome {
    exec: ExecResult,
    rows: Vec<Row>,
}

impl MemoryConnection {
    async fn run(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Outcome, DatabaseError> {
        match self.database.take_fault(sql) {
            Some(FaultKind::Hang) => std::future::pending().await,
            Some(FaultKind::Server { code, message }) => Err(DatabaseError::server(code, message)),
            Some(FaultKind::ConnectionLost) => Err(DatabaseError::ConnectionLost(format!(
                "session {} terminated",
                self.session_id
            ))),
            None => self.interpret(sql, params),
        }
    }

    fn interpret(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Outcome, DatabaseError> {
        let database = self.database.clone();
        let mut state = database.lock();
        state.statements.push(sql.to_string());

        let statement = sql.trim().trim_end_matches(';').trim();
        match statement.to_ascii_uppercase().as_str() {
            "START TRANSACTION" | "BEGIN" => {
                self.staged = Some(Staged {
                    tables: state.tables.clone(),
                    touched: BTreeSet::new(),
                });
                return Ok(Outcome::default());
            }
            "COMMIT" => {
                if let Some(staged) = self.staged.take() {
                    for name in staged.touched {
                        match staged.tables.get(&name) {
                            Some(table) => {
                                state.tables.insert(name, table.clone());
                            }
                            None => {
                                state.tables.remove(&name);
                            }
                        }
                    }
                }
                return Ok(Outcome::default());
            }
            "ROLLBACK" => {
                self.staged = None;
                return Ok(Outcome::default());
            }
            "SELECT 1" => {
                return Ok(Outcome {
                    exec: ExecResult::default(),
                    rows: vec![Row {
                        columns: vec!["1".to_string()],
                        values: vec![SqlValue::Int(1)],
                    }],
                });
            }
            _ => {}
        }

        let parsed = parse_statement(statement)?;
        let target = parsed.table().to_string();
        let tables = match self.staged.as_mut() {
            Some(staged) => {
                staged.touched.insert(target);
                &mut staged.tables
            }
            None => &mut state.tables,
        };
        apply(tables, parsed, params)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    async fn ping(&mut self) -> Result<(), DatabaseError> {
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionLost("server has gone away".to_string()));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<ExecResult, DatabaseError> {
        self.run(sql, params).await.map(|outcome| outcome.exec)
    }

    async fn query(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, DatabaseError> {
        self.run(sql, params).await.map(|outcome| outcome.rows)
    }
}

#[derive(Debug)]
enum Token {
    Param,
    Literal(SqlValue),
}

#[derive(Debug)]
enum Statement {
    CreateTable {
        name: String,
        if_not_exists: bool,
        columns: Vec<String>,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Insert {
        name: String,
        ignore: bool,
        upsert: bool,
        columns: Vec<String>,
        values: Vec<Token>,
    },
    Select {
        name: String,
        columns: Option<Vec<String>>,
        filter: Option<(String, Token)>,
    },
    Delete {
        name: String,
        filter: Option<(String, Token)>,
    },
}

impl Statement {
    fn table(&self) -> &str {
        match self {
            Statement::CreateTable { name, .. }
            | Statement::DropTable { name, .. }
            | Statement::Insert { name, .. }
            | Statement::Select { name, .. }
            | Statement::Delete { name, .. } => name,
        }
    }
}

fn syntax_error(sql: &str) -> DatabaseError {
    DatabaseError::server(
        1064,
        format!("You have an error in your SQL syntax near '{}'", sql),
    )
}

fn normalize_ident(raw: &str) -> String {
    raw.trim().trim_matches('`').to_ascii_lowercase()
}

/// Split on commas that are not nested in parentheses or quotes
fn split_top_level(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_token(raw: &str) -> Option<Token> {
    let raw = raw.trim();
    if raw == "?" {
        return Some(Token::Param);
    }
    if raw.eq_ignore_ascii_case("NULL") {
        return Some(Token::Literal(SqlValue::Null));
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Some(Token::Literal(SqlValue::Text(raw[1..raw.len() - 1].to_string())));
    }
    raw.parse::<i64>().ok().map(|v| Token::Literal(SqlValue::Int(v)))
}

fn parse_filter(
    column: Option<regex::Match<'_>>,
    value: Option<regex::Match<'_>>,
    sql: &str,
) -> Result<Option<(String, Token)>, DatabaseError> {
    match (column, value) {
        (Some(column), Some(value)) => {
            let token = parse_token(value.as_str()).ok_or_else(|| syntax_error(sql))?;
            Ok(Some((normalize_ident(column.as_str()), token)))
        }
        _ => Ok(None),
    }
}

fn parse_statement(sql: &str) -> Result<Statement, DatabaseError> {
    static CREATE: OnceLock<Regex> = OnceLock::new();
    static DROP: OnceLock<Regex> = OnceLock::new();
    static INSERT: OnceLock<Regex> = OnceLock::new();
    static SELECT: OnceLock<Regex> = OnceLock::new();
    static DELETE: OnceLock<Regex> = OnceLock::new();

    let create = pattern::cached(
        &CREATE,
        r"(?is)^create\s+table\s+(if\s+not\s+exists\s+)?([`\w.]+)\s*\((.*)\)[^)]*$",
    );
    if let Some(caps) = create.captures(sql) {
        let columns = split_top_level(&caps[3])
            .iter()
            .filter_map(|def| {
                let first = def.split_whitespace().next()?;
                let keyword = first.to_ascii_uppercase();
                let is_constraint = matches!(
                    keyword.as_str(),
                    "PRIMARY" | "KEY" | "UNIQUE" | "INDEX" | "CONSTRAINT" | "FOREIGN" | "FULLTEXT" | "CHECK"
                );
                (!is_constraint).then(|| normalize_ident(first))
            })
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(syntax_error(sql));
        }
        return Ok(Statement::CreateTable {
            name: normalize_ident(&caps[2]),
            if_not_exists: caps.get(1).is_some(),
            columns,
        });
    }

    let drop = pattern::cached(&DROP, r"(?is)^drop\s+table\s+(if\s+exists\s+)?([`\w.]+)\s*$");
    if let Some(caps) = drop.captures(sql) {
        return Ok(Statement::DropTable {
            name: normalize_ident(&caps[2]),
            if_exists: caps.get(1).is_some(),
        });
    }

    let insert = pattern::cached(
        &INSERT,
        r"(?is)^insert\s+(ignore\s+)?into\s+([`\w.]+)\s*\(([^)]*)\)\s*values\s*\((.*?)\)\s*(on\s+duplicate\s+key\s+update\b.*)?$",
    );
    if let Some(caps) = insert.captures(sql) {
        let columns = split_top_level(&caps[3])
            .iter()
            .map(|c| normalize_ident(c))
            .collect::<Vec<_>>();
        let values = split_top_level(&caps[4])
            .iter()
            .map(|v| parse_token(v).ok_or_else(|| syntax_error(sql)))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.len() != values.len() {
            return Err(DatabaseError::server(
                1136,
                "Column count doesn't match value count at row 1",
            ));
        }
        return Ok(Statement::Insert {
            name: normalize_ident(&caps[2]),
            ignore: caps.get(1).is_some(),
            upsert: caps.get(5).is_some(),
            columns,
            values,
        });
    }

    let select = pattern::cached(
        &SELECT,
        r"(?is)^select\s+(.+?)\s+from\s+([`\w.]+)(?:\s+where\s+([`\w]+)\s*=\s*(.+?))?\s*$",
    );
    if let Some(caps) = select.captures(sql) {
        let projection = caps[1].trim();
        let columns = (projection != "*").then(|| {
            split_top_level(projection)
                .iter()
                .map(|c| normalize_ident(c))
                .collect()
        });
        return Ok(Statement::Select {
            name: normalize_ident(&caps[2]),
            columns,
            filter: parse_filter(caps.get(3), caps.get(4), sql)?,
        });
    }

    let delete = pattern::cached(
        &DELETE,
        r"(?is)^delete\s+from\s+([`\w.]+)(?:\s+where\s+([`\w]+)\s*=\s*(.+?))?\s*$",
    );
    if let Some(caps) = delete.captures(sql) {
        return Ok(Statement::Delete {
            name: normalize_ident(&caps[1]),
            filter: parse_filter(caps.get(2), caps.get(3), sql)?,
        });
    }

    Err(syntax_error(sql))
}

fn values_equal(a: &SqlValue, b: &SqlValue) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn missing_table(name: &str) -> DatabaseError {
    DatabaseError::server(1146, format!("Table '{}' doesn't exist", name))
}

fn column_index(table: &Table, column: &str) -> Result<usize, DatabaseError> {
    table
        .columns
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| DatabaseError::server(1054, format!("Unknown column '{}'", column)))
}

fn bind(token: Token, params: &mut std::vec::IntoIter<SqlValue>) -> Result<SqlValue, DatabaseError> {
    match token {
        Token::Literal(value) => Ok(value),
        Token::Param => params.next().ok_or_else(|| {
            DatabaseError::Driver("statement has more placeholders than parameters".to_string())
        }),
    }
}

fn apply(
    tables: &mut BTreeMap<String, Table>,
    statement: Statement,
    params: Vec<SqlValue>,
) -> Result<Outcome, DatabaseError> {
    let mut params = params.into_iter();

    match statement {
        Statement::CreateTable {
            name,
            if_not_exists,
            columns,
        } => {
            if tables.contains_key(&name) {
                if if_not_exists {
                    return Ok(Outcome::default());
                }
                return Err(DatabaseError::server(
                    crate::errors::ER_TABLE_EXISTS,
                    format!("Table '{}' already exists", name),
                ));
            }
            tables.insert(
                name,
                Table {
                    columns,
                    ..Table::default()
                },
            );
            Ok(Outcome::default())
        }
        Statement::DropTable { name, if_exists } => {
            if tables.remove(&name).is_none() && !if_exists {
                return Err(DatabaseError::server(1051, format!("Unknown table '{}'", name)));
            }
            Ok(Outcome::default())
        }
        Statement::Insert {
            name,
            ignore,
            upsert,
            columns,
            values,
        } => {
            let table = tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;

            let mut row = vec![SqlValue::Null; table.columns.len()];
            let mut provided = Vec::with_capacity(columns.len());
            for (column, token) in columns.iter().zip(values) {
                let index = column_index(table, column)?;
                row[index] = bind(token, &mut params)?;
                provided.push(index);
            }

            if row[0].is_null() {
                table.next_id += 1;
                row[0] = SqlValue::UInt(table.next_id);
            } else if let Some(id) = row[0].as_i64() {
                table.next_id = table.next_id.max(id.max(0) as u64);
            }
            let last_insert_id = row[0].as_i64().map(|id| id as u64);

            let existing = table.rows.iter().position(|r| values_equal(&r[0], &row[0]));
            match existing {
                Some(_) if ignore => Ok(Outcome::default()),
                Some(position) if upsert => {
                    for index in provided {
                        table.rows[position][index] = row[index].clone();
                    }
                    Ok(Outcome {
                        exec: ExecResult {
                            affected_rows: 2,
                            last_insert_id,
                        },
                        rows: Vec::new(),
                    })
                }
                Some(_) => Err(DatabaseError::server(
                    1062,
                    format!("Duplicate entry '{:?}' for key 'PRIMARY'", row[0]),
                )),
                None => {
                    table.rows.push(row);
                    Ok(Outcome {
                        exec: ExecResult {
                            affected_rows: 1,
                            last_insert_id,
                        },
                        rows: Vec::new(),
                    })
                }
            }
        }
        Statement::Select {
            name,
            columns,
            filter,
        } => {
            let table = tables.get(&name).ok_or_else(|| missing_table(&name))?;
            let projection = match columns {
                Some(columns) => columns
                    .iter()
                    .map(|c| column_index(table, c))
                    .collect::<Result<Vec<_>, _>>()?,
                None => (0..table.columns.len()).collect(),
            };
            let filter = match filter {
                Some((column, token)) => Some((column_index(table, &column)?, bind(token, &mut params)?)),
                None => None,
            };

            let rows = table
                .rows
                .iter()
                .filter(|r| match &filter {
                    Some((index, value)) => values_equal(&r[*index], value),
                    None => true,
                })
                .map(|r| Row {
                    columns: projection.iter().map(|&i| table.columns[i].clone()).collect(),
                    values: projection.iter().map(|&i| r[i].clone()).collect(),
                })
                .collect();
            Ok(Outcome {
                exec: ExecResult::default(),
                rows,
            })
        }
        Statement::Delete { name, filter } => {
            let table = tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
            let before = table.rows.len();
            match filter {
                Some((column, token)) => {
                    let index = column_index(table, &column)?;
                    let value = bind(token, &mut params)?;
                    table.rows.retain(|r| !values_equal(&r[index], &value));
                }
                None => table.rows.clear(),
            }
            Ok(Outcome {
                exec: ExecResult {
                    affected_rows: (before - table.rows.len()) as u64,
                    last_insert_id: None,
                },
                rows: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connection(connector: &MemoryConnector) -> MemoryConnection {
        let mut config = DatabaseConfig::new("memory", "u", "p", "d");
        config.max_connections = 4;
        let backend = connector.connect(&config).await.unwrap();
        backend.get_conn().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_insert_select() {
        let connector = MemoryConnector::new();
        let mut conn = connection(&connector).await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS products (id INT AUTO_INCREMENT, name VARCHAR(255), PRIMARY KEY (id))",
            vec![],
        )
        .await
        .unwrap();
        let result = conn
            .execute("INSERT INTO products (name) VALUES (?)", vec!["Lamp".into()])
            .await
            .unwrap();
        assert_eq!(result.last_insert_id, Some(1));

        let rows = conn
            .query("SELECT id, name FROM products WHERE id = ?", vec![1i64.into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").and_then(SqlValue::as_str), Some("Lamp"));
    }

    #[tokio::test]
    async fn test_duplicate_create_without_guard_fails() {
        let connector = MemoryConnector::new();
        let mut conn = connection(&connector).await;

        conn.execute("CREATE TABLE users (id INT)", vec![]).await.unwrap();
        let err = conn.execute("CREATE TABLE users (id INT)", vec![]).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let connector = MemoryConnector::new();
        let mut conn = connection(&connector).await;
        conn.execute("CREATE TABLE t (id INT)", vec![]).await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)", vec![]).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(connector.database().rows("t").is_empty());
    }

    #[tokio::test]
    async fn test_insert_ignore_and_upsert() {
        let connector = MemoryConnector::new();
        let mut conn = connection(&connector).await;
        conn.execute("CREATE TABLE settings (id INT, value TEXT)", vec![]).await.unwrap();
        conn.execute("INSERT INTO settings (id, value) VALUES (1, 'a')", vec![]).await.unwrap();

        let ignored = conn
            .execute("INSERT IGNORE INTO settings (id, value) VALUES (1, 'b')", vec![])
            .await
            .unwrap();
        assert_eq!(ignored.affected_rows, 0);

        conn.execute(
            "INSERT INTO settings (id, value) VALUES (?, ?) ON DUPLICATE KEY UPDATE value = VALUES(value)",
            vec![1i64.into(), "c".into()],
        )
        .await
        .unwrap();
        let rows = connector.database().rows("settings");
        assert_eq!(rows[0].get("value").and_then(SqlValue::as_str), Some("c"));

        let err = conn
            .execute("INSERT INTO settings (id, value) VALUES (1, 'd')", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Server { code: 1062, .. }));
    }

    #[tokio::test]
    async fn test_scripted_fault_fires_once() {
        let connector = MemoryConnector::new();
        connector.database().fail_on("INSERT", 1213, "Deadlock found", 1);
        let mut conn = connection(&connector).await;
        conn.execute("CREATE TABLE t (id INT)", vec![]).await.unwrap();

        let err = conn.execute("INSERT INTO t (id) VALUES (1)", vec![]).await.unwrap_err();
        assert!(err.is_transient());
        conn.execute("INSERT INTO t (id) VALUES (1)", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_statement_is_syntax_error() {
        let connector = MemoryConnector::new();
        let mut conn = connection(&connector).await;
        let err = conn.execute("CREAT TABLE oops", vec![]).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Server { code: 1064, .. }));
    }

    #[test]
    fn test_split_top_level_respects_nesting() {
        let parts = split_top_level("id INT, price DECIMAL(10, 2), note VARCHAR(5) DEFAULT 'a,b'");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], "price DECIMAL(10, 2)");
    }
}
