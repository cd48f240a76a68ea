// Idempotent schema bootstrapper
// Applies an ordered list of DDL/seed statements in one executor transaction
// and tracks the applied version in a single-row marker table.

use crate::config::SchemaConfig;
use crate::db::connection::{Connector, SqlValue};
use crate::db::ident::IdentifierAllowlist;
use crate::db::pool::ManagedConnection;
use crate::db::transaction::TransactionExecutor;
use crate::errors::DatabaseError;
use crate::pattern;
use regex::Regex;
use serde::Serialize;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument};

/// Marker table used when none is configured
pub const DEFAULT_VERSION_TABLE: &str = "schema_version";

/// MySQL server error: table doesn't exist
const ER_NO_SUCH_TABLE: u16 = 1146;

/// Ordered statements loaded from a SQL script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaScript {
    statements: Vec<String>,
}

impl SchemaScript {
    /// Split a script on `;`, ignoring separators inside quotes and comments
    ///
    /// Comments are stripped from the returned statements and empty
    /// statements are dropped.
    pub fn parse(sql: &str) -> Self {
        let mut statements = Vec::new();
        let mut current = String::new();
        let mut chars = sql.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(ch) = chars.next() {
            if let Some(q) = quote {
                current.push(ch);
                if ch == '\\' && q != '`' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if ch == q {
                    quote = None;
                }
                continue;
            }

            match ch {
                '\'' | '"' | '`' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '-' if starts_dash_comment(&chars) => {
                    skip_line(&mut chars);
                    current.push('\n');
                }
                '#' => {
                    skip_line(&mut chars);
                    current.push('\n');
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    skip_block(&mut chars);
                    current.push(' ');
                }
                ';' => flush(&mut statements, &mut current),
                _ => current.push(ch),
            }
        }
        flush(&mut statements, &mut current);

        Self { statements }
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// `--` opens a comment only when followed by whitespace or end of input
fn starts_dash_comment(chars: &Peekable<Chars<'_>>) -> bool {
    let mut lookahead = chars.clone();
    if lookahead.next() != Some('-') {
        return false;
    }
    lookahead.peek().map_or(true, |c| c.is_whitespace())
}

fn skip_line(chars: &mut Peekable<Chars<'_>>) {
    for ch in chars.by_ref() {
        if ch == '\n' {
            break;
        }
    }
}

fn skip_block(chars: &mut Peekable<Chars<'_>>) {
    while let Some(ch) = chars.next() {
        if ch == '*' && chars.peek() == Some(&'/') {
            chars.next();
            break;
        }
    }
}

fn flush(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Reject statements that would fail or duplicate data when run twice
pub fn validate_idempotent(statements: &[String]) -> Result<(), DatabaseError> {
    static CREATE_TABLE: OnceLock<Regex> = OnceLock::new();
    static DROP_TABLE: OnceLock<Regex> = OnceLock::new();
    static INSERT: OnceLock<Regex> = OnceLock::new();
    static INSERT_GUARD: OnceLock<Regex> = OnceLock::new();

    let create_table = pattern::cached(
        &CREATE_TABLE,
        r"(?is)^create\s+(?:temporary\s+)?table\s+(if\s+not\s+exists\s+)?",
    );
    let drop_table = pattern::cached(
        &DROP_TABLE,
        r"(?is)^drop\s+(?:temporary\s+)?table\s+(if\s+exists\s+)?",
    );
    let insert = pattern::cached(&INSERT, r"(?is)^insert\s+(?:low_priority\s+|high_priority\s+)?(ignore\s+)?");
    let insert_guard = pattern::cached(
        &INSERT_GUARD,
        r"(?is)\bon\s+duplicate\s+key\s+update\b|\bwhere\s+not\s+exists\b",
    );

    for (index, statement) in statements.iter().enumerate() {
        let reason = if let Some(caps) = create_table.captures(statement) {
            caps.get(1)
                .is_none()
                .then_some("CREATE TABLE without IF NOT EXISTS")
        } else if let Some(caps) = drop_table.captures(statement) {
            caps.get(1).is_none().then_some("DROP TABLE without IF EXISTS")
        } else if let Some(caps) = insert.captures(statement) {
            (caps.get(1).is_none() && !insert_guard.is_match(statement)).then_some(
                "INSERT without IGNORE, ON DUPLICATE KEY UPDATE or WHERE NOT EXISTS guard",
            )
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(DatabaseError::NonIdempotentStatement {
                index,
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}

/// Result of [`SchemaBootstrapper::migrate_if_needed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    UpToDate { current: u32 },
    Applied { from: u32, to: u32 },
}

/// Creates and upgrades the schema through a [`TransactionExecutor`]
pub struct SchemaBootstrapper<K: Connector> {
    executor: TransactionExecutor<K>,
    /// Backtick-quoted marker table name
    version_table: String,
}

impl<K: Connector> SchemaBootstrapper<K> {
    pub fn new(executor: TransactionExecutor<K>) -> Self {
        Self {
            executor,
            version_table: format!("`{}`", DEFAULT_VERSION_TABLE),
        }
    }

    /// Bootstrapper recording versions in the configured marker table
    pub fn from_config(
        executor: TransactionExecutor<K>,
        config: &SchemaConfig,
    ) -> Result<Self, DatabaseError> {
        Self::new(executor).with_version_table(&config.version_table)
    }

    pub fn with_version_table(mut self, table: &str) -> Result<Self, DatabaseError> {
        let allowlist = IdentifierAllowlist::new([table])?;
        self.version_table = allowlist.quote(table)?;
        Ok(self)
    }

    pub fn executor(&self) -> &TransactionExecutor<K> {
        &self.executor
    }

    /// Run every statement in order inside one transaction
    ///
    /// "Already exists" errors are skipped. Any other failure rolls the whole
    /// run back and is reported as `SchemaBootstrap` with the failing
    /// statement's 0-based index. Deadlocks retry the whole run.
    #[instrument(skip_all, fields(statements = statements.len()))]
    pub async fn ensure_schema(&self, statements: &[String]) -> Result<(), DatabaseError> {
        validate_idempotent(statements)?;
        let statements = Arc::new(statements.to_vec());

        self.executor
            .run_in_transaction(|conn| {
                let statements = statements.clone();
                Box::pin(async move { apply_statements::<K>(conn, &statements).await })
            })
            .await
            .map_err(unwrap_bootstrap_error)?;

        info!(statements = statements.len(), "Schema ensured");
        Ok(())
    }

    /// Current marker version; 0 when the marker table or row is absent
    #[instrument(skip(self))]
    pub async fn read_schema_version(&self) -> Result<u32, DatabaseError> {
        let sql = format!("SELECT version FROM {} WHERE id = 1", self.version_table);
        let rows = self
            .executor
            .run(|conn| Box::pin(async move { conn.query(&sql, Vec::new()).await }))
            .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(DatabaseError::Server { code, .. }) if code == ER_NO_SUCH_TABLE => {
                debug!("Schema version table not found");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let Some(value) = rows.first().and_then(|row| row.get("version")) else {
            return Ok(0);
        };
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| DatabaseError::Driver(format!("invalid schema version value: {:?}", value)))
    }

    /// Apply `statements` and advance the marker unless already at `target_version`
    ///
    /// The marker row is written in the same transaction as the statements,
    /// after the last one.
    #[instrument(skip(self, statements), fields(statements = statements.len()))]
    pub async fn migrate_if_needed(
        &self,
        target_version: u32,
        statements: &[String],
    ) -> Result<MigrationOutcome, DatabaseError> {
        self.ensure_version_table().await?;

        let current = self.read_schema_version().await?;
        if current >= target_version {
            info!(current = current, target = target_version, "Schema is up to date");
            return Ok(MigrationOutcome::UpToDate { current });
        }

        validate_idempotent(statements)?;
        info!(from = current, to = target_version, "Migrating schema");

        let statements = Arc::new(statements.to_vec());
        let marker_sql = Arc::new(format!(
            "INSERT INTO {} (id, version) VALUES (1, ?) ON DUPLICATE KEY UPDATE version = VALUES(version)",
            self.version_table
        ));

        self.executor
            .run_in_transaction(|conn| {
                let statements = statements.clone();
                let marker_sql = marker_sql.clone();
                Box::pin(async move {
                    apply_statements::<K>(conn, &statements).await?;
                    conn.execute(&marker_sql, vec![SqlValue::from(target_version)])
                        .await?;
                    Ok::<_, DatabaseError>(())
                })
            })
            .await
            .map_err(unwrap_bootstrap_error)?;

        info!(from = current, to = target_version, "Schema migrated");
        Ok(MigrationOutcome::Applied {
            from: current,
            to: target_version,
        })
    }

    async fn ensure_version_table(&self) -> Result<(), DatabaseError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id TINYINT UNSIGNED NOT NULL, \
             version INT UNSIGNED NOT NULL, \
             updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP, \
             PRIMARY KEY (id))",
            self.version_table
        );
        self.executor
            .run(|conn| Box::pin(async move { conn.execute(&sql, Vec::new()).await.map(|_| ()) }))
            .await
    }
}

async fn apply_statements<K: Connector>(
    conn: &mut ManagedConnection<K>,
    statements: &[String],
) -> Result<(), DatabaseError> {
    for (index, statement) in statements.iter().enumerate() {
        match conn.execute(statement, Vec::new()).await {
            Ok(_) => debug!(index = index, "Schema statement applied"),
            Err(e) if e.is_already_exists() => {
                debug!(index = index, error = %e, "Schema object already exists, skipping");
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                return Err(DatabaseError::SchemaBootstrap {
                    index,
                    statement: statement.clone(),
                    cause: Box::new(e),
                })
            }
        }
    }
    Ok(())
}

/// Surface the failing statement instead of the executor's wrapper
fn unwrap_bootstrap_error(err: DatabaseError) -> DatabaseError {
    match err {
        DatabaseError::TransactionFailed { cause }
            if matches!(*cause, DatabaseError::SchemaBootstrap { .. }) =>
        {
            *cause
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::memory::MemoryConnector;
    use crate::db::pool::PoolManager;
    use crate::errors::ER_DUP_KEYNAME;
    use crate::retry::LinearBackoff;

    const SCRIPT: &str = r#"
        -- storefront catalog
        CREATE TABLE IF NOT EXISTS categories (
            id INT UNSIGNED NOT NULL AUTO_INCREMENT,
            name VARCHAR(100) NOT NULL,
            PRIMARY KEY (id)
        );
        CREATE TABLE IF NOT EXISTS products (
            id INT UNSIGNED NOT NULL AUTO_INCREMENT,
            category_id INT UNSIGNED NOT NULL,
            name VARCHAR(255) NOT NULL,
            PRIMARY KEY (id)
        );
        INSERT IGNORE INTO categories (id, name) VALUES (1, 'Furniture');
    "#;

    async fn bootstrapper(connector: MemoryConnector) -> SchemaBootstrapper<MemoryConnector> {
        let mut config = DatabaseConfig::new("memory", "storefront", "secret", "storefront");
        config.max_connections = 2;
        let pool = Arc::new(PoolManager::new(connector));
        pool.initialize(config).await.unwrap();
        let executor = TransactionExecutor::new(pool).with_retry(LinearBackoff::new(3, 5));
        SchemaBootstrapper::new(executor)
    }

    fn statements(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_splits_outside_quotes_and_comments() {
        let script = SchemaScript::parse(
            "CREATE TABLE IF NOT EXISTS a (id INT); -- trailing; comment\n\
             INSERT IGNORE INTO a (id, note) VALUES (1, 'x;y');\n\
             /* block; comment */ INSERT IGNORE INTO a (id, note) VALUES (2, 'it''s')\n\
             # hash comment;\n",
        );
        assert_eq!(script.len(), 3);
        assert_eq!(script.statements()[0], "CREATE TABLE IF NOT EXISTS a (id INT)");
        assert!(script.statements()[1].ends_with("VALUES (1, 'x;y')"));
        assert!(script.statements()[2].starts_with("INSERT IGNORE"));
        assert!(script.statements()[2].ends_with("'it''s')"));
    }

    #[test]
    fn test_parse_keeps_double_dash_without_space() {
        let script = SchemaScript::parse("SELECT 1--1;");
        assert_eq!(script.statements(), ["SELECT 1--1"]);
    }

    #[test]
    fn test_parse_empty_script() {
        assert!(SchemaScript::parse("  ;\n-- nothing here\n;").is_empty());
    }

    #[test]
    fn test_validate_rejects_unguarded_statements() {
        let err = validate_idempotent(&statements(&[
            "CREATE TABLE IF NOT EXISTS a (id INT)",
            "create table b (id int)",
        ]))
        .unwrap_err();
        assert!(matches!(err, DatabaseError::NonIdempotentStatement { index: 1, .. }));

        let err = validate_idempotent(&statements(&["INSERT INTO a (id) VALUES (1)"])).unwrap_err();
        assert!(matches!(err, DatabaseError::NonIdempotentStatement { index: 0, .. }));

        let err = validate_idempotent(&statements(&["DROP TABLE a"])).unwrap_err();
        assert!(matches!(err, DatabaseError::NonIdempotentStatement { index: 0, .. }));
    }

    #[test]
    fn test_validate_accepts_guarded_statements() {
        validate_idempotent(&statements(&[
            "CREATE TABLE IF NOT EXISTS a (id INT)",
            "INSERT IGNORE INTO a (id) VALUES (1)",
            "INSERT INTO a (id) VALUES (1) ON DUPLICATE KEY UPDATE id = id",
            "INSERT INTO a (id) SELECT 2 FROM DUAL WHERE NOT EXISTS (SELECT 1 FROM a WHERE id = 2)",
            "CREATE INDEX idx_a ON a (id)",
            "DROP TABLE IF EXISTS legacy",
        ]))
        .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_schema_twice_is_idempotent() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;
        let script = SchemaScript::parse(SCRIPT);

        bootstrapper.ensure_schema(script.statements()).await.unwrap();
        let tables = connector.database().table_names();
        let categories = connector.database().rows("categories");

        bootstrapper.ensure_schema(script.statements()).await.unwrap();
        assert_eq!(connector.database().table_names(), tables);
        assert_eq!(connector.database().rows("categories"), categories);
        assert_eq!(categories.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_statement_succeeds() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;
        let create_users =
            "CREATE TABLE IF NOT EXISTS users (id INT UNSIGNED NOT NULL, email VARCHAR(255), PRIMARY KEY (id))";

        bootstrapper
            .ensure_schema(&statements(&[create_users, create_users]))
            .await
            .unwrap();
        assert!(connector.database().has_table("users"));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_whole_run() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;

        let err = bootstrapper
            .ensure_schema(&statements(&[
                "CREATE TABLE IF NOT EXISTS orders (id INT, total INT)",
                "INSERT IGNORE INTO orders (id, total) VALUES (1, 10)",
                "CREATE TABLE IF NOT EXISTS broken (id INT",
            ]))
            .await
            .unwrap_err();

        match err {
            DatabaseError::SchemaBootstrap { index, cause, .. } => {
                assert_eq!(index, 2);
                assert!(matches!(*cause, DatabaseError::Server { code: 1064, .. }));
            }
            other => panic!("Expected SchemaBootstrap, got: {:?}", other),
        }
        assert!(!connector.database().has_table("orders"));
    }

    #[tokio::test]
    async fn test_non_idempotent_statement_rejected_before_execution() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;

        let err = bootstrapper
            .ensure_schema(&statements(&["CREATE TABLE users (id INT)"]))
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::NonIdempotentStatement { index: 0, .. }));
        assert_eq!(connector.database().executed("CREATE TABLE"), 0);
    }

    #[tokio::test]
    async fn test_already_exists_errors_are_skipped() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;
        connector
            .database()
            .fail_on("CREATE INDEX", ER_DUP_KEYNAME, "Duplicate key name 'idx_name'", 1);

        bootstrapper
            .ensure_schema(&statements(&[
                "CREATE TABLE IF NOT EXISTS products (id INT, name VARCHAR(255))",
                "CREATE INDEX idx_name ON products (name)",
                "INSERT IGNORE INTO products (id, name) VALUES (1, 'Lamp')",
            ]))
            .await
            .unwrap();
        assert_eq!(connector.database().rows("products").len(), 1);
    }

    #[tokio::test]
    async fn test_deadlock_during_bootstrap_is_retried() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;
        connector.database().fail_on("INSERT IGNORE", 1213, "Deadlock found", 1);

        bootstrapper.ensure_schema(SchemaScript::parse(SCRIPT).statements()).await.unwrap();
        assert_eq!(connector.database().rows("categories").len(), 1);
        assert_eq!(connector.database().executed("START TRANSACTION"), 2);
    }

    #[test]
    fn test_migration_outcome_serializes_tagged() {
        let json = serde_json::to_value(MigrationOutcome::Applied { from: 0, to: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "applied", "from": 0, "to": 1}));
    }

    #[tokio::test]
    async fn test_read_version_without_marker_is_zero() {
        let bootstrapper = bootstrapper(MemoryConnector::new()).await;
        assert_eq!(bootstrapper.read_schema_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrate_applies_once_then_up_to_date() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;
        let script = SchemaScript::parse(SCRIPT);

        let outcome = bootstrapper.migrate_if_needed(1, script.statements()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Applied { from: 0, to: 1 });
        assert_eq!(bootstrapper.read_schema_version().await.unwrap(), 1);
        assert!(connector.database().has_table("products"));

        let outcome = bootstrapper.migrate_if_needed(1, script.statements()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::UpToDate { current: 1 });

        let outcome = bootstrapper.migrate_if_needed(2, script.statements()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Applied { from: 1, to: 2 });
        assert_eq!(connector.database().rows(DEFAULT_VERSION_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_migration_leaves_version_unchanged() {
        let connector = MemoryConnector::new();
        let bootstrapper = bootstrapper(connector.clone()).await;

        let err = bootstrapper
            .migrate_if_needed(
                1,
                &statements(&[
                    "CREATE TABLE IF NOT EXISTS carts (id INT)",
                    "INSERT IGNORE INTO missing (id) VALUES (1)",
                ]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::SchemaBootstrap { index: 1, .. }));
        assert_eq!(bootstrapper.read_schema_version().await.unwrap(), 0);
        assert!(!connector.database().has_table("carts"));
    }

    #[tokio::test]
    async fn test_custom_version_table_must_be_valid_identifier() {
        let executor = bootstrapper(MemoryConnector::new()).await.executor().clone();
        assert!(matches!(
            SchemaBootstrapper::new(executor.clone()).with_version_table("versions; DROP TABLE users"),
            Err(DatabaseError::InvalidIdentifier(_))
        ));

        let bootstrapper = SchemaBootstrapper::new(executor).with_version_table("storefront_schema").unwrap();
        bootstrapper.migrate_if_needed(3, &[]).await.unwrap();
        assert_eq!(bootstrapper.read_schema_version().await.unwrap(), 3);
    }
}
