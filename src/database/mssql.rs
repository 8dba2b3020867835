//! SQL Server driver built on Tiberius.
//!
//! Each [`MssqlConnection`] owns one TDS connection behind an async mutex, so
//! statements sharing a connection run one at a time. Result rows stream from
//! a task that holds that lock until the result set is exhausted.

use crate::constants::{LOG_QUERY_TRUNCATE_LENGTH, ROW_CHANNEL_CAPACITY};
use crate::database::params::{bind_named, BoundStatement};
use crate::database::types::{SqlValue, TypeMapper};
use crate::database::{
    ColumnInfo, Connection, Cursor, Driver, Execution, ForeignKeyInfo, QueryParams,
};
use crate::error::ServerError;
use crate::request::{redact_descriptor, DriverOptions};
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tiberius::{Client, Config, Query, QueryItem, QueryStream};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

/// Type alias for a raw tiberius connection.
pub type RawConnection = Client<Compat<TcpStream>>;

type SharedClient = Arc<Mutex<Option<RawConnection>>>;

/// Statements whose only outcome is an affected-row count.
///
/// Anything else (batches with `DECLARE` or `SET`, procedure calls, `WITH`,
/// `VALUES`) is read as a result set, and an empty result is reported as zero
/// rows affected.
static AFFECTED_COUNT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        compile(r"(?i)^\s*(INSERT|UPDATE|DELETE|MERGE)\b"),
        compile(r"(?i)^\s*(CREATE|ALTER|DROP|TRUNCATE|GRANT|REVOKE|DENY)\b"),
    ]
});

/// Clauses that turn a modification into a row-returning statement.
static ROW_RETURNING_CLAUSES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        compile(r"(?i)\bOUTPUT\b"),
        // a later statement in the same batch that reads rows
        compile(r"(?i);\s*(\(\s*)?(SELECT|WITH|EXEC(UTE)?|VALUES)\b"),
    ]
});

static LEADING_COMMENTS: Lazy<Regex> =
    Lazy::new(|| compile(r"^(\s*(--[^\n]*(\n|$)|/\*.*?\*/))*"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern)
        .unwrap_or_else(|e| panic!("Internal error: invalid regex pattern '{}': {}", pattern, e))
}

/// Whether a statement is a plain modification or DDL that reports only an
/// affected-row count.
pub fn is_plain_modification(sql: &str) -> bool {
    let body = LEADING_COMMENTS.replace(sql, "");
    AFFECTED_COUNT_PATTERNS.iter().any(|p| p.is_match(&body))
        && !ROW_RETURNING_CLAUSES.iter().any(|p| p.is_match(&body))
}

/// Driver that opens Tiberius connections from ADO.NET connection strings.
#[derive(Debug, Default, Clone)]
pub struct MssqlDriver;

impl MssqlDriver {
    pub fn new() -> Self {
        Self
    }

    fn build_config(descriptor: &str, options: &DriverOptions) -> Result<Config, ServerError> {
        let parsed = if descriptor.trim_start().to_lowercase().starts_with("jdbc:") {
            Config::from_jdbc_string(descriptor)
        } else {
            Config::from_ado_string(descriptor)
        };
        let mut config = parsed.map_err(|e| {
            ServerError::connection_with_source("Invalid connection string", e)
        })?;

        if let Some(name) = options.extra_str("application_name") {
            config.application_name(name);
        }
        if options.extra_bool("trust_server_certificate") == Some(true) {
            config.trust_cert();
        }
        Ok(config)
    }
}

#[async_trait]
impl Driver for MssqlDriver {
    async fn connect(
        &self,
        descriptor: &str,
        options: &DriverOptions,
    ) -> Result<Arc<dyn Connection>, ServerError> {
        let config = Self::build_config(descriptor, options)?;
        let address = config.get_addr();
        debug!(
            "Opening connection to {} ({})",
            address,
            redact_descriptor(descriptor)
        );

        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|e| ServerError::connection_with_source(format!("Failed to connect to {}", address), e))?;

        tcp.set_nodelay(true)
            .map_err(|e| ServerError::connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let mut client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| ServerError::connection_with_source("Failed to connect to SQL Server", e))?;

        if let Some(sql) = options.isolation_level.as_sql() {
            client
                .simple_query(sql)
                .await
                .map_err(ServerError::from)?
                .into_results()
                .await
                .map_err(|e| {
                    ServerError::connection(format!(
                        "Failed to set isolation level {}: {}",
                        options.isolation_level, e
                    ))
                })?;
        }

        debug!("Connection to {} established", address);
        Ok(Arc::new(MssqlConnection::new(client, options.clone())))
    }
}

/// A single SQL Server connection.
pub struct MssqlConnection {
    client: SharedClient,
    opened_at: Instant,
    options: DriverOptions,
}

impl MssqlConnection {
    fn new(client: RawConnection, options: DriverOptions) -> Self {
        Self {
            client: Arc::new(Mutex::new(Some(client))),
            opened_at: Instant::now(),
            options,
        }
    }

    fn recycle_due(&self) -> bool {
        // zero disables recycling
        !self.options.recycle_after.is_zero() && self.opened_at.elapsed() >= self.options.recycle_after
    }

    /// Run a metadata statement and collect every row.
    async fn fetch_all(&self, sql: &str, args: &[&str]) -> Result<Vec<Vec<SqlValue>>, ServerError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed_error)?;

        let mut query = Query::new(sql);
        for arg in args {
            query.bind(arg.to_string());
        }
        let rows = query.query(client).await?.into_first_result().await?;
        Ok(rows.iter().map(TypeMapper::extract_row).collect())
    }

    async fn execute_affected(&self, bound: BoundStatement) -> Result<Execution, ServerError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed_error)?;

        let mut query = Query::new(bound.sql);
        for value in &bound.values {
            bind_value(&mut query, value);
        }
        let result = query.execute(client).await?;
        let affected: u64 = result.rows_affected().iter().sum();
        debug!("Statement completed: {} rows affected", affected);
        Ok(Execution::Affected(affected))
    }

    async fn execute_rows(&self, bound: BoundStatement) -> Result<Execution, ServerError> {
        let guard = self.client.clone().lock_owned().await;
        let (columns_tx, columns_rx) =
            oneshot::channel::<Result<Option<Vec<String>>, ServerError>>();
        let (rows_tx, rows_rx) =
            mpsc::channel::<Result<Vec<SqlValue>, ServerError>>(ROW_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut guard = guard;
            let Some(client) = guard.as_mut() else {
                let _ = columns_tx.send(Err(closed_error()));
                return;
            };

            let mut query = Query::new(bound.sql);
            for value in &bound.values {
                bind_value(&mut query, value);
            }

            let mut stream = match query.query(client).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = columns_tx.send(Err(e.into()));
                    return;
                }
            };
            let columns: Option<Vec<String>> = match stream.columns().await {
                Ok(cols) => cols.map(|cols| cols.iter().map(|c| c.name().to_string()).collect()),
                Err(e) => {
                    let _ = columns_tx.send(Err(e.into()));
                    return;
                }
            };
            let has_rows = columns.is_some();
            if columns_tx.send(Ok(columns)).is_err() || !has_rows {
                drain(stream).await;
                return;
            }

            // Only the first result set reaches the cursor. The rest of the
            // stream is still read so the connection is left idle.
            let mut forwarding = true;
            let mut skipped_warned = false;
            loop {
                match stream.try_next().await {
                    Ok(Some(QueryItem::Row(row))) => {
                        if row.result_index() > 0 {
                            if !skipped_warned {
                                warn!("Batch returned more than one result set; only the first is reported");
                                skipped_warned = true;
                            }
                            continue;
                        }
                        if forwarding
                            && rows_tx.send(Ok(TypeMapper::extract_row(&row))).await.is_err()
                        {
                            debug!("Cursor dropped before result set was exhausted");
                            forwarding = false;
                        }
                    }
                    Ok(Some(QueryItem::Metadata(_))) => {}
                    Ok(None) => break,
                    Err(e) => {
                        if forwarding {
                            let _ = rows_tx.send(Err(e.into())).await;
                        } else {
                            debug!("Error while draining result stream: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let columns = columns_rx
            .await
            .map_err(|_| ServerError::internal("Row reader stopped before reporting columns"))??;

        match columns {
            Some(columns) => Ok(Execution::Rows(Box::new(MssqlCursor {
                columns,
                rows: rows_rx,
            }))),
            None => {
                debug!("Statement returned no result set");
                Ok(Execution::Affected(0))
            }
        }
    }
}

/// Read a result stream to its end, discarding everything.
async fn drain(mut stream: QueryStream<'_>) {
    loop {
        match stream.try_next().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!("Error while draining result stream: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Connection for MssqlConnection {
    async fn is_alive(&self) -> bool {
        if self.recycle_due() {
            debug!("Connection exceeded recycle age");
            return false;
        }

        let mut guard = self.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return false;
        };
        if !self.options.pre_ping {
            return true;
        }

        let alive = match client.simple_query("SELECT 1").await {
            Ok(stream) => stream.into_results().await.is_ok(),
            Err(e) => {
                debug!("Liveness check failed: {}", e);
                false
            }
        };
        alive
    }

    async fn execute(&self, sql: &str, params: &QueryParams) -> Result<Execution, ServerError> {
        debug!("Executing: {}", truncate_for_log(sql, LOG_QUERY_TRUNCATE_LENGTH));
        let bound = bind_named(sql, params)?;

        if is_plain_modification(&bound.sql) {
            self.execute_affected(bound).await
        } else {
            self.execute_rows(bound).await
        }
    }

    async fn table_names(&self) -> Result<Vec<String>, ServerError> {
        let rows = self
            .fetch_all(
                r#"
                SELECT TABLE_NAME
                FROM INFORMATION_SCHEMA.TABLES
                WHERE TABLE_TYPE = 'BASE TABLE'
                AND TABLE_SCHEMA = SCHEMA_NAME()
                ORDER BY TABLE_NAME
                "#,
                &[],
            )
            .await?;

        Ok(rows.iter().filter_map(|r| text_at(r, 0)).collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ServerError> {
        let rows = self
            .fetch_all(
                r#"
                SELECT
                    c.COLUMN_NAME,
                    c.DATA_TYPE,
                    c.CHARACTER_MAXIMUM_LENGTH,
                    CAST(c.NUMERIC_PRECISION AS INT),
                    c.NUMERIC_SCALE,
                    c.IS_NULLABLE,
                    c.COLUMN_DEFAULT,
                    COLUMNPROPERTY(t.object_id, c.COLUMN_NAME, 'IsIdentity'),
                    CAST(ep.value AS NVARCHAR(4000))
                FROM INFORMATION_SCHEMA.COLUMNS c
                INNER JOIN sys.tables t
                    ON t.name = c.TABLE_NAME AND SCHEMA_NAME(t.schema_id) = c.TABLE_SCHEMA
                LEFT JOIN sys.extended_properties ep
                    ON ep.major_id = t.object_id
                    AND ep.minor_id = COLUMNPROPERTY(t.object_id, c.COLUMN_NAME, 'ColumnId')
                    AND ep.name = 'MS_Description'
                WHERE c.TABLE_SCHEMA = SCHEMA_NAME()
                AND c.TABLE_NAME = @P1
                ORDER BY c.ORDINAL_POSITION
                "#,
                &[table],
            )
            .await?;

        if rows.is_empty() {
            return Err(ServerError::query(format!("Table '{}' does not exist", table)));
        }

        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                name: text_at(r, 0).unwrap_or_default(),
                data_type: render_type(
                    &text_at(r, 1).unwrap_or_default(),
                    int_at(r, 2),
                    int_at(r, 3),
                    int_at(r, 4),
                ),
                nullable: text_at(r, 5).is_some_and(|v| v.eq_ignore_ascii_case("YES")),
                default: text_at(r, 6),
                autoincrement: int_at(r, 7) == Some(1),
                comment: text_at(r, 8).filter(|c| !c.is_empty()),
            })
            .collect())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyInfo>, ServerError> {
        let rows = self
            .fetch_all(
                r#"
                SELECT
                    fk.name,
                    pc.name,
                    OBJECT_NAME(fk.referenced_object_id),
                    rc.name
                FROM sys.foreign_keys fk
                INNER JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
                INNER JOIN sys.columns pc
                    ON pc.object_id = fkc.parent_object_id AND pc.column_id = fkc.parent_column_id
                INNER JOIN sys.columns rc
                    ON rc.object_id = fkc.referenced_object_id AND rc.column_id = fkc.referenced_column_id
                WHERE fk.parent_object_id = OBJECT_ID(QUOTENAME(SCHEMA_NAME()) + '.' + QUOTENAME(@P1))
                ORDER BY fk.name, fkc.constraint_column_id
                "#,
                &[table],
            )
            .await?;

        let mut keys: Vec<ForeignKeyInfo> = Vec::new();
        for row in &rows {
            let name = text_at(row, 0);
            let column = text_at(row, 1).unwrap_or_default();
            let referred_table = text_at(row, 2).unwrap_or_default();
            let referred_column = text_at(row, 3).unwrap_or_default();

            match keys.last_mut() {
                Some(last) if last.name == name => {
                    last.constrained_columns.push(column);
                    last.referred_columns.push(referred_column);
                }
                _ => keys.push(ForeignKeyInfo {
                    name,
                    constrained_columns: vec![column],
                    referred_table,
                    referred_columns: vec![referred_column],
                }),
            }
        }
        Ok(keys)
    }

    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ServerError> {
        let rows = self
            .fetch_all(
                r#"
                SELECT c.name
                FROM sys.indexes i
                INNER JOIN sys.index_columns ic
                    ON ic.object_id = i.object_id AND ic.index_id = i.index_id
                INNER JOIN sys.columns c
                    ON c.object_id = ic.object_id AND c.column_id = ic.column_id
                WHERE i.is_primary_key = 1
                AND i.object_id = OBJECT_ID(QUOTENAME(SCHEMA_NAME()) + '.' + QUOTENAME(@P1))
                ORDER BY ic.key_ordinal
                "#,
                &[table],
            )
            .await?;

        Ok(rows.iter().filter_map(|r| text_at(r, 0)).collect())
    }

    async fn close(&self) -> Result<(), ServerError> {
        let client = self.client.lock().await.take();
        match client {
            Some(client) => client
                .close()
                .await
                .map_err(|e| ServerError::connection(format!("Failed to close connection: {}", e))),
            None => Ok(()),
        }
    }
}

/// Cursor fed by the task that owns the connection while a result set is open.
pub struct MssqlCursor {
    columns: Vec<String>,
    rows: mpsc::Receiver<Result<Vec<SqlValue>, ServerError>>,
}

#[async_trait]
impl Cursor for MssqlCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>, ServerError> {
        match self.rows.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => {
                warn!("Row fetch failed: {}", e);
                Err(e)
            }
            None => Ok(None),
        }
    }
}

fn closed_error() -> ServerError {
    ServerError::connection("Connection is closed")
}

fn bind_value(query: &mut Query<'_>, value: &Value) {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i);
            } else if let Some(f) = n.as_f64() {
                query.bind(f);
            } else {
                query.bind(n.to_string());
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn text_at(row: &[SqlValue], idx: usize) -> Option<String> {
    match row.get(idx)? {
        SqlValue::Null => None,
        value => Some(value.to_display_string()),
    }
}

fn int_at(row: &[SqlValue], idx: usize) -> Option<i64> {
    match row.get(idx)? {
        SqlValue::I8(v) => Some(i64::from(*v)),
        SqlValue::I16(v) => Some(i64::from(*v)),
        SqlValue::I32(v) => Some(i64::from(*v)),
        SqlValue::I64(v) => Some(*v),
        _ => None,
    }
}

/// Render a column type the way it would be declared, e.g. `NVARCHAR(50)`.
fn render_type(
    data_type: &str,
    max_length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i64>,
) -> String {
    let name = data_type.to_uppercase();
    match name.as_str() {
        "CHAR" | "VARCHAR" | "NCHAR" | "NVARCHAR" | "BINARY" | "VARBINARY" => match max_length {
            Some(-1) => format!("{}(max)", name),
            Some(len) => format!("{}({})", name, len),
            None => name,
        },
        "DECIMAL" | "NUMERIC" => match (precision, scale) {
            (Some(p), Some(s)) => format!("{}({}, {})", name, p, s),
            _ => name,
        },
        _ => name,
    }
}

/// Truncate a string for logging purposes.
fn truncate_for_log(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
