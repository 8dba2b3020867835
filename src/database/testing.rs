//! In-memory driver for unit tests.

use crate::database::{
    ColumnInfo, Connection, Cursor, Driver, Execution, ForeignKeyInfo, QueryParams, SqlValue,
};
use crate::error::ServerError;
use crate::request::DriverOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted result of a statement.
#[derive(Debug, Clone)]
pub enum Scripted {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        /// Fail after yielding this many rows.
        fail_after: Option<usize>,
    },
    Affected(u64),
    Error(String),
    /// The connection drops while the statement runs.
    Disconnect(String),
}

impl Scripted {
    pub fn rows(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            fail_after: None,
        }
    }

    /// Rows that stop with a transport failure after `yielded` of them.
    pub fn interrupted_rows(columns: &[&str], rows: Vec<Vec<SqlValue>>, yielded: usize) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            fail_after: Some(yielded),
        }
    }
}

/// Driver whose connections answer from a fixed script.
#[derive(Default)]
pub struct FakeDriver {
    opened: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    script: Mutex<HashMap<String, Scripted>>,
    tables: Mutex<Vec<FakeTable>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

/// Table metadata served by fake connections.
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub primary_keys: Vec<String>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of connections opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every connect take `delay`, so concurrent opens overlap.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Answer `sql` with `result` on every connection.
    pub fn script(&self, sql: &str, result: Scripted) {
        self.script.lock().insert(sql.to_string(), result);
    }

    pub fn add_table(&self, table: FakeTable) {
        self.tables.lock().push(table);
    }

    /// Every connection opened so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn connect(
        &self,
        descriptor: &str,
        options: &DriverOptions,
    ) -> Result<Arc<dyn Connection>, ServerError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ServerError::connection(format!(
                "Login failed for descriptor '{}'",
                descriptor
            )));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let conn = Arc::new(FakeConnection {
            descriptor: descriptor.to_string(),
            options: options.clone(),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            script: self.script.lock().clone(),
            tables: self.tables.lock().clone(),
        });
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }
}

/// Connection answering from its driver's script.
#[derive(Debug)]
pub struct FakeConnection {
    pub descriptor: String,
    pub options: DriverOptions,
    alive: AtomicBool,
    closed: AtomicBool,
    fail_close: AtomicBool,
    script: HashMap<String, Scripted>,
    tables: Vec<FakeTable>,
}

impl FakeConnection {
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn table(&self, name: &str) -> Result<&FakeTable, ServerError> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ServerError::query(format!("Table '{}' does not exist", name)))
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn execute(&self, sql: &str, _params: &QueryParams) -> Result<Execution, ServerError> {
        match self.script.get(sql) {
            Some(Scripted::Rows {
                columns,
                rows,
                fail_after,
            }) => Ok(Execution::Rows(Box::new(FakeCursor::new(
                columns.clone(),
                rows.clone(),
                *fail_after,
            )))),
            Some(Scripted::Affected(n)) => Ok(Execution::Affected(*n)),
            Some(Scripted::Error(msg)) => Err(ServerError::query(msg.clone())),
            Some(Scripted::Disconnect(msg)) => Err(ServerError::connection(msg.clone())),
            None => Err(ServerError::query(format!("Incorrect syntax near '{}'", sql))),
        }
    }

    async fn table_names(&self) -> Result<Vec<String>, ServerError> {
        Ok(self.tables.iter().map(|t| t.name.clone()).collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ServerError> {
        Ok(self.table(table)?.columns.clone())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyInfo>, ServerError> {
        Ok(self.table(table)?.foreign_keys.clone())
    }

    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ServerError> {
        Ok(self.table(table)?.primary_keys.clone())
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(ServerError::connection("connection reset while closing"));
        }
        Ok(())
    }
}

/// Cursor over a fixed set of rows.
pub struct FakeCursor {
    columns: Vec<String>,
    rows: VecDeque<Vec<SqlValue>>,
    yielded: usize,
    fail_after: Option<usize>,
}

impl FakeCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>, fail_after: Option<usize>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            yielded: 0,
            fail_after,
        }
    }

    pub fn of(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        Self::new(columns.iter().map(|c| c.to_string()).collect(), rows, None)
    }
}

#[async_trait]
impl Cursor for FakeCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>, ServerError> {
        if self.fail_after == Some(self.yielded) {
            return Err(ServerError::connection(
                "IO error: Transport-level error while fetching rows",
            ));
        }
        let row = self.rows.pop_front();
        if row.is_some() {
            self.yielded += 1;
        }
        Ok(row)
    }
}

/// Column metadata shorthand.
pub fn column(name: &str, data_type: &str, nullable: bool) -> ColumnInfo {
    ColumnInfo {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable,
        default: None,
        autoincrement: false,
        comment: None,
    }
}
