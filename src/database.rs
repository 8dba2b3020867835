//! Database driver seam and its SQL Server implementation.
//!
//! The connection cache and result formatter only see the traits defined here.
//! [`mssql::MssqlDriver`] is the production implementation.

pub mod mssql;
pub mod params;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

use crate::error::ServerError;
use crate::request::DriverOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use mssql::MssqlDriver;
pub use params::QueryParams;
pub use types::{SqlValue, TypeMapper};

/// Opens connections to a target described by a connection string.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new connection. Failures are `ServerError::Connection`.
    async fn connect(
        &self,
        descriptor: &str,
        options: &DriverOptions,
    ) -> Result<Arc<dyn Connection>, ServerError>;
}

/// One live connection to one database target.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection can still be used.
    async fn is_alive(&self) -> bool;

    /// Execute a statement.
    async fn execute(&self, sql: &str, params: &QueryParams) -> Result<Execution, ServerError>;

    /// Names of all tables visible to this connection.
    async fn table_names(&self) -> Result<Vec<String>, ServerError>;

    /// Column definitions of a table, in ordinal order.
    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ServerError>;

    /// Foreign keys declared on a table.
    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyInfo>, ServerError>;

    /// Columns that make up a table's primary key.
    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ServerError>;

    /// Close the connection. Further calls fail.
    async fn close(&self) -> Result<(), ServerError>;
}

/// Outcome of executing a statement.
pub enum Execution {
    /// The statement produced a result set.
    Rows(Box<dyn Cursor>),
    /// The statement modified data.
    Affected(u64),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::Rows(cursor) => f
                .debug_tuple("Rows")
                .field(&cursor.columns())
                .finish(),
            Execution::Affected(n) => f.debug_tuple("Affected").field(n).finish(),
        }
    }
}

/// Pull-based access to a result set, one row at a time.
#[async_trait]
pub trait Cursor: Send {
    /// Column names, in order.
    fn columns(&self) -> &[String];

    /// Fetch the next row, or `None` when the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>, ServerError>;
}

/// Column metadata from schema introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub autoincrement: bool,
    pub comment: Option<String>,
}

/// Foreign key metadata from schema introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: Option<String>,
    pub constrained_columns: Vec<String>,
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

/// Everything `schema_definitions` reports for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub primary_keys: Vec<String>,
}

/// Load the schema details of several tables over one connection.
pub async fn load_table_schemas(
    conn: &dyn Connection,
    table_names: &[String],
) -> Result<Vec<TableSchema>, ServerError> {
    let mut schemas = Vec::with_capacity(table_names.len());
    for name in table_names {
        schemas.push(TableSchema {
            name: name.clone(),
            columns: conn.columns(name).await?,
            foreign_keys: conn.foreign_keys(name).await?,
            primary_keys: conn.primary_keys(name).await?,
        });
    }
    Ok(schemas)
}

/// Table names containing `filter` (all of them when `None`).
pub async fn filtered_table_names(
    conn: &dyn Connection,
    filter: Option<&str>,
) -> Result<Vec<String>, ServerError> {
    let tables = conn.table_names().await?;
    Ok(match filter {
        Some(q) => tables.into_iter().filter(|t| t.contains(q)).collect(),
        None => tables,
    })
}
