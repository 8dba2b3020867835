//! MCP tool implementations.
//!
//! Tools:
//! - `all_table_names`: every table visible to the target, comma separated
//! - `filter_table_names`: tables whose name contains a substring
//! - `schema_definitions`: columns and relationships of named tables
//! - `execute_query`: run a statement and return a size-bounded result
//!
//! Each call resolves its own [`RequestConfig`] and borrows the cached
//! connection for that target. Anything that fails once the connection is in
//! hand comes back as an `Error: ...` tool result. Configuration, input, and
//! connect failures fail the call.

mod inputs;

pub use inputs::*;

use crate::cache::ConnectionCache;
use crate::constants::LOG_QUERY_TRUNCATE_LENGTH;
use crate::database::{
    filtered_table_names, load_table_schemas, Connection, Execution, QueryParams,
};
use crate::error::{McpError, ServerError};
use crate::formatter::{OutputFormat, ResultFormatter};
use crate::request::{ConfigSource, RequestConfig};
use crate::schema::describe_tables;
use crate::server::{config_source, DbContextServer};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{tool, tool_router};
use tracing::{debug, info, warn};

#[tool_router]
impl DbContextServer {
    #[tool(description = "Return all table names in the database separated by comma.")]
    async fn all_table_names(
        &self,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_all_table_names(config_source(&context)).await
    }

    #[tool(
        description = "Return all table names in the database containing the substring 'q' separated by comma."
    )]
    async fn filter_table_names(
        &self,
        Parameters(input): Parameters<FilterTableNamesInput>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_filter_table_names(config_source(&context), input)
            .await
    }

    #[tool(description = "Returns schema and relation information for the given tables.")]
    async fn schema_definitions(
        &self,
        Parameters(input): Parameters<SchemaDefinitionsInput>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_schema_definitions(config_source(&context), input)
            .await
    }

    #[tool(
        description = "Execute a SQL query and return results in a readable format. Results will be truncated after EXECUTE_QUERY_MAX_CHARS characters. Pass values for named placeholders through 'params', e.g. 'WHERE id = :id' with params={\"id\": 123}; never splice values into the query text."
    )]
    async fn execute_query(
        &self,
        Parameters(input): Parameters<ExecuteQueryInput>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_execute_query(config_source(&context), input).await
    }
}

// Tool bodies, separated from the protocol context so they can be driven
// with any configuration source.
impl DbContextServer {
    pub(crate) async fn run_all_table_names(
        &self,
        source: ConfigSource,
    ) -> Result<CallToolResult, McpError> {
        let config = RequestConfig::resolve(source)?;
        into_tool_result(
            "all_table_names",
            list_table_names(self.cache(), &config, None).await,
        )
    }

    pub(crate) async fn run_filter_table_names(
        &self,
        source: ConfigSource,
        input: FilterTableNamesInput,
    ) -> Result<CallToolResult, McpError> {
        let config = RequestConfig::resolve(source)?;
        let result = match config.parameter("q", input.q) {
            Some(q) => list_table_names(self.cache(), &config, Some(&q)).await,
            None => Err(ServerError::invalid_input("'q' is required")),
        };
        into_tool_result("filter_table_names", result)
    }

    pub(crate) async fn run_schema_definitions(
        &self,
        source: ConfigSource,
        input: SchemaDefinitionsInput,
    ) -> Result<CallToolResult, McpError> {
        let config = RequestConfig::resolve(source)?;
        let result = match config.list_parameter("table_names", input.table_names) {
            Some(tables) => schema_definitions(self.cache(), &config, &tables).await,
            None => Err(ServerError::invalid_input("'table_names' is required")),
        };
        into_tool_result("schema_definitions", result)
    }

    pub(crate) async fn run_execute_query(
        &self,
        source: ConfigSource,
        input: ExecuteQueryInput,
    ) -> Result<CallToolResult, McpError> {
        let config = RequestConfig::resolve(source)?;
        into_tool_result(
            "execute_query",
            execute_query(self.cache(), &config, input).await,
        )
    }
}

/// Router over every tool of [`DbContextServer`].
pub(crate) fn build_router() -> ToolRouter<DbContextServer> {
    DbContextServer::tool_router()
}

/// Table names joined with `", "`, optionally filtered by substring.
pub(crate) async fn list_table_names(
    cache: &ConnectionCache,
    config: &RequestConfig,
    filter: Option<&str>,
) -> Result<String, ServerError> {
    let handle = cache.acquire(config).await?;
    let tables = filtered_table_names(handle.connection(), filter)
        .await
        .map_err(ServerError::into_query_failure)?;
    debug!("Listed {} table(s)", tables.len());
    Ok(tables.join(", "))
}

/// Text description of each named table.
pub(crate) async fn schema_definitions(
    cache: &ConnectionCache,
    config: &RequestConfig,
    tables: &[String],
) -> Result<String, ServerError> {
    let handle = cache.acquire(config).await?;
    let schemas = load_table_schemas(handle.connection(), tables)
        .await
        .map_err(ServerError::into_query_failure)?;
    Ok(describe_tables(&schemas))
}

/// Run one statement and render its outcome.
pub(crate) async fn execute_query(
    cache: &ConnectionCache,
    config: &RequestConfig,
    input: ExecuteQueryInput,
) -> Result<String, ServerError> {
    let query = config
        .parameter("query", input.query)
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ServerError::invalid_input("'query' is required"))?;

    let params = match config.json_parameter("params", input.params)? {
        Some(value) => QueryParams::from_json(value)?,
        None => QueryParams::new(),
    };

    let format = match input.format {
        Some(format) => format,
        None => match config.parameter("format", None) {
            Some(raw) => raw
                .parse::<OutputFormat>()
                .map_err(|e| ServerError::invalid_input(e.to_string()))?,
            None => OutputFormat::default(),
        },
    };

    info!(
        "Executing query on {}: {}",
        config.fingerprint().short(),
        preview(&query)
    );

    let formatter =
        ResultFormatter::new(config.max_chars(), format).with_spill_dir(config.spill_dir().cloned());

    let handle = cache.acquire(config).await?;
    run_statement(handle.connection(), &query, &params, &formatter)
        .await
        .map_err(ServerError::into_query_failure)
}

async fn run_statement(
    conn: &dyn Connection,
    query: &str,
    params: &QueryParams,
    formatter: &ResultFormatter,
) -> Result<String, ServerError> {
    match conn.execute(query, params).await? {
        Execution::Affected(count) => Ok(format!("Success: {} rows affected", count)),
        Execution::Rows(mut cursor) => Ok(formatter.format(cursor.as_mut()).await?.render()),
    }
}

/// Map a tool outcome onto the protocol.
fn into_tool_result(
    tool: &str,
    result: Result<String, ServerError>,
) -> Result<CallToolResult, McpError> {
    match result {
        Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
        Err(e) if e.is_data() => {
            warn!("{} failed: {}", tool, e);
            Ok(CallToolResult::error(vec![Content::text(format!(
                "Error: {}",
                e
            ))]))
        }
        Err(e) => {
            warn!("{} rejected: {}", tool, e);
            Err(e.into())
        }
    }
}

fn preview(query: &str) -> String {
    let flat = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= LOG_QUERY_TRUNCATE_LENGTH {
        flat
    } else {
        let head: String = flat.chars().take(LOG_QUERY_TRUNCATE_LENGTH).collect();
        format!("{}...", head)
    }
}
