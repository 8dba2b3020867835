//! ServerHandler implementation for the database context MCP server.
//!
//! This module implements the rmcp `ServerHandler` trait which defines how
//! the server responds to MCP protocol requests.

use crate::constants::{DEFAULT_EXECUTE_QUERY_MAX_CHARS, SUPPORTED_PARAMS};
use crate::request::{aliases, header_name};
use crate::server::DbContextServer;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo};
use rmcp::tool_handler;
use tracing::info;

/// The `#[tool_handler]` macro wires up tool routing automatically.
/// It generates the `list_tools` and `call_tool` method implementations.
#[tool_handler]
impl ServerHandler for DbContextServer {
    /// Server identification - called during initialization handshake.
    fn get_info(&self) -> ServerInfo {
        info!("MCP client requesting server info");

        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,

            capabilities: ServerCapabilities::builder().enable_tools().build(),

            server_info: Implementation {
                name: self.config.server_name.clone(),
                title: Some("Database Context MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },

            instructions: Some(build_instructions()),
        }
    }
}

/// Build server instructions.
fn build_instructions() -> String {
    let mut instructions = String::new();

    instructions.push_str("# Database Context MCP Server\n\n");
    instructions.push_str("Inspect and query SQL databases. Every call names its own target.\n\n");

    instructions.push_str("## Configuration\n");
    for key in SUPPORTED_PARAMS {
        instructions.push_str(&format!("- `{}` (header `{}`)", key, header_name(key)));
        for alias in aliases(key) {
            instructions.push_str(&format!(", also `{}`", alias));
        }
        instructions.push('\n');
    }
    instructions.push_str(&format!(
        "\nResults longer than {} characters are truncated unless EXECUTE_QUERY_MAX_CHARS says otherwise.\n\n",
        DEFAULT_EXECUTE_QUERY_MAX_CHARS
    ));

    instructions.push_str("## Tools\n");
    instructions.push_str("- `all_table_names`, `filter_table_names`: discover tables\n");
    instructions.push_str("- `schema_definitions`: columns, keys and relationships\n");
    instructions.push_str("- `execute_query`: run SQL; bind values through `params`\n\n");

    instructions.push_str("### Best Practices\n");
    instructions.push_str("1. Explore the schema before writing queries\n");
    instructions.push_str("2. Prefer narrow SELECTs over SELECT * on wide tables\n");
    instructions.push_str("3. Use RESULT_SPILL_DIR when the full result set is needed\n");

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instructions_list_headers() {
        let text = build_instructions();
        assert!(text.contains("`DB_URL` (header `x-db-url`)\n"));
        assert!(text.contains(
            "`DB_ENGINE_OPTIONS` (header `x-db-engine-options`), also `DB_OPTIONS`"
        ));
        assert!(text.contains("execute_query"));
    }
}
