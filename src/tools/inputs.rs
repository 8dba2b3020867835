//! Tool input types with JSON Schema generation.
//!
//! Every field is optional at the schema level: over HTTP a missing argument
//! may be supplied by the query string or a header of the same name.

use crate::formatter::OutputFormat;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input for the `filter_table_names` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FilterTableNamesInput {
    /// Substring to look for in table names.
    #[serde(default)]
    #[schemars(description = "Substring that returned table names must contain")]
    pub q: Option<String>,
}

/// Input for the `schema_definitions` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SchemaDefinitionsInput {
    #[serde(default)]
    #[schemars(description = "Names of the tables to describe")]
    pub table_names: Option<Vec<String>>,
}

/// Input for the `execute_query` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteQueryInput {
    /// The SQL statement to execute.
    #[serde(default)]
    #[schemars(description = "SQL statement to execute")]
    pub query: Option<String>,

    /// Values for `:name` placeholders.
    #[serde(default)]
    #[schemars(
        description = "Values for named placeholders, e.g. {\"id\": 123} for 'WHERE id = :id'"
    )]
    pub params: Option<Value>,

    /// Output format for row results.
    #[serde(default)]
    #[schemars(description = "Output format: 'text' (numbered row blocks) or 'json' (default: text)")]
    pub format: Option<OutputFormat>,
}
