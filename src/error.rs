//! Error types for the database context MCP server.
//!
//! Configuration and connection failures abort the call. Query failures are
//! reported back to the caller as data, and storage failures only degrade the
//! response (the spill reference is dropped).

pub use rmcp::ErrorData as McpError;
use serde_json::json;
use thiserror::Error;

/// Domain-specific errors for the database context MCP server.
///
/// Named `ServerError` to avoid collision with the protocol-level `McpError`.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Missing or malformed request configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver failed to open or validate a connection
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Execution or fetch failure on an otherwise valid connection
    #[error("{0}")]
    Query(String),

    /// Spill write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid tool input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query execution error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error should be reported inside a successful tool result
    /// rather than failing the call.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Query(_))
    }

    /// Reclassify a failure raised after a connection was acquired.
    ///
    /// A reset socket or a handle closed underneath a running statement is a
    /// query outcome, reported to the caller like any server-side error.
    pub fn into_query_failure(self) -> Self {
        match self {
            Self::Connection { message, .. } => Self::Query(message),
            Self::Internal(msg) => Self::Query(msg),
            other => other,
        }
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check DB_URL, DB_ENGINE_OPTIONS and EXECUTE_QUERY_MAX_CHARS (or their x- headers)"),
            Self::Connection { .. } => {
                Some("Check server hostname, port, credentials, and network connectivity")
            }
            Self::Query(_) => Some("Review the statement and its parameters"),
            Self::Storage(_) => Some("Check that the result spill directory exists and is writable"),
            _ => None,
        }
    }
}

/// Convert ServerError to the protocol error for failed calls.
///
/// Query errors should generally be returned as `CallToolResult::error` with a
/// message instead of using this conversion. The suggestion, when there is
/// one, travels in the error data.
impl From<ServerError> for McpError {
    fn from(e: ServerError) -> Self {
        let data = e.suggestion().map(|s| json!({ "suggestion": s }));
        match e {
            ServerError::Config(msg) => McpError::invalid_request(msg, data),
            ServerError::InvalidInput(msg) => McpError::invalid_params(msg, data),
            ServerError::Connection { message, .. } => {
                McpError::internal_error(format!("Connection error: {message}"), data)
            }
            ServerError::Query(msg) => McpError::internal_error(msg, data),
            ServerError::Storage(msg) => McpError::internal_error(msg, data),
            ServerError::Internal(msg) => McpError::internal_error(msg, data),
        }
    }
}

impl From<tiberius::error::Error> for ServerError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match &e {
            Error::Server(token) => ServerError::query(format!(
                "{} (error {})",
                token.message(),
                token.code()
            )),
            Error::Io { .. } => ServerError::connection(format!("IO error: {}", e)),
            Error::Tls(_) => ServerError::connection(format!("TLS error: {}", e)),
            Error::Routing { host, port } => ServerError::connection(format!(
                "Server requested routing to {}:{}",
                host, port
            )),
            Error::Protocol(_) => ServerError::connection(format!("Protocol error: {}", e)),
            _ => ServerError::query(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::storage(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::internal(format!("Serialization failed: {}", e))
    }
}
