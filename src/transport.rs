//! Transport layer selection for the MCP server.
//!
//! Supports two transport mechanisms:
//! - stdio: Standard input/output (default). Request settings come from the
//!   process environment.
//! - http: Streamable HTTP. Request settings come from each call's headers.
//!
//! The HTTP transport is optional and requires the `http` feature flag.

use crate::constants::{DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT};

/// Transport configuration.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Transport type to use.
    pub transport_type: TransportType,

    /// HTTP server configuration (only used for HTTP transport).
    pub http: HttpConfig,
}

/// Available transport types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportType {
    /// Standard input/output transport (default).
    #[default]
    Stdio,

    /// Streamable HTTP transport.
    #[cfg(feature = "http")]
    Http,
}

/// Error returned when parsing a transport type fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTransportTypeError(String);

impl std::fmt::Display for ParseTransportTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transport type: '{}'", self.0)
    }
}

impl std::error::Error for ParseTransportTypeError {}

impl std::str::FromStr for TransportType {
    type Err = ParseTransportTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" | "standard" | "io" => Ok(TransportType::Stdio),
            #[cfg(feature = "http")]
            "http" | "streamable-http" | "streamable_http" => Ok(TransportType::Http),
            _ => Err(ParseTransportTypeError(s.to_string())),
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Stdio => write!(f, "stdio"),
            #[cfg(feature = "http")]
            TransportType::Http => write!(f, "http"),
        }
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Host to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

impl HttpConfig {
    /// Socket address string to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Streamable HTTP server (only available with `http` feature).
///
/// Serves:
/// - `/mcp` - MCP streamable HTTP endpoint; each call's headers reach the
///   tools through the request context
/// - `/health` and `/` - health check
#[cfg(feature = "http")]
pub mod http_server {
    use super::*;
    use crate::request::supported_headers;
    use crate::server::DbContextServer;
    use crate::shutdown::SharedShutdownController;
    use axum::{response::IntoResponse, routing::get, Json, Router};
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    };
    use tracing::info;

    /// Start the HTTP server; returns once the shutdown signal fires.
    pub async fn start_http_server_with_shutdown(
        server: DbContextServer,
        config: HttpConfig,
        shutdown_controller: SharedShutdownController,
    ) -> Result<(), anyhow::Error> {
        let service = StreamableHttpService::new(
            move || Ok(server.clone()),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        );

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/", get(health_handler))
            .nest_service("/mcp", service);

        let addr = config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("HTTP server listening on http://{}", addr);
        info!("MCP endpoint: http://{}/mcp", addr);
        info!("Expected headers: {:?}", supported_headers());

        let mut shutdown_signal = shutdown_controller.signal();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal.recv().await;
                info!("HTTP server received shutdown signal");
            })
            .await?;

        Ok(())
    }

    /// Health check handler.
    async fn health_handler() -> impl IntoResponse {
        Json(serde_json::json!({
            "status": "healthy",
            "server": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "transport": "http",
            "endpoints": {
                "mcp": "/mcp",
                "health": "/health"
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_parse() {
        assert_eq!("stdio".parse::<TransportType>().unwrap(), TransportType::Stdio);
        assert_eq!("STDIO".parse::<TransportType>().unwrap(), TransportType::Stdio);
        assert!("smtp".parse::<TransportType>().is_err());
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_transport_parse() {
        assert_eq!(
            "streamable-http".parse::<TransportType>().unwrap(),
            TransportType::Http
        );
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(HttpConfig::default().bind_address(), "127.0.0.1:8000");
    }
}
