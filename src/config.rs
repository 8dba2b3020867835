//! Process-level configuration for the database context MCP server.
//!
//! Configuration is loaded from environment variables following the 12-factor
//! app pattern. Per-call settings (target descriptor, result budget) are not
//! configured here; see [`crate::request`].

use crate::cache::CacheSettings;
use crate::constants::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT, DEFAULT_IDLE_THRESHOLD,
    DEFAULT_SERVER_NAME, DEFAULT_SWEEP_INTERVAL,
};
use crate::error::ServerError;
use crate::shutdown::ShutdownConfig;
use crate::transport::{HttpConfig, TransportConfig, TransportType};
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name announced to MCP clients
    pub server_name: String,

    /// Transport selection and HTTP binding
    pub transport: TransportConfig,

    /// Idle sweep timing of the connection cache
    pub cache: CacheSettings,

    /// Graceful shutdown timing
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            transport: TransportConfig::default(),
            cache: CacheSettings::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DBCTX_SERVER_NAME`: Server name (default: dbctx-mcp-server)
    /// - `DBCTX_TRANSPORT`: `stdio` or `http` (default: stdio)
    /// - `DBCTX_HTTP_HOST`: HTTP bind host (default: 127.0.0.1)
    /// - `DBCTX_HTTP_PORT`: HTTP port (default: 8000)
    /// - `DBCTX_SWEEP_INTERVAL`: Idle sweep interval in seconds (default: 60)
    /// - `DBCTX_IDLE_THRESHOLD`: Idle time before a connection is closed, in seconds (default: 600)
    /// - `DBCTX_SHUTDOWN_DRAIN_TIMEOUT`: Shutdown drain timeout in seconds (default: 30)
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_name = lookup("DBCTX_SERVER_NAME")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        let transport_type = match lookup("DBCTX_TRANSPORT") {
            Some(raw) => raw
                .parse::<TransportType>()
                .map_err(|e| ServerError::config(e.to_string()))?,
            None => TransportType::Stdio,
        };

        let http = HttpConfig {
            host: lookup("DBCTX_HTTP_HOST").unwrap_or_else(|| DEFAULT_HTTP_HOST.to_string()),
            port: lookup("DBCTX_HTTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_HTTP_PORT),
        };

        let cache = CacheSettings {
            sweep_interval: seconds(&lookup, "DBCTX_SWEEP_INTERVAL").unwrap_or(DEFAULT_SWEEP_INTERVAL),
            idle_threshold: seconds(&lookup, "DBCTX_IDLE_THRESHOLD").unwrap_or(DEFAULT_IDLE_THRESHOLD),
        };
        cache.validate()?;

        let shutdown = ShutdownConfig {
            drain_timeout: seconds(&lookup, "DBCTX_SHUTDOWN_DRAIN_TIMEOUT")
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        };

        Ok(Self {
            server_name,
            transport: TransportConfig {
                transport_type,
                http,
            },
            cache,
            shutdown,
        })
    }
}

fn seconds<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
