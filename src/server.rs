//! MCP server struct definition and the configuration source of each call.

use crate::cache::{ConnectionCache, SharedCache};
use crate::config::Config;
use crate::request::ConfigSource;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::service::{RequestContext, RoleServer};
use std::sync::Arc;

/// The database context MCP server.
///
/// Cloned for every HTTP session; the connection cache is shared through
/// an `Arc`, so all sessions reuse the same connections per target.
#[derive(Clone)]
pub struct DbContextServer {
    /// Process configuration.
    pub(crate) config: Arc<Config>,

    /// Connections keyed by target fingerprint.
    pub(crate) cache: SharedCache,

    /// Tool router for dispatching tool calls.
    pub(crate) tool_router: ToolRouter<Self>,
}

impl DbContextServer {
    /// Create a server around an existing cache.
    pub fn new(config: Config, cache: SharedCache) -> Self {
        Self {
            config: Arc::new(config),
            cache,
            tool_router: crate::tools::build_router(),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the connection cache.
    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }
}

/// Where a tool call reads its configuration from.
///
/// Calls that arrived over HTTP carry their request parts in the context
/// and are configured from headers and query string. Everything else is
/// configured from the process environment.

#[cfg(feature = "http")]
pub(crate) fn config_source(context: &RequestContext<RoleServer>) -> ConfigSource {
    use axum::extract::Query;
    use std::collections::HashMap;

    match context.extensions.get::<http::request::Parts>() {
        Some(parts) => {
            let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                .map(|Query(q)| q)
                .unwrap_or_default();
            let headers = parts
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                });
            ConfigSource::from_headers(headers, query)
        }
        None => ConfigSource::from_env(),
    }
}

#[cfg(not(feature = "http"))]
pub(crate) fn config_source(_context: &RequestContext<RoleServer>) -> ConfigSource {
    ConfigSource::from_env()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::database::testing::FakeDriver;

    #[test]
    fn test_server_shares_cache_across_clones() {
        let cache = Arc::new(
            ConnectionCache::new(FakeDriver::new(), CacheSettings::default()).unwrap(),
        );
        let server = DbContextServer::new(Config::default(), cache.clone());
        let clone = server.clone();

        assert!(std::ptr::eq(server.cache(), clone.cache()));
        assert_eq!(server.config().server_name, "dbctx-mcp-server");
    }

    #[test]
    fn test_router_lists_all_tools() {
        let cache = Arc::new(
            ConnectionCache::new(FakeDriver::new(), CacheSettings::default()).unwrap(),
        );
        let server = DbContextServer::new(Config::default(), cache);
        let mut names: Vec<String> = server
            .tool_router
            .list_all()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![
                "all_table_names",
                "execute_query",
                "filter_table_names",
                "schema_definitions"
            ]
        );
    }
}
