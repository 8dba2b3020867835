//! Centralized constants for the database context MCP server.
//!
//! This module contains all magic numbers and default values used throughout
//! the codebase, making them easy to find, understand, and modify.

use std::time::Duration;

// =============================================================================
// Request Configuration Keys
// =============================================================================

/// Target descriptor (connection string). Required.
pub const PARAM_DB_URL: &str = "DB_URL";

/// JSON object of driver option overrides.
pub const PARAM_DB_ENGINE_OPTIONS: &str = "DB_ENGINE_OPTIONS";

/// Inline result budget in characters.
pub const PARAM_EXECUTE_QUERY_MAX_CHARS: &str = "EXECUTE_QUERY_MAX_CHARS";

/// Directory receiving complete result sets that overflow the inline budget.
pub const PARAM_RESULT_SPILL_DIR: &str = "RESULT_SPILL_DIR";

/// All request-level keys, in environment-variable form.
pub const SUPPORTED_PARAMS: [&str; 4] = [
    PARAM_DB_URL,
    PARAM_DB_ENGINE_OPTIONS,
    PARAM_EXECUTE_QUERY_MAX_CHARS,
    PARAM_RESULT_SPILL_DIR,
];

/// Alternate names for request-level keys, as `(key, alias)`.
///
/// A key is looked up under its own name first, then under each alias.
pub const PARAM_ALIASES: [(&str, &str); 2] = [
    (PARAM_DB_ENGINE_OPTIONS, "DB_OPTIONS"),
    (PARAM_RESULT_SPILL_DIR, "CLAUDE_LOCAL_FILES_PATH"),
];

/// Prefix for header equivalents of request-level keys.
pub const HEADER_PREFIX: &str = "x-";

// =============================================================================
// Result Size Constants
// =============================================================================

/// Default inline result budget in characters.
pub const DEFAULT_EXECUTE_QUERY_MAX_CHARS: usize = 4000;

/// Capacity of the channel carrying rows from the driver task to the formatter.
pub const ROW_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Driver Option Defaults
// =============================================================================

/// Check that a cached connection is alive before reusing it.
pub const DEFAULT_PRE_PING: bool = true;

/// Connections older than this are treated as stale.
pub const DEFAULT_RECYCLE_SECS: u64 = 3600;

// =============================================================================
// Connection Cache Constants
// =============================================================================

/// Default interval between idle sweeps in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default idle threshold in seconds.
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 600;

/// Default sweep interval as Duration.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS);

/// Default idle threshold as Duration.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(DEFAULT_IDLE_THRESHOLD_SECS);

// =============================================================================
// Server Constants
// =============================================================================

/// Default MCP server name.
pub const DEFAULT_SERVER_NAME: &str = "dbctx-mcp-server";

/// Default HTTP bind host.
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

// =============================================================================
// Shutdown Constants
// =============================================================================

/// Default shutdown drain timeout in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Default shutdown drain timeout as Duration.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS);

// =============================================================================
// Logging Constants
// =============================================================================

/// Default truncation length for query logging.
pub const LOG_QUERY_TRUNCATE_LENGTH: usize = 200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_durations() {
        assert_eq!(DEFAULT_SWEEP_INTERVAL, Duration::from_secs(60));
        assert_eq!(DEFAULT_IDLE_THRESHOLD, Duration::from_secs(600));
        assert!(DEFAULT_IDLE_THRESHOLD > DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn test_shutdown_durations() {
        assert_eq!(DEFAULT_DRAIN_TIMEOUT, Duration::from_secs(30));
    }

    #[test]
    fn test_supported_params() {
        assert!(SUPPORTED_PARAMS.contains(&PARAM_DB_URL));
        assert_eq!(SUPPORTED_PARAMS.len(), 4);
        for (key, alias) in PARAM_ALIASES {
            assert!(SUPPORTED_PARAMS.contains(&key));
            assert!(!SUPPORTED_PARAMS.contains(&alias));
        }
    }
}
