//! Per-call request configuration.
//!
//! Every tool call resolves a [`RequestConfig`] from exactly one
//! [`ConfigSource`]: the process environment (stdio transport) or the call's
//! HTTP headers (network transport). The two are never merged.

use crate::constants::{
    DEFAULT_EXECUTE_QUERY_MAX_CHARS, DEFAULT_PRE_PING, DEFAULT_RECYCLE_SECS, HEADER_PREFIX,
    PARAM_ALIASES, PARAM_DB_ENGINE_OPTIONS, PARAM_DB_URL, PARAM_EXECUTE_QUERY_MAX_CHARS,
    PARAM_RESULT_SPILL_DIR, SUPPORTED_PARAMS,
};
use crate::error::ServerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Where a call's configuration comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Process environment, keyed by upper-case variable name.
    Environment(HashMap<String, String>),
    /// Per-call HTTP headers (lower-case names) and query-string parameters.
    Headers {
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
    },
}

impl ConfigSource {
    /// Snapshot the current process environment.
    pub fn from_env() -> Self {
        Self::Environment(std::env::vars().collect())
    }

    /// Build a header source, normalizing header names to lower case.
    pub fn from_headers<I, K, V>(headers: I, query: HashMap<String, String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self::Headers {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
                .collect(),
            query,
        }
    }

    /// Look up a request-level key given in environment form (e.g. `DB_URL`),
    /// falling back to its aliases.
    fn setting(&self, key: &str) -> Option<&str> {
        self.lookup(key)
            .or_else(|| aliases(key).find_map(|alias| self.lookup(alias)))
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match self {
            Self::Environment(vars) => vars.get(name).map(String::as_str),
            Self::Headers { headers, .. } => headers.get(&header_name(name)).map(String::as_str),
        }
    }

    /// Look up a per-call parameter by name (query string first, then header).
    fn parameter(&self, key: &str) -> Option<&str> {
        match self {
            Self::Environment(_) => None,
            Self::Headers { headers, query } => query
                .get(key)
                .or_else(|| headers.get(&key.to_lowercase()))
                .map(String::as_str),
        }
    }
}

/// Header equivalent of an environment key: `DB_URL` becomes `x-db-url`.
pub fn header_name(key: &str) -> String {
    format!("{}{}", HEADER_PREFIX, key.replace('_', "-").to_lowercase())
}

/// Alternate names accepted for `key`.
pub fn aliases(key: &str) -> impl Iterator<Item = &'static str> + '_ {
    PARAM_ALIASES
        .iter()
        .filter(move |(k, _)| *k == key)
        .map(|(_, alias)| *alias)
}

/// Header names understood by the server, aliases included.
pub fn supported_headers() -> Vec<String> {
    SUPPORTED_PARAMS
        .iter()
        .flat_map(|k| std::iter::once(*k).chain(aliases(k)))
        .map(header_name)
        .collect()
}

/// Transaction isolation requested for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// Each statement commits on its own; the driver default.
    #[default]
    Autocommit,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    /// Statement that applies this level to a fresh session, if any.
    #[must_use]
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Autocommit => None,
            Self::ReadUncommitted => Some("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"),
            Self::ReadCommitted => Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Self::RepeatableRead => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            Self::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
            Self::Snapshot => Some("SET TRANSACTION ISOLATION LEVEL SNAPSHOT"),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Autocommit => "AUTOCOMMIT",
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Error returned when parsing an isolation level fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIsolationLevelError(String);

impl std::fmt::Display for ParseIsolationLevelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid isolation level: '{}'", self.0)
    }
}

impl std::error::Error for ParseIsolationLevelError {}

impl std::str::FromStr for IsolationLevel {
    type Err = ParseIsolationLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], " ").trim() {
            "autocommit" | "auto commit" => Ok(IsolationLevel::Autocommit),
            "read uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            "snapshot" => Ok(IsolationLevel::Snapshot),
            _ => Err(ParseIsolationLevelError(s.to_string())),
        }
    }
}

/// Driver options: fixed defaults overridden by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverOptions {
    pub isolation_level: IsolationLevel,
    /// Check the connection before reusing it.
    pub pre_ping: bool,
    /// Treat connections older than this as stale.
    pub recycle_after: Duration,
    /// Unrecognized keys, forwarded to the driver as-is.
    pub extra: BTreeMap<String, Value>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::Autocommit,
            pre_ping: DEFAULT_PRE_PING,
            recycle_after: Duration::from_secs(DEFAULT_RECYCLE_SECS),
            extra: BTreeMap::new(),
        }
    }
}

impl DriverOptions {
    /// Apply overrides on top of `self`; the last write wins.
    pub fn merge(mut self, overrides: Map<String, Value>) -> Result<Self, ServerError> {
        for (key, value) in overrides {
            match key.as_str() {
                "isolation_level" => {
                    let level = value
                        .as_str()
                        .ok_or_else(|| option_type_error(&key, "a string", &value))?;
                    self.isolation_level = level
                        .parse()
                        .map_err(|e: ParseIsolationLevelError| ServerError::config(e.to_string()))?;
                }
                "pre_ping" => {
                    self.pre_ping = value
                        .as_bool()
                        .ok_or_else(|| option_type_error(&key, "a boolean", &value))?;
                }
                "recycle_seconds" => {
                    let secs = value
                        .as_u64()
                        .ok_or_else(|| option_type_error(&key, "a non-negative integer", &value))?;
                    self.recycle_after = Duration::from_secs(secs);
                }
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
        Ok(self)
    }

    /// Passthrough option as a string, if present.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Passthrough option as a boolean, if present.
    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(Value::as_bool)
    }
}

fn option_type_error(key: &str, expected: &str, value: &Value) -> ServerError {
    ServerError::config(format!(
        "{} option '{}' must be {}, got {}",
        PARAM_DB_ENGINE_OPTIONS, key, expected, value
    ))
}

/// Stable one-way identity of a target descriptor; the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash a descriptor. Options never participate.
    pub fn of(descriptor: &str) -> Self {
        Self(hex::encode(&Sha256::digest(descriptor.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for a single tool call.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    descriptor: String,
    fingerprint: Fingerprint,
    options: DriverOptions,
    max_chars: usize,
    spill_dir: Option<PathBuf>,
    source: ConfigSource,
}

impl RequestConfig {
    /// Resolve the configuration of a call from its source.
    ///
    /// Fails with `ServerError::Config` before any I/O when the descriptor is
    /// missing, the option JSON is malformed, or the budget is not an integer.
    pub fn resolve(source: ConfigSource) -> Result<Self, ServerError> {
        let descriptor = source
            .setting(PARAM_DB_URL)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::config(format!("{} is required", PARAM_DB_URL)))?
            .to_string();

        let max_chars = match source.setting(PARAM_EXECUTE_QUERY_MAX_CHARS) {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                ServerError::config(format!(
                    "{} must be a non-negative integer, got '{}'",
                    PARAM_EXECUTE_QUERY_MAX_CHARS, raw
                ))
            })?,
            None => DEFAULT_EXECUTE_QUERY_MAX_CHARS,
        };

        let spill_dir = source
            .setting(PARAM_RESULT_SPILL_DIR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let overrides = match source.setting(PARAM_DB_ENGINE_OPTIONS) {
            Some(raw) if !raw.trim().is_empty() => parse_option_overrides(raw)?,
            _ => Map::new(),
        };
        let options = DriverOptions::default().merge(overrides)?;

        Ok(Self {
            fingerprint: Fingerprint::of(&descriptor),
            descriptor,
            options,
            max_chars,
            spill_dir,
            source,
        })
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Inline result budget in characters.
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn spill_dir(&self) -> Option<&PathBuf> {
        self.spill_dir.as_ref()
    }

    /// A call parameter: the argument wins over query string and headers.
    pub fn parameter(&self, key: &str, argument: Option<String>) -> Option<String> {
        argument.or_else(|| self.source.parameter(key).map(str::to_string))
    }

    /// A JSON-typed call parameter; string fallbacks are parsed as JSON.
    pub fn json_parameter(
        &self,
        key: &str,
        argument: Option<Value>,
    ) -> Result<Option<Value>, ServerError> {
        if argument.is_some() {
            return Ok(argument);
        }
        match self.source.parameter(key) {
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                ServerError::invalid_input(format!("'{}' is not valid JSON: {}", key, e))
            }),
            None => Ok(None),
        }
    }

    /// A list-of-strings call parameter; string fallbacks may be a JSON array
    /// or a comma-separated list.
    pub fn list_parameter(&self, key: &str, argument: Option<Vec<String>>) -> Option<Vec<String>> {
        if argument.is_some() {
            return argument;
        }
        let raw = self.source.parameter(key)?;
        if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
            return Some(list);
        }
        Some(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

fn parse_option_overrides(raw: &str) -> Result<Map<String, Value>, ServerError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ServerError::config(format!(
            "{} must be a JSON object, got {}",
            PARAM_DB_ENGINE_OPTIONS, other
        ))),
        Err(e) => Err(ServerError::config(format!(
            "{} is not valid JSON: {}",
            PARAM_DB_ENGINE_OPTIONS, e
        ))),
    }
}

static PASSWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)((?:password|pwd)\s*=\s*)([^;]*)")
        .unwrap_or_else(|e| panic!("Internal error: invalid password pattern: {}", e))
});

static URL_CREDENTIALS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(://[^:/@]+:)([^@]*)(@)")
        .unwrap_or_else(|e| panic!("Internal error: invalid credentials pattern: {}", e))
});

/// Mask passwords in a descriptor before it is logged.
pub fn redact_descriptor(descriptor: &str) -> String {
    let masked = PASSWORD_PATTERN.replace_all(descriptor, "${1}***");
    URL_CREDENTIALS_PATTERN
        .replace_all(&masked, "${1}***${3}")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = "server=tcp:localhost,1433;user=sa;password=secret;TrustServerCertificate=true";

    fn env(pairs: &[(&str, &str)]) -> ConfigSource {
        ConfigSource::Environment(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn headers(pairs: &[(&str, &str)], query: &[(&str, &str)]) -> ConfigSource {
        ConfigSource::from_headers(
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())),
            query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_from_environment() {
        let config = RequestConfig::resolve(env(&[("DB_URL", DESCRIPTOR)])).unwrap();
        assert_eq!(config.descriptor(), DESCRIPTOR);
        assert_eq!(config.max_chars(), 4000);
        assert!(config.spill_dir().is_none());
        assert_eq!(config.options(), &DriverOptions::default());
    }

    #[test]
    fn test_missing_descriptor_is_config_error() {
        let err = RequestConfig::resolve(env(&[("EXECUTE_QUERY_MAX_CHARS", "10")])).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));

        let err = RequestConfig::resolve(env(&[("DB_URL", "   ")])).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_malformed_options_are_config_errors() {
        for raw in ["{not json", "[1,2]", r#"{"recycle_seconds": "big"}"#, r#"{"isolation_level": "chaos"}"#] {
            let err = RequestConfig::resolve(env(&[("DB_URL", DESCRIPTOR), ("DB_ENGINE_OPTIONS", raw)]))
                .unwrap_err();
            assert!(matches!(err, ServerError::Config(_)), "{raw}");
        }
    }

    #[test]
    fn test_invalid_budget_is_config_error() {
        let err = RequestConfig::resolve(env(&[
            ("DB_URL", DESCRIPTOR),
            ("EXECUTE_QUERY_MAX_CHARS", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_option_merge_last_write_wins_and_passes_unknown_keys() {
        let config = RequestConfig::resolve(env(&[
            ("DB_URL", DESCRIPTOR),
            (
                "DB_ENGINE_OPTIONS",
                r#"{"pool_size": 4, "isolation_level": "read_committed", "application_name": "reports"}"#,
            ),
        ]))
        .unwrap();
        let options = config.options();
        assert_eq!(options.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(options.recycle_after, Duration::from_secs(DEFAULT_RECYCLE_SECS));
        assert!(options.pre_ping);
        assert_eq!(options.extra_str("application_name"), Some("reports"));
        assert_eq!(options.extra.get("pool_size"), Some(&serde_json::json!(4)));
    }

    #[test]
    fn test_alternate_key_names_from_environment() {
        let config = RequestConfig::resolve(env(&[
            ("DB_URL", DESCRIPTOR),
            ("DB_OPTIONS", r#"{"isolation_level": "serializable"}"#),
            ("CLAUDE_LOCAL_FILES_PATH", "/tmp/results"),
        ]))
        .unwrap();
        assert_eq!(config.options().isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.spill_dir(), Some(&PathBuf::from("/tmp/results")));
    }

    #[test]
    fn test_alternate_key_names_from_headers() {
        let config = RequestConfig::resolve(headers(
            &[
                ("x-db-url", DESCRIPTOR),
                ("x-db-options", r#"{"pre_ping": false}"#),
                ("X-Claude-Local-Files-Path", "/srv/spill"),
            ],
            &[],
        ))
        .unwrap();
        assert!(!config.options().pre_ping);
        assert_eq!(config.spill_dir(), Some(&PathBuf::from("/srv/spill")));
    }

    #[test]
    fn test_primary_key_name_wins_over_alias() {
        let config = RequestConfig::resolve(env(&[
            ("DB_URL", DESCRIPTOR),
            ("DB_ENGINE_OPTIONS", r#"{"isolation_level": "snapshot"}"#),
            ("DB_OPTIONS", r#"{"isolation_level": "serializable"}"#),
            ("RESULT_SPILL_DIR", "/primary"),
            ("CLAUDE_LOCAL_FILES_PATH", "/alias"),
        ]))
        .unwrap();
        assert_eq!(config.options().isolation_level, IsolationLevel::Snapshot);
        assert_eq!(config.spill_dir(), Some(&PathBuf::from("/primary")));
    }

    #[test]
    fn test_headers_source() {
        let source = headers(
            &[
                ("X-DB-URL", DESCRIPTOR),
                ("x-execute-query-max-chars", "120"),
                ("x-result-spill-dir", "/tmp/spill"),
            ],
            &[],
        );
        let config = RequestConfig::resolve(source).unwrap();
        assert_eq!(config.descriptor(), DESCRIPTOR);
        assert_eq!(config.max_chars(), 120);
        assert_eq!(config.spill_dir(), Some(&PathBuf::from("/tmp/spill")));
    }

    #[test]
    fn test_headers_source_ignores_environment_names() {
        let source = headers(&[("DB_URL", DESCRIPTOR)], &[]);
        assert!(RequestConfig::resolve(source).is_err());
    }

    #[test]
    fn test_argument_wins_over_query_and_header() {
        let source = headers(
            &[("x-db-url", DESCRIPTOR), ("query", "SELECT 'header'")],
            &[("query", "SELECT 'query'")],
        );
        let config = RequestConfig::resolve(source).unwrap();

        assert_eq!(
            config.parameter("query", Some("SELECT 'arg'".to_string())),
            Some("SELECT 'arg'".to_string())
        );
        assert_eq!(
            config.parameter("query", None),
            Some("SELECT 'query'".to_string())
        );

        let header_only = RequestConfig::resolve(headers(
            &[("x-db-url", DESCRIPTOR), ("q", "user")],
            &[],
        ))
        .unwrap();
        assert_eq!(header_only.parameter("q", None), Some("user".to_string()));
    }

    #[test]
    fn test_environment_source_has_no_call_parameters() {
        let config =
            RequestConfig::resolve(env(&[("DB_URL", DESCRIPTOR), ("query", "SELECT 1")])).unwrap();
        assert_eq!(config.parameter("query", None), None);
    }

    #[test]
    fn test_list_and_json_parameters() {
        let config = RequestConfig::resolve(headers(
            &[
                ("x-db-url", DESCRIPTOR),
                ("table_names", "users, orders"),
                ("params", r#"{"id": 3}"#),
            ],
            &[],
        ))
        .unwrap();
        assert_eq!(
            config.list_parameter("table_names", None),
            Some(vec!["users".to_string(), "orders".to_string()])
        );
        assert_eq!(
            config.json_parameter("params", None).unwrap(),
            Some(serde_json::json!({"id": 3}))
        );
    }

    #[test]
    fn test_fingerprint_stability() {
        assert_eq!(Fingerprint::of(DESCRIPTOR), Fingerprint::of(DESCRIPTOR));
        assert_ne!(Fingerprint::of(DESCRIPTOR), Fingerprint::of("server=other"));
        assert_eq!(
            Fingerprint::of("a").as_str(),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
    }

    #[test]
    fn test_fingerprint_ignores_options() {
        let a = RequestConfig::resolve(env(&[("DB_URL", DESCRIPTOR)])).unwrap();
        let b = RequestConfig::resolve(env(&[
            ("DB_URL", DESCRIPTOR),
            ("DB_ENGINE_OPTIONS", r#"{"pre_ping": false}"#),
        ]))
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_header_names() {
        assert_eq!(header_name("DB_URL"), "x-db-url");
        let headers = supported_headers();
        assert!(headers.contains(&"x-execute-query-max-chars".to_string()));
        assert!(headers.contains(&"x-db-engine-options".to_string()));
        assert!(headers.contains(&"x-db-options".to_string()));
        assert!(headers.contains(&"x-claude-local-files-path".to_string()));
    }

    #[test]
    fn test_redact_descriptor() {
        let redacted = redact_descriptor(DESCRIPTOR);
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("password=***"));

        let url = redact_descriptor("mssql://sa:hunter2@db:1433/app");
        assert_eq!(url, "mssql://sa:***@db:1433/app");
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!("SERIALIZABLE".parse(), Ok(IsolationLevel::Serializable));
        assert_eq!("AUTOCOMMIT".parse(), Ok(IsolationLevel::Autocommit));
        assert!(IsolationLevel::Autocommit.as_sql().is_none());
        assert!("bogus".parse::<IsolationLevel>().is_err());
    }
}
