//! Named query parameters.
//!
//! Statements use `:name` placeholders. SQL Server binds positionally
//! (`@P1`, `@P2`, ...), so placeholders are rewritten before execution and the
//! values are returned in binding order.

use crate::error::ServerError;
use serde_json::{Map, Value};

/// Named parameter values for a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    values: Map<String, Value>,
}

impl QueryParams {
    /// No parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters from a JSON object.
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Parameters from an arbitrary JSON value; `null` means none.
    pub fn from_json(value: Value) -> Result<Self, ServerError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(ServerError::invalid_input(format!(
                "params must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Add or replace a value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Look up a value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// A statement with positional placeholders and its ordered values.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub values: Vec<Value>,
}

/// Rewrite `:name` placeholders to `@Pn` and collect values in binding order.
///
/// Placeholders inside string literals, quoted identifiers, and comments are
/// left alone, as are `::` casts. A name used more than once binds once.
pub fn bind_named(sql: &str, params: &QueryParams) -> Result<BoundStatement, ServerError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '[' => {
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == close {
                        // doubled delimiter is an escape
                        if i + 1 < chars.len() && chars[i + 1] == close {
                            out.push(close);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                out.push_str("/*");
                i += 2;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        out.push_str("*/");
                        i += 2;
                        break;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|n| n.is_alphabetic() || *n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let position = match names.iter().position(|n| *n == name) {
                    Some(p) => p,
                    None => {
                        names.push(name);
                        names.len() - 1
                    }
                };
                out.push_str(&format!("@P{}", position + 1));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    let values = names
        .iter()
        .map(|name| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| ServerError::query(format!("Missing value for parameter '{}'", name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BoundStatement { sql: out, values })
}
