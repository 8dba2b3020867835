//! Bounded rendering of query results.
//!
//! [`ResultFormatter`] drains a [`Cursor`] one row at a time. Rows are
//! appended to the inline output until the character budget would be
//! exceeded; after that the cursor is still drained so the total row count is
//! exact. When a spill directory is configured the complete result set is
//! also written to `{dir}/{sha256}.json` and referenced from the output.

use crate::database::{Cursor, SqlValue};
use crate::error::ServerError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Marker returned when a result set is empty.
pub const NO_ROWS: &str = "No rows returned";

/// Presentation of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Vertical `column: value` blocks (default).
    #[default]
    Text,
    /// A JSON object with columns, rows and counts.
    Json,
}

impl OutputFormat {
    /// Get the format name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = InvalidOutputFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "vertical" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(InvalidOutputFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid output format string.
#[derive(Debug, Clone)]
pub struct InvalidOutputFormatError(String);

impl fmt::Display for InvalidOutputFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid output format '{}'. Valid formats: text, json",
            self.0
        )
    }
}

impl std::error::Error for InvalidOutputFormatError {}

/// Location of a spilled result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillReference {
    pub path: PathBuf,
    /// Content hash of the file, also its stem.
    pub hash: String,
    pub rows: usize,
}

impl SpillReference {
    /// One-line description naming the file.
    pub fn describe(&self) -> String {
        format!(
            "Full result set ({} rows) saved to {}",
            self.rows,
            self.path.display()
        )
    }
}

/// A size-bounded rendering of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedResult {
    pub format: OutputFormat,
    pub columns: Vec<String>,
    /// Inline rows, each value already rendered.
    pub rows: Vec<Vec<String>>,
    pub rows_returned: usize,
    pub total_rows: usize,
    pub truncated: bool,
    pub spill: Option<SpillReference>,
}

impl FormattedResult {
    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    /// Render in the format the result was measured for.
    pub fn render(&self) -> String {
        match self.format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
        }
    }

    fn render_text(&self) -> String {
        if self.is_empty() {
            return NO_ROWS.to_string();
        }

        let mut lines = Vec::new();
        for (idx, row) in self.rows.iter().enumerate() {
            lines.extend(text_block(idx + 1, &self.columns, row));
        }

        if self.truncated {
            lines.push(format!(
                "Result: showing first {} of {} rows (output truncated)",
                self.rows_returned, self.total_rows
            ));
        } else {
            lines.push(format!("Result: {} rows", self.total_rows));
        }

        if let Some(spill) = &self.spill {
            lines.push(spill.describe());
        }
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        let mut body = if self.is_empty() {
            json!({
                "message": NO_ROWS,
                "columns": self.columns,
                "rows": [],
                "rows_returned": 0,
                "total_rows": 0,
                "truncated": false,
            })
        } else {
            json!({
                "columns": self.columns,
                "rows": self.rows,
                "rows_returned": self.rows_returned,
                "total_rows": self.total_rows,
                "truncated": self.truncated,
            })
        };
        if let (Some(spill), Some(map)) = (&self.spill, body.as_object_mut()) {
            map.insert("full_result".to_string(), json!(spill.describe()));
        }
        body.to_string()
    }
}

/// Lines of one text-mode row block, including the trailing blank line.
fn text_block(number: usize, columns: &[String], row: &[String]) -> Vec<String> {
    let mut lines = Vec::with_capacity(columns.len() + 2);
    lines.push(format!("{}. row", number));
    for (column, value) in columns.iter().zip(row) {
        lines.push(format!("{}: {}", column, value));
    }
    lines.push(String::new());
    lines
}

/// Complete result set as written to the spill directory.
#[derive(Serialize)]
struct Snapshot<'a> {
    columns: &'a [String],
    rows: &'a [Vec<SqlValue>],
}

/// Streams a cursor into a [`FormattedResult`].
#[derive(Debug, Clone)]
pub struct ResultFormatter {
    max_chars: usize,
    format: OutputFormat,
    spill_dir: Option<PathBuf>,
}

impl ResultFormatter {
    pub fn new(max_chars: usize, format: OutputFormat) -> Self {
        Self {
            max_chars,
            format,
            spill_dir: None,
        }
    }

    /// Enable spilling the complete result set into `dir`.
    pub fn with_spill_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spill_dir = dir;
        self
    }

    /// Characters a row adds to the inline output.
    fn row_cost(&self, number: usize, columns: &[String], row: &[String]) -> usize {
        match self.format {
            // every line plus its line ending
            OutputFormat::Text => text_block(number, columns, row)
                .iter()
                .map(|line| line.chars().count() + 1)
                .sum(),
            // the serialized array plus a separating comma
            OutputFormat::Json => json!(row).to_string().chars().count() + 1,
        }
    }

    /// Drain `cursor` and build the bounded result.
    ///
    /// Cursor failures propagate. A failed spill write is logged and the
    /// result is returned without a reference.
    pub async fn format(&self, cursor: &mut dyn Cursor) -> Result<FormattedResult, ServerError> {
        let columns = cursor.columns().to_vec();
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut snapshot: Option<Vec<Vec<SqlValue>>> = self.spill_dir.as_ref().map(|_| Vec::new());
        let mut size = 0usize;
        let mut total = 0usize;
        let mut budget_exceeded = false;

        while let Some(row) = cursor.next_row().await? {
            total += 1;

            if !budget_exceeded {
                let rendered: Vec<String> = row.iter().map(SqlValue::to_display_string).collect();
                let cost = self.row_cost(total, &columns, &rendered);
                if size + cost > self.max_chars {
                    budget_exceeded = true;
                } else {
                    size += cost;
                    rows.push(rendered);
                }
            }

            if let Some(snapshot) = snapshot.as_mut() {
                snapshot.push(row);
            }
        }

        let spill = match (&self.spill_dir, snapshot) {
            (Some(dir), Some(snapshot)) if total > 0 => {
                match write_spill(dir, &columns, &snapshot).await {
                    Ok(reference) => Some(reference),
                    Err(e) => {
                        warn!("Result spill to {} failed: {}", dir.display(), e);
                        None
                    }
                }
            }
            _ => None,
        };

        let rows_returned = rows.len();
        debug!(
            "Formatted {} of {} rows ({} chars, budget {})",
            rows_returned, total, size, self.max_chars
        );

        Ok(FormattedResult {
            format: self.format,
            columns,
            rows,
            rows_returned,
            total_rows: total,
            truncated: rows_returned < total || budget_exceeded,
            spill,
        })
    }
}

/// Write the snapshot as `{dir}/{sha256 of contents}.json`.
async fn write_spill(
    dir: &Path,
    columns: &[String],
    rows: &[Vec<SqlValue>],
) -> Result<SpillReference, ServerError> {
    let bytes = serde_json::to_vec(&Snapshot { columns, rows })?;
    let hash = hex::encode(&Sha256::digest(&bytes));
    let path = dir.join(format!("{}.json", hash));

    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, &bytes).await?;
    debug!("Spilled {} rows ({} bytes) to {}", rows.len(), bytes.len(), path.display());

    Ok(SpillReference {
        path,
        hash,
        rows: rows.len(),
    })
}
