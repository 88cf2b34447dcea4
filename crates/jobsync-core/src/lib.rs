//! Core domain model for the job posting loader.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobsync-core";

/// Column stamped on every extracted row with the extraction instant.
pub const TIMESTAMP_FETCHED: &str = "timestamp_fetched";

/// Opaque posting identifier, normalized to its textual form so API values
/// (strings or integers) compare equal to warehouse cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Strings and numbers are usable ids; null, bools and containers are not.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) if !s.trim().is_empty() => Some(Self(s.clone())),
            JsonValue::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One flattened job listing.
///
/// `fields` carries every flattened attribute, `id` and `timestamp_fetched`
/// included; `id` is cached separately for membership tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: RecordId,
    pub fields: Map<String, JsonValue>,
}

impl JobPosting {
    /// Builds a posting from a flat row, reading the identifier from `id_field`.
    pub fn from_flat(fields: Map<String, JsonValue>, id_field: &str) -> Option<Self> {
        let id = fields.get(id_field).and_then(RecordId::from_json)?;
        Some(Self { id, fields })
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.fields.get(column)
    }

    pub fn fetched_at_text(&self) -> Option<&str> {
        self.fields.get(TIMESTAMP_FETCHED).and_then(JsonValue::as_str)
    }
}

/// Snapshot of identifiers already present in the destination table.
pub type ExistingIdSet = HashSet<RecordId>;

/// Serializes the fetch instant as text so rows survive a hand-off between processes.
pub fn format_fetched_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DD HH:MM:SS[.f]`, the latter read as UTC.
pub fn parse_fetched_at(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let text = text.trim();
    match DateTime::parse_from_rfc3339(text) {
        Ok(at) => Ok(at.with_timezone(&Utc)),
        Err(rfc_err) => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| rfc_err),
    }
}

/// Fully-qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let table = Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        };
        for part in [&table.project_id, &table.dataset_id, &table.table_id] {
            validate_identifier(part)?;
        }
        Ok(table)
    }

    /// Parses `project.dataset.table`.
    pub fn parse(qualified: &str) -> Result<Self, PipelineError> {
        let parts: Vec<&str> = qualified.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table] => Self::new(*project, *dataset, *table),
            _ => Err(PipelineError::Config(format!(
                "table reference `{qualified}` must look like project.dataset.table"
            ))),
        }
    }

    /// Backtick-quoted table path for SQL.
    pub fn sql_path(&self) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, self.table_id)
    }

    /// Backtick-quoted dataset path for SQL.
    pub fn dataset_sql_path(&self) -> String {
        format!("`{}.{}`", self.project_id, self.dataset_id)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Rejects anything that could escape a backtick-quoted path or a column position.
pub fn validate_identifier(name: &str) -> Result<(), PipelineError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("invalid identifier `{name}`")))
    }
}

/// Column type as reported by the warehouse's information schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Bool,
    Timestamp,
    /// Anything else (JSON, DATE, STRUCT...) is carried as JSON text.
    Other,
}

impl ColumnType {
    pub fn from_warehouse_name(data_type: &str) -> Self {
        match data_type.trim().to_ascii_uppercase().as_str() {
            "STRING" => Self::String,
            "INT64" | "INTEGER" => Self::Int64,
            "FLOAT64" | "FLOAT" | "NUMERIC" | "BIGNUMERIC" => Self::Float64,
            "BOOL" | "BOOLEAN" => Self::Bool,
            "TIMESTAMP" => Self::Timestamp,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationColumn {
    pub name: String,
    pub data_type: ColumnType,
}

impl DestinationColumn {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered column set currently defined on the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DestinationSchema {
    pub columns: Vec<DestinationColumn>,
}

impl DestinationSchema {
    pub fn new(columns: Vec<DestinationColumn>) -> Self {
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Warehouse column names are case-insensitive.
    pub fn find(&self, name: &str) -> Option<&DestinationColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Failure kinds of a pipeline run. Only query failures are fatal.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("job search API reported failure: {0}")]
    ApiLogicFailure(String),
    #[error("warehouse query failed: {0}")]
    QueryFailure(String),
    #[error("bulk load failed: {0}")]
    LoadFailure(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::QueryFailure(_) | Self::Config(_))
    }
}
