//! Warehouse contract: query execution and append-only bulk loads.

use std::collections::BTreeMap;

use arrow_array::RecordBatch;
use async_trait::async_trait;
use jobsync_core::TableRef;
use parquet::arrow::ArrowWriter;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// One result row keyed by column name.
pub type Row = BTreeMap<String, JsonValue>;

/// Named STRING parameter bound into a query as `@name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub sql: String,
    pub parameters: Vec<QueryParameter>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

/// Loads only ever append; there is no truncate variant to pick by mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteDisposition {
    #[default]
    WriteAppend,
}

impl WriteDisposition {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::WriteAppend => "WRITE_APPEND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFormat {
    #[default]
    Parquet,
}

impl SourceFormat {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Parquet => "PARQUET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadJobConfig {
    pub write_disposition: WriteDisposition,
    pub source_format: SourceFormat,
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub table: TableRef,
    pub config: LoadJobConfig,
    pub batch: RecordBatch,
}

/// Handle to a submitted bulk load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub project_id: String,
    pub job_id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadJobResult {
    pub output_rows: u64,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("warehouse returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("obtaining warehouse credentials: {0}")]
    Auth(String),
    #[error("job {job_id} failed: {message}")]
    Job { job_id: String, message: String },
    #[error("job {job_id} did not finish after {polls} polls")]
    Timeout { job_id: String, polls: usize },
    #[error("encoding load payload: {0}")]
    Encode(String),
    #[error("decoding warehouse response: {0}")]
    Decode(String),
    #[error("unsupported statement: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Runs a query to completion and returns every row, across all pages.
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, WarehouseError>;

    async fn submit_load(&self, request: LoadRequest) -> Result<LoadJob, WarehouseError>;

    /// Blocks until the job reaches a terminal state.
    async fn wait_for_load(&self, job: &LoadJob) -> Result<LoadJobResult, WarehouseError>;

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>, WarehouseError>;
}

/// Serializes a record batch into an in-memory Parquet file.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, WarehouseError> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .map_err(|e| WarehouseError::Encode(format!("opening parquet writer: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| WarehouseError::Encode(format!("writing record batch: {e}")))?;
    writer
        .close()
        .map_err(|e| WarehouseError::Encode(format!("closing parquet writer: {e}")))?;
    Ok(buffer)
}
