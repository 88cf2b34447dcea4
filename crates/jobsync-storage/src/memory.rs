//! In-process [`Warehouse`] used by tests.
//!
//! It understands the two statement shapes the pipeline issues: a single-column
//! select from a backtick-quoted `project.dataset.table` (the column may be
//! quoted too) and the information-schema column listing bound through
//! `@table_name`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{Array, RecordBatch};
use arrow_schema::DataType;
use async_trait::async_trait;
use chrono::DateTime;
use jobsync_core::{format_fetched_at, ColumnType, DestinationSchema, TableRef};
use serde_json::{json, Value as JsonValue};

use crate::warehouse::{
    LoadJob, LoadJobResult, LoadRequest, QueryRequest, Row, Warehouse, WarehouseError,
};

#[derive(Debug, Default)]
struct MemoryTable {
    schema: DestinationSchema,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    query_failure: Option<String>,
    load_failure: Option<String>,
    pending: BTreeMap<String, u64>,
    loads: Vec<LoadRequest>,
    queries: Vec<QueryRequest>,
    next_job: u64,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table: &TableRef, schema: DestinationSchema) {
        self.lock().tables.insert(
            table.to_string(),
            MemoryTable {
                schema,
                rows: Vec::new(),
            },
        );
    }

    pub fn insert_rows(&self, table: &TableRef, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.lock();
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.rows.extend(rows);
    }

    /// Every query fails with `message` until cleared.
    pub fn fail_queries(&self, message: Option<&str>) {
        self.lock().query_failure = message.map(str::to_string);
    }

    /// Every load job finishes with `message` until cleared.
    pub fn fail_loads(&self, message: Option<&str>) {
        self.lock().load_failure = message.map(str::to_string);
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.lock()
            .tables
            .get(&table.to_string())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn loads(&self) -> Vec<LoadRequest> {
        self.lock().loads.clone()
    }

    pub fn queries(&self) -> Vec<QueryRequest> {
        self.lock().queries.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, WarehouseError> {
        let mut state = self.lock();
        state.queries.push(request.clone());
        if let Some(message) = &state.query_failure {
            return Err(WarehouseError::Api {
                status: 503,
                message: message.clone(),
            });
        }

        let sql = request.sql.trim();
        if sql.contains("INFORMATION_SCHEMA.COLUMNS") {
            let dataset = backticked(sql)
                .ok_or_else(|| WarehouseError::Unsupported(sql.to_string()))?;
            let table_name = request
                .param("table_name")
                .ok_or_else(|| WarehouseError::Unsupported("missing @table_name".to_string()))?;
            let key = format!("{dataset}.{table_name}");
            let Some(table) = state.tables.get(&key) else {
                return Ok(Vec::new());
            };
            return Ok(table
                .schema
                .columns
                .iter()
                .map(|c| {
                    Row::from([
                        ("column_name".to_string(), json!(c.name)),
                        ("data_type".to_string(), json!(type_name(c.data_type))),
                    ])
                })
                .collect());
        }

        let rest = sql
            .strip_prefix("SELECT ")
            .ok_or_else(|| WarehouseError::Unsupported(sql.to_string()))?;
        let (column, from) = rest
            .split_once(" FROM ")
            .ok_or_else(|| WarehouseError::Unsupported(sql.to_string()))?;
        let table_key =
            backticked(from).ok_or_else(|| WarehouseError::Unsupported(sql.to_string()))?;
        let table = state.tables.get(table_key).ok_or_else(|| WarehouseError::Api {
            status: 404,
            message: format!("Not found: Table {table_key}"),
        })?;
        let column = column.trim().trim_matches('`');
        Ok(table
            .rows
            .iter()
            .map(|row| {
                let value = row
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(column))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(JsonValue::Null);
                Row::from([(column.to_string(), value)])
            })
            .collect())
    }

    async fn submit_load(&self, request: LoadRequest) -> Result<LoadJob, WarehouseError> {
        let mut state = self.lock();
        state.next_job += 1;
        let job_id = format!("memory_load_{}", state.next_job);

        let output_rows = if state.load_failure.is_none() {
            let rows = batch_to_rows(&request.batch)?;
            let count = rows.len() as u64;
            state
                .tables
                .entry(request.table.to_string())
                .or_default()
                .rows
                .extend(rows);
            count
        } else {
            0
        };
        state.pending.insert(job_id.clone(), output_rows);
        let project_id = request.table.project_id.clone();
        state.loads.push(request);

        Ok(LoadJob {
            project_id,
            job_id,
            location: None,
        })
    }

    async fn wait_for_load(&self, job: &LoadJob) -> Result<LoadJobResult, WarehouseError> {
        let mut state = self.lock();
        let output_rows = state.pending.remove(&job.job_id).ok_or_else(|| WarehouseError::Job {
            job_id: job.job_id.clone(),
            message: "unknown job".to_string(),
        })?;
        if let Some(message) = &state.load_failure {
            return Err(WarehouseError::Job {
                job_id: job.job_id.clone(),
                message: message.clone(),
            });
        }
        Ok(LoadJobResult { output_rows })
    }

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>, WarehouseError> {
        let state = self.lock();
        if let Some(message) = &state.query_failure {
            return Err(WarehouseError::Api {
                status: 503,
                message: message.clone(),
            });
        }
        let mut datasets: Vec<String> = state
            .tables
            .keys()
            .filter_map(|key| {
                let mut parts = key.split('.');
                match (parts.next(), parts.next()) {
                    (Some(project), Some(dataset)) if project == project_id => {
                        Some(dataset.to_string())
                    }
                    _ => None,
                }
            })
            .collect();
        datasets.dedup();
        Ok(datasets)
    }
}

fn backticked(sql: &str) -> Option<&str> {
    let start = sql.find('`')? + 1;
    let len = sql[start..].find('`')?;
    Some(&sql[start..start + len])
}

fn type_name(data_type: ColumnType) -> &'static str {
    match data_type {
        ColumnType::String => "STRING",
        ColumnType::Int64 => "INT64",
        ColumnType::Float64 => "FLOAT64",
        ColumnType::Bool => "BOOL",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Other => "JSON",
    }
}

fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>, WarehouseError> {
    let schema = batch.schema();
    let mut rows = vec![Row::new(); batch.num_rows()];
    for (index, field) in schema.fields().iter().enumerate() {
        let column = batch.column(index);
        for (row_index, row) in rows.iter_mut().enumerate() {
            let value = if column.is_null(row_index) {
                JsonValue::Null
            } else {
                match field.data_type() {
                    DataType::Utf8 => json!(column.as_string::<i32>().value(row_index)),
                    DataType::Int64 => json!(column.as_primitive::<Int64Type>().value(row_index)),
                    DataType::Float64 => {
                        json!(column.as_primitive::<Float64Type>().value(row_index))
                    }
                    DataType::Boolean => json!(column.as_boolean().value(row_index)),
                    DataType::Timestamp(_, _) => {
                        let micros = column
                            .as_primitive::<TimestampMicrosecondType>()
                            .value(row_index);
                        let at = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                            WarehouseError::Encode(format!("timestamp {micros} out of range"))
                        })?;
                        json!(format_fetched_at(at))
                    }
                    other => {
                        return Err(WarehouseError::Encode(format!(
                            "unsupported column type {other}"
                        )))
                    }
                }
            };
            row.insert(field.name().clone(), value);
        }
    }
    Ok(rows)
}
