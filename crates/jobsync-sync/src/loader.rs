//! Schema alignment and append-only bulk load of reconciled postings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use jobsync_core::{
    parse_fetched_at, ColumnType, DestinationColumn, DestinationSchema, JobPosting,
    PipelineError, TableRef, TIMESTAMP_FETCHED,
};
use jobsync_storage::{LoadJobConfig, LoadRequest, Warehouse};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::keys::fetch_destination_schema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Nothing new to append.
    Skipped,
    Loaded { rows: u64, job_id: String },
    Failed { error: String },
}

impl LoadOutcome {
    pub fn rows(&self) -> u64 {
        match self {
            Self::Loaded { rows, .. } => *rows,
            Self::Skipped | Self::Failed { .. } => 0,
        }
    }
}

/// A batch aligned to the destination's columns.
#[derive(Debug, Clone)]
pub struct ProjectedBatch {
    pub columns: Vec<DestinationColumn>,
    /// Record fields with no destination column, sorted.
    pub dropped: Vec<String>,
    /// Values that could not be coerced to their column type and became NULL.
    pub coercion_misses: usize,
    pub batch: RecordBatch,
}

/// Appends `records` to `table`.
///
/// Schema lookup failures propagate as [`PipelineError::QueryFailure`]; every
/// other failure is logged and reported as [`LoadOutcome::Failed`].
pub async fn load(
    warehouse: &dyn Warehouse,
    table: &TableRef,
    records: &[JobPosting],
) -> Result<LoadOutcome, PipelineError> {
    if records.is_empty() {
        info!(%table, rows = 0, "no new records; loaded 0 rows");
        return Ok(LoadOutcome::Skipped);
    }

    let fetched_at = match restore_fetched_at(records) {
        Ok(fetched_at) => fetched_at,
        Err(err) => return Ok(failed(table, err)),
    };

    let schema = fetch_destination_schema(warehouse, table).await?;
    let projected = match project(records, &fetched_at, &schema) {
        Ok(projected) => projected,
        Err(err) => return Ok(failed(table, err)),
    };
    info!(
        %table,
        columns = projected.columns.len(),
        "schema check passed; batch aligned to destination columns"
    );
    if !projected.dropped.is_empty() {
        debug!(
            %table,
            dropped = ?projected.dropped,
            "fields not in destination schema were dropped"
        );
    }
    if projected.coercion_misses > 0 {
        warn!(
            %table,
            misses = projected.coercion_misses,
            "values did not match their column type and were loaded as NULL"
        );
    }

    let request = LoadRequest {
        table: table.clone(),
        config: LoadJobConfig::default(),
        batch: projected.batch,
    };
    let job = match warehouse.submit_load(request).await {
        Ok(job) => job,
        Err(err) => return Ok(failed(table, PipelineError::LoadFailure(err.to_string()))),
    };
    match warehouse.wait_for_load(&job).await {
        Ok(result) => {
            info!(
                %table,
                job_id = %job.job_id,
                rows = result.output_rows,
                "successful extraction and load"
            );
            Ok(LoadOutcome::Loaded {
                rows: result.output_rows,
                job_id: job.job_id,
            })
        }
        Err(err) => Ok(failed(table, PipelineError::LoadFailure(err.to_string()))),
    }
}

fn failed(table: &TableRef, err: PipelineError) -> LoadOutcome {
    error!(%table, error = %err, "data load failed");
    LoadOutcome::Failed {
        error: err.to_string(),
    }
}

/// Parses every row's text fetch stamp back into a timestamp.
pub fn restore_fetched_at(
    records: &[JobPosting],
) -> Result<Vec<Option<DateTime<Utc>>>, PipelineError> {
    records
        .iter()
        .map(|record| match record.get(TIMESTAMP_FETCHED) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::String(text)) => parse_fetched_at(text).map(Some).map_err(|e| {
                PipelineError::LoadFailure(format!(
                    "record {}: {TIMESTAMP_FETCHED} `{text}` is not a timestamp: {e}",
                    record.id
                ))
            }),
            Some(other) => Err(PipelineError::LoadFailure(format!(
                "record {}: {TIMESTAMP_FETCHED} must be text, got {other}",
                record.id
            ))),
        })
        .collect()
}

/// Keeps only destination columns that occur in the batch, in destination order.
pub fn project(
    records: &[JobPosting],
    fetched_at: &[Option<DateTime<Utc>>],
    schema: &DestinationSchema,
) -> Result<ProjectedBatch, PipelineError> {
    // destination column name -> record field name
    let mut sources: BTreeMap<&str, &str> = BTreeMap::new();
    let mut dropped = BTreeSet::new();
    for record in records {
        for field in record.fields.keys() {
            match schema.find(field) {
                Some(column) => {
                    sources.entry(column.name.as_str()).or_insert(field.as_str());
                }
                None => {
                    dropped.insert(field.clone());
                }
            }
        }
    }

    let columns: Vec<DestinationColumn> = schema
        .columns
        .iter()
        .filter(|c| sources.contains_key(c.name.as_str()))
        .cloned()
        .collect();
    if columns.is_empty() {
        return Err(PipelineError::LoadFailure(
            "no record field matches a destination column".to_string(),
        ));
    }

    let mut coercion_misses = 0usize;
    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for column in &columns {
        let source = sources[column.name.as_str()];
        let values: Vec<Option<&JsonValue>> = records
            .iter()
            .map(|r| r.fields.get(source).filter(|v| !v.is_null()))
            .collect();

        let (data_type, array): (DataType, ArrayRef) =
            if source == TIMESTAMP_FETCHED && column.data_type == ColumnType::Timestamp {
                (
                    timestamp_type(),
                    Arc::new(
                        TimestampMicrosecondArray::from(
                            fetched_at
                                .iter()
                                .map(|at| at.map(|at| at.timestamp_micros()))
                                .collect::<Vec<_>>(),
                        )
                        .with_timezone("UTC"),
                    ),
                )
            } else {
                build_column(column.data_type, &values, &mut coercion_misses)
            };
        fields.push(ArrowField::new(column.name.clone(), data_type, true));
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| PipelineError::LoadFailure(format!("building record batch: {e}")))?;
    Ok(ProjectedBatch {
        columns,
        dropped: dropped.into_iter().collect(),
        coercion_misses,
        batch,
    })
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn build_column(
    data_type: ColumnType,
    values: &[Option<&JsonValue>],
    misses: &mut usize,
) -> (DataType, ArrayRef) {
    match data_type {
        ColumnType::Int64 => {
            let out: Vec<Option<i64>> = values.iter().map(|v| v.and_then(as_i64)).collect();
            *misses += count_misses(values, &out);
            (DataType::Int64, Arc::new(Int64Array::from(out)))
        }
        ColumnType::Float64 => {
            let out: Vec<Option<f64>> = values.iter().map(|v| v.and_then(as_f64)).collect();
            *misses += count_misses(values, &out);
            (DataType::Float64, Arc::new(Float64Array::from(out)))
        }
        ColumnType::Bool => {
            let out: Vec<Option<bool>> = values.iter().map(|v| v.and_then(as_bool)).collect();
            *misses += count_misses(values, &out);
            (DataType::Boolean, Arc::new(BooleanArray::from(out)))
        }
        ColumnType::Timestamp => {
            let out: Vec<Option<i64>> = values
                .iter()
                .map(|v| v.and_then(as_timestamp_micros))
                .collect();
            *misses += count_misses(values, &out);
            (
                timestamp_type(),
                Arc::new(TimestampMicrosecondArray::from(out).with_timezone("UTC")),
            )
        }
        ColumnType::String | ColumnType::Other => {
            let out: Vec<Option<String>> = values.iter().map(|v| v.map(as_text)).collect();
            (DataType::Utf8, Arc::new(StringArray::from(out)))
        }
    }
}

/// Present inputs whose coerced value came out empty.
fn count_misses<T>(values: &[Option<&JsonValue>], coerced: &[Option<T>]) -> usize {
    values
        .iter()
        .zip(coerced)
        .filter(|(value, out)| value.is_some() && out.is_none())
        .count()
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_timestamp_micros(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::String(s) => parse_fetched_at(s).ok().map(|at| at.timestamp_micros()),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|at| at.timestamp_micros()),
        _ => None,
    }
}

/// Strings verbatim, everything else as JSON text.
fn as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Int64Type, TimestampMicrosecondType};
    use arrow_array::Array;
    use jobsync_core::DestinationColumn;
    use jobsync_storage::MemoryWarehouse;
    use serde_json::{json, Map};

    fn table() -> TableRef {
        TableRef::new("proj", "Raw", "Raw_Data").expect("table")
    }

    fn schema() -> DestinationSchema {
        DestinationSchema::new(vec![
            DestinationColumn::new("ID", ColumnType::Int64),
            DestinationColumn::new("title", ColumnType::String),
            DestinationColumn::new("company_name", ColumnType::String),
            DestinationColumn::new("remote", ColumnType::Bool),
            DestinationColumn::new("salary_min", ColumnType::Float64),
            DestinationColumn::new("timestamp_fetched", ColumnType::Timestamp),
        ])
    }

    fn posting(value: JsonValue) -> JobPosting {
        let fields: Map<String, JsonValue> = value.as_object().expect("object").clone();
        JobPosting::from_flat(fields, "id").expect("posting")
    }

    fn sample() -> Vec<JobPosting> {
        vec![
            posting(json!({
                "id": 1,
                "title": "Data Analyst",
                "company_name": "Acme",
                "location": "Toronto",
                "skills": ["sql"],
                "timestamp_fetched": "2025-02-16T06:00:00.000000Z",
            })),
            posting(json!({
                "id": "2",
                "title": "BI Analyst",
                "remote": "true",
                "timestamp_fetched": "2025-02-16T06:00:00.000000Z",
            })),
        ]
    }

    #[test]
    fn projection_is_an_ordered_subset_of_the_schema() {
        let records = sample();
        let fetched = restore_fetched_at(&records).expect("timestamps");
        let projected = project(&records, &fetched, &schema()).expect("project");

        let names: Vec<&str> = projected.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "title", "company_name", "remote", "timestamp_fetched"]);
        assert_eq!(projected.dropped, vec!["location".to_string(), "skills".to_string()]);

        let batch = &projected.batch;
        assert_eq!(batch.num_rows(), 2);
        let ids = batch.column(0).as_primitive::<Int64Type>();
        assert_eq!((ids.value(0), ids.value(1)), (1, 2));
        let company = batch.column(2).as_string::<i32>();
        assert!(company.is_null(1));
        let remote = batch.column(3).as_boolean();
        assert!(remote.is_null(0));
        assert!(remote.value(1));
    }

    #[test]
    fn fetch_stamp_becomes_a_native_timestamp() {
        let records = sample();
        let fetched = restore_fetched_at(&records).expect("timestamps");
        let projected = project(&records, &fetched, &schema()).expect("project");

        let field = projected.batch.schema().field(4).clone();
        assert_eq!(field.data_type(), &timestamp_type());
        let stamps = projected.batch.column(4).as_primitive::<TimestampMicrosecondType>();
        let expected = parse_fetched_at("2025-02-16T06:00:00Z").expect("ts");
        assert_eq!(stamps.value(0), expected.timestamp_micros());
    }

    #[test]
    fn unparsable_fetch_stamp_is_a_load_failure() {
        let records = vec![posting(json!({ "id": 1, "timestamp_fetched": "not a time" }))];
        let err = restore_fetched_at(&records).expect_err("bad stamp");
        assert!(matches!(err, PipelineError::LoadFailure(_)));
    }

    #[test]
    fn uncoercible_values_become_nulls() {
        let records = vec![posting(json!({ "id": "abc", "salary_min": "n/a" }))];
        let fetched = restore_fetched_at(&records).expect("timestamps");
        let projected = project(&records, &fetched, &schema()).expect("project");
        assert_eq!(projected.coercion_misses, 2);
        assert!(projected.batch.column(0).is_null(0));
    }

    #[test]
    fn schema_with_no_matching_columns_fails() {
        let records = vec![posting(json!({ "id": 1 }))];
        let schema = DestinationSchema::new(vec![DestinationColumn::new("other", ColumnType::String)]);
        let fetched = restore_fetched_at(&records).expect("timestamps");
        assert!(matches!(
            project(&records, &fetched, &schema),
            Err(PipelineError::LoadFailure(_))
        ));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let warehouse = MemoryWarehouse::new();
        let outcome = load(&warehouse, &table(), &[]).await.expect("load");
        assert_eq!(outcome, LoadOutcome::Skipped);
        assert!(warehouse.queries().is_empty());
        assert!(warehouse.loads().is_empty());
    }

    #[tokio::test]
    async fn load_appends_projected_rows() {
        let warehouse = MemoryWarehouse::new();
        warehouse.create_table(&table(), schema());

        let outcome = load(&warehouse, &table(), &sample()).await.expect("load");
        assert_eq!(outcome.rows(), 2);

        let loads = warehouse.loads();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].config, LoadJobConfig::default());
        assert!(loads[0].batch.schema().field_with_name("location").is_err());
        assert_eq!(warehouse.rows(&table()).len(), 2);
    }

    #[tokio::test]
    async fn failed_job_is_reported_not_raised() {
        let warehouse = MemoryWarehouse::new();
        warehouse.create_table(&table(), schema());
        warehouse.fail_loads(Some("quota exceeded"));

        let outcome = load(&warehouse, &table(), &sample()).await.expect("outcome");
        match outcome {
            LoadOutcome::Failed { error } => assert!(error.contains("quota exceeded")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_query_failure_propagates() {
        let warehouse = MemoryWarehouse::new();
        warehouse.create_table(&table(), schema());
        warehouse.fail_queries(Some("connection reset"));

        let err = load(&warehouse, &table(), &sample()).await.expect_err("fatal");
        assert!(matches!(err, PipelineError::QueryFailure(_)));
        assert!(warehouse.loads().is_empty());
    }
}
