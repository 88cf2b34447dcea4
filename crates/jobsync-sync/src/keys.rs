//! Reads of destination-table state: existing identifiers and column layout.

use jobsync_core::{
    ColumnType, DestinationColumn, DestinationSchema, ExistingIdSet, PipelineError, RecordId,
    TableRef,
};
use jobsync_storage::{QueryRequest, Row, Warehouse};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

/// Reads every identifier currently in `table`. A failed query is fatal for the run.
pub async fn fetch_existing_ids(
    warehouse: &dyn Warehouse,
    table: &TableRef,
    id_column: &str,
) -> Result<ExistingIdSet, PipelineError> {
    let request = QueryRequest::new(format!("SELECT `{id_column}` FROM {}", table.sql_path()));
    let rows = warehouse.query(&request).await.map_err(|e| {
        error!(%table, error = %e, "existing id query failed");
        PipelineError::QueryFailure(e.to_string())
    })?;

    let mut ids = ExistingIdSet::with_capacity(rows.len());
    let mut unusable = 0usize;
    for row in &rows {
        match cell(row, id_column) {
            None | Some(JsonValue::Null) => {}
            Some(value) => match RecordId::from_json(value) {
                Some(id) => {
                    ids.insert(id);
                }
                None => unusable += 1,
            },
        }
    }
    if unusable > 0 {
        warn!(%table, unusable, "ignored identifier cells that are not strings or numbers");
    }
    info!(%table, existing = ids.len(), "found existing records in warehouse");
    Ok(ids)
}

/// Reads the destination's columns in ordinal order.
pub async fn fetch_destination_schema(
    warehouse: &dyn Warehouse,
    table: &TableRef,
) -> Result<DestinationSchema, PipelineError> {
    let request = QueryRequest::new(format!(
        "SELECT column_name, data_type FROM {}.INFORMATION_SCHEMA.COLUMNS \
         WHERE table_name = @table_name ORDER BY ordinal_position",
        table.dataset_sql_path()
    ))
    .with_param("table_name", table.table_id.clone());

    let rows = warehouse.query(&request).await.map_err(|e| {
        error!(%table, error = %e, "failed to fetch schema from warehouse");
        PipelineError::QueryFailure(e.to_string())
    })?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = cell(row, "column_name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                PipelineError::QueryFailure("schema row without column_name".to_string())
            })?;
        let data_type = cell(row, "data_type")
            .and_then(JsonValue::as_str)
            .map(ColumnType::from_warehouse_name)
            .unwrap_or(ColumnType::Other);
        columns.push(DestinationColumn::new(name, data_type));
    }

    if columns.is_empty() {
        return Err(PipelineError::QueryFailure(format!(
            "destination table {table} has no columns (does it exist?)"
        )));
    }
    Ok(DestinationSchema::new(columns))
}

fn cell<'a>(row: &'a Row, column: &str) -> Option<&'a JsonValue> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_storage::MemoryWarehouse;
    use serde_json::json;

    fn table() -> TableRef {
        TableRef::new("proj", "Raw", "Raw_Data").expect("table")
    }

    fn warehouse_with_ids(ids: &[JsonValue]) -> MemoryWarehouse {
        let warehouse = MemoryWarehouse::new();
        warehouse.create_table(
            &table(),
            DestinationSchema::new(vec![
                DestinationColumn::new("ID", ColumnType::String),
                DestinationColumn::new("title", ColumnType::String),
                DestinationColumn::new("timestamp_fetched", ColumnType::Timestamp),
            ]),
        );
        warehouse.insert_rows(
            &table(),
            ids.iter()
                .map(|id| Row::from([("ID".to_string(), id.clone())])),
        );
        warehouse
    }

    #[tokio::test]
    async fn existing_ids_are_normalized_and_nulls_skipped() {
        let warehouse = warehouse_with_ids(&[json!("1"), json!(2), JsonValue::Null]);
        let ids = fetch_existing_ids(&warehouse, &table(), "ID")
            .await
            .expect("ids");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&RecordId::new("1")));
        assert!(ids.contains(&RecordId::new("2")));
        assert_eq!(
            warehouse.queries()[0].sql,
            "SELECT `ID` FROM `proj.Raw.Raw_Data`"
        );
    }

    #[tokio::test]
    async fn hyphenated_id_column_is_quoted() {
        let warehouse = MemoryWarehouse::new();
        warehouse.insert_rows(
            &table(),
            [Row::from([("job-id".to_string(), json!("42"))])],
        );
        let ids = fetch_existing_ids(&warehouse, &table(), "job-id")
            .await
            .expect("ids");
        assert_eq!(
            warehouse.queries()[0].sql,
            "SELECT `job-id` FROM `proj.Raw.Raw_Data`"
        );
        assert!(ids.contains(&RecordId::new("42")));
    }

    #[tokio::test]
    async fn id_query_failure_is_fatal() {
        let warehouse = warehouse_with_ids(&[]);
        warehouse.fail_queries(Some("connection refused"));
        let err = fetch_existing_ids(&warehouse, &table(), "ID")
            .await
            .expect_err("failure");
        assert!(matches!(err, PipelineError::QueryFailure(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn schema_is_read_in_ordinal_order_with_bound_table_name() {
        let warehouse = warehouse_with_ids(&[]);
        let schema = fetch_destination_schema(&warehouse, &table())
            .await
            .expect("schema");
        assert_eq!(
            schema.names().collect::<Vec<_>>(),
            vec!["ID", "title", "timestamp_fetched"]
        );
        assert_eq!(schema.columns[2].data_type, ColumnType::Timestamp);

        let query = &warehouse.queries()[0];
        assert!(query.sql.contains("`proj.Raw`.INFORMATION_SCHEMA.COLUMNS"));
        assert_eq!(query.param("table_name"), Some("Raw_Data"));
    }

    #[tokio::test]
    async fn missing_destination_table_is_a_query_failure() {
        let warehouse = MemoryWarehouse::new();
        let err = fetch_destination_schema(&warehouse, &table())
            .await
            .expect_err("no table");
        assert!(matches!(err, PipelineError::QueryFailure(_)));
    }
}
