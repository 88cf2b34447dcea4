//! BigQuery REST implementation of [`Warehouse`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};
use uuid::Uuid;

use crate::warehouse::{
    encode_parquet, LoadJob, LoadJobResult, LoadRequest, QueryRequest, Row, Warehouse,
    WarehouseError,
};
use crate::BackoffPolicy;

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Where bearer tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A pre-minted token, e.g. `gcloud auth print-access-token`.
    Static(String),
    /// The GCE/GKE metadata server of the host the job runs on.
    MetadataServer { url: String },
}

impl TokenSource {
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` when set, otherwise the metadata server.
    pub fn from_env() -> Self {
        match std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Self::Static(token.trim().to_string()),
            _ => Self::MetadataServer {
                url: METADATA_TOKEN_URL.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// Project that owns (and is billed for) query jobs.
    pub project_id: String,
    pub base_url: String,
    pub location: Option<String>,
    pub timeout: Duration,
    pub query_timeout_ms: u64,
    pub poll: BackoffPolicy,
    pub max_polls: usize,
}

impl BigQueryConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            location: None,
            timeout: Duration::from_secs(60),
            query_timeout_ms: 10_000,
            poll: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
            },
            max_polls: 120,
        }
    }
}

pub struct BigQueryWarehouse {
    client: reqwest::Client,
    config: BigQueryConfig,
    token: TokenSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiRow {
    #[serde(default)]
    f: Vec<ApiCell>,
}

#[derive(Debug, Deserialize)]
struct ApiCell {
    #[serde(default)]
    v: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<ApiRow>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig, token: TokenSource) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            token,
        })
    }

    async fn bearer(&self) -> Result<String, WarehouseError> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::MetadataServer { url } => {
                let resp = self
                    .client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| WarehouseError::Auth(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(WarehouseError::Auth(format!(
                        "metadata server returned {}",
                        resp.status()
                    )));
                }
                let token: MetadataToken = resp
                    .json()
                    .await
                    .map_err(|e| WarehouseError::Auth(e.to_string()))?;
                Ok(token.access_token)
            }
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/bigquery/v2{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, WarehouseError> {
        let token = self.bearer().await?;
        let resp = request.bearer_auth(token).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(WarehouseError::Api {
                status: status.as_u16(),
                message: api_error_message(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| WarehouseError::Decode(e.to_string()))
    }

    async fn get_query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let mut query: Vec<(&str, String)> =
            vec![("timeoutMs", self.config.query_timeout_ms.to_string())];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let url = self.api_url(&format!(
            "/projects/{}/queries/{}",
            job.project_id, job.job_id
        ));
        self.send_json(self.client.get(url).query(&query)).await
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, WarehouseError> {
        let parameters: Vec<JsonValue> = request
            .parameters
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "parameterType": { "type": "STRING" },
                    "parameterValue": { "value": p.value },
                })
            })
            .collect();
        let mut body = json!({
            "query": request.sql,
            "useLegacySql": false,
            "timeoutMs": self.config.query_timeout_ms,
        });
        if !parameters.is_empty() {
            body["parameterMode"] = json!("NAMED");
            body["queryParameters"] = JsonValue::Array(parameters);
        }
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }

        let url = self.api_url(&format!("/projects/{}/queries", self.config.project_id));
        debug!(sql = %request.sql, "submitting query");
        let mut response: QueryResponse = self.send_json(self.client.post(url).json(&body)).await?;

        let mut rows = Vec::new();
        let mut column_names: Vec<String> = Vec::new();
        let mut polls = 0usize;
        let mut page_token: Option<String> = None;
        loop {
            if response.job_complete {
                if let Some(schema) = response.schema.take() {
                    column_names = schema.fields.into_iter().map(|f| f.name).collect();
                }
                for api_row in response.rows.drain(..) {
                    if api_row.f.len() != column_names.len() {
                        return Err(WarehouseError::Decode(format!(
                            "row has {} cells but schema has {} columns",
                            api_row.f.len(),
                            column_names.len()
                        )));
                    }
                    rows.push(
                        column_names
                            .iter()
                            .cloned()
                            .zip(api_row.f.into_iter().map(|cell| cell.v))
                            .collect::<Row>(),
                    );
                }
                match response.page_token.take() {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            } else {
                if polls >= self.config.max_polls {
                    let job_id = response
                        .job_reference
                        .as_ref()
                        .map(|j| j.job_id.clone())
                        .unwrap_or_default();
                    return Err(WarehouseError::Timeout { job_id, polls });
                }
                tokio::time::sleep(self.config.poll.delay_for_attempt(polls)).await;
                polls += 1;
            }

            let job = response.job_reference.take().ok_or_else(|| {
                WarehouseError::Decode("query response without jobReference".to_string())
            })?;
            response = self.get_query_results(&job, page_token.as_deref()).await?;
            if response.job_reference.is_none() {
                response.job_reference = Some(job);
            }
        }

        debug!(rows = rows.len(), "query finished");
        Ok(rows)
    }

    async fn submit_load(&self, request: LoadRequest) -> Result<LoadJob, WarehouseError> {
        let payload = encode_parquet(&request.batch)?;
        let mut metadata = json!({
            "jobReference": {
                "projectId": request.table.project_id,
                "jobId": format!("jobsync_load_{}", Uuid::new_v4().simple()),
            },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": request.table.project_id,
                        "datasetId": request.table.dataset_id,
                        "tableId": request.table.table_id,
                    },
                    "sourceFormat": request.config.source_format.as_api_str(),
                    "writeDisposition": request.config.write_disposition.as_api_str(),
                }
            }
        });
        if let Some(location) = &self.config.location {
            metadata["jobReference"]["location"] = json!(location);
        }

        let boundary = format!("jobsync_{}", Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &metadata, &payload);
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.config.base_url.trim_end_matches('/'),
            request.table.project_id
        );

        info!(
            table = %request.table,
            rows = request.batch.num_rows(),
            bytes = payload.len(),
            "submitting load job"
        );
        let job: JobResource = self
            .send_json(
                self.client
                    .post(url)
                    .header(
                        CONTENT_TYPE,
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body),
            )
            .await?;

        if let Some(error) = job.status.as_ref().and_then(|s| s.error_result.as_ref()) {
            return Err(WarehouseError::Job {
                job_id: job.job_reference.job_id.clone(),
                message: describe_error(error),
            });
        }

        Ok(LoadJob {
            project_id: job.job_reference.project_id,
            job_id: job.job_reference.job_id,
            location: job.job_reference.location,
        })
    }

    async fn wait_for_load(&self, job: &LoadJob) -> Result<LoadJobResult, WarehouseError> {
        let url = self.api_url(&format!("/projects/{}/jobs/{}", job.project_id, job.job_id));
        for attempt in 0..self.config.max_polls {
            let mut request = self.client.get(&url);
            if let Some(location) = &job.location {
                request = request.query(&[("location", location)]);
            }
            let resource: JobResource = self.send_json(request).await?;
            let Some(status) = resource.status else {
                tokio::time::sleep(self.config.poll.delay_for_attempt(attempt)).await;
                continue;
            };

            if status.state == "DONE" {
                if let Some(error) = status.error_result {
                    return Err(WarehouseError::Job {
                        job_id: job.job_id.clone(),
                        message: describe_error(&error),
                    });
                }
                let output_rows = resource
                    .statistics
                    .and_then(|s| s.load)
                    .and_then(|l| l.output_rows)
                    .map(|rows| {
                        rows.parse::<u64>()
                            .map_err(|e| WarehouseError::Decode(format!("outputRows `{rows}`: {e}")))
                    })
                    .transpose()?
                    .unwrap_or(0);
                return Ok(LoadJobResult { output_rows });
            }

            debug!(job_id = %job.job_id, state = %status.state, "load job still running");
            tokio::time::sleep(self.config.poll.delay_for_attempt(attempt)).await;
        }

        Err(WarehouseError::Timeout {
            job_id: job.job_id.clone(),
            polls: self.config.max_polls,
        })
    }

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>, WarehouseError> {
        let url = self.api_url(&format!("/projects/{project_id}/datasets"));
        let mut datasets = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: DatasetList = self.send_json(request).await?;
            datasets.extend(
                page.datasets
                    .into_iter()
                    .map(|d| d.dataset_reference.dataset_id),
            );
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(datasets)
    }
}

fn multipart_related(boundary: &str, metadata: &JsonValue, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 1024);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(
        format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn describe_error(error: &ErrorProto) -> String {
    match &error.reason {
        Some(reason) => format!("{reason}: {}", error.message),
        None => error.message.clone(),
    }
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow_array::{RecordBatch, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use jobsync_core::TableRef;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::warehouse::LoadJobConfig;

    fn warehouse_for(server: &MockServer) -> BigQueryWarehouse {
        let mut config = BigQueryConfig::new("proj");
        config.base_url = server.uri();
        config.poll = BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        config.max_polls = 3;
        BigQueryWarehouse::new(config, TokenSource::Static("token".into())).expect("client")
    }

    #[tokio::test]
    async fn query_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/proj/queries"))
            .and(header("authorization", "Bearer token"))
            .and(body_partial_json(json!({ "useLegacySql": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "jobReference": { "projectId": "proj", "jobId": "q1", "location": "US" },
                "schema": { "fields": [{ "name": "id", "type": "STRING" }] },
                "rows": [{ "f": [{ "v": "1" }] }, { "f": [{ "v": "2" }] }],
                "pageToken": "next",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/queries/q1"))
            .and(query_param("pageToken", "next"))
            .and(query_param("location", "US"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "rows": [{ "f": [{ "v": "3" }] }],
            })))
            .mount(&server)
            .await;

        let rows = warehouse_for(&server)
            .query(&QueryRequest::new("SELECT id FROM `proj.Raw.Raw_Data`"))
            .await
            .expect("query");
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("2"), json!("3")]);
    }

    #[tokio::test]
    async fn query_parameters_are_sent_named() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/proj/queries"))
            .and(body_partial_json(json!({
                "parameterMode": "NAMED",
                "queryParameters": [{
                    "name": "table_name",
                    "parameterType": { "type": "STRING" },
                    "parameterValue": { "value": "Raw_Data" },
                }],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "jobReference": { "projectId": "proj", "jobId": "q2" },
                "schema": { "fields": [{ "name": "column_name" }] },
                "rows": [{ "f": [{ "v": "id" }] }],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rows = warehouse_for(&server)
            .query(&QueryRequest::new("SELECT column_name ...").with_param("table_name", "Raw_Data"))
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn api_errors_surface_the_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": 404, "message": "Not found: Table proj:Raw.Raw_Data" }
            })))
            .mount(&server)
            .await;

        let err = warehouse_for(&server)
            .query(&QueryRequest::new("SELECT id FROM `proj.Raw.Raw_Data`"))
            .await
            .expect_err("404");
        match err {
            WarehouseError::Api { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("Not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_uploads_parquet_and_polls_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .and(query_param("uploadType", "multipart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "projectId": "proj", "jobId": "load1", "location": "US" },
                "status": { "state": "RUNNING" },
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/load1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "projectId": "proj", "jobId": "load1", "location": "US" },
                "status": { "state": "RUNNING" },
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/load1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "projectId": "proj", "jobId": "load1", "location": "US" },
                "status": { "state": "DONE" },
                "statistics": { "load": { "outputRows": "2" } },
            })))
            .mount(&server)
            .await;

        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec![Some("1"), Some("2")]))],
        )
        .expect("batch");

        let warehouse = warehouse_for(&server);
        let job = warehouse
            .submit_load(LoadRequest {
                table: TableRef::new("proj", "Raw", "Raw_Data").expect("table"),
                config: LoadJobConfig::default(),
                batch,
            })
            .await
            .expect("submit");
        assert_eq!(job.job_id, "load1");
        let result = warehouse.wait_for_load(&job).await.expect("wait");
        assert_eq!(result.output_rows, 2);

        let requests = server.received_requests().await.expect("recorded");
        let upload = requests
            .iter()
            .find(|r| r.url.path().starts_with("/upload/"))
            .expect("upload request");
        let body = String::from_utf8_lossy(&upload.body);
        assert!(body.contains("\"writeDisposition\":\"WRITE_APPEND\""));
        assert!(body.contains("\"sourceFormat\":\"PARQUET\""));
        assert!(body.contains("PAR1"));
    }

    #[tokio::test]
    async fn failed_load_job_reports_error_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/load2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "projectId": "proj", "jobId": "load2" },
                "status": {
                    "state": "DONE",
                    "errorResult": { "reason": "invalid", "message": "Provided Schema does not match" },
                },
            })))
            .mount(&server)
            .await;

        let err = warehouse_for(&server)
            .wait_for_load(&LoadJob {
                project_id: "proj".into(),
                job_id: "load2".into(),
                location: None,
            })
            .await
            .expect_err("job error");
        assert!(err.to_string().contains("Provided Schema does not match"));
    }

    #[tokio::test]
    async fn datasets_are_listed_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/datasets"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "datasets": [{ "datasetReference": { "projectId": "proj", "datasetId": "Curated" } }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/datasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "datasets": [{ "datasetReference": { "projectId": "proj", "datasetId": "Raw" } }],
                "nextPageToken": "p2",
            })))
            .mount(&server)
            .await;

        let datasets = warehouse_for(&server).list_datasets("proj").await.expect("list");
        assert_eq!(datasets, vec!["Raw".to_string(), "Curated".to_string()]);
    }

    #[test]
    fn multipart_body_wraps_metadata_and_payload() {
        let body = multipart_related("b", &json!({"a": 1}), b"DATA");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.starts_with("--b\r\nContent-Type: application/json"));
        assert!(text.contains("{\"a\":1}"));
        assert!(text.ends_with("DATA\r\n--b--\r\n"));
    }
}
