//! Job-search API extractor: envelope validation, flattening and fetch stamps.

use chrono::{DateTime, Utc};
use jobsync_core::{format_fetched_at, JobPosting, PipelineError, TIMESTAMP_FETCHED};
use jobsync_storage::{FetchError, GetRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-adapters";

/// Separator used when nested keys are joined into a flat column name.
pub const FLATTEN_SEPARATOR: &str = "_";

/// Field carrying the posting identifier in API payloads.
pub const API_ID_FIELD: &str = "id";

pub const DEFAULT_API_URL: &str = "https://linkedin-api8.p.rapidapi.com/search-jobs";
pub const DEFAULT_API_HOST: &str = "linkedin-api8.p.rapidapi.com";

/// Fixed query sent on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub keywords: String,
    pub location_id: String,
    pub date_posted: String,
    pub sort: String,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            keywords: "Data Analyst".to_string(),
            location_id: "103035651".to_string(),
            date_posted: "past24Hours".to_string(),
            sort: "mostRecent".to_string(),
        }
    }
}

impl SearchQuery {
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("keywords".to_string(), self.keywords.clone()),
            ("locationId".to_string(), self.location_id.clone()),
            ("datePosted".to_string(), self.date_posted.clone()),
            ("sort".to_string(), self.sort.clone()),
        ]
    }
}

/// Everything one extraction call needs; nothing is read from ambient state.
#[derive(Clone)]
pub struct SearchRequest {
    pub url: String,
    pub api_key: String,
    pub api_host: String,
    pub query: SearchQuery,
    pub id_field: String,
}

impl std::fmt::Debug for SearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchRequest")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("api_host", &self.api_host)
            .field("query", &self.query)
            .field("id_field", &self.id_field)
            .finish()
    }
}

impl SearchRequest {
    pub fn to_get_request(&self) -> GetRequest {
        GetRequest {
            url: self.url.clone(),
            headers: vec![
                ("x-rapidapi-key".to_string(), self.api_key.clone()),
                ("x-rapidapi-host".to_string(), self.api_host.clone()),
            ],
            query: self.query.to_pairs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("error fetching data from API: {0}")]
    Fetch(#[from] FetchError),
    #[error("malformed API response: {0}")]
    Malformed(String),
    #[error("API call failed. Response: {0}")]
    ApiFailure(String),
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::ApiFailure(envelope) => PipelineError::ApiLogicFailure(envelope),
            other => PipelineError::ExtractionFailure(other.to_string()),
        }
    }
}

/// Runs one extraction; every failure is logged and yields an empty batch.
pub async fn extract(
    http: &HttpFetcher,
    run_id: Uuid,
    request: &SearchRequest,
) -> Vec<JobPosting> {
    match try_extract(http, run_id, request, Utc::now()).await {
        Ok(postings) => postings,
        Err(err) => {
            let err = PipelineError::from(err);
            error!(%run_id, error = %err, "extraction produced no data");
            Vec::new()
        }
    }
}

pub async fn try_extract(
    http: &HttpFetcher,
    run_id: Uuid,
    request: &SearchRequest,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<JobPosting>, ExtractError> {
    info!(%run_id, url = %request.url, "starting data extraction from job search API");
    let response = http.fetch(run_id, &request.to_get_request()).await?;
    let postings = parse_search_response(&response.body, &request.id_field, fetched_at)?;
    info!(%run_id, records = postings.len(), "today's data extracted");
    Ok(postings)
}

/// Validates the `{success, data}` envelope and flattens every posting.
pub fn parse_search_response(
    body: &[u8],
    id_field: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<JobPosting>, ExtractError> {
    let envelope: JsonValue = serde_json::from_slice(body)
        .map_err(|e| ExtractError::Malformed(format!("body is not JSON: {e}")))?;

    match envelope.get("success").and_then(JsonValue::as_bool) {
        Some(true) => {}
        Some(false) => return Err(ExtractError::ApiFailure(envelope.to_string())),
        None => {
            return Err(ExtractError::Malformed(format!(
                "missing boolean `success`: {envelope}"
            )))
        }
    }
    info!("API call successful, no error messages returned");

    let data = envelope
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ExtractError::Malformed("`data` is not an array".to_string()))?;

    let stamp = JsonValue::String(format_fetched_at(fetched_at));
    let mut postings = Vec::with_capacity(data.len());
    let mut skipped = 0usize;
    for item in data {
        let Some(object) = item.as_object() else {
            skipped += 1;
            continue;
        };
        let mut flat = flatten_record(object, FLATTEN_SEPARATOR);
        flat.insert(TIMESTAMP_FETCHED.to_string(), stamp.clone());
        match JobPosting::from_flat(flat, id_field) {
            Some(posting) => postings.push(posting),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, id_field, "dropped postings without a usable identifier");
    }
    Ok(postings)
}

/// Flattens nested objects, joining keys with `separator`. Arrays and
/// scalars are kept as leaf values; empty objects contribute no key.
pub fn flatten_record(object: &Map<String, JsonValue>, separator: &str) -> Map<String, JsonValue> {
    let mut out = Map::new();
    flatten_into(&mut out, None, object, separator);
    out
}

fn flatten_into(
    out: &mut Map<String, JsonValue>,
    prefix: Option<&str>,
    object: &Map<String, JsonValue>,
    separator: &str,
) {
    for (key, value) in object {
        let name = match prefix {
            Some(prefix) => format!("{prefix}{separator}{key}"),
            None => key.clone(),
        };
        match value {
            JsonValue::Object(inner) => flatten_into(out, Some(&name), inner, separator),
            leaf => {
                out.insert(name, leaf.clone());
            }
        }
    }
}
