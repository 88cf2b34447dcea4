//! Process configuration, read once at startup and passed down explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jobsync_adapters::{
    SearchQuery, SearchRequest, API_ID_FIELD, DEFAULT_API_HOST, DEFAULT_API_URL,
};
use jobsync_core::{validate_identifier, TableRef};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first).
    pub cron: String,
    pub retries: usize,
    pub retry_delay: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 6 * * *".to_string(),
            retries: 1,
            retry_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub api_url: String,
    pub api_host: String,
    pub api_key: String,
    pub query: SearchQuery,
    pub table: TableRef,
    pub id_column: String,
    pub warehouse_location: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub reports_dir: Option<PathBuf>,
    pub schedule: ScheduleConfig,
    pub log_file: PathBuf,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("api_url", &self.api_url)
            .field("api_host", &self.api_host)
            .field("api_key", &"<redacted>")
            .field("query", &self.query)
            .field("table", &self.table)
            .field("id_column", &self.id_column)
            .field("warehouse_location", &self.warehouse_location)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("http_max_retries", &self.http_max_retries)
            .field("reports_dir", &self.reports_dir)
            .field("schedule", &self.schedule)
            .field("log_file", &self.log_file)
            .finish()
    }
}

/// Optional YAML overlay for the search and destination settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default)]
    pub search: Option<SearchQuery>,
    #[serde(default)]
    pub destination: Option<DestinationFile>,
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationFile {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl PipelineConfig {
    /// Loads `.env` if present, then reads the process environment. Fails
    /// when `API_KEY` is missing or `.env` exists but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        tolerate_missing_dotenv(dotenvy::dotenv())?;
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        if let Ok(path) = std::env::var("JOBSYNC_CONFIG") {
            config.apply_file(&ConfigFile::read(Path::new(&path))?)?;
        }
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = var("API_KEY").ok_or_else(|| {
            anyhow!("API_KEY is not set; export it or add it to a local .env file")
        })?;

        let defaults = SearchQuery::default();
        let query = SearchQuery {
            keywords: var("JOBSYNC_KEYWORDS").unwrap_or(defaults.keywords),
            location_id: var("JOBSYNC_LOCATION_ID").unwrap_or(defaults.location_id),
            date_posted: var("JOBSYNC_DATE_POSTED").unwrap_or(defaults.date_posted),
            sort: var("JOBSYNC_SORT").unwrap_or(defaults.sort),
        };

        let table = TableRef::new(
            var("JOBSYNC_PROJECT_ID").unwrap_or_else(|| "linkedinapidatapipeline".to_string()),
            var("JOBSYNC_DATASET_ID").unwrap_or_else(|| "Raw".to_string()),
            var("JOBSYNC_TABLE_ID").unwrap_or_else(|| "Raw_Data".to_string()),
        )?;
        let id_column = var("JOBSYNC_ID_COLUMN").unwrap_or_else(|| "id".to_string());
        validate_identifier(&id_column)?;

        let defaults = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            cron: var("JOBSYNC_SCHEDULE").unwrap_or(defaults.cron),
            retries: parse_var(&var, "JOBSYNC_RETRIES")?.unwrap_or(defaults.retries),
            retry_delay: parse_var(&var, "JOBSYNC_RETRY_DELAY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        };

        Ok(Self {
            api_url: var("JOBSYNC_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_host: var("JOBSYNC_API_HOST").unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
            api_key,
            query,
            table,
            id_column,
            warehouse_location: var("JOBSYNC_WAREHOUSE_LOCATION"),
            user_agent: var("JOBSYNC_USER_AGENT").unwrap_or_else(|| "jobsync/0.1".to_string()),
            http_timeout_secs: parse_var(&var, "JOBSYNC_HTTP_TIMEOUT_SECS")?.unwrap_or(20),
            http_max_retries: parse_var(&var, "JOBSYNC_HTTP_MAX_RETRIES")?.unwrap_or(0),
            reports_dir: var("JOBSYNC_REPORTS_DIR").map(PathBuf::from),
            schedule,
            log_file: var("JOBSYNC_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("extraction.log")),
        })
    }

    pub fn apply_file(&mut self, file: &ConfigFile) -> Result<()> {
        if let Some(url) = &file.api_url {
            self.api_url = url.clone();
        }
        if let Some(host) = &file.api_host {
            self.api_host = host.clone();
        }
        if let Some(search) = &file.search {
            self.query = search.clone();
        }
        if let Some(dest) = &file.destination {
            self.table = TableRef::new(&dest.project_id, &dest.dataset_id, &dest.table_id)?;
            if let Some(id_column) = &dest.id_column {
                validate_identifier(id_column)?;
                self.id_column = id_column.clone();
            }
            if dest.location.is_some() {
                self.warehouse_location = dest.location.clone();
            }
        }
        if let Some(cron) = &file.schedule {
            self.schedule.cron = cron.clone();
        }
        Ok(())
    }

    pub fn search_request(&self) -> SearchRequest {
        SearchRequest {
            url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            api_host: self.api_host.clone(),
            query: self.query.clone(),
            id_field: API_ID_FIELD.to_string(),
        }
    }
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// A missing `.env` is fine; an unreadable or malformed one is not.
fn tolerate_missing_dotenv<T>(loaded: std::result::Result<T, dotenvy::Error>) -> Result<()> {
    match loaded {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(anyhow!("loading .env: {err}")),
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("{name} must be a number: {e}"))
        })
        .transpose()
}
