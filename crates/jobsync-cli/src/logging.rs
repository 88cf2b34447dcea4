//! Process-wide log sinks: an append-only run log plus stderr.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// `2025-02-16 06:00:00,123 - INFO - message key=value`
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Flushes the run log when the process shuts down.
pub struct LogGuard {
    file: Arc<File>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
    }
}

fn open_log(path: &Path) -> Result<Arc<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    Ok(Arc::new(file))
}

fn file_layer<S>(file: Arc<File>) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .event_format(LineFormat)
        .with_ansi(false)
        .with_writer(file)
        .with_filter(LevelFilter::INFO)
}

/// Installs the global subscriber. Call once, keep the guard until exit.
pub fn init_logging(path: &Path) -> Result<LogGuard> {
    let file = open_log(path)?;
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(file_layer(Arc::clone(&file)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))?;

    Ok(LogGuard { file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn run_log_lines_carry_time_level_and_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("extraction.log");
        std::fs::write(&path, "earlier run\n").expect("seed");

        let file = open_log(&path).expect("open");
        let subscriber = tracing_subscriber::registry().with(file_layer(Arc::clone(&file)));
        tracing::subscriber::with_default(subscriber, || {
            info!(rows = 3, "successful extraction and load");
            warn!("no datasets found");
            debug!("not written");
        });
        drop(LogGuard { file });

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "earlier run");
        assert!(lines[1].contains(" - INFO - successful extraction and load rows=3"));
        assert!(lines[2].ends_with(" - WARN - no datasets found"));
    }
}
