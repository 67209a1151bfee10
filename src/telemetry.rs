use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt};

use crate::config::{TelemetrySettings, TraceSettings, project_dirs};

const TRACE_SUFFIX: &str = ".trace.jsonl";

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_TRACE_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install the global subscriber: compact console output filtered by
/// `RUST_LOG` (default `sidekick=info`), plus an optional JSON trace file.
pub fn init_tracing(service: &str, verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let default_level = if verbose {
        "sidekick=debug"
    } else {
        "sidekick=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let trace_layer = if telemetry.traces.enabled {
        let (file, path) = open_trace_file(service, &telemetry.traces)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = TRACE_GUARD.set(guard);
        let _ = ACTIVE_TRACE_FILE.set(path);
        Some(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
                .with_filter(LevelFilter::TRACE),
        )
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false).with_filter(filter))
        .with(trace_layer);
    subscriber::set_global_default(subscriber).context("failed to install tracing subscriber")?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Trace file written by this process, when trace export is enabled.
pub fn current_trace_file() -> Option<&'static PathBuf> {
    ACTIVE_TRACE_FILE.get()
}

pub fn resolve_trace_directory(settings: &TraceSettings) -> Result<PathBuf> {
    match &settings.directory {
        Some(dir) => Ok(dir.clone()),
        None => Ok(project_dirs()?.cache_dir().join("traces")),
    }
}

fn open_trace_file(service: &str, settings: &TraceSettings) -> Result<(fs::File, PathBuf)> {
    let directory = resolve_trace_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut path = directory.join(format!("{service}-{timestamp}{TRACE_SUFFIX}"));
    let mut counter = 0;
    while path.exists() {
        counter += 1;
        path = directory.join(format!("{service}-{timestamp}-{counter}{TRACE_SUFFIX}"));
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open trace file {}", path.display()))?;
    prune_traces(&directory, settings.max_files, &path)?;
    Ok((file, path))
}

/// Delete all but the newest `max_files` trace files, counting `keep`.
/// `max_files == 0` disables pruning.
pub fn prune_traces(directory: &Path, max_files: usize, keep: &Path) -> Result<usize> {
    if max_files == 0 {
        return Ok(0);
    }

    let mut traces: Vec<(SystemTime, PathBuf)> = fs::read_dir(directory)
        .with_context(|| format!("Failed to read trace directory {}", directory.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path != keep && path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(TRACE_SUFFIX))
        })
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok()?;
            Some((modified, path))
        })
        .collect();

    traces.sort_by_key(|(modified, _)| Reverse(*modified));
    let mut removed = 0;
    for (_, path) in traces.into_iter().skip(max_files.saturating_sub(1)) {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
