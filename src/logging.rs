//! Diagnostic logging to `.ralph-tui/ralph.log`.
//!
//! The terminal belongs to the live display, so tracing output goes to a file.
//! `RUST_LOG` overrides the default filter.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { "ralph=debug,warn" } else { "ralph=info,warn" }
}

/// Install the global subscriber. Keep the guard alive until exit or buffered
/// lines are lost.
pub fn init(log_file: &Path, verbose: bool) -> Result<WorkerGuard> {
    let dir = log_file
        .parent()
        .context("Log file path has no parent directory")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let file_name = log_file
        .file_name()
        .context("Log file path has no file name")?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;

    Ok(guard)
}
