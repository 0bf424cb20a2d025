use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::tasks::TaskRef;

/// Opens one log per iteration.
pub trait LogSink: Send {
    fn open(&mut self, task: &TaskRef, agent: &str) -> Result<Box<dyn IterationLog>>;
}

/// An open iteration log. Closing writes the summary footer.
pub trait IterationLog: Send {
    fn write_line(&mut self, line: &str) -> Result<()>;

    fn close(self: Box<Self>, completed: bool, marker_seen: bool) -> Result<()>;
}

/// Writes `<hash>_<timestamp>_<task>.log` files into a directory.
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    /// Logs go to `<project_dir>/.ralph-tui/iterations`.
    pub fn new(project_dir: &Path) -> Self {
        Self::in_dir(project_dir.join(".ralph-tui").join("iterations"))
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogSink for FileLogSink {
    fn open(&mut self, task: &TaskRef, agent: &str) -> Result<Box<dyn IterationLog>> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create iteration log dir: {}", self.dir.display())
        })?;

        let hash = Uuid::new_v4().simple().to_string();
        let filename = format!(
            "{}_{}_{}.log",
            &hash[..8],
            Local::now().format("%Y-%m-%d_%H-%M-%S"),
            file_safe(&task.id)
        );
        let path = self.dir.join(filename);
        let mut file = File::create(&path)
            .with_context(|| format!("Failed to create iteration log: {}", path.display()))?;

        let header = format!(
            "# Iteration Log\n\n\
             ## Metadata\n\n\
             - **Task ID**: {}\n\
             - **Task Title**: {}\n\
             - **Started At**: {}\n\
             - **Agent**: {}\n\
             --- RAW OUTPUT ---\n\n",
            task.id,
            task.title,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            agent
        );
        file.write_all(header.as_bytes())
            .with_context(|| format!("Failed to write iteration log: {}", path.display()))?;

        Ok(Box::new(FileIterationLog {
            file,
            path,
            started: Instant::now(),
        }))
    }
}

struct FileIterationLog {
    file: File,
    path: PathBuf,
    started: Instant,
}

impl IterationLog for FileIterationLog {
    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}")
            .with_context(|| format!("Failed to write iteration log: {}", self.path.display()))
    }

    fn close(mut self: Box<Self>, completed: bool, marker_seen: bool) -> Result<()> {
        let status = if completed { "completed" } else { "normal" };
        let footer = format!(
            "\n--- END OUTPUT ---\n\n\
             ## Summary\n\n\
             - **Status**: {status}\n\
             - **Task Completed**: {completed}\n\
             - **Promise Detected**: {marker_seen}\n\
             - **Ended At**: {}\n\
             - **Duration**: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            format_duration(self.started.elapsed())
        );
        self.file
            .write_all(footer.as_bytes())
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to finish iteration log: {}", self.path.display()))
    }
}

/// `42s` under a minute, `3m 5s` from there on.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

fn file_safe(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
