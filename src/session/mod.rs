//! Per-iteration log files under `.ralph-tui/iterations/`.

pub mod iteration_log;

pub use iteration_log::{FileLogSink, IterationLog, LogSink, format_duration};
