use chrono::{DateTime, Local};
use std::time::Duration;

use crate::tasks::TaskRef;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_ITERATION_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";
/// Lines of earlier output kept for the completion check.
pub const HISTORY_LIMIT: usize = 500;

/// Operator requests delivered to a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    TogglePause,
    Pause,
    Resume,
    /// Kill the current run and move on to the next iteration.
    Skip,
    /// Stop everything. Terminal.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Starting,
    Running,
    Evaluating,
    Sleeping,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl LoopStatus {
    pub(crate) fn phase(&self) -> LoopPhase {
        match self {
            LoopStatus::Running => LoopPhase::Running,
            LoopStatus::Completed => LoopPhase::Completed,
            LoopStatus::Failed => LoopPhase::Failed,
            LoopStatus::Interrupted => LoopPhase::Interrupted,
        }
    }
}

/// Point-in-time view of the loop, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSnapshot {
    pub iteration: u32,
    pub max_iterations: u32,
    pub phase: LoopPhase,
    pub status: LoopStatus,
    pub paused: bool,
    pub task: Option<TaskRef>,
    pub completed_tasks: usize,
    pub total_tasks: usize,
}

impl LoopSnapshot {
    pub(crate) fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            phase: LoopPhase::Idle,
            status: LoopStatus::Running,
            paused: false,
            task: None,
            completed_tasks: 0,
            total_tasks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    Continuing,
    /// The agent could not be started.
    Failed(String),
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: u32,
    pub task: TaskRef,
    pub started_at: DateTime<Local>,
    pub outcome: IterationOutcome,
    /// The run was cut short by a skip request.
    pub skipped: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// Everything the loop reports to its observers, in order.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    IterationStarted {
        iteration: u32,
        max_iterations: u32,
        task: TaskRef,
    },
    Output(String),
    Notice {
        level: NoticeLevel,
        text: String,
    },
    IterationFinished(IterationRecord),
    Finished(LoopStatus),
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub iteration_delay: Duration,
    pub completion_marker: String,
    pub history_limit: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            iteration_delay: DEFAULT_ITERATION_DELAY,
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            history_limit: HISTORY_LIMIT,
        }
    }
}

/// Result of a finished loop.
#[derive(Debug)]
pub struct LoopReport {
    pub status: LoopStatus,
    pub iterations: Vec<IterationRecord>,
}
