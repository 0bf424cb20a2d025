//! Iteration loop: runs the agent repeatedly until the completion marker shows up
//! or the iteration budget is spent.

mod runner;
mod state;

pub use runner::{ControllerHandle, IterationController};
pub use state::{
    ControlCommand, DEFAULT_COMPLETION_MARKER, DEFAULT_ITERATION_DELAY, DEFAULT_MAX_ITERATIONS,
    HISTORY_LIMIT, IterationOutcome, IterationRecord, LoopEvent, LoopPhase, LoopReport,
    LoopSettings, LoopSnapshot, LoopStatus, NoticeLevel,
};
