//! Typed error hierarchy for the agent loop.
//!
//! Two enums cover the two subsystems that can fail in ways callers match on:
//! - `SupervisorError`: subprocess start and signal delivery
//! - `AgentError`: agent-level start failures (prompt input, supervisor)
//!
//! Stream parsing never fails outward: malformed events are handled inside
//! [`crate::stream::StreamParser`].

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Errors from the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up {0} pipe")]
    Pipe(&'static str),

    #[error("No running process")]
    NoProcess,

    #[error("Failed to deliver {signal} to process group: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("A run is already active")]
    AlreadyRunning,
}

/// Errors from starting an agent run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to read prompt file at {path}: {source}")]
    PromptRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
