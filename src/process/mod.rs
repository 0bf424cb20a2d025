//! Subprocess supervision for agent runs.

pub mod lines;
pub mod supervisor;

pub use lines::{LineReader, MAX_LINE_BYTES};
pub use supervisor::{
    Channel, CommandSpec, KILL_GRACE, OutputLine, OutputStream, ProcessSupervisor,
};
