//! CLI command implementations.
//!
//! | Module   | Handles                        |
//! |----------|--------------------------------|
//! | `run`    | the default loop invocation    |
//! | `config` | `Config`                       |

pub mod config;
pub mod run;

pub use config::cmd_config;
pub use run::run_loop;
