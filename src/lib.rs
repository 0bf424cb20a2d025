pub mod agent;
pub mod config;
pub mod controller;
pub mod errors;
pub mod logging;
pub mod process;
pub mod ralph_config;
pub mod session;
pub mod stream;
pub mod tasks;
pub mod ui;
