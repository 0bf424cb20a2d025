use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

use ralph::agent::AgentKind;

mod cmd;

#[derive(Parser)]
#[command(name = "ralph")]
#[command(version, about = "Run a coding agent in a loop until the task list is done")]
pub struct Cli {
    /// Agent to run: 'amp' or 'claude'. Overrides config.toml.
    #[arg(long, value_parser = parse_tool)]
    pub tool: Option<AgentKind>,

    /// Model passed to the agent CLI
    #[arg(long)]
    pub model: Option<String>,

    /// Maximum iterations; non-positive values fall back to config.toml
    #[arg(long, allow_negative_numbers = true)]
    pub max_iterations: Option<i64>,

    /// Directory holding prd.json and the prompt files
    #[arg(long)]
    pub ralph_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// View or create .ralph-tui/config.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a config.toml with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_tool(value: &str) -> Result<AgentKind, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid tool '{value}'. Must be 'amp' or 'claude'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Some(Commands::Config { command }) => {
            cmd::cmd_config(cli.project_dir.as_deref(), command.as_ref())
                .map(|()| ExitCode::SUCCESS)
        }
        None => cmd::run_loop(&cli).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
