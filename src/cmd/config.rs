//! Configuration view and creation commands: `ralph config`.

use anyhow::{Context, Result};
use std::path::Path;

use ralph::ralph_config::RalphConfig;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: Option<&Path>, command: Option<&ConfigCommands>) -> Result<()> {
    let project_dir = match project_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config_path = RalphConfig::path(&project_dir);

    match command {
        None | Some(ConfigCommands::Show) => show(&project_dir, &config_path),
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("config.toml already exists at {}", config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }
            let written = RalphConfig::default().save(&project_dir)?;
            println!("Created config.toml at {}", written.display());
            println!();
            println!("You can now customize:");
            println!("  - agent, maxIterations, iterationDelayMs");
            println!("  - [agentOptions] command, model");
            Ok(())
        }
    }
}

fn show(project_dir: &Path, config_path: &Path) -> Result<()> {
    println!();
    println!("Ralph Configuration");
    println!("===================");
    println!();

    let config = if config_path.exists() {
        println!("Config file: {}", config_path.display());
        RalphConfig::load(config_path)?
    } else {
        println!("No config.toml found at {}", config_path.display());
        println!("Using defaults. Run 'ralph config init' to create one.");
        RalphConfig::default()
    };
    println!();

    println!("  agent = \"{}\"", config.agent);
    println!("  maxIterations = {}", config.max_iterations);
    println!("  iterationDelayMs = {}", config.iteration_delay_ms);
    println!("  completionMarker = \"{}\"", config.completion_marker);
    println!("  tracker = \"{}\"", config.tracker);
    println!("  autoCommit = {}", config.auto_commit);
    if let Some(command) = &config.agent_options.command {
        println!("  agentOptions.command = \"{}\"", command);
    }
    if let Some(model) = &config.agent_options.model {
        println!("  agentOptions.model = \"{}\"", model);
    }
    println!();

    match ralph::config::resolve_ralph_dir(None, None, project_dir) {
        Some(dir) => println!("Task list: {}", dir.join(ralph::config::PRD_FILE).display()),
        None => println!("Task list: not found (use --ralph-dir)"),
    }
    println!();
    Ok(())
}
