//! The default invocation: run the agent loop with a live display.

use anyhow::{Context, Result};
use console::style;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use ralph::agent::CommandAgent;
use ralph::config::{self, Config, Overrides};
use ralph::controller::{ControlCommand, IterationController, LoopEvent, LoopSnapshot, LoopStatus};
use ralph::logging;
use ralph::session::FileLogSink;
use ralph::tasks::{PrdTaskSource, TaskSource};
use ralph::ui::LiveDisplay;

use crate::Cli;

const EXIT_INTERRUPTED: u8 = 130;

pub async fn run_loop(cli: &Cli) -> Result<ExitCode> {
    let config = Config::resolve(Overrides {
        project_dir: cli.project_dir.clone(),
        ralph_dir: cli.ralph_dir.clone(),
        tool: cli.tool,
        model: cli.model.clone(),
        max_iterations: cli.max_iterations,
        verbose: cli.verbose,
    })?;

    let _log_guard = match logging::init(&config.log_file(), config.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{} {:#}", style("Warning:").yellow().bold(), e);
            None
        }
    };

    warn_duplicate_task_lists(&config);
    if let Err(e) = config.check_prompt_file() {
        eprintln!("{} {:#}", style("Warning:").yellow().bold(), e);
    }

    let tasks = PrdTaskSource::open(&config.prd_path)
        .with_context(|| format!("Failed to load task list: {}", config.prd_path.display()))?;
    let mut agent = CommandAgent::new(
        config.agent,
        &config.ralph_dir,
        &config.project_dir,
        config.model.as_deref(),
    );
    if let Some(program) = &config.agent_command {
        agent = agent.with_program(program.clone());
    }

    print_header(&config, &agent, &tasks);
    info!(
        agent = %config.agent,
        ralph_dir = %config.ralph_dir.display(),
        max_iterations = config.max_iterations,
        "starting loop"
    );

    let (controller, handle) = IterationController::new(
        Arc::new(agent),
        Box::new(tasks),
        Box::new(FileLogSink::new(&config.project_dir)),
        config.loop_settings(),
    );

    spawn_interrupt_listener(handle.commands.clone());
    spawn_key_reader(handle.commands.clone());
    let display = tokio::spawn(render(LiveDisplay::new(), handle.events, handle.snapshot));

    let report = controller.run().await;
    if let Err(e) = display.await {
        warn!(error = %e, "display task failed");
    }

    info!(status = ?report.status, iterations = report.iterations.len(), "loop finished");
    println!(
        "{}",
        style(format!(
            "{} iteration(s). Logs: {}",
            report.iterations.len(),
            config.state_dir.join("iterations").display()
        ))
        .dim()
    );

    Ok(match report.status {
        LoopStatus::Completed => ExitCode::SUCCESS,
        LoopStatus::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        LoopStatus::Failed | LoopStatus::Running => ExitCode::FAILURE,
    })
}

fn print_header(config: &Config, agent: &CommandAgent, tasks: &PrdTaskSource) {
    println!();
    println!("{}", style("Ralph").bold().cyan());
    println!("  Agent:       {}", config.agent);
    println!("  Prompt:      {}", agent.prompt_path().display());
    println!("  Task list:   {}", config.prd_path.display());
    println!(
        "  Stories:     {}/{} complete",
        tasks.completed_count(),
        tasks.total_count()
    );
    println!("  Iterations:  up to {}", config.max_iterations);
    println!(
        "  {}",
        style("Keys: p + Enter pause/resume, s + Enter skip, q + Enter quit").dim()
    );
}

fn warn_duplicate_task_lists(config: &Config) {
    let found = config::find_prd_files(&config.project_dir);
    if found.len() <= 1 {
        return;
    }
    eprintln!(
        "{} found {} prd.json files:",
        style("Warning:").yellow().bold(),
        found.len()
    );
    for path in &found {
        let marker = if *path == config.prd_path { " (using)" } else { "" };
        eprintln!(
            "  {} [{}]{}",
            path.display(),
            config::prd_summary(path),
            marker
        );
    }
}

/// First Ctrl-C interrupts the loop, the second exits immediately.
fn spawn_interrupt_listener(commands: mpsc::Sender<ControlCommand>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let _ = commands.send(ControlCommand::Interrupt).await;
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });
}

pub fn key_command(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "p" | "pause" => Some(ControlCommand::TogglePause),
        "s" | "skip" => Some(ControlCommand::Skip),
        "q" | "quit" => Some(ControlCommand::Interrupt),
        _ => None,
    }
}

/// Reads keys on a plain thread; a blocked stdin read must not hold up
/// runtime shutdown.
fn spawn_key_reader(commands: mpsc::Sender<ControlCommand>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if let Some(command) = key_command(&line)
                && commands.blocking_send(command).is_err()
            {
                break;
            }
        }
    });
}

async fn render(
    display: LiveDisplay,
    mut events: mpsc::UnboundedReceiver<LoopEvent>,
    mut snapshot: watch::Receiver<LoopSnapshot>,
) {
    let mut snapshot_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => display.handle(&event),
                None => break,
            },
            changed = snapshot.changed(), if snapshot_open => {
                if changed.is_ok() {
                    display.update(&snapshot.borrow_and_update());
                } else {
                    snapshot_open = false;
                }
            }
        }
    }
}
