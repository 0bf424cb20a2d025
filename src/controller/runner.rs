//! The iteration loop.
//!
//! `Idle → Starting → Running → Evaluating`, then either `Sleeping → Starting` or one
//! of `Completed`, `Failed`, `Interrupted`.
//!
//! The controller is a single task. It suspends on the next display line, the
//! next operator command or the inter-iteration timer, and nothing else. Commands
//! are polled first so an interrupt always wins over output that is already queued.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{
    ControlCommand, IterationOutcome, IterationRecord, LoopEvent, LoopPhase, LoopReport,
    LoopSettings, LoopSnapshot, LoopStatus, NoticeLevel,
};
use crate::agent::Agent;
use crate::session::{IterationLog, LogSink};
use crate::tasks::{TaskRef, TaskSource};

const COMMAND_CAPACITY: usize = 16;
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Caller's side of a controller: send commands, watch state, receive events.
pub struct ControllerHandle {
    pub commands: mpsc::Sender<ControlCommand>,
    pub snapshot: watch::Receiver<LoopSnapshot>,
    pub events: mpsc::UnboundedReceiver<LoopEvent>,
}

/// How a single run ended.
enum RunEnd {
    Drained,
    Skipped,
    Interrupted,
}

/// What the loop should do after an iteration.
enum Verdict {
    Completed,
    NotCompleted,
    Interrupted,
}

pub struct IterationController {
    agent: Arc<dyn Agent>,
    tasks: Box<dyn TaskSource>,
    logs: Box<dyn LogSink>,
    settings: LoopSettings,
    commands: Option<mpsc::Receiver<ControlCommand>>,
    events: mpsc::UnboundedSender<LoopEvent>,
    snapshot: watch::Sender<LoopSnapshot>,
    /// Output of earlier, non-skipped iterations.
    history: VecDeque<String>,
    records: Vec<IterationRecord>,
    iteration: u32,
}

impl IterationController {
    pub fn new(
        agent: Arc<dyn Agent>,
        tasks: Box<dyn TaskSource>,
        logs: Box<dyn LogSink>,
        mut settings: LoopSettings,
    ) -> (Self, ControllerHandle) {
        settings.max_iterations = settings.max_iterations.max(1);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(LoopSnapshot::new(settings.max_iterations));

        let controller = Self {
            agent,
            tasks,
            logs,
            settings,
            commands: Some(command_rx),
            events: event_tx,
            snapshot: snapshot_tx,
            history: VecDeque::new(),
            records: Vec::new(),
            iteration: 0,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            events: event_rx,
        };
        (controller, handle)
    }

    /// Drive iterations until the task is done, the budget is spent or the
    /// operator interrupts.
    pub async fn run(mut self) -> LoopReport {
        info!(
            agent = self.agent.name(),
            max_iterations = self.settings.max_iterations,
            "starting agent loop"
        );
        let status = self.drive().await;

        self.snapshot.send_modify(|s| {
            s.status = status;
            s.phase = status.phase();
            s.paused = false;
        });
        info!(?status, iterations = self.iteration, "agent loop finished");
        self.emit(LoopEvent::Finished(status));

        LoopReport {
            status,
            iterations: self.records,
        }
    }

    async fn drive(&mut self) -> LoopStatus {
        loop {
            self.iteration += 1;
            match self.run_iteration().await {
                Verdict::Completed => {
                    self.notice(NoticeLevel::Info, "All tasks completed!");
                    return LoopStatus::Completed;
                }
                Verdict::Interrupted => {
                    self.notice(NoticeLevel::Warn, "Interrupted.");
                    return LoopStatus::Interrupted;
                }
                Verdict::NotCompleted => {}
            }

            if self.iteration >= self.settings.max_iterations {
                self.notice(
                    NoticeLevel::Warn,
                    format!(
                        "Max iterations ({}) reached without completion.",
                        self.settings.max_iterations
                    ),
                );
                return LoopStatus::Failed;
            }

            let delay = self.settings.iteration_delay;
            self.notice(
                NoticeLevel::Info,
                format!("Iteration complete. Next in {}s...", delay.as_secs_f64()),
            );
            self.set_phase(LoopPhase::Sleeping);
            if self.until_interrupted(tokio::time::sleep(delay)).await.is_none() {
                self.notice(NoticeLevel::Warn, "Interrupted.");
                return LoopStatus::Interrupted;
            }
        }
    }

    async fn run_iteration(&mut self) -> Verdict {
        let iteration = self.iteration;
        self.set_phase(LoopPhase::Starting);

        if let Err(e) = self.tasks.refresh() {
            self.notice(NoticeLevel::Warn, format!("Failed to reload task list: {e:#}"));
        }
        let task = self.tasks.current_task().unwrap_or_else(TaskRef::unknown);
        let completed_tasks = self.tasks.completed_count();
        let total_tasks = self.tasks.total_count();
        self.snapshot.send_modify(|s| {
            s.iteration = iteration;
            s.task = Some(task.clone());
            s.completed_tasks = completed_tasks;
            s.total_tasks = total_tasks;
        });
        info!(iteration, task = %task.id, "starting iteration");
        self.emit(LoopEvent::IterationStarted {
            iteration,
            max_iterations: self.settings.max_iterations,
            task: task.clone(),
        });

        let started_at = Local::now();
        let clock = Instant::now();

        // A skipped run gets SIGTERM and up to the kill grace window to exit.
        if self.agent.is_running() {
            debug!("waiting for the previous run to exit");
            let agent = Arc::clone(&self.agent);
            let reaped = self.until_interrupted(async move { agent.wait().await }).await;
            match reaped {
                None => {
                    self.kill_agent();
                    let outcome = IterationOutcome::Interrupted;
                    self.finish(iteration, task, started_at, clock, outcome, false);
                    return Verdict::Interrupted;
                }
                Some(Err(e)) => debug!(error = %e, "previous run already gone"),
                Some(Ok(_)) => {}
            }
        }

        let mut log = match self.logs.open(&task, self.agent.name()) {
            Ok(log) => Some(log),
            Err(e) => {
                self.notice(NoticeLevel::Warn, format!("Could not open iteration log: {e:#}"));
                None
            }
        };

        let cancel = CancellationToken::new();
        let mut stream = match self.agent.start(cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = e.to_string();
                warn!(iteration, error = %message, "agent failed to start");
                self.notice(NoticeLevel::Error, format!("Agent error: {message}"));
                close_log(log, false, false);
                self.finish(
                    iteration,
                    task,
                    started_at,
                    clock,
                    IterationOutcome::Failed(message),
                    false,
                );
                return Verdict::NotCompleted;
            }
        };

        self.set_phase(LoopPhase::Running);
        let marker = self.settings.completion_marker.clone();
        let mut marker_seen = false;
        let mut produced = Vec::new();

        let end = loop {
            tokio::select! {
                biased;
                command = recv_command(&mut self.commands) => match command {
                    ControlCommand::Interrupt => {
                        cancel.cancel();
                        self.kill_agent();
                        break RunEnd::Interrupted;
                    }
                    ControlCommand::Skip => {
                        self.kill_agent();
                        break RunEnd::Skipped;
                    }
                    ControlCommand::TogglePause => {
                        let paused = self.agent.is_paused();
                        self.set_paused(!paused);
                    }
                    ControlCommand::Pause => self.set_paused(true),
                    ControlCommand::Resume => self.set_paused(false),
                },
                line = stream.next_line() => match line {
                    Some(line) => {
                        if line.contains(&marker) {
                            marker_seen = true;
                        }
                        let write_failed = match log.as_mut() {
                            Some(sink) => sink.write_line(&line).err(),
                            None => None,
                        };
                        if let Some(e) = write_failed {
                            warn!(error = %e, "dropping iteration log after write failure");
                            log = None;
                        }
                        produced.push(line.clone());
                        self.emit(LoopEvent::Output(line));
                    }
                    None => break RunEnd::Drained,
                },
            }
        };
        drop(stream);

        self.set_phase(LoopPhase::Evaluating);
        self.snapshot.send_modify(|s| s.paused = false);

        let (completed, skipped) = match end {
            RunEnd::Interrupted => {
                let agent = Arc::clone(&self.agent);
                if tokio::time::timeout(REAP_TIMEOUT, agent.wait()).await.is_err() {
                    warn!("agent did not exit after interrupt");
                }
                close_log(log, false, marker_seen);
                let outcome = IterationOutcome::Interrupted;
                self.finish(iteration, task, started_at, clock, outcome, false);
                return Verdict::Interrupted;
            }
            RunEnd::Skipped => {
                self.notice(NoticeLevel::Warn, "Skipping iteration...");
                self.remember(produced);
                (false, true)
            }
            RunEnd::Drained => {
                let completed = marker_seen || self.history_has_marker();
                self.remember(produced);
                (completed, false)
            }
        };

        close_log(log, completed, marker_seen);
        let outcome = if completed {
            IterationOutcome::Completed
        } else {
            IterationOutcome::Continuing
        };
        self.finish(iteration, task, started_at, clock, outcome, skipped);

        if completed {
            Verdict::Completed
        } else {
            Verdict::NotCompleted
        }
    }

    /// Await `fut` while still honouring an interrupt. Other commands are ignored
    /// here since nothing is running. `None` means interrupted.
    async fn until_interrupted<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                command = recv_command(&mut self.commands) => match command {
                    ControlCommand::Interrupt => return None,
                    other => debug!(?other, "ignoring command while no run is active"),
                },
                output = &mut fut => return Some(output),
            }
        }
    }

    fn set_paused(&mut self, paused: bool) {
        let result = if paused {
            self.agent.pause()
        } else {
            self.agent.resume()
        };
        match result {
            Ok(()) => {
                self.snapshot.send_modify(|s| s.paused = paused);
                let text = if paused {
                    "⏸ Agent paused"
                } else {
                    "▶ Agent resumed"
                };
                self.notice(NoticeLevel::Info, text);
            }
            Err(e) => {
                let action = if paused { "pause" } else { "resume" };
                self.notice(NoticeLevel::Error, format!("Failed to {action} agent: {e}"));
            }
        }
    }

    fn kill_agent(&mut self) {
        if let Err(e) = self.agent.kill() {
            self.notice(NoticeLevel::Error, format!("Failed to stop agent: {e}"));
        }
    }

    fn history_has_marker(&self) -> bool {
        let marker = self.settings.completion_marker.as_str();
        self.history.iter().any(|line| line.contains(marker))
    }

    fn remember(&mut self, lines: Vec<String>) {
        let limit = self.settings.history_limit;
        self.history.extend(lines);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn finish(
        &mut self,
        iteration: u32,
        task: TaskRef,
        started_at: chrono::DateTime<Local>,
        clock: Instant,
        outcome: IterationOutcome,
        skipped: bool,
    ) {
        let record = IterationRecord {
            iteration,
            task,
            started_at,
            outcome,
            skipped,
            duration: clock.elapsed(),
        };
        info!(
            iteration,
            outcome = ?record.outcome,
            skipped,
            secs = record.duration.as_secs(),
            "iteration finished"
        );
        self.emit(LoopEvent::IterationFinished(record.clone()));
        self.records.push(record);
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.snapshot.send_modify(|s| s.phase = phase);
    }

    fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(LoopEvent::Notice {
            level,
            text: text.into(),
        });
    }

    fn emit(&self, event: LoopEvent) {
        // Observers are optional.
        let _ = self.events.send(event);
    }
}

fn close_log(log: Option<Box<dyn IterationLog>>, completed: bool, marker_seen: bool) {
    if let Some(log) = log
        && let Err(e) = log.close(completed, marker_seen)
    {
        warn!(error = %e, "failed to finish iteration log");
    }
}

/// Next operator command. Pends forever once every sender is gone.
async fn recv_command(commands: &mut Option<mpsc::Receiver<ControlCommand>>) -> ControlCommand {
    loop {
        let Some(rx) = commands.as_mut() else {
            return std::future::pending().await;
        };
        if let Some(command) = rx.recv().await {
            return command;
        }
        *commands = None;
    }
}
