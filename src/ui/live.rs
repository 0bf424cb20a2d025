use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

use crate::controller::{
    IterationOutcome, IterationRecord, LoopEvent, LoopPhase, LoopSnapshot, LoopStatus,
    NoticeLevel,
};
use crate::session::format_duration;
use crate::ui::icons::{CHECK, CROSS, NEXT, SKIP, SPARKLE, STOP};

const BANNER_WIDTH: usize = 50;

/// Terminal rendering of a running loop.
///
/// Agent output scrolls above a single status spinner. When stderr is not a
/// terminal the spinner is hidden and lines are printed plainly.
pub struct LiveDisplay {
    multi: MultiProgress,
    status: ProgressBar,
}

impl Default for LiveDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveDisplay {
    pub fn new() -> Self {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let status = multi.add(ProgressBar::new_spinner());
        if let Ok(spinner) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            status.set_style(spinner);
        }
        Self { multi, status }
    }

    /// A hidden MultiProgress swallows `println`, so fall back to stdout.
    fn print_line(&self, line: &str) {
        if self.multi.is_hidden() {
            println!("{line}");
        } else if self.multi.println(line).is_err() {
            eprintln!("{line}");
        }
    }

    pub fn handle(&self, event: &LoopEvent) {
        if let LoopEvent::IterationStarted { .. } = event {
            self.status.enable_steady_tick(Duration::from_millis(120));
        }
        for line in format_event(event) {
            self.print_line(&line);
        }
        if let LoopEvent::Finished(status) = event {
            self.status.finish_and_clear();
            self.print_line(&format_final(*status));
        }
    }

    pub fn update(&self, snapshot: &LoopSnapshot) {
        self.status.set_message(format_status(snapshot));
    }
}

/// Lines printed for an event, in order.
pub fn format_event(event: &LoopEvent) -> Vec<String> {
    match event {
        LoopEvent::IterationStarted {
            iteration,
            max_iterations,
            task,
        } => {
            let rule = "═".repeat(BANNER_WIDTH);
            let mut lines = vec![
                String::new(),
                style(&rule).cyan().to_string(),
                style(format!("  Iteration {iteration} / {max_iterations}"))
                    .cyan()
                    .bold()
                    .to_string(),
            ];
            if task.title.is_empty() {
                lines.push(format!("  Task: {}", task.id));
            } else {
                lines.push(format!("  Task: {} {}", style(&task.id).yellow(), task.title));
            }
            lines.push(style(&rule).cyan().to_string());
            lines
        }
        LoopEvent::Output(line) => vec![line.clone()],
        LoopEvent::Notice { level, text } => {
            let styled = match level {
                NoticeLevel::Info => style(text).cyan(),
                NoticeLevel::Warn => style(text).yellow(),
                NoticeLevel::Error => style(text).red().bold(),
            };
            vec![styled.to_string()]
        }
        LoopEvent::IterationFinished(record) => vec![format_record(record)],
        LoopEvent::Finished(_) => Vec::new(),
    }
}

fn format_record(record: &IterationRecord) -> String {
    let (icon, label) = match (&record.outcome, record.skipped) {
        (_, true) => (SKIP, "skipped".to_string()),
        (IterationOutcome::Completed, _) => (CHECK, "completed".to_string()),
        (IterationOutcome::Continuing, _) => (NEXT, "finished".to_string()),
        (IterationOutcome::Failed(reason), _) => (CROSS, format!("failed: {reason}")),
        (IterationOutcome::Interrupted, _) => (STOP, "interrupted".to_string()),
    };
    format!(
        "{}{}",
        icon,
        style(format!(
            "Iteration {} {} after {}",
            record.iteration,
            label,
            format_duration(record.duration)
        ))
        .dim()
    )
}

fn format_final(status: LoopStatus) -> String {
    match status {
        LoopStatus::Completed => {
            format!("{}{}", SPARKLE, style("Loop completed").green().bold())
        }
        LoopStatus::Failed => {
            format!("{}{}", CROSS, style("Loop stopped without completion").red())
        }
        LoopStatus::Interrupted => format!("{}{}", STOP, style("Loop interrupted").yellow()),
        LoopStatus::Running => String::new(),
    }
}

/// One-line status shown next to the spinner.
pub fn format_status(snapshot: &LoopSnapshot) -> String {
    let mut parts = vec![format!(
        "Iteration {}/{}",
        snapshot.iteration, snapshot.max_iterations
    )];
    if let Some(task) = &snapshot.task {
        if task.title.is_empty() {
            parts.push(task.id.clone());
        } else {
            parts.push(format!("{} {}", task.id, task.title));
        }
    }
    if snapshot.total_tasks > 0 {
        parts.push(format!(
            "{}/{} stories done",
            snapshot.completed_tasks, snapshot.total_tasks
        ));
    }
    let mut line = parts.join(" · ");
    if snapshot.paused {
        line.push_str(" [paused: p to resume]");
    } else if snapshot.phase == LoopPhase::Sleeping {
        line.push_str(" (waiting)");
    }
    line
}
