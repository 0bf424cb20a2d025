//! Agent bindings: which CLI to run, what to feed it and how to render its output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::AgentError;
use crate::process::{CommandSpec, OutputStream, ProcessSupervisor};
use crate::stream::StreamParser;

const DISPLAY_CAPACITY: usize = 256;

/// Display lines of one run. Closes when the run is over and all output was rendered.
pub struct DisplayStream {
    rx: mpsc::Receiver<String>,
}

impl DisplayStream {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// A supervised agent the iteration loop can drive.
/// Real implementation: `CommandAgent`. Tests use scripted doubles.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Launch one run. Cancelling `cancel` kills it outright.
    async fn start(&self, cancel: CancellationToken) -> Result<DisplayStream, AgentError>;

    /// Wait for the current run to exit and return its raw transcript.
    async fn wait(&self) -> Result<String, AgentError>;

    fn pause(&self) -> Result<(), AgentError>;

    fn resume(&self) -> Result<(), AgentError>;

    /// Graceful terminate with forced kill after a grace window. Idempotent.
    fn kill(&self) -> Result<(), AgentError>;

    fn is_paused(&self) -> bool;

    fn is_running(&self) -> bool;
}

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Claude,
    Amp,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Amp => "amp",
        }
    }

    pub fn default_program(&self) -> &'static str {
        self.as_str()
    }

    /// Prompt file inside the ralph directory that is piped to stdin.
    pub fn prompt_file(&self) -> &'static str {
        match self {
            AgentKind::Claude => "CLAUDE.md",
            AgentKind::Amp => "prompt.md",
        }
    }

    /// Whether output is stream-json that needs rendering.
    pub fn structured_output(&self) -> bool {
        matches!(self, AgentKind::Claude)
    }

    pub fn args(&self, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = match self {
            AgentKind::Claude => [
                "--dangerously-skip-permissions",
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            AgentKind::Amp => vec!["--dangerously-allow-all".to_string()],
        };
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "amp" => Ok(AgentKind::Amp),
            other => Err(format!(
                "unknown agent '{other}' (expected 'claude' or 'amp')"
            )),
        }
    }
}

/// Agent backed by an external CLI under a [`ProcessSupervisor`].
pub struct CommandAgent {
    kind: AgentKind,
    program: String,
    args: Vec<String>,
    prompt_path: PathBuf,
    working_dir: PathBuf,
    supervisor: ProcessSupervisor,
}

impl CommandAgent {
    pub fn new(kind: AgentKind, ralph_dir: &Path, project_dir: &Path, model: Option<&str>) -> Self {
        Self {
            kind,
            program: kind.default_program().to_string(),
            args: kind.args(model),
            prompt_path: ralph_dir.join(kind.prompt_file()),
            working_dir: project_dir.to_path_buf(),
            supervisor: ProcessSupervisor::new(),
        }
    }

    /// Run a different executable with the same arguments and prompt.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn prompt_path(&self) -> &Path {
        &self.prompt_path
    }

    pub fn command(&self, prompt: Vec<u8>) -> CommandSpec {
        CommandSpec::new(&self.program)
            .args(self.args.iter().cloned())
            .current_dir(&self.working_dir)
            .stdin(prompt)
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn start(&self, cancel: CancellationToken) -> Result<DisplayStream, AgentError> {
        let prompt = tokio::fs::read(&self.prompt_path)
            .await
            .map_err(|source| AgentError::PromptRead {
                path: self.prompt_path.clone(),
                source,
            })?;

        let output = self.supervisor.start(self.command(prompt), cancel)?;
        let (tx, rx) = mpsc::channel(DISPLAY_CAPACITY);
        if self.kind.structured_output() {
            tokio::spawn(render_events(output, tx));
        } else {
            tokio::spawn(pass_through(output, tx));
        }
        Ok(DisplayStream::new(rx))
    }

    async fn wait(&self) -> Result<String, AgentError> {
        Ok(self.supervisor.wait().await?)
    }

    fn pause(&self) -> Result<(), AgentError> {
        Ok(self.supervisor.pause()?)
    }

    fn resume(&self) -> Result<(), AgentError> {
        Ok(self.supervisor.resume()?)
    }

    fn kill(&self) -> Result<(), AgentError> {
        Ok(self.supervisor.kill()?)
    }

    fn is_paused(&self) -> bool {
        self.supervisor.is_paused()
    }

    fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }
}

async fn render_events(mut output: OutputStream, tx: mpsc::Sender<String>) {
    let mut parser = StreamParser::new();
    while let Some(line) = output.next_line().await {
        for display in parser.parse_line(&line.text) {
            if tx.send(display).await.is_err() {
                debug!("display receiver dropped, stopping event rendering");
                return;
            }
        }
    }
    for display in parser.flush() {
        if tx.send(display).await.is_err() {
            return;
        }
    }
}

async fn pass_through(mut output: OutputStream, tx: mpsc::Sender<String>) {
    while let Some(line) = output.next_line().await {
        if tx.send(line.text).await.is_err() {
            debug!("display receiver dropped, stopping output forwarding");
            return;
        }
    }
}
