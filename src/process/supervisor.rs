//! Subprocess lifecycle: start, merged output, transcript, signals.
//!
//! A [`ProcessSupervisor`] owns at most one run at a time. The child is placed in
//! its own process group so that stop/continue/terminate reach every descendant
//! (shells, test runners, language servers the agent spawned).
//!
//! Output from stdout and stderr is read by one task per pipe and fanned into a
//! single [`OutputStream`]. A finisher task joins both readers, reaps the child,
//! marks the run done and only then drops the last sender, so a closed stream
//! always means "run over, transcript final".

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lines::LineReader;
use crate::errors::SupervisorError;

/// Time a process group gets to honour SIGTERM before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

const STREAM_CAPACITY: usize = 256;

/// Hints that make common CLIs flush line by line and skip terminal styling.
const OUTPUT_ENV: [(&str, &str); 4] = [
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("COLUMNS", "200"),
    ("LINES", "50"),
];

/// What to run: program, arguments, working directory, stdin payload and extra env.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stdin: Vec<u8>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = payload.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

/// One line of subprocess output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub text: String,
    pub channel: Channel,
    pub received_at: DateTime<Local>,
}

/// Merged stdout/stderr of one run. Ends when the run is done.
///
/// Lines keep their order within a channel; interleaving across channels is
/// whatever order the readers got them in.
pub struct OutputStream {
    rx: mpsc::Receiver<OutputLine>,
}

impl OutputStream {
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

struct Run {
    id: u64,
    pgid: Pid,
    started_at: DateTime<Local>,
    paused: bool,
    transcript: String,
    exit_status: Option<ExitStatus>,
    /// `Some(final transcript)` once the run is done.
    finished: watch::Sender<Option<Arc<str>>>,
}

impl Run {
    fn is_done(&self) -> bool {
        self.finished.borrow().is_some()
    }
}

#[derive(Default)]
struct State {
    run: Option<Run>,
    next_id: u64,
}

impl State {
    fn active(&mut self) -> Option<&mut Run> {
        self.run.as_mut().filter(|run| !run.is_done())
    }

    fn active_with_id(&mut self, id: u64) -> Option<&mut Run> {
        self.active().filter(|run| run.id == id)
    }

    fn with_id(&mut self, id: u64) -> Option<&mut Run> {
        self.run.as_mut().filter(|run| run.id == id)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<(), SupervisorError> {
    signal::killpg(pgid, signal).map_err(|source| SupervisorError::Signal { signal, source })
}

/// ESRCH means the group already exited, which is what a kill wants anyway.
fn ignore_gone(result: Result<(), SupervisorError>) -> Result<(), SupervisorError> {
    match result {
        Err(SupervisorError::Signal {
            source: Errno::ESRCH,
            ..
        }) => Ok(()),
        other => other,
    }
}

/// Runs one subprocess at a time and controls it through its process group.
///
/// Cloning is cheap; clones share the same run. All state transitions happen
/// under a single mutex, and every deferred action re-checks the run id so a
/// stale request never reaches a newer run.
#[derive(Clone)]
pub struct ProcessSupervisor {
    state: Arc<Mutex<State>>,
    kill_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::with_kill_grace(KILL_GRACE)
    }

    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            kill_grace,
        }
    }

    /// Spawn `spec` and return its merged output stream.
    ///
    /// Cancelling `cancel` SIGKILLs the process group of this run. Must be called
    /// from within a Tokio runtime.
    pub fn start(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
    ) -> Result<OutputStream, SupervisorError> {
        let mut state = lock(&self.state);
        if state.active().is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .envs(OUTPUT_ENV)
            .envs(spec.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            return Err(SupervisorError::NoProcess);
        };

        state.next_id += 1;
        let id = state.next_id;
        let (finished, _) = watch::channel(None);
        state.run = Some(Run {
            id,
            pgid: Pid::from_raw(pid as i32),
            started_at: Local::now(),
            paused: false,
            transcript: String::new(),
            exit_status: None,
            finished,
        });
        drop(state);

        info!(run = id, pid, program = %spec.program, "started agent process");

        tokio::spawn(feed_stdin(id, stdin, spec.stdin));

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let readers = [
            tokio::spawn(read_channel(
                Arc::clone(&self.state),
                id,
                stdout,
                Channel::Stdout,
                tx.clone(),
            )),
            tokio::spawn(read_channel(
                Arc::clone(&self.state),
                id,
                stderr,
                Channel::Stderr,
                tx.clone(),
            )),
        ];

        let done = CancellationToken::new();
        tokio::spawn(watch_cancel(
            Arc::clone(&self.state),
            id,
            cancel,
            done.clone(),
        ));
        tokio::spawn(finish_run(
            Arc::clone(&self.state),
            id,
            child,
            readers,
            tx,
            done,
        ));

        Ok(OutputStream { rx })
    }

    /// Wait for the current run to finish and return its full transcript.
    ///
    /// Safe to call while output is still streaming.
    pub async fn wait(&self) -> Result<String, SupervisorError> {
        let mut finished = {
            let state = lock(&self.state);
            state
                .run
                .as_ref()
                .ok_or(SupervisorError::NoProcess)?
                .finished
                .subscribe()
        };
        let transcript = match finished.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        Ok(transcript.map(|t| t.to_string()).unwrap_or_default())
    }

    /// Transcript accumulated so far for the current (or last) run.
    pub fn transcript(&self) -> String {
        lock(&self.state)
            .run
            .as_ref()
            .map(|run| run.transcript.clone())
            .unwrap_or_default()
    }

    /// Stop the whole process group (SIGSTOP).
    pub fn pause(&self) -> Result<(), SupervisorError> {
        let mut state = lock(&self.state);
        let run = state.active().ok_or(SupervisorError::NoProcess)?;
        run.paused = true;
        if let Err(e) = signal_group(run.pgid, Signal::SIGSTOP) {
            run.paused = false;
            return Err(e);
        }
        debug!(run = run.id, "paused agent process group");
        Ok(())
    }

    /// Continue a stopped process group (SIGCONT).
    pub fn resume(&self) -> Result<(), SupervisorError> {
        let mut state = lock(&self.state);
        let run = state.active().ok_or(SupervisorError::NoProcess)?;
        signal_group(run.pgid, Signal::SIGCONT)?;
        run.paused = false;
        debug!(run = run.id, "resumed agent process group");
        Ok(())
    }

    /// Terminate the current run: SIGCONT, SIGTERM, then SIGKILL after the grace
    /// window if the same run is still alive. No-op when nothing is running.
    pub fn kill(&self) -> Result<(), SupervisorError> {
        let id = {
            let mut state = lock(&self.state);
            let Some(run) = state.active() else {
                debug!("kill requested with no active run");
                return Ok(());
            };
            run.paused = false;
            ignore_gone(signal_group(run.pgid, Signal::SIGCONT))?;
            ignore_gone(signal_group(run.pgid, Signal::SIGTERM))?;
            run.id
        };
        info!(run = id, "sent SIGTERM to agent process group");

        let shared = Arc::clone(&self.state);
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut state = lock(&shared);
            if let Some(run) = state.active_with_id(id) {
                warn!(run = id, "process group outlived SIGTERM, sending SIGKILL");
                if let Err(e) = ignore_gone(signal_group(run.pgid, Signal::SIGKILL)) {
                    warn!(run = id, error = %e, "SIGKILL failed");
                }
            }
        });
        Ok(())
    }

    /// Last requested pause state. The OS may not have stopped the group yet.
    pub fn is_paused(&self) -> bool {
        lock(&self.state)
            .active()
            .map(|run| run.paused)
            .unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).active().is_some()
    }

    /// Exit status of the last finished run.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        lock(&self.state).run.as_ref().and_then(|run| run.exit_status)
    }
}

type Pipes = (
    ChildStdin,
    tokio::process::ChildStdout,
    tokio::process::ChildStderr,
);

fn take_pipes(child: &mut Child) -> Result<Pipes, SupervisorError> {
    let stdin = child.stdin.take().ok_or(SupervisorError::Pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SupervisorError::Pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SupervisorError::Pipe("stderr"))?;
    Ok((stdin, stdout, stderr))
}

async fn feed_stdin(id: u64, mut stdin: ChildStdin, payload: Vec<u8>) {
    if let Err(e) = stdin.write_all(&payload).await {
        debug!(run = id, error = %e, "agent closed stdin early");
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(run = id, error = %e, "failed to close agent stdin");
    }
}

async fn read_channel<R: AsyncRead + Unpin>(
    shared: Arc<Mutex<State>>,
    id: u64,
    pipe: R,
    channel: Channel,
    tx: mpsc::Sender<OutputLine>,
) {
    let mut reader = LineReader::new(pipe);
    let mut forwarding = true;
    loop {
        let text = match reader.next_line().await {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(e) => {
                warn!(run = id, ?channel, error = %e, "failed reading agent output");
                break;
            }
        };

        {
            let mut state = lock(&shared);
            if let Some(run) = state.with_id(id) {
                run.transcript.push_str(&text);
                run.transcript.push('\n');
            }
        }

        if forwarding {
            let line = OutputLine {
                text,
                channel,
                received_at: Local::now(),
            };
            if tx.send(line).await.is_err() {
                debug!(run = id, ?channel, "output receiver dropped, draining pipe");
                forwarding = false;
            }
        }
    }
}

async fn watch_cancel(
    shared: Arc<Mutex<State>>,
    id: u64,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            let mut state = lock(&shared);
            if let Some(run) = state.active_with_id(id) {
                warn!(run = id, "run cancelled, killing process group");
                run.paused = false;
                let _ = ignore_gone(signal_group(run.pgid, Signal::SIGCONT));
                if let Err(e) = ignore_gone(signal_group(run.pgid, Signal::SIGKILL)) {
                    warn!(run = id, error = %e, "SIGKILL failed");
                }
            }
        }
        _ = done.cancelled() => {}
    }
}

async fn finish_run(
    shared: Arc<Mutex<State>>,
    id: u64,
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    tx: mpsc::Sender<OutputLine>,
    done: CancellationToken,
) {
    for reader in readers {
        if let Err(e) = reader.await {
            warn!(run = id, error = %e, "output reader task failed");
        }
    }

    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(run = id, error = %e, "failed to wait for agent process");
            None
        }
    };

    let elapsed_ms = {
        let mut state = lock(&shared);
        state.with_id(id).map(|run| {
            run.exit_status = status;
            run.paused = false;
            let transcript: Arc<str> = Arc::from(run.transcript.as_str());
            run.finished.send_replace(Some(transcript));
            (Local::now() - run.started_at).num_milliseconds()
        })
    };
    done.cancel();
    info!(run = id, ?status, ?elapsed_ms, "agent process finished");

    drop(tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::time::timeout;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    async fn drain(mut stream: OutputStream) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await {
            lines.push(line);
        }
        lines
    }

    async fn drain_within(stream: OutputStream, secs: u64) -> Vec<OutputLine> {
        timeout(Duration::from_secs(secs), drain(stream))
            .await
            .expect("stream did not close in time")
    }

    #[tokio::test]
    async fn test_merges_stdout_and_stderr() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(sh("echo out1; echo err1 >&2; echo out2"), CancellationToken::new())
            .unwrap();
        let lines = drain_within(stream, 10).await;

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.channel == Channel::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        let stderr: Vec<_> = lines
            .iter()
            .filter(|l| l.channel == Channel::Stderr)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["out1", "out2"]);
        assert_eq!(stderr, vec!["err1"]);
    }

    #[tokio::test]
    async fn test_stream_close_means_done() {
        let sup = ProcessSupervisor::new();
        let stream = sup.start(sh("echo hi; exit 3"), CancellationToken::new()).unwrap();
        drain_within(stream, 10).await;

        assert!(!sup.is_running());
        assert_eq!(sup.exit_status().and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_wait_returns_full_transcript() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(sh("echo a; echo b >&2; echo c"), CancellationToken::new())
            .unwrap();

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.wait().await })
        };
        drain_within(stream, 10).await;
        let transcript = waiter.await.unwrap().unwrap();

        let mut lines: Vec<_> = transcript.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert!(transcript.ends_with('\n'));
        assert_eq!(sup.transcript(), transcript);
    }

    #[tokio::test]
    async fn test_wait_without_run_is_no_process() {
        let sup = ProcessSupervisor::new();
        assert!(matches!(sup.wait().await, Err(SupervisorError::NoProcess)));
    }

    #[tokio::test]
    async fn test_stdin_payload_is_delivered() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(
                CommandSpec::new("cat").stdin("hello\nworld\n"),
                CancellationToken::new(),
            )
            .unwrap();
        let lines = drain_within(stream, 10).await;
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_environment_hints_are_set() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(
                sh("echo $TERM $NO_COLOR $EXTRA").env("EXTRA", "yes"),
                CancellationToken::new(),
            )
            .unwrap();
        let lines = drain_within(stream, 10).await;
        assert_eq!(lines[0].text, "dumb 1 yes");
    }

    #[tokio::test]
    async fn test_working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(sh("pwd").current_dir(dir.path()), CancellationToken::new())
            .unwrap();
        let lines = drain_within(stream, 10).await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(&lines[0].text).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = ProcessSupervisor::new();
        let result = sup.start(
            CommandSpec::new("/definitely/not/a/real/agent"),
            CancellationToken::new(),
        );
        match result {
            Err(SupervisorError::Spawn { program, .. }) => {
                assert_eq!(program, "/definitely/not/a/real/agent")
            }
            other => panic!("Expected Spawn error, got {:?}", other.err()),
        }
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let sup = ProcessSupervisor::new();
        let stream = sup.start(sh("sleep 30"), CancellationToken::new()).unwrap();
        let second = sup.start(sh("echo nope"), CancellationToken::new());
        assert!(matches!(second, Err(SupervisorError::AlreadyRunning)));

        sup.kill().unwrap();
        drain_within(stream, 10).await;

        let third = sup.start(sh("echo again"), CancellationToken::new()).unwrap();
        let lines = drain_within(third, 10).await;
        assert_eq!(lines[0].text, "again");
    }

    #[tokio::test]
    async fn test_pause_then_resume_keeps_run_alive() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(sh("sleep 0.3; echo finished"), CancellationToken::new())
            .unwrap();

        sup.pause().unwrap();
        assert!(sup.is_paused());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sup.is_running());

        sup.resume().unwrap();
        assert!(!sup.is_paused());

        let lines = drain_within(stream, 10).await;
        assert_eq!(lines.last().map(|l| l.text.as_str()), Some("finished"));
        assert_eq!(sup.exit_status().and_then(|s| s.code()), Some(0));
    }

    #[tokio::test]
    async fn test_signals_without_run_are_no_process() {
        let sup = ProcessSupervisor::new();
        assert!(matches!(sup.pause(), Err(SupervisorError::NoProcess)));
        assert!(matches!(sup.resume(), Err(SupervisorError::NoProcess)));
        assert!(!sup.is_paused());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let sup = ProcessSupervisor::new();
        sup.kill().unwrap();

        let stream = sup.start(sh("sleep 30"), CancellationToken::new()).unwrap();
        sup.kill().unwrap();
        sup.kill().unwrap();
        drain_within(stream, 10).await;

        sup.kill().unwrap();
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_kill_reaches_whole_process_group() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(sh("sleep 30 & sleep 30 & wait"), CancellationToken::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.kill().unwrap();
        drain_within(stream, 10).await;
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_kill_escalates_when_sigterm_ignored() {
        let sup = ProcessSupervisor::with_kill_grace(Duration::from_millis(200));
        let stream = sup
            .start(sh("trap '' TERM; echo ready; sleep 30"), CancellationToken::new())
            .unwrap();
        let mut stream = stream;
        let first = timeout(Duration::from_secs(5), stream.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.text, "ready");

        let started = Instant::now();
        sup.kill().unwrap();
        drain_within(stream, 10).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_kill_while_paused_terminates() {
        let sup = ProcessSupervisor::new();
        let stream = sup.start(sh("sleep 30"), CancellationToken::new()).unwrap();
        sup.pause().unwrap();
        sup.kill().unwrap();
        assert!(!sup.is_paused());
        drain_within(stream, 10).await;
    }

    #[tokio::test]
    async fn test_cancel_token_kills_run() {
        let sup = ProcessSupervisor::new();
        let cancel = CancellationToken::new();
        let stream = sup.start(sh("sleep 30"), cancel.clone()).unwrap();
        cancel.cancel();
        drain_within(stream, 10).await;
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_block_process() {
        let sup = ProcessSupervisor::new();
        let stream = sup
            .start(
                sh("i=0; while [ $i -lt 2000 ]; do echo line$i; i=$((i+1)); done"),
                CancellationToken::new(),
            )
            .unwrap();
        drop(stream);
        let transcript = timeout(Duration::from_secs(10), sup.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transcript.lines().count(), 2000);
    }
}
