//! Agent process supervisor
//!
//! Owns the conversation with the agent executable. Every message spawns one
//! short-lived process (a job); the supervisor feeds it the prompt, decodes its
//! output, remembers the continuation token it reports and pushes every event
//! to the sink it was built with. Only one job may run at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DecodedRecord, Session, SessionSnapshot, StreamDecoder, StreamEvent};
use crate::process::{
    shutdown, AgentProcess, ExitReason, Invocation, ProcessError, ProcessExit, ProcessResult,
    ProcessSpawner, SpawnedProcess,
};

/// Flags selecting non-interactive, structured-output, permission-bypass mode
pub const STREAM_FLAGS: &[&str] = &[
    "-p",
    "--output-format",
    "stream-json",
    "--verbose",
    "--dangerously-skip-permissions",
];

/// Flag carrying the continuation token when resuming a conversation
pub const RESUME_FLAG: &str = "--resume";

/// Default time a process gets to exit after SIGTERM
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to keep reading output after the process has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra time `stop` allows beyond the grace period for the forced kill
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// Upper bound on retained stderr, in bytes
const STDERR_TAIL_LIMIT: usize = 8 * 1024;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors returned synchronously by supervisor operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Agent is busy with another message")]
    Busy,

    #[error("Supervisor has not been started")]
    NotStarted,

    #[error("Supervisor already started")]
    AlreadyStarted,
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Destination for decoded events
pub trait EventSink: Send + Sync {
    fn push(&self, event: StreamEvent);

    /// A job has claimed the agent; its events follow
    fn job_started(&self, _job_id: Uuid) {}

    /// A job has pushed its terminal event; nothing else of it follows
    fn job_finished(&self, _job_id: Uuid) {}
}

/// How to launch the agent executable
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Executable name or path
    pub executable: String,
    /// Working directory for every job
    pub working_dir: PathBuf,
    /// Arguments appended after the stream flags
    pub extra_args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Time allowed between SIGTERM and SIGKILL
    pub grace_period: Duration,
}

impl AgentCommand {
    /// Create a command with default grace period and no extra arguments
    pub fn new(executable: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Build the invocation for one job, resuming `token` if given
    pub fn invocation(&self, token: Option<&str>) -> Invocation {
        let mut args: Vec<String> = STREAM_FLAGS.iter().map(|s| s.to_string()).collect();
        args.extend(self.extra_args.iter().cloned());
        if let Some(token) = token {
            args.push(RESUME_FLAG.to_string());
            args.push(token.to_string());
        }
        Invocation::new(&self.executable, args, &self.working_dir).with_env(self.env.clone())
    }
}

/// Resolves once a job has emitted its terminal event
#[derive(Debug, Clone)]
pub struct JobCompletion {
    job_id: Uuid,
    done: watch::Receiver<bool>,
}

impl JobCompletion {
    /// Id the job's boundary markers carry
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the job to finish
    pub async fn wait(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }

    #[allow(dead_code)]
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Bookkeeping for the in-flight job
struct JobHandle {
    id: Uuid,
    stop_tx: Option<oneshot::Sender<()>>,
    completion: JobCompletion,
}

#[derive(Default)]
struct SupervisorState {
    session: Option<Session>,
    job: Option<JobHandle>,
}

/// Drives the agent executable, one job at a time
pub struct ProcessSupervisor {
    command: AgentCommand,
    spawner: Arc<dyn ProcessSpawner>,
    sink: Arc<dyn EventSink>,
    state: Arc<RwLock<SupervisorState>>,
}

impl ProcessSupervisor {
    /// Create a supervisor. Nothing runs until `start` is called.
    pub fn new(
        command: AgentCommand,
        spawner: Arc<dyn ProcessSpawner>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            command,
            spawner,
            sink,
            state: Arc::new(RwLock::new(SupervisorState::default())),
        }
    }

    /// Initialize the session. Spawns nothing.
    pub async fn start(&self) -> SupervisorResult<()> {
        let mut state = self.state.write().await;
        if state.session.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let session = Session::new();
        info!(
            "Agent supervisor started (session {}, executable {})",
            session.id(),
            self.command.executable
        );
        state.session = Some(session);
        Ok(())
    }

    /// True once `start` has completed
    pub async fn is_alive(&self) -> bool {
        self.state.read().await.session.is_some()
    }

    /// True while a job is in flight
    pub async fn is_busy(&self) -> bool {
        self.state
            .read()
            .await
            .session
            .as_ref()
            .is_some_and(Session::is_busy)
    }

    pub async fn continuation_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .session
            .as_ref()
            .and_then(|s| s.continuation_token().map(str::to_string))
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.state.read().await.session.as_ref().map(Session::snapshot)
    }

    /// Run the agent on `text`
    ///
    /// Fails with `Busy` while another job is in flight; nothing is spawned in
    /// that case. Spawn failures are reported as an `error` event, not as an
    /// `Err`, so the returned completion always resolves after a terminal event.
    pub async fn send_message(&self, text: &str) -> SupervisorResult<JobCompletion> {
        let job_id = Uuid::new_v4();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        let completion = JobCompletion {
            job_id,
            done: done_rx,
        };

        let (invocation, session_id) = {
            let mut state = self.state.write().await;
            let session = state.session.as_mut().ok_or(SupervisorError::NotStarted)?;
            if !session.begin_job() {
                debug!("Rejecting message while job is in flight");
                return Err(SupervisorError::Busy);
            }
            let invocation = self.command.invocation(session.continuation_token());
            let session_id = session.id();
            state.job = Some(JobHandle {
                id: job_id,
                stop_tx: Some(stop_tx),
                completion: completion.clone(),
            });
            self.sink.job_started(job_id);
            (invocation, session_id)
        };

        info!(
            "Starting job {} ({} bytes, resume: {})",
            job_id,
            text.len(),
            invocation.arg_value(RESUME_FLAG).unwrap_or("none")
        );

        let runner = JobRunner {
            id: job_id,
            session_id,
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&self.state),
            grace_period: self.command.grace_period,
        };

        match self.spawner.spawn(&invocation) {
            Ok(spawned) => {
                tokio::spawn(runner.run(spawned, text.to_string(), stop_rx, done_tx));
            }
            Err(e) => {
                error!("Failed to spawn agent: {}", e);
                let event = StreamEvent::error_with_detail(
                    format!("Failed to start agent: {}", e),
                    json!({ "executable": invocation.executable }),
                );
                runner.finish(event).await;
                let _ = done_tx.send(true);
            }
        }

        Ok(completion)
    }

    /// Terminate the in-flight process, if any
    ///
    /// Sends SIGTERM, escalates to SIGKILL after the grace period, and returns
    /// once the job has emitted its terminal event or a bounded wait expires.
    pub async fn stop(&self) {
        let job = {
            let mut state = self.state.write().await;
            take_stop_request(&mut state)
        };
        self.await_stop(job).await;
    }

    /// Forget the conversation and stop any job
    ///
    /// The token is dropped before the job is signalled, under the same lock
    /// `send_message` claims the session with, so no later job resumes the
    /// old conversation. The stopped job keeps the session busy until it
    /// ends, and tokens it still reports are ignored. Returns the new local
    /// session id.
    pub async fn reset(&self) -> SupervisorResult<Uuid> {
        let (session_id, job) = {
            let mut state = self.state.write().await;
            let session = state.session.as_mut().ok_or(SupervisorError::NotStarted)?;
            session.reset();
            let session_id = session.id();
            info!("Session reset (new session {})", session_id);
            (session_id, take_stop_request(&mut state))
        };
        self.await_stop(job).await;
        Ok(session_id)
    }

    async fn await_stop(&self, job: Option<(Option<oneshot::Sender<()>>, JobCompletion)>) {
        let Some((stop_tx, mut completion)) = job else {
            return;
        };

        if let Some(stop_tx) = stop_tx {
            info!("Stopping in-flight agent process");
            let _ = stop_tx.send(());
        }

        let limit = self.command.grace_period + STOP_MARGIN;
        if tokio::time::timeout(limit, completion.wait()).await.is_err() {
            warn!("Agent job still running {:?} after stop request", limit);
        }
    }
}

/// Take the stop signal of the in-flight job, if any
fn take_stop_request(
    state: &mut SupervisorState,
) -> Option<(Option<oneshot::Sender<()>>, JobCompletion)> {
    state
        .job
        .as_mut()
        .map(|job| (job.stop_tx.take(), job.completion.clone()))
}

/// Consumes one spawned process
struct JobRunner {
    id: Uuid,
    /// Session the job was started in
    session_id: Uuid,
    sink: Arc<dyn EventSink>,
    state: Arc<RwLock<SupervisorState>>,
    grace_period: Duration,
}

impl JobRunner {
    async fn run(
        self,
        spawned: SpawnedProcess,
        input: String,
        stop_rx: oneshot::Receiver<()>,
        done_tx: watch::Sender<bool>,
    ) {
        let SpawnedProcess {
            stdin,
            mut stdout,
            stderr,
            process,
        } = spawned;

        tokio::spawn(write_input(stdin, input));
        let stderr_task = tokio::spawn(collect_stderr(stderr));
        let (exit_tx, mut exit_rx) = oneshot::channel();
        tokio::spawn(watch_process(process, stop_rx, self.grace_period, exit_tx));

        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut exit = None;

        while exit.is_none() {
            tokio::select! {
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for record in decoder.feed_records(&buf[..n]) {
                            self.dispatch(record).await;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read agent stdout: {}", e);
                        break;
                    }
                },
                result = &mut exit_rx => exit = Some(flatten_exit(result)),
            }
        }

        if exit.is_some() {
            // The process is gone; collect what is left in the pipe without
            // waiting on stray holders of its write end.
            let drain = async {
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            for record in decoder.feed_records(&buf[..n]) {
                                self.dispatch(record).await;
                            }
                        }
                    }
                }
            };
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                debug!("Agent stdout still open after exit");
            }
        }

        for record in decoder.finish() {
            self.dispatch(record).await;
        }

        let exit = match exit {
            Some(exit) => exit,
            None => flatten_exit(exit_rx.await),
        };

        let stderr_tail = match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, stderr_task).await {
            Ok(Ok(tail)) => tail,
            _ => String::new(),
        };

        self.finish(terminal_event(exit, &stderr_tail)).await;
        let _ = done_tx.send(true);
    }

    /// Record the continuation token, then forward the record's events
    async fn dispatch(&self, record: DecodedRecord) {
        if let Some(token) = record.session_id.as_deref() {
            let mut state = self.state.write().await;
            match state.session.as_mut() {
                Some(session) if session.id() != self.session_id => {
                    debug!("Ignoring token {} from job of a reset session", token);
                }
                Some(session) => {
                    if session.observe_token(token) {
                        info!("Captured continuation token {}", token);
                    }
                }
                None => {}
            }
        }
        for event in record.events {
            self.sink.push(event);
        }
    }

    /// Clear the busy flag and emit the terminal event
    ///
    /// Both happen under the state lock, so the next job's events cannot
    /// overtake this job's terminal event or its end marker.
    async fn finish(&self, terminal: StreamEvent) {
        let mut state = self.state.write().await;
        if let Some(session) = state.session.as_mut() {
            session.end_job();
        }
        if state.job.as_ref().is_some_and(|job| job.id == self.id) {
            state.job = None;
        }
        debug!("Job {} finished with {}", self.id, terminal.event_type());
        self.sink.push(terminal);
        self.sink.job_finished(self.id);
    }
}

fn flatten_exit(result: Result<ProcessResult<ProcessExit>, oneshot::error::RecvError>) -> ProcessResult<ProcessExit> {
    result.unwrap_or_else(|_| {
        Err(ProcessError::Io(std::io::Error::other(
            "process watcher ended unexpectedly",
        )))
    })
}

fn terminal_event(exit: ProcessResult<ProcessExit>, stderr_tail: &str) -> StreamEvent {
    match exit {
        Ok(exit) if exit.success() => {
            info!("Agent process exited successfully");
            StreamEvent::completed()
        }
        Ok(exit) => {
            let message = match (exit.exit_code, exit.reason) {
                (Some(code), _) => format!("Agent process exited with code {}", code),
                (None, ExitReason::Killed) => "Agent process was killed".to_string(),
                (None, _) => "Agent process terminated by signal".to_string(),
            };
            warn!("{}", message);
            StreamEvent::error_with_detail(
                message,
                json!({
                    "exit_code": exit.exit_code,
                    "stderr": stderr_tail,
                }),
            )
        }
        Err(e) => {
            error!("Agent process error: {}", e);
            StreamEvent::error_with_detail(
                format!("Agent process error: {}", e),
                json!({ "stderr": stderr_tail }),
            )
        }
    }
}

async fn write_input(mut stdin: Box<dyn AsyncWrite + Send + Unpin>, input: String) {
    let result = async {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await
    }
    .await;
    if let Err(e) = result {
        warn!("Failed to write prompt to agent stdin: {}", e);
    }
}

/// Log stderr lines and keep the most recent ones
async fn collect_stderr(stderr: Box<dyn AsyncRead + Send + Unpin>) -> String {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut tail = String::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!("agent stderr: {}", text.trim_end());
                tail.push_str(&text);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let mut cut = tail.len() - STDERR_TAIL_LIMIT;
                    while !tail.is_char_boundary(cut) {
                        cut += 1;
                    }
                    tail.drain(..cut);
                }
            }
            Err(e) => {
                debug!("Stopped reading agent stderr: {}", e);
                break;
            }
        }
    }

    tail
}

/// Wait for the process, terminating it if a stop is requested
async fn watch_process(
    mut process: Box<dyn AgentProcess>,
    mut stop_rx: oneshot::Receiver<()>,
    grace_period: Duration,
    exit_tx: oneshot::Sender<ProcessResult<ProcessExit>>,
) {
    let waited = tokio::select! {
        result = process.wait() => Some(result),
        _ = &mut stop_rx => None,
    };

    let result = match waited {
        Some(result) => result,
        None => shutdown(process.as_mut(), grace_period).await,
    };
    let _ = exit_tx.send(result);
}
