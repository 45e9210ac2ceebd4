//! In-memory process spawner for tests
//!
//! Records every invocation and hands out fake processes backed by
//! `tokio::io::duplex` pipes, so supervisor behavior can be exercised without
//! an agent executable installed.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use super::{AgentProcess, Invocation, ProcessError, ProcessExit, ProcessResult, ProcessSpawner, SpawnedProcess};

const PIPE_CAPACITY: usize = 64 * 1024;

/// What the next spawned process does
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Print `stdout`/`stderr`, then exit with `code`
    Exit {
        stdout: String,
        stderr: String,
        code: i32,
    },
    /// Stay running; the test drives it through a `MockControl`
    Hold {
        /// Whether SIGTERM makes the process exit
        honor_terminate: bool,
    },
    /// Fail to launch
    FailSpawn,
}

impl MockBehavior {
    pub fn exit_with(stdout: impl Into<String>, code: i32) -> Self {
        MockBehavior::Exit {
            stdout: stdout.into(),
            stderr: String::new(),
            code,
        }
    }

    pub fn hold() -> Self {
        MockBehavior::Hold {
            honor_terminate: true,
        }
    }
}

/// Test-side handle to a held process
pub struct MockControl {
    /// Write end of the process's stdout
    pub stdout: DuplexStream,
    /// Read end of the process's stdin
    pub stdin: DuplexStream,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    terminated: Arc<AtomicBool>,
}

impl MockControl {
    /// Write raw bytes to the process's stdout
    pub async fn emit(&mut self, data: &str) {
        self.stdout.write_all(data.as_bytes()).await.unwrap();
        self.stdout.flush().await.unwrap();
    }

    /// Close stdout and exit with `code`
    pub fn exit(self, code: i32) {
        drop(self.stdout);
        let _ = self.exit_tx.send(Some(ProcessExit::code(code)));
    }

    /// Exit with `code` while stdout stays open, as when a grandchild
    /// inherited it
    pub fn exit_leaving_stdout_open(&self, code: i32) {
        let _ = self.exit_tx.send(Some(ProcessExit::code(code)));
    }

    /// Whether the supervisor asked the process to terminate
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Everything written to stdin until it was closed
    pub async fn read_stdin(&mut self) -> String {
        let mut input = String::new();
        self.stdin.read_to_string(&mut input).await.unwrap();
        input
    }
}

/// Spawner that records invocations and plays back scripted behaviors
pub struct MockSpawner {
    invocations: Mutex<Vec<Invocation>>,
    behaviors: Mutex<VecDeque<MockBehavior>>,
    inputs: Arc<Mutex<Vec<String>>>,
    controls_tx: mpsc::UnboundedSender<MockControl>,
    controls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockControl>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        Self {
            invocations: Mutex::new(Vec::new()),
            behaviors: Mutex::new(VecDeque::new()),
            inputs: Arc::new(Mutex::new(Vec::new())),
            controls_tx,
            controls_rx: tokio::sync::Mutex::new(controls_rx),
        }
    }

    /// Queue the behavior of a future spawn. With an empty queue, processes exit 0 silently.
    pub fn push(&self, behavior: MockBehavior) -> &Self {
        self.behaviors.lock().unwrap().push_back(behavior);
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn last_invocation(&self) -> Option<Invocation> {
        self.invocations.lock().unwrap().last().cloned()
    }

    /// Stdin contents of finished `Exit` processes, in spawn order
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    /// Wait for the control handle of the next `Hold` process
    pub async fn next_control(&self) -> MockControl {
        self.controls_rx.lock().await.recv().await.unwrap()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, invocation: &Invocation) -> ProcessResult<SpawnedProcess> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockBehavior::exit_with("", 0));

        let (stdin_ours, stdin_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_ours, mut stdout_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_ours, mut stderr_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminated = Arc::new(AtomicBool::new(false));

        let honor_terminate = match behavior {
            MockBehavior::FailSpawn => {
                return Err(ProcessError::SpawnFailed {
                    executable: invocation.executable.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                });
            }
            MockBehavior::Exit {
                stdout,
                stderr,
                code,
            } => {
                let inputs = Arc::clone(&self.inputs);
                let mut stdin_theirs = stdin_theirs;
                tokio::spawn(async move {
                    let mut input = String::new();
                    let _ = stdin_theirs.read_to_string(&mut input).await;
                    inputs.lock().unwrap().push(input);

                    let _ = stderr_theirs.write_all(stderr.as_bytes()).await;
                    drop(stderr_theirs);
                    let _ = stdout_theirs.write_all(stdout.as_bytes()).await;
                    drop(stdout_theirs);
                    let _ = exit_tx.send(Some(ProcessExit::code(code)));
                });
                true
            }
            MockBehavior::Hold { honor_terminate } => {
                drop(stderr_theirs);
                let control = MockControl {
                    stdout: stdout_theirs,
                    stdin: stdin_theirs,
                    exit_tx,
                    terminated: Arc::clone(&terminated),
                };
                let _ = self.controls_tx.send(control);
                honor_terminate
            }
        };

        Ok(SpawnedProcess {
            stdin: Box::new(stdin_ours),
            stdout: Box::new(stdout_ours),
            stderr: Box::new(stderr_ours),
            process: Box::new(MockProcess {
                exit_rx,
                terminated,
                honor_terminate,
                forced: None,
            }),
        })
    }
}

struct MockProcess {
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    terminated: Arc<AtomicBool>,
    honor_terminate: bool,
    forced: Option<ProcessExit>,
}

#[async_trait]
impl AgentProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> ProcessResult<ProcessExit> {
        loop {
            if let Some(exit) = self.forced {
                return Ok(exit);
            }
            if let Some(exit) = *self.exit_rx.borrow_and_update() {
                return Ok(exit);
            }
            if self.exit_rx.changed().await.is_err() {
                // Control dropped without exiting: behave like a crash
                return Ok(self.forced.unwrap_or_else(ProcessExit::signaled));
            }
        }
    }

    fn terminate(&mut self) -> ProcessResult<()> {
        self.terminated.store(true, Ordering::SeqCst);
        if self.honor_terminate && self.exit_rx.borrow().is_none() {
            self.forced = Some(ProcessExit::signaled());
        }
        Ok(())
    }

    async fn kill(&mut self) -> ProcessResult<()> {
        if self.exit_rx.borrow().is_none() {
            self.forced = Some(ProcessExit::killed());
        }
        Ok(())
    }
}
