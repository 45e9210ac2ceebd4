//! Agent child process management
//!
//! Handles spawning the agent executable with piped stdio, including:
//! - Working directory and environment setup
//! - Separate stdout/stderr streams
//! - Graceful termination with a forced-kill fallback

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Errors that can occur during process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {executable}: {source}")]
    SpawnFailed {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("Process {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("Failed to signal process: {0}")]
    SignalFailed(io::Error),

    #[error("Process I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Everything needed to launch one agent process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable name or path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: PathBuf,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl Invocation {
    /// Create an invocation with no extra environment
    pub fn new(executable: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args,
            working_dir: working_dir.into(),
            env: HashMap::new(),
        }
    }

    /// Add environment variables
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Whether `flag` appears among the arguments
    #[allow(dead_code)]
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// The argument following `flag`, if any
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Reason for process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited on its own
    Normal,
    /// Process was killed by a signal
    Signal,
    /// Process was force-killed by us
    Killed,
}

/// Event describing how a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,
    /// Exit reason
    pub reason: ExitReason,
}

impl ProcessExit {
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            reason: ExitReason::Normal,
        }
    }

    pub fn signaled() -> Self {
        Self {
            exit_code: None,
            reason: ExitReason::Signal,
        }
    }

    pub fn killed() -> Self {
        Self {
            exit_code: None,
            reason: ExitReason::Killed,
        }
    }

    /// True only for a normal exit with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::code(code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if status.signal() == Some(libc::SIGKILL) {
                        return Self::killed();
                    }
                }
                Self::signaled()
            }
        }
    }
}

/// A running process whose lifetime the supervisor controls
#[async_trait]
pub trait AgentProcess: Send {
    /// OS process id, if still known
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> ProcessResult<ProcessExit>;

    /// Ask the process to exit (SIGTERM on Unix)
    fn terminate(&mut self) -> ProcessResult<()>;

    /// Force the process to exit and reap it
    async fn kill(&mut self) -> ProcessResult<()>;
}

/// Streams and handle of a freshly spawned process
pub struct SpawnedProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn AgentProcess>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

/// Launches agent processes
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> ProcessResult<SpawnedProcess>;
}

/// Spawns real OS processes through `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, invocation: &Invocation) -> ProcessResult<SpawnedProcess> {
        let mut cmd = Command::new(&invocation.executable);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            executable: invocation.executable.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        debug!(
            "Spawned {} (pid {:?}) in {}",
            invocation.executable,
            child.id(),
            invocation.working_dir.display()
        );

        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: Box::new(TokioProcess { child }),
        })
    }
}

struct TokioProcess {
    child: Child,
}

#[async_trait]
impl AgentProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> ProcessResult<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit::from_status(status))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> ProcessResult<()> {
        // No pid means the child has already been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| ProcessError::SignalFailed(io::Error::other("pid out of range")))?;
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ProcessError::SignalFailed(io::Error::last_os_error()))
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> ProcessResult<()> {
        self.child.start_kill().map_err(ProcessError::SignalFailed)
    }

    async fn kill(&mut self) -> ProcessResult<()> {
        self.child.kill().await?;
        Ok(())
    }
}

/// Terminate a process, escalating to a forced kill after `grace`
///
/// Always returns once the process is gone or the kill itself fails.
pub async fn shutdown(process: &mut dyn AgentProcess, grace: Duration) -> ProcessResult<ProcessExit> {
    let pid = process.pid();

    if let Err(e) = process.terminate() {
        warn!("Failed to send termination signal to pid {:?}: {}", pid, e);
    }

    let waited = tokio::time::timeout(grace, process.wait()).await;
    match waited {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Process {:?} did not exit within {:?}, forcing kill",
                pid, grace
            );
            process.kill().await?;
            Ok(ProcessExit::killed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn sh(script: &str) -> Invocation {
        Invocation::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_invocation_arg_helpers() {
        let invocation = Invocation::new(
            "claude",
            vec!["-p".to_string(), "--resume".to_string(), "abc".to_string()],
            "/tmp",
        );
        assert!(invocation.has_arg("-p"));
        assert!(!invocation.has_arg("--verbose"));
        assert_eq!(invocation.arg_value("--resume"), Some("abc"));
        assert_eq!(invocation.arg_value("abc"), None);
    }

    #[test]
    fn test_exit_success() {
        assert!(ProcessExit::code(0).success());
        assert!(!ProcessExit::code(1).success());
        assert!(!ProcessExit::signaled().success());
        assert!(!ProcessExit::killed().success());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let invocation = Invocation::new(
            "/nonexistent/agent/binary",
            Vec::new(),
            std::env::temp_dir(),
        );
        let result = TokioSpawner.spawn(&invocation);
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_to_stdout_and_exit_code() {
        let mut spawned = TokioSpawner
            .spawn(&sh("read line; echo \"got:$line\"; echo diag >&2; exit 3"))
            .unwrap();

        spawned.stdin.write_all(b"hello\n").await.unwrap();
        spawned.stdin.shutdown().await.unwrap();
        drop(spawned.stdin);

        let mut stdout = String::new();
        spawned.stdout.read_to_string(&mut stdout).await.unwrap();
        let mut stderr = String::new();
        spawned.stderr.read_to_string(&mut stderr).await.unwrap();

        let exit = timeout(Duration::from_secs(5), spawned.process.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stdout, "got:hello\n");
        assert_eq!(stderr, "diag\n");
        assert_eq!(exit, ProcessExit::code(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_passed() {
        let mut env = HashMap::new();
        env.insert("AGENT_PROXY_TEST".to_string(), "test_value".to_string());
        let mut spawned = TokioSpawner
            .spawn(&sh("echo $AGENT_PROXY_TEST").with_env(env))
            .unwrap();

        let mut stdout = String::new();
        spawned.stdout.read_to_string(&mut stdout).await.unwrap();
        assert_eq!(stdout.trim(), "test_value");
        assert!(spawned.process.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_graceful() {
        let mut spawned = TokioSpawner.spawn(&sh("exec sleep 30")).unwrap();

        let exit = timeout(
            Duration::from_secs(5),
            shutdown(spawned.process.as_mut(), Duration::from_secs(3)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit.reason, ExitReason::Signal);
        assert_eq!(exit.exit_code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let mut spawned = TokioSpawner
            .spawn(&sh("trap '' TERM; exec sleep 30"))
            .unwrap();
        // Let the shell install its trap before signalling
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exit = timeout(
            Duration::from_secs(5),
            shutdown(spawned.process.as_mut(), Duration::from_millis(200)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit.reason, ExitReason::Killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_after_exit_is_harmless() {
        let mut spawned = TokioSpawner.spawn(&sh("exit 0")).unwrap();
        assert!(spawned.process.wait().await.unwrap().success());

        let exit = shutdown(spawned.process.as_mut(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(exit.success());
    }
}
