//! Background launcher
//!
//! Re-executes the current binary without the detach flag, with stdin closed
//! and stdout/stderr appended to a log file, so the server keeps running
//! after the launching shell exits.

use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};

use super::{ProcessError, ProcessResult};

/// Command line flag that requests detaching
pub const DETACH_FLAG: &str = "--detach";

/// Remove the detach flag from a command line, keeping everything else in order
pub fn strip_detach_flag<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .filter(|arg| arg.as_ref() != OsStr::new(DETACH_FLAG))
        .map(|arg| arg.as_ref().to_os_string())
        .collect()
}

/// Start a detached copy of this binary with `args`
///
/// `args` excludes the program name. Returns the pid of the new process.
pub fn spawn_detached(args: &[OsString], log_file: &Path) -> ProcessResult<u32> {
    let exe = std::env::current_exe()?;

    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let log = OpenOptions::new().create(true).append(true).open(log_file)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(&exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so terminal signals aimed at the launcher miss it
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
        executable: exe.display().to_string(),
        source,
    })?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_detach_flag() {
        let args = strip_detach_flag(["--port", "3000", "--detach", "-v"]);
        assert_eq!(args, vec!["--port", "3000", "-v"]);
    }

    #[test]
    fn test_strip_detach_flag_without_flag() {
        let args = strip_detach_flag(["--log-file", "proxy.log"]);
        assert_eq!(args, vec!["--log-file", "proxy.log"]);
        assert!(strip_detach_flag(Vec::<String>::new()).is_empty());
    }
}
