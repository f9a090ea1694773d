// OS-level process primitives: shell launch, group signaling, liveness and
// reaping.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, warn};
use warden_core::{ProcessStatus, Result, RunnerError};

/// Answer of a signal-0 probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited,
    /// The probe was refused (e.g. EPERM); treat the process as running.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// ESRCH: nothing left in the group to signal.
    ProcessGone,
    Failed(Errno),
}

/// Children are launched as leaders of their own process group, so the
/// group id is the pid.
fn group_of(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

pub fn probe(pid: u32) -> Liveness {
    let Some(group) = group_of(pid) else {
        return Liveness::Unknown;
    };
    match killpg(group, None::<Signal>) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Exited,
        Err(_) => Liveness::Unknown,
    }
}

pub fn send(pid: u32, signal: Signal) -> Delivery {
    let Some(group) = group_of(pid) else {
        return Delivery::Failed(Errno::EINVAL);
    };
    match killpg(group, signal) {
        Ok(()) => Delivery::Sent,
        Err(Errno::ESRCH) => Delivery::ProcessGone,
        Err(errno) => Delivery::Failed(errno),
    }
}

/// Build `sh -c <command>`; the command string is passed through untouched.
pub fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

/// Turn the result of waiting on the child into a status.
///
/// ESRCH means a racing path already collected the process and is absorbed
/// silently. ECHILD is reported once and the run continues with an unknown
/// status.
pub fn reap(waited: io::Result<ExitStatus>, pid: u32) -> Result<ProcessStatus> {
    match waited {
        Ok(status) => Ok(ProcessStatus::from(status)),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
            debug!(pid, "Process already reaped");
            Ok(ProcessStatus::unknown())
        }
        Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {
            warn!("Could not reap process {}: no child process to wait for", pid);
            Ok(ProcessStatus::unknown())
        }
        Err(source) => Err(RunnerError::Reap { pid, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command as StdCommand;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with a subscriber that records every event at DEBUG and up.
    fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let value = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        (value, logs)
    }

    fn warnings(logs: &str) -> Vec<&str> {
        logs.lines().filter(|line| line.contains("WARN")).collect()
    }

    fn spawn_group_leader(script: &str) -> std::process::Child {
        StdCommand::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_probe_running_then_exited() {
        let mut child = spawn_group_leader("sleep 10");
        let pid = child.id();
        assert_eq!(probe(pid), Liveness::Alive);

        assert_eq!(send(pid, Signal::SIGKILL), Delivery::Sent);
        child.wait().unwrap();
        assert_eq!(probe(pid), Liveness::Exited);
    }

    #[test]
    fn test_send_to_reaped_process_is_gone() {
        let mut child = spawn_group_leader("exit 0");
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(send(pid, Signal::SIGTERM), Delivery::ProcessGone);
    }

    #[test]
    fn test_invalid_pid_is_unknown() {
        assert_eq!(probe(0), Liveness::Unknown);
        assert_eq!(probe(u32::MAX), Liveness::Unknown);
        assert_eq!(send(0, Signal::SIGTERM), Delivery::Failed(Errno::EINVAL));
    }

    #[test]
    fn test_reap_absorbs_esrch() {
        let waited = Err(io::Error::from_raw_os_error(libc::ESRCH));
        let (status, logs) = with_captured_logs(|| reap(waited, 1234));
        assert!(status.unwrap().is_unknown());
        assert!(warnings(&logs).is_empty(), "unexpected warnings: {}", logs);
    }

    #[test]
    fn test_reap_continues_after_echild() {
        let waited = Err(io::Error::from_raw_os_error(libc::ECHILD));
        let (status, logs) = with_captured_logs(|| reap(waited, 1234));
        assert!(status.unwrap().is_unknown());

        let warnings = warnings(&logs);
        assert_eq!(warnings.len(), 1, "expected one warning in: {}", logs);
        assert!(warnings[0].contains("Could not reap process 1234"));
    }

    #[test]
    fn test_reap_surfaces_other_errors() {
        let waited = Err(io::Error::from_raw_os_error(libc::EINVAL));
        match reap(waited, 1234) {
            Err(RunnerError::Reap { pid, .. }) => assert_eq!(pid, 1234),
            other => panic!("Expected Reap error, got {:?}", other),
        }
    }

    #[test]
    fn test_reap_converts_exit_status() {
        let status = StdCommand::new("sh")
            .arg("-c")
            .arg("exit 7")
            .status()
            .unwrap();
        assert_eq!(reap(Ok(status), 1).unwrap(), ProcessStatus::exited(7));
    }
}
