use crate::process;
use crate::watchdog::{Trigger, Watchdog, WatchdogOutcome};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::{
    ConfigError, ContextMonitor, EnvOverlay, Environment, Escalation, OutputSink, Result,
    RunResult, RunnerDefaults, RunnerError, Timeout,
};

const CHUNK_SIZE: usize = 8 * 1024;

/// How long output pipes may stay open after the launched process exited.
/// Background processes that inherited them are detached afterwards.
const OUTPUT_DRAIN: Duration = Duration::from_millis(200);

/// Caller-facing options for a [`CommandRunner`]. Everything is optional.
#[derive(Clone)]
pub struct RunOptions {
    pub environment: EnvOverlay,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub stdout: Option<Arc<dyn OutputSink>>,
    pub stderr: Option<Arc<dyn OutputSink>>,
    pub timeout: Option<Timeout>,
    /// Falls back to the runner defaults when unset.
    pub escalation: Option<Escalation>,
    pub valid_exit_codes: Vec<i32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            environment: EnvOverlay::default(),
            cwd: None,
            stdin: None,
            stdout: None,
            stderr: None,
            timeout: None,
            escalation: None,
            valid_exit_codes: vec![0],
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment = self.environment.set(key, value);
        self
    }

    pub fn without_env(mut self, key: impl Into<String>) -> Self {
        self.environment = self.environment.remove(key);
        self
    }

    pub fn with_cleared_env(mut self) -> Self {
        self.environment = EnvOverlay::Cleared;
        self
    }

    pub fn with_cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_stdout(mut self, sink: impl OutputSink + 'static) -> Self {
        self.stdout = Some(Arc::new(sink));
        self
    }

    pub fn with_stderr(mut self, sink: impl OutputSink + 'static) -> Self {
        self.stderr = Some(Arc::new(sink));
        self
    }

    pub fn with_timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(Timeout::After(after));
        self
    }

    /// Kill the command when the caller context behind `monitor` ends.
    pub fn on_context_exit(mut self, monitor: ContextMonitor) -> Self {
        self.timeout = Some(Timeout::OnContextExit(monitor));
        self
    }

    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn with_valid_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.valid_exit_codes = codes.into_iter().collect();
        self
    }
}

/// A validated, reusable description of one external command.
///
/// Every call to [`CommandRunner::run`] launches the command once through
/// `sh -c`, streams its output into the configured sinks and, when a timeout
/// is configured, supervises it with a [`Watchdog`].
#[derive(Clone)]
pub struct CommandRunner {
    command: String,
    environment: Environment,
    cwd: PathBuf,
    stdin: Option<String>,
    stdout: Option<Arc<dyn OutputSink>>,
    stderr: Option<Arc<dyn OutputSink>>,
    timeout: Option<Timeout>,
    escalation: Escalation,
    valid_exit_codes: Vec<i32>,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>, options: RunOptions) -> Result<Self> {
        Self::with_defaults(command, options, &RunnerDefaults::default())
    }

    pub fn with_defaults(
        command: impl Into<String>,
        options: RunOptions,
        defaults: &RunnerDefaults,
    ) -> Result<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand.into());
        }

        let cwd = match options.cwd {
            Some(dir) if dir.is_dir() => dir,
            Some(dir) => return Err(ConfigError::DirectoryNotFound(dir).into()),
            None => std::env::temp_dir(),
        };

        if let Some(Timeout::After(after)) = &options.timeout {
            if after.is_zero() {
                return Err(
                    ConfigError::InvalidTimeout("timeout must be greater than zero".into()).into(),
                );
            }
        }

        let escalation = options.escalation.unwrap_or(defaults.escalation);
        if escalation.poll_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "poll interval must be greater than zero".into(),
            )
            .into());
        }

        let valid_exit_codes = if options.valid_exit_codes.is_empty() {
            vec![0]
        } else {
            options.valid_exit_codes
        };

        Ok(Self {
            environment: Environment::resolve(&defaults.environment, &options.environment),
            command,
            cwd,
            stdin: options.stdin,
            stdout: options.stdout,
            stderr: options.stderr,
            timeout: options.timeout,
            escalation,
            valid_exit_codes,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn timeout(&self) -> Option<&Timeout> {
        self.timeout.as_ref()
    }

    pub fn escalation(&self) -> Escalation {
        self.escalation
    }

    /// Run the command and block the calling thread until it has finished
    /// or been terminated.
    ///
    /// Drives its own single-threaded runtime. Called from inside an async
    /// context, that runtime lives on a scoped helper thread and the caller's
    /// worker is blocked meanwhile; prefer [`CommandRunner::run_async`] there.
    pub fn run(&self) -> Result<RunResult> {
        if tokio::runtime::Handle::try_current().is_err() {
            return self.block_on();
        }
        thread::scope(|scope| match scope.spawn(|| self.block_on()).join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        })
    }

    fn block_on(&self) -> Result<RunResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_async())
    }

    pub async fn run_async(&self) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start_instant = Instant::now();

        let mut child = self.spawn()?;
        let pid = child.id().ok_or_else(|| RunnerError::Launch {
            command: self.command.clone(),
            source: io::Error::other("process exited before its pid was read"),
        })?;

        info!(
            run_id = %run_id,
            pid,
            command = %self.command,
            "Launched command"
        );

        let watchdog = self
            .timeout
            .as_ref()
            .map(|timeout| Watchdog::arm(pid, Trigger::from(timeout), self.escalation));

        let feeder = child
            .stdin
            .take()
            .zip(self.stdin.clone())
            .map(|(pipe, input)| tokio::spawn(feed_stdin(pipe, input, pid)));

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (detach_tx, detach_rx) = watch::channel(false);

        // The run completes when the launched process exits. The watchdog is
        // stopped right away; the pumps only get a short window to drain what
        // was written before that.
        let exited = async {
            let waited = child.wait().await;
            let outcome = match watchdog {
                Some(watchdog) => watchdog.stop().await,
                None => WatchdogOutcome::Disarmed,
            };
            if time::timeout(OUTPUT_DRAIN, detach_tx.closed()).await.is_err() {
                debug!(pid, "Output pipes still held open after exit, detaching");
            }
            detach_tx.send_replace(true);
            (waited, outcome)
        };

        let ((waited, outcome), stdout, stderr) = tokio::join!(
            exited,
            pump(stdout_pipe, self.stdout.clone(), "stdout", pid, detach_rx.clone()),
            pump(stderr_pipe, self.stderr.clone(), "stderr", pid, detach_rx),
        );

        let status = process::reap(waited, pid);

        if let Some(feeder) = feeder {
            feeder.abort();
            let _ = feeder.await;
        }

        let status = status?;
        let duration_ms = start_instant.elapsed().as_millis() as u64;

        info!(
            run_id = %run_id,
            pid,
            status = %status,
            timed_out = outcome.fired(),
            duration_ms,
            "Command finished"
        );

        Ok(RunResult {
            run_id,
            command: self.command.clone(),
            pid,
            status,
            stdout: String::from_utf8_lossy(&stdout.captured).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.captured).into_owned(),
            started_at,
            duration_ms,
            timed_out: outcome.fired(),
            valid_exit_codes: self.valid_exit_codes.clone(),
            sink_errors: [stdout.sink_error, stderr.sink_error]
                .into_iter()
                .flatten()
                .collect(),
        })
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = process::shell_command(&self.command);
        cmd.current_dir(&self.cwd)
            .envs(self.environment.iter())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        cmd.spawn().map_err(|source| RunnerError::Launch {
            command: self.command.clone(),
            source,
        })
    }
}

async fn feed_stdin(mut pipe: ChildStdin, input: String, pid: u32) {
    if let Err(err) = pipe.write_all(input.as_bytes()).await {
        // BrokenPipe: the child exited or closed stdin without reading it all
        debug!(pid, error = %err, "Stopped writing stdin");
    }
    // dropping the pipe sends EOF
}

/// What one pump collected from a child stream.
#[derive(Debug, Default)]
struct Pumped {
    captured: Vec<u8>,
    /// First failure of the caller's sink, as `"<stream>: <error>"`.
    sink_error: Option<String>,
}

/// Copy a child stream chunk by chunk into the sink, keeping a copy for the
/// result. Stops at EOF or once `detach` is raised.
async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    mut sink: Option<Arc<dyn OutputSink>>,
    stream: &'static str,
    pid: u32,
    mut detach: watch::Receiver<bool>,
) -> Pumped {
    let mut pumped = Pumped::default();
    let Some(mut reader) = reader else {
        return pumped;
    };

    let mut chunk = vec![0u8; CHUNK_SIZE];
    while !*detach.borrow() {
        let read = tokio::select! {
            biased;
            read = reader.read(&mut chunk) => Some(read),
            _ = detach.wait_for(|detached| *detached) => None,
        };
        let Some(read) = read else {
            break;
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                pumped.captured.extend_from_slice(&chunk[..n]);
                if let Some(target) = &sink {
                    if let Err(err) = target.append(&chunk[..n]) {
                        warn!(
                            pid,
                            stream,
                            error = %err,
                            "Output sink failed, output is only captured from here on"
                        );
                        pumped.sink_error = Some(format!("{}: {}", stream, err));
                        sink = None;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(pid, stream, error = %err, "Stopped reading output");
                break;
            }
        }
    }
    pumped
}
