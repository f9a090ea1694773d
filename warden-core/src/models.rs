use crate::context::ContextMonitor;
use crate::error::{Result, RunnerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Resolved variables handed to the child, applied on top of the inherited
/// environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Merge a caller overlay onto the defaults.
    ///
    /// A `None` or empty value removes the key; anything else overrides or
    /// adds. `EnvOverlay::Cleared` yields an empty environment.
    pub fn resolve(defaults: &Environment, overlay: &EnvOverlay) -> Environment {
        let entries = match overlay {
            EnvOverlay::Cleared => return Environment::new(),
            EnvOverlay::Merge(entries) => entries,
        };

        let mut merged = defaults.0.clone();
        for (key, value) in entries {
            match value.as_deref() {
                None | Some("") => {
                    merged.remove(key);
                }
                Some(value) => {
                    merged.insert(key.clone(), value.to_string());
                }
            }
        }
        Environment(merged)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Environment(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Caller-supplied changes to the default environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverlay {
    Merge(BTreeMap<String, Option<String>>),
    /// Explicit "no mapping": the child gets no variables from the runner.
    Cleared,
}

impl Default for EnvOverlay {
    fn default() -> Self {
        EnvOverlay::Merge(BTreeMap::new())
    }
}

impl EnvOverlay {
    pub fn set(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key.into(), Some(value.into()))
    }

    pub fn remove(self, key: impl Into<String>) -> Self {
        self.insert(key.into(), None)
    }

    fn insert(self, key: String, value: Option<String>) -> Self {
        match self {
            EnvOverlay::Merge(mut entries) => {
                entries.insert(key, value);
                EnvOverlay::Merge(entries)
            }
            EnvOverlay::Cleared => EnvOverlay::Cleared,
        }
    }
}

/// TERM-then-KILL escalation timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    /// How long a process may keep running after TERM before it gets KILL.
    pub grace: Duration,
    /// Liveness polling tick while inside the grace window.
    pub poll_interval: Duration,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// When the watchdog should start terminating the child.
#[derive(Debug, Clone)]
pub enum Timeout {
    /// Wall-clock deadline measured from launch.
    After(Duration),
    /// Fires when the caller's `CallerContext` ends.
    OnContextExit(ContextMonitor),
}

/// Immutable defaults merged into every runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerDefaults {
    pub environment: Environment,
    pub escalation: Escalation,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            environment: [("LC_ALL", "C")].into_iter().collect(),
            escalation: Escalation::default(),
        }
    }
}

/// How a process ended. Both fields are `None` when the status could not be
/// collected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.code.is_none() && self.signal.is_none()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessStatus::signaled(signal);
            }
        }
        match status.code() {
            Some(code) => ProcessStatus::exited(code),
            None => ProcessStatus::unknown(),
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Outcome of one `run` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub command: String,
    pub pid: u32,
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// The watchdog fired and signaled the process.
    pub timed_out: bool,
    pub valid_exit_codes: Vec<i32>,
    /// Caller sinks that failed during the run, as `"<stream>: <error>"`.
    /// Output after the failure is still in `stdout`/`stderr`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sink_errors: Vec<String>,
}

impl RunResult {
    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn success(&self) -> bool {
        self.status
            .code
            .is_some_and(|code| self.valid_exit_codes.contains(&code))
    }

    /// Fail with the captured output when the exit status is not one of the
    /// valid exit codes.
    pub fn ensure_success(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(RunnerError::CommandFailed(self.describe()))
        }
    }

    /// Human-readable report of the run, suitable for error messages.
    pub fn describe(&self) -> String {
        let mut report = format!(
            "`{}` (pid {}) finished with {}",
            self.command, self.pid, self.status
        );
        if self.timed_out {
            report.push_str(" after timing out");
        }
        report.push_str(&format!(
            ", expected exit code in {:?}\n",
            self.valid_exit_codes
        ));
        for error in &self.sink_errors {
            report.push_str(&format!("output sink failed: {}\n", error));
        }
        report.push_str(&format!("STDOUT: {}\n", self.stdout.trim_end()));
        report.push_str(&format!("STDERR: {}", self.stderr.trim_end()));
        report
    }
}
