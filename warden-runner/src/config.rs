// Loosely typed run configuration, as read from a TOML file, and its
// validation into `RunOptions`.

use crate::runner::RunOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use toml::Value;
use warden_core::{
    ConfigError, ContextMonitor, EnvOverlay, Escalation, FileSink, OutputSink, Timeout,
};

/// Spelling of the caller-context timeout mode in config files.
pub const ON_THREAD_EXIT: &str = "on_thread_exit";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub cwd: Option<PathBuf>,
    pub environment: Option<Value>,
    pub stdin: Option<Value>,
    pub stdout: Option<Value>,
    pub stderr: Option<Value>,
    pub timeout: Option<Value>,
    pub grace_period: Option<f64>,
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub valid_exit_codes: Vec<i32>,
}

impl RunnerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Validate every field and build the typed options.
    ///
    /// `context` is required when the timeout is `"on_thread_exit"`.
    pub fn into_options(self, context: Option<ContextMonitor>) -> Result<RunOptions, ConfigError> {
        let mut options = RunOptions {
            cwd: self.cwd,
            valid_exit_codes: if self.valid_exit_codes.is_empty() {
                vec![0]
            } else {
                self.valid_exit_codes
            },
            ..RunOptions::default()
        };

        if let Some(environment) = &self.environment {
            options.environment = parse_environment(environment)?;
        }

        options.stdin = match self.stdin {
            None => None,
            Some(Value::String(input)) => Some(input),
            Some(_) => return Err(ConfigError::StdinNotString),
        };

        options.stdout = parse_sink("stdout", self.stdout.as_ref())?;
        options.stderr = parse_sink("stderr", self.stderr.as_ref())?;

        options.timeout = match &self.timeout {
            None => None,
            Some(value) => Some(parse_timeout(value, context)?),
        };

        if self.grace_period.is_some() || self.poll_interval.is_some() {
            let defaults = Escalation::default();
            options.escalation = Some(Escalation {
                grace: match self.grace_period {
                    Some(secs) => seconds("grace_period", secs)?,
                    None => defaults.grace,
                },
                poll_interval: match self.poll_interval {
                    Some(secs) => seconds("poll_interval", secs)?,
                    None => defaults.poll_interval,
                },
            });
        }

        Ok(options)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ConfigError::InvalidTimeout(format!(
            "{} must be a non-negative number of seconds",
            field
        ))
    })
}

/// A table overlays the defaults (an empty string removes a key); `false`
/// means no mapping at all.
fn parse_environment(value: &Value) -> Result<EnvOverlay, ConfigError> {
    match value {
        Value::Boolean(false) => Ok(EnvOverlay::Cleared),
        Value::Table(table) => {
            let mut entries = BTreeMap::new();
            for (key, value) in table {
                let value = match value {
                    Value::String(s) if s.is_empty() => None,
                    Value::String(s) => Some(s.clone()),
                    other => {
                        return Err(ConfigError::InvalidEnvironment(format!(
                            "{} must be a string, got {}",
                            key,
                            other.type_str()
                        )))
                    }
                };
                entries.insert(key.clone(), value);
            }
            Ok(EnvOverlay::Merge(entries))
        }
        other => Err(ConfigError::InvalidEnvironment(format!(
            "expected a table or false, got {}",
            other.type_str()
        ))),
    }
}

fn parse_timeout(value: &Value, context: Option<ContextMonitor>) -> Result<Timeout, ConfigError> {
    let secs = match value {
        Value::String(mode) if mode == ON_THREAD_EXIT => {
            return context.map(Timeout::OnContextExit).ok_or_else(|| {
                ConfigError::InvalidTimeout(format!("{} requires a caller context", ON_THREAD_EXIT))
            });
        }
        Value::Integer(secs) => *secs as f64,
        Value::Float(secs) => *secs,
        other => {
            return Err(ConfigError::InvalidTimeout(format!(
                "expected seconds or \"{}\", got {}",
                ON_THREAD_EXIT, other
            )))
        }
    };

    let after = seconds("timeout", secs)?;
    if after.is_zero() {
        return Err(ConfigError::InvalidTimeout(
            "timeout must be greater than zero".into(),
        ));
    }
    Ok(Timeout::After(after))
}

/// `"capture"` keeps output in the run result only; `{ append = "path" }`
/// also appends it to a file, opened on the first chunk. Anything else
/// cannot be appended to.
fn parse_sink(
    stream: &str,
    value: Option<&Value>,
) -> Result<Option<Arc<dyn OutputSink>>, ConfigError> {
    let not_appendable = || ConfigError::SinkNotAppendable {
        stream: stream.to_string(),
    };

    match value {
        None => Ok(None),
        Some(Value::String(kind)) if kind == "capture" => Ok(None),
        Some(Value::Table(table)) if table.len() == 1 => {
            let Some(Value::String(path)) = table.get("append") else {
                return Err(not_appendable());
            };
            if !appendable(Path::new(path)) {
                return Err(not_appendable());
            }
            Ok(Some(Arc::new(FileSink::new(path))))
        }
        Some(_) => Err(not_appendable()),
    }
}

/// An existing file must open for append; a missing one needs an existing
/// parent directory. Nothing is created.
fn appendable(path: &Path) -> bool {
    if path.exists() {
        return !path.is_dir() && OpenOptions::new().append(true).open(path).is_ok();
    }
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parent.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use warden_core::CallerContext;

    fn options(content: &str) -> Result<RunOptions, ConfigError> {
        RunnerConfig::from_toml_str(content)?.into_options(None)
    }

    #[test]
    fn test_empty_config() {
        let options = options("").unwrap();
        assert_eq!(options.environment, EnvOverlay::default());
        assert!(options.cwd.is_none());
        assert!(options.stdin.is_none());
        assert!(options.stdout.is_none());
        assert!(options.timeout.is_none());
        assert!(options.escalation.is_none());
        assert_eq!(options.valid_exit_codes, vec![0]);
    }

    #[test]
    fn test_full_config() {
        let options = options(
            r#"
cwd = "/tmp"
stdin = "input"
timeout = 2.5
grace_period = 1.0
poll_interval = 0.5
valid_exit_codes = [0, 2]
environment = { LANG = "en_US.UTF-8", LC_ALL = "" }
"#,
        )
        .unwrap();

        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.stdin.as_deref(), Some("input"));
        assert!(matches!(
            options.timeout,
            Some(Timeout::After(after)) if after == Duration::from_millis(2500)
        ));
        assert_eq!(
            options.escalation,
            Some(Escalation {
                grace: Duration::from_secs(1),
                poll_interval: Duration::from_millis(500),
            })
        );
        assert_eq!(options.valid_exit_codes, vec![0, 2]);
        assert_eq!(
            options.environment,
            EnvOverlay::default().set("LANG", "en_US.UTF-8").remove("LC_ALL")
        );
    }

    #[test]
    fn test_environment_false_clears() {
        let options = options("environment = false").unwrap();
        assert_eq!(options.environment, EnvOverlay::Cleared);
    }

    #[test]
    fn test_environment_rejects_non_string_values() {
        let err = options("environment = { DEBUG = 1 }").err().unwrap();
        assert!(matches!(err, ConfigError::InvalidEnvironment(_)));

        let err = options("environment = \"LC_ALL=C\"").err().unwrap();
        assert!(matches!(err, ConfigError::InvalidEnvironment(_)));
    }

    #[test]
    fn test_stdin_must_be_string() {
        for content in ["stdin = 42", "stdin = true", "stdin = []", "stdin = {}"] {
            let err = options(content).err().unwrap();
            assert!(
                matches!(err, ConfigError::StdinNotString),
                "{} gave {:?}",
                content,
                err
            );
            assert_eq!(err.to_string(), "stdin must be a string");
        }
    }

    #[test]
    fn test_sink_must_support_append() {
        for content in [
            "stdout = 5",
            "stdout = \"clipboard\"",
            "stdout = { overwrite = \"out.log\" }",
        ] {
            let err = options(content).err().unwrap();
            assert_eq!(err.to_string(), "stdout must support append");
        }

        let dir = tempfile::tempdir().unwrap();
        let content = format!("stderr = {{ append = {:?} }}", dir.path().to_str().unwrap());
        let err = options(&content).err().unwrap();
        assert_eq!(err.to_string(), "stderr must support append");
    }

    #[test]
    fn test_append_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, "before\n").unwrap();

        let content = format!("stdout = {{ append = {:?} }}", path.to_str().unwrap());
        let options = options(&content).unwrap();
        let sink = options.stdout.unwrap();
        sink.append(b"after\n").unwrap();

        let mut written = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut written)
            .unwrap();
        assert_eq!(written, "before\nafter\n");
    }

    #[test]
    fn test_append_target_is_not_created_by_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.log");

        let content = format!("stdout = {{ append = {:?} }}", path.to_str().unwrap());
        let options = options(&content).unwrap();
        assert!(!path.exists());

        options.stdout.unwrap().append(b"first\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\n");
    }

    #[test]
    fn test_append_target_needs_existing_parent() {
        let err = options("stdout = { append = \"/definitely/not/a/warden/dir/out.log\" }")
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "stdout must support append");
    }

    #[test]
    fn test_capture_sink() {
        let options = options("stdout = \"capture\"\nstderr = \"capture\"").unwrap();
        assert!(options.stdout.is_none());
        assert!(options.stderr.is_none());
    }

    #[test]
    fn test_invalid_timeouts() {
        for content in ["timeout = 0", "timeout = -1", "timeout = \"soon\"", "timeout = true"] {
            let err = options(content).err().unwrap();
            assert!(
                matches!(err, ConfigError::InvalidTimeout(_)),
                "{} gave {:?}",
                content,
                err
            );
        }
    }

    #[test]
    fn test_on_thread_exit_needs_context() {
        let config = RunnerConfig::from_toml_str("timeout = \"on_thread_exit\"").unwrap();
        let err = config.clone().into_options(None).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidTimeout(_)));

        let context = CallerContext::new();
        let options = config.into_options(Some(context.monitor())).unwrap();
        assert!(matches!(options.timeout, Some(Timeout::OnContextExit(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = RunnerConfig::from_toml_str("shell = \"bash\"").err().unwrap();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunnerConfig::load("/definitely/not/warden.toml").err().unwrap();
        assert!(err.to_string().contains("/definitely/not/warden.toml"));
    }
}
