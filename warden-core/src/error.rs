use std::path::PathBuf;
use thiserror::Error;

/// Invalid construction arguments. Always fatal, never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("directory does not exist: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("stdin must be a string")]
    StdinNotString,

    #[error("{stream} must support append")]
    SinkNotAppendable { stream: String },

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to reap process {pid}: {source}")]
    Reap {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RunnerError {
    pub fn is_config_error(&self) -> bool {
        matches!(self, RunnerError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_error_names_path() {
        let err = ConfigError::DirectoryNotFound(PathBuf::from("/no/such/dir"));
        assert_eq!(err.to_string(), "directory does not exist: /no/such/dir");
    }

    #[test]
    fn test_sink_error_names_stream() {
        let err = ConfigError::SinkNotAppendable {
            stream: "stderr".to_string(),
        };
        assert_eq!(err.to_string(), "stderr must support append");
    }

    #[test]
    fn test_config_error_converts() {
        let err: RunnerError = ConfigError::StdinNotString.into();
        assert!(err.is_config_error());
        assert_eq!(err.to_string(), "Invalid configuration: stdin must be a string");
    }

    #[test]
    fn test_launch_error_carries_os_message() {
        let err = RunnerError::Launch {
            command: "nope".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!err.is_config_error());
        assert!(err.to_string().starts_with("Failed to launch `nope`"));
    }
}
