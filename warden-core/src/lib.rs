//! Shared types for warden: run options data, results, output sinks and
//! errors.

pub mod context;
pub mod error;
pub mod models;
pub mod sink;

pub use context::{CallerContext, ContextMonitor};
pub use error::{ConfigError, Result, RunnerError};
pub use models::{
    EnvOverlay, Environment, Escalation, ProcessStatus, RunResult, RunnerDefaults, Timeout,
};
pub use sink::{FileSink, OutputSink, StringSink, WriterSink};
