//! Bounded execution of external commands.
//!
//! [`CommandRunner`] launches a command through `sh -c`, streams its output
//! into [`OutputSink`](warden_core::OutputSink)s and, when a timeout is
//! configured, supervises it with a watchdog that escalates from SIGTERM to
//! SIGKILL.

pub mod config;
pub mod process;
pub mod runner;
pub mod watchdog;

pub use config::RunnerConfig;
pub use process::Liveness;
pub use runner::{CommandRunner, RunOptions};
pub use watchdog::WatchdogOutcome;
