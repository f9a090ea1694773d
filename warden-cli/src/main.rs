use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use warden_core::{
    CallerContext, EnvOverlay, Escalation, ProcessStatus, RunResult, Timeout, WriterSink,
};
use warden_runner::{CommandRunner, RunOptions, RunnerConfig};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Run a command with a deadline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command through `sh -c`
    Run {
        /// TOML file with run options; flags override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Working directory (defaults to the system temp directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Set KEY=VALUE in the child environment; `KEY=` removes KEY
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Do not apply any environment variables, not even LC_ALL=C
        #[arg(long, conflicts_with = "env")]
        no_env: bool,

        /// Text sent to the command's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Seconds before the command is sent SIGTERM
        #[arg(short, long, conflicts_with = "on_interrupt")]
        timeout: Option<f64>,

        /// Terminate the command when warden is interrupted (Ctrl-C)
        #[arg(long)]
        on_interrupt: bool,

        /// Seconds between SIGTERM and SIGKILL
        #[arg(long)]
        grace: Option<f64>,

        /// Exit codes that count as success (repeatable)
        #[arg(long = "valid-exit-code", value_name = "CODE")]
        valid_exit_codes: Vec<i32>,

        /// Print the run result as JSON instead of streaming output
        #[arg(long)]
        json: bool,

        /// The command line, passed verbatim to the shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Validate a config file
    CheckConfig {
        /// Path to the TOML file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            cwd,
            env,
            no_env,
            stdin,
            timeout,
            on_interrupt,
            grace,
            valid_exit_codes,
            json,
            command,
        } => {
            let context = CallerContext::new();

            let mut options = match &config {
                Some(path) => RunnerConfig::load(path)?.into_options(Some(context.monitor()))?,
                None => RunOptions::default(),
            };

            if let Some(cwd) = cwd {
                options = options.with_cwd(cwd);
            }
            if no_env {
                options.environment = EnvOverlay::Cleared;
            }
            for pair in &env {
                let (key, value) = parse_env_pair(pair)?;
                options = if value.is_empty() {
                    options.without_env(key)
                } else {
                    options.with_env(key, value)
                };
            }
            if let Some(input) = stdin {
                options = options.with_stdin(input);
            }
            if let Some(secs) = timeout {
                options = options.with_timeout(seconds(secs)?);
            }
            if on_interrupt {
                options = options.on_context_exit(context.monitor());
            }
            if let Some(secs) = grace {
                let escalation = options.escalation.unwrap_or_default();
                options = options.with_escalation(Escalation {
                    grace: seconds(secs)?,
                    ..escalation
                });
            }
            if !valid_exit_codes.is_empty() {
                options = options.with_valid_exit_codes(valid_exit_codes);
            }
            if !json {
                if options.stdout.is_none() {
                    options.stdout = Some(Arc::new(WriterSink::new(io::stdout())));
                }
                if options.stderr.is_none() {
                    options.stderr = Some(Arc::new(WriterSink::new(io::stderr())));
                }
            }

            if matches!(options.timeout, Some(Timeout::OnContextExit(_))) {
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        debug!("Interrupted, ending caller context");
                    }
                    context.end();
                });
            }

            let runner = CommandRunner::new(command.join(" "), options)?;
            let result = runner.run_async().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                report(&result);
            }

            process::exit(exit_code(&result.status));
        }
        Commands::CheckConfig { path } => {
            let context = CallerContext::new();
            let options = RunnerConfig::load(&path)?.into_options(Some(context.monitor()))?;
            if let Some(cwd) = &options.cwd {
                if !cwd.is_dir() {
                    bail!("{}: directory does not exist: {}", path.display(), cwd.display());
                }
            }
            println!("✓ {} is valid", path.display());
        }
    }

    Ok(())
}

fn parse_env_pair(pair: &str) -> anyhow::Result<(&str, &str)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got `{}`", pair))?;
    if key.is_empty() {
        bail!("environment variable name must not be empty in `{}`", pair);
    }
    Ok((key, value))
}

fn seconds(secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("expected a non-negative number of seconds, got {}", secs))
}

fn report(result: &RunResult) {
    for error in &result.sink_errors {
        eprintln!("warden: output lost, sink failed: {}", error);
    }
    if result.timed_out {
        eprintln!(
            "warden: `{}` overran and was terminated ({})",
            result.command, result.status
        );
    } else if !result.success() {
        eprintln!("warden: `{}` finished with {}", result.command, result.status);
    }
}

/// Shell convention: the child's code, or 128 + the terminating signal.
fn exit_code(status: &ProcessStatus) -> i32 {
    match (status.code, status.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
