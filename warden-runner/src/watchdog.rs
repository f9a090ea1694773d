//! Timeout enforcement for a single run.
//!
//! The watchdog is a tokio task bound to one launched pid. It stays armed
//! until its trigger fires (deadline or end of the caller context) or the
//! runner stops it. Once fired it escalates:
//!
//! ```text
//! Armed -> Escalated(TERM) -> Escalated(KILL) -> Stopped
//! Armed -> Stopped
//! ```
//!
//! TERM goes out first; the process group is then probed every
//! `poll_interval` and gets KILL if it is still around when `grace` runs out.

use crate::process::{self, Delivery, Liveness};
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use warden_core::{ContextMonitor, Escalation, Timeout};

#[derive(Debug, Clone)]
pub enum Trigger {
    Deadline(Duration),
    ContextExit(ContextMonitor),
}

impl Trigger {
    async fn fired(&self) {
        match self {
            Trigger::Deadline(after) => sleep(*after).await,
            Trigger::ContextExit(monitor) => monitor.ended().await,
        }
    }
}

impl From<&Timeout> for Trigger {
    fn from(timeout: &Timeout) -> Self {
        match timeout {
            Timeout::After(after) => Trigger::Deadline(*after),
            Timeout::OnContextExit(monitor) => Trigger::ContextExit(monitor.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Stopped before the trigger fired, or the process was gone when it did.
    Disarmed,
    /// TERM was sent and the process went away within the grace window.
    Terminated,
    /// KILL was needed.
    Killed,
}

impl WatchdogOutcome {
    pub fn fired(&self) -> bool {
        !matches!(self, WatchdogOutcome::Disarmed)
    }
}

pub struct Watchdog {
    stop: oneshot::Sender<()>,
    task: JoinHandle<WatchdogOutcome>,
}

impl Watchdog {
    /// Arm a watchdog for `pid`. Must be called inside a tokio runtime.
    pub fn arm(pid: u32, trigger: Trigger, escalation: Escalation) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(supervise(pid, trigger, escalation, stopped));
        Self { stop, task }
    }

    /// Ask the task to stop and wait until it has.
    pub async fn stop(self) -> WatchdogOutcome {
        // Err only means the task already finished on its own
        let _ = self.stop.send(());
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(error = %err, "Watchdog task ended abnormally");
                WatchdogOutcome::Disarmed
            }
        }
    }
}

async fn supervise(
    pid: u32,
    trigger: Trigger,
    escalation: Escalation,
    mut stopped: oneshot::Receiver<()>,
) -> WatchdogOutcome {
    tokio::select! {
        biased;
        _ = &mut stopped => return WatchdogOutcome::Disarmed,
        _ = trigger.fired() => {}
    }

    info!(pid, trigger = ?trigger, "Command overran, sending SIGTERM");
    match process::send(pid, Signal::SIGTERM) {
        Delivery::Sent => {}
        Delivery::ProcessGone => return WatchdogOutcome::Disarmed,
        Delivery::Failed(errno) => {
            debug!(pid, error = %errno, "SIGTERM not delivered");
        }
    }

    let give_up = Instant::now() + escalation.grace;
    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => return WatchdogOutcome::Terminated,
            _ = sleep(escalation.poll_interval) => {}
        }

        match process::probe(pid) {
            Liveness::Exited => return WatchdogOutcome::Terminated,
            Liveness::Alive | Liveness::Unknown if Instant::now() >= give_up => break,
            Liveness::Alive | Liveness::Unknown => {}
        }
    }

    info!(pid, grace = ?escalation.grace, "Command survived SIGTERM, sending SIGKILL");
    match process::send(pid, Signal::SIGKILL) {
        Delivery::ProcessGone => WatchdogOutcome::Terminated,
        Delivery::Failed(errno) => {
            debug!(pid, error = %errno, "SIGKILL not delivered");
            WatchdogOutcome::Killed
        }
        Delivery::Sent => WatchdogOutcome::Killed,
    }
}
