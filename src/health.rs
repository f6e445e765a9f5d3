//! Runner health monitoring.
//!
//! The monitor polls the runner's `/healthz` on a fixed interval and reports
//! [`HealthStatus::Unhealthy`] after too many consecutive failures. A separate
//! killer thread waits on that single report and terminates the runner, so the
//! probe loop never blocks on process I/O. Cancelling the monitor's scope ends
//! it with [`HealthStatus::Cancelled`] and no kill.
//!
//! ```text
//!   monitor thread ──(one HealthStatus)──► killer thread ──► Terminate::terminate
//!        ▲                                      │
//!   CancelScope                           MonitorHandle::join
//! ```

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, bail};

use crate::broker::http_agent;
use crate::cancel::CancelScope;
use crate::error::LaunchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// Wait before the first probe, to let the runner start its server.
    pub initial_delay: Duration,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures after which the runner is terminated.
    pub max_failures: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            max_failures: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unhealthy,
    Cancelled,
}

/// A single health check against the runner.
pub trait Probe: Send + 'static {
    fn probe(&mut self) -> anyhow::Result<()>;
}

impl<F> Probe for F
where
    F: FnMut() -> anyhow::Result<()> + Send + 'static,
{
    fn probe(&mut self) -> anyhow::Result<()> {
        self()
    }
}

/// Something the monitor can forcibly stop.
pub trait Terminate: Send + 'static {
    fn terminate(&self) -> std::io::Result<()>;
}

/// `GET {runner}/healthz`, 200 is healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    agent: ureq::Agent,
    url: String,
}

impl HttpProbe {
    pub fn new(runner_uri: &str, timeout: Duration) -> Self {
        Self {
            agent: http_agent(timeout),
            url: format!("{}/healthz", runner_uri.trim_end_matches('/')),
        }
    }
}

impl Probe for HttpProbe {
    fn probe(&mut self) -> anyhow::Result<()> {
        let resp = self
            .agent
            .get(&self.url)
            .call()
            .context("failed to send health check request to runner")?;
        let status = resp.status().as_u16();
        if status != 200 {
            bail!("runner health check returned status code {status}");
        }
        Ok(())
    }
}

/// What happened to one monitored runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorReport {
    pub status: HealthStatus,
    /// The killer terminated the runner.
    pub killed: bool,
}

/// Join handle over the monitor and killer threads.
#[derive(Debug)]
pub struct MonitorHandle {
    monitor: JoinHandle<()>,
    killer: JoinHandle<(HealthStatus, std::io::Result<bool>)>,
}

impl MonitorHandle {
    /// Wait for both threads. Only returns once the monitor has fully stopped,
    /// so cancel its scope first unless it is known to be finishing.
    pub fn join(self) -> Result<MonitorReport, LaunchError> {
        if self.monitor.join().is_err() {
            return Err(LaunchError::Other("health monitor thread panicked".into()));
        }
        let (status, killed) = self
            .killer
            .join()
            .map_err(|_| LaunchError::Other("runner killer thread panicked".into()))?;
        let killed = killed.map_err(LaunchError::KillFailed)?;
        Ok(MonitorReport { status, killed })
    }
}

pub struct HealthMonitor;

impl HealthMonitor {
    /// Start monitoring `target` until `scope` is cancelled or the runner is
    /// found unhealthy.
    pub fn spawn<P, T>(
        settings: HealthSettings,
        probe: P,
        target: T,
        scope: &CancelScope,
    ) -> MonitorHandle
    where
        P: Probe,
        T: Terminate,
    {
        let (status_tx, status_rx) = mpsc::sync_channel::<HealthStatus>(1);

        let monitor = {
            let scope = scope.clone();
            thread::spawn(move || {
                let status = watch(settings, probe, &scope);
                let _ = status_tx.send(status);
            })
        };

        let killer = {
            let scope = scope.clone();
            thread::spawn(move || {
                // A dropped sender means the monitor panicked; treat as cancelled.
                let status = status_rx.recv().unwrap_or(HealthStatus::Cancelled);
                match status {
                    HealthStatus::Unhealthy => {
                        tracing::warn!(
                            "found runner unresponsive too many times, terminating runner"
                        );
                        let killed = target.terminate();
                        if let Err(e) = &killed {
                            tracing::error!(error = %e, "failed to terminate unhealthy runner");
                            // Unblock whoever waits on the runner so the error surfaces now.
                            scope.cancel();
                        }
                        (status, killed.map(|()| true))
                    }
                    HealthStatus::Cancelled => (status, Ok(false)),
                }
            })
        };

        tracing::debug!("started monitoring runner health");
        MonitorHandle { monitor, killer }
    }
}

/// The probe loop. Returns exactly once with the terminal status.
///
/// The first check comes one `interval` after `initial_delay`.
fn watch<P: Probe>(settings: HealthSettings, mut probe: P, scope: &CancelScope) -> HealthStatus {
    if scope.wait_timeout(settings.initial_delay) {
        tracing::debug!("stopped monitoring runner health");
        return HealthStatus::Cancelled;
    }

    let mut failures: u32 = 0;
    loop {
        if scope.wait_timeout(settings.interval) {
            tracing::debug!("stopped monitoring runner health");
            return HealthStatus::Cancelled;
        }

        match probe.probe() {
            Ok(()) => {
                if failures > 0 {
                    tracing::debug!(previous_failures = failures, "runner recovered");
                }
                failures = 0;
                tracing::debug!("found runner healthy");
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    failures,
                    max_failures = settings.max_failures,
                    error = %format!("{e:#}"),
                    "found runner unresponsive ({failures}/{})",
                    settings.max_failures
                );
                if failures >= settings.max_failures {
                    return HealthStatus::Unhealthy;
                }
            }
        }
    }
}
