//! The supervision loop.
//!
//! One cycle:
//!
//! ```text
//! wait for broker ─► grant token ─► handshake ─► grant token ─► spawn runner
//!        ▲            (launcher)        │         (runner)          │
//!        │                     broker down: cool down        health monitor
//!        │                                                          │
//!        └──────────── strip grant token ◄── join monitor ◄── runner exits
//! ```
//!
//! The loop only ends on a terminal error or a shutdown request.

use std::process::ExitStatus;
use std::time::Duration;

use crate::broker::BrokerClient;
use crate::cancel::CancelScope;
use crate::config::{EnvConfig, RunnerConfig};
use crate::env::RunnerEnv;
use crate::error::LaunchError;
use crate::handshake::{self, DEFAULT_MAX_MESSAGE_SIZE, HandshakeConfig, HandshakeError};
use crate::health::{HealthMonitor, HealthSettings, HttpProbe};
use crate::retry::RetryPolicy;
use crate::subprocess::RunnerCommand;

/// Timing and limits for the loop. Defaults match production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSettings {
    pub readiness_policy: RetryPolicy,
    pub grant_token_policy: RetryPolicy,
    /// Pause before reconnecting after the broker dropped the handshake.
    pub reconnect_cooldown: Duration,
    pub health: HealthSettings,
    pub max_message_size: usize,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            readiness_policy: RetryPolicy::UNBOUNDED,
            grant_token_policy: RetryPolicy::BOUNDED,
            reconnect_cooldown: Duration::from_secs(5),
            health: HealthSettings::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// How a runner process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited cleanly after its idle timeout.
    IdleShutdown,
    /// Killed by the health monitor.
    Unhealthy,
    /// Exited on its own with a failure status.
    Failed(ExitStatus),
}

impl ExitKind {
    /// A kill that raced with a clean exit is a no-op, so the real exit
    /// status wins over the monitor's report.
    pub fn classify(status: ExitStatus, killed_by_monitor: bool) -> Self {
        if status.success() {
            Self::IdleShutdown
        } else if killed_by_monitor {
            Self::Unhealthy
        } else {
            Self::Failed(status)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The broker dropped the handshake; the next cycle reconnects.
    BrokerDown,
    RunnerExited(ExitKind),
    ShutdownRequested,
}

pub struct Launcher {
    runner: RunnerConfig,
    env: EnvConfig,
    settings: LaunchSettings,
    broker: BrokerClient,
    runner_env: RunnerEnv,
    shutdown: CancelScope,
    cycles: u64,
}

impl Launcher {
    /// Build a launcher whose runner inherits the allow-listed part of this
    /// process's environment.
    pub fn new(
        runner: RunnerConfig,
        env: EnvConfig,
        settings: LaunchSettings,
        shutdown: CancelScope,
    ) -> Self {
        let runner_env = RunnerEnv::from_process(&runner, &env);
        tracing::debug!(keys = ?runner_env.keys(), "filtered environment variables");
        Self {
            broker: BrokerClient::new(&env.task_broker_uri),
            runner,
            env,
            settings,
            runner_env,
            shutdown,
            cycles: 0,
        }
    }

    /// Replace the runner environment assembled by [`Launcher::new`].
    #[must_use]
    pub fn with_runner_env(mut self, runner_env: RunnerEnv) -> Self {
        self.runner_env = runner_env;
        self
    }

    pub const fn runner_env(&self) -> &RunnerEnv {
        &self.runner_env
    }

    /// Supervise forever. Returns `Ok` only after a shutdown request.
    pub fn run(&mut self) -> Result<(), LaunchError> {
        tracing::info!(runner_type = %self.runner.runner_type, "starting launcher");
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested, stopping launcher");
                return Ok(());
            }
            if self.run_cycle()? == CycleOutcome::ShutdownRequested {
                tracing::info!("shutdown requested, stopping launcher");
                return Ok(());
            }
        }
    }

    /// One full launch cycle.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, LaunchError> {
        self.cycles += 1;
        let _span = tracing::info_span!("cycle", n = self.cycles).entered();

        // 1. broker readiness
        self.broker
            .wait_until_ready(self.settings.readiness_policy)
            .map_err(|source| LaunchError::RetriesExhausted {
                what: "failed while waiting for task broker to be ready",
                source,
            })?;
        if self.shutdown.is_cancelled() {
            return Ok(CycleOutcome::ShutdownRequested);
        }

        // 2. launcher grant token
        let launcher_token = self
            .broker
            .fetch_grant_token(&self.env.auth_token, self.settings.grant_token_policy)
            .map_err(|source| LaunchError::RetriesExhausted {
                what: "failed to fetch grant token for launcher",
                source,
            })?;
        tracing::debug!("fetched grant token for launcher");

        // 3. handshake
        let handshake_cfg = HandshakeConfig {
            max_message_size: self.settings.max_message_size,
            ..HandshakeConfig::new(
                &self.runner.runner_type,
                &self.env.task_broker_uri,
                &launcher_token,
            )
        };
        match handshake::handshake(&handshake_cfg) {
            Ok(()) => {}
            Err(HandshakeError::BrokerDown) => {
                tracing::warn!("task broker is down, launcher will try to reconnect");
                if self.shutdown.wait_timeout(self.settings.reconnect_cooldown) {
                    return Ok(CycleOutcome::ShutdownRequested);
                }
                return Ok(CycleOutcome::BrokerDown);
            }
            Err(e) => return Err(e.into()),
        }

        // 4. runner grant token
        let runner_token = self
            .broker
            .fetch_grant_token(&self.env.auth_token, self.settings.grant_token_policy)
            .map_err(|source| LaunchError::RetriesExhausted {
                what: "failed to fetch grant token for runner",
                source,
            })?;
        tracing::debug!("fetched grant token for runner");

        // 5. spawn
        self.runner_env.with_grant_token(&runner_token);
        let command = RunnerCommand::new(&self.runner.command)
            .args(&self.runner.args)
            .workdir(&self.runner.workdir)
            .env(&self.runner_env);
        tracing::debug!(
            command = %self.runner.command,
            args = ?self.runner.args,
            env = ?self.runner_env.keys(),
            "task ready for pickup, launching runner"
        );

        let scope = self.shutdown.child();
        let process = match command.spawn() {
            Ok(process) => process,
            Err(source) => {
                scope.cancel();
                return Err(LaunchError::Spawn {
                    command: self.runner.command.clone(),
                    source,
                });
            }
        };

        // 6. health monitor
        let probe = HttpProbe::new(&self.env.runner_uri, self.settings.health.probe_timeout);
        let monitor = HealthMonitor::spawn(self.settings.health, probe, process.handle(), &scope);

        // 7. wait, stop monitoring, classify
        let waited = process.wait(&scope);
        scope.cancel();
        let report = monitor.join()?;

        // 8. the next runner needs a fresh grant token
        self.runner_env.clear_grant_token();

        let status = waited.map_err(|e| {
            LaunchError::Other(format!("failed to wait for runner process: {e}"))
        })?;

        if self.shutdown.is_cancelled() {
            tracing::info!(%status, "runner stopped for shutdown");
            return Ok(CycleOutcome::ShutdownRequested);
        }

        let kind = ExitKind::classify(status, report.killed);
        match kind {
            ExitKind::Unhealthy => tracing::warn!("unhealthy runner process was terminated"),
            ExitKind::Failed(status) => {
                tracing::error!(%status, "runner process exited with error");
            }
            ExitKind::IdleShutdown => tracing::info!("runner exited on idle timeout"),
        }
        Ok(CycleOutcome::RunnerExited(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn status_of(script: &str) -> ExitStatus {
        Command::new("sh").args(["-c", script]).status().unwrap()
    }

    #[test]
    fn clean_exit_is_idle_shutdown_even_if_monitor_fired() {
        let ok = status_of("exit 0");
        assert_eq!(ExitKind::classify(ok, false), ExitKind::IdleShutdown);
        assert_eq!(ExitKind::classify(ok, true), ExitKind::IdleShutdown);
    }

    #[test]
    fn failure_is_unhealthy_only_when_monitor_killed() {
        let failed = status_of("exit 1");
        assert_eq!(ExitKind::classify(failed, true), ExitKind::Unhealthy);
        assert_eq!(ExitKind::classify(failed, false), ExitKind::Failed(failed));
    }

    #[test]
    fn default_settings_use_canonical_policies() {
        let settings = LaunchSettings::default();
        assert_eq!(settings.readiness_policy, RetryPolicy::UNBOUNDED);
        assert_eq!(settings.grant_token_policy, RetryPolicy::BOUNDED);
        assert_eq!(settings.reconnect_cooldown, Duration::from_secs(5));
    }
}
