use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::Args;

use crate::cancel::CancelScope;
use crate::config::{EnvConfig, config_path, load_runner_config};
use crate::error::LaunchError;
use crate::launcher::{LaunchSettings, Launcher};

/// How long a signal waits for the loop to wind down before forcing exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Args)]
pub struct LaunchArgs {
    /// Runner type to launch, as named in the config file
    pub runner_type: String,
    /// Path to the runner config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl LaunchArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let env = EnvConfig::from_env().map_err(LaunchError::from)?;
        let path = config_path(self.config);
        let runner = load_runner_config(&path, &self.runner_type).map_err(LaunchError::from)?;

        let shutdown = CancelScope::new();
        install_signal_handler(shutdown.clone());

        let mut launcher = Launcher::new(runner, env, LaunchSettings::default(), shutdown);
        launcher.run()?;
        Ok(())
    }
}

/// SIGINT/SIGTERM cancel the shutdown scope, which kills the running runner
/// and stops the loop at the next cycle boundary. A loop stuck in a broker
/// call is cut off after [`SHUTDOWN_GRACE`].
fn install_signal_handler(shutdown: CancelScope) {
    let result = ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal, stopping runner");
        shutdown.cancel();
        thread::sleep(SHUTDOWN_GRACE);
        tracing::warn!("launcher did not stop in time, exiting");
        process::exit(0);
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to install signal handler");
    }
}
