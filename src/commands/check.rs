use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use crate::config::{EnvConfig, RunnerConfig, config_path, load_runner_config};
use crate::error::LaunchError;

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Runner type to resolve, as named in the config file
    pub runner_type: String,
    /// Path to the runner config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// What `launch` would run with. The auth token is never printed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckReport {
    pub config_path: PathBuf,
    pub task_broker_uri: String,
    pub runner_uri: String,
    pub idle_timeout: String,
    pub log_level: String,
    pub runner: RunnerConfig,
}

impl CheckArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let env = EnvConfig::from_env().map_err(LaunchError::from)?;
        let path = config_path(self.config);
        let runner = load_runner_config(&path, &self.runner_type).map_err(LaunchError::from)?;

        let report = CheckReport {
            config_path: path,
            task_broker_uri: env.task_broker_uri,
            runner_uri: env.runner_uri,
            idle_timeout: env.idle_timeout,
            log_level: env.log_level,
            runner,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
