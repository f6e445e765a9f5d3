use std::process::ExitCode;

use clap::{Parser, Subcommand};

use runner_launcher::commands::check::CheckArgs;
use runner_launcher::commands::launch::LaunchArgs;
use runner_launcher::config::{DEFAULT_LOG_LEVEL, ENV_LOG_LEVEL};
use runner_launcher::error::LaunchError;
use runner_launcher::{commands, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "runner-launcher",
    version,
    about = "Register, launch, and supervise task runners for a task broker"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Wait for tasks and launch a runner of the given type for each one
    Launch(LaunchArgs),
    /// Validate environment and config file, then print the resolved runner
    Check(CheckArgs),
    /// Print the JSON Schema for the runner config file
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch",
            Self::Check(_) => "check",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    // Invalid levels are reported later by config validation.
    let level = std::env::var(ENV_LOG_LEVEL)
        .map_or_else(|_| DEFAULT_LOG_LEVEL.to_string(), |l| l.to_lowercase());
    let _telemetry = telemetry::init(&level);

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Launch(args) => args.execute(),
        Commands::Check(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(launch_err) = e.downcast_ref::<LaunchError>() {
                tracing::error!(error = %format!("{e:#}"), "launcher stopped");
                eprintln!("error: {e:#}");
                launch_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
