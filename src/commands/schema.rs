use std::io::Write;

use crate::config::LauncherConfig;

/// Write the config file's JSON Schema to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &LauncherConfig::schema())?;
    writeln!(out)?;
    Ok(())
}
