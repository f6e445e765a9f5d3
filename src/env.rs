//! Environment handed to the runner process.

use std::collections::BTreeMap;
use std::ffi::OsString;

use crate::config::{EnvConfig, RunnerConfig};

pub const ENV_AUTH_TOKEN: &str = "RUNNERS_AUTH_TOKEN";
pub const ENV_GRANT_TOKEN: &str = "RUNNERS_GRANT_TOKEN";
pub const ENV_SERVER_ENABLED: &str = "RUNNERS_SERVER_ENABLED";
pub const ENV_IDLE_TIMEOUT: &str = "RUNNERS_AUTO_SHUTDOWN_TIMEOUT";

/// Inherited by every runner regardless of its `allowed-env`.
pub const DEFAULT_ALLOWED_ENV: [&str; 4] = ["LANG", "PATH", "TZ", "TERM"];

/// Ordered `KEY=VALUE` set for the runner.
///
/// Built once per launch from the allow-list and fixed entries; only the grant
/// token changes between cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerEnv {
    vars: BTreeMap<String, String>,
}

impl RunnerEnv {
    /// Keep only allow-listed variables from `inherited`. Allowed entries
    /// whose value is not UTF-8 are skipped with a warning; everything else
    /// is ignored without looking at it.
    pub fn allowed_only<I, K, V>(inherited: I, allowed: &[&str]) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut vars = BTreeMap::new();
        for (key, value) in inherited {
            let key: OsString = key.into();
            let Some(key) = key.to_str().filter(|k| allowed.contains(k)) else {
                continue;
            };
            match value.into().into_string() {
                Ok(value) => {
                    vars.insert(key.to_string(), value);
                }
                Err(_) => tracing::warn!(key, "skipping allowed variable with non-UTF-8 value"),
            }
        }
        Self { vars }
    }

    /// Allow-listed part of this process's environment plus the fixed runner
    /// settings.
    pub fn from_process(runner: &RunnerConfig, env: &EnvConfig) -> Self {
        Self::assemble(std::env::vars_os(), runner, env)
    }

    /// Allow-listed inherited variables plus the fixed runner settings.
    pub fn assemble<I, K, V>(inherited: I, runner: &RunnerConfig, env: &EnvConfig) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut allowed: Vec<&str> = DEFAULT_ALLOWED_ENV.to_vec();
        for key in &runner.allowed_env {
            // Never leak the launcher's own credentials to the runner.
            if key == ENV_AUTH_TOKEN || key == ENV_GRANT_TOKEN {
                tracing::warn!(
                    key = %key,
                    runner_type = %runner.runner_type,
                    "ignoring credential variable in allowed-env"
                );
                continue;
            }
            allowed.push(key);
        }

        let mut assembled = Self::allowed_only(inherited, &allowed);
        assembled.set(ENV_SERVER_ENABLED, "true");
        assembled.set(ENV_IDLE_TIMEOUT, &env.idle_timeout);
        assembled
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Remove every entry for `key`.
    pub fn clear(&mut self, key: &str) {
        self.vars.remove(key);
    }

    pub fn with_grant_token(&mut self, token: &str) {
        self.set(ENV_GRANT_TOKEN, token);
    }

    pub fn clear_grant_token(&mut self) {
        self.clear(ENV_GRANT_TOKEN);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.vars.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `KEY=VALUE` strings in key order.
    pub fn to_pairs(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}
