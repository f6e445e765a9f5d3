use std::path::{Path, PathBuf};

use schemars::schema::RootSchema;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use ureq::http::Uri;

use crate::env::{ENV_AUTH_TOKEN, ENV_IDLE_TIMEOUT};

pub const ENV_TASK_BROKER_URI: &str = "RUNNERS_TASK_BROKER_URI";
pub const ENV_RUNNER_URI: &str = "RUNNERS_RUNNER_URI";
pub const ENV_LOG_LEVEL: &str = "RUNNERS_LAUNCHER_LOG_LEVEL";
pub const ENV_CONFIG_PATH: &str = "RUNNERS_LAUNCHER_CONFIG";

pub const DEFAULT_TASK_BROKER_URI: &str = "http://127.0.0.1:5679";
pub const DEFAULT_RUNNER_URI: &str = "http://127.0.0.1:5681";
pub const DEFAULT_IDLE_TIMEOUT: &str = "15";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/task-runners.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment: {}", .0.join("; "))]
    InvalidEnv(Vec<String>),

    #[error("failed to open config file at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("found no task runner configs in {}", path.display())]
    NoRunners { path: PathBuf },

    #[error("config file does not contain requested runner type: {0}")]
    UnknownRunnerType(String),

    #[error("runner type {0} has an empty command")]
    EmptyCommand(String),
}

/// Launcher settings taken from the environment, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub auth_token: String,
    pub task_broker_uri: String,
    pub runner_uri: String,
    /// Seconds a runner may sit idle before shutting itself down.
    pub idle_timeout: String,
    pub log_level: String,
}

impl EnvConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through `lookup`, collecting every validation failure rather than
    /// stopping at the first.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut errors = Vec::new();

        let auth_token = get(ENV_AUTH_TOKEN).unwrap_or_default();
        if auth_token.is_empty() {
            errors.push(format!("{ENV_AUTH_TOKEN} is required"));
        }

        let task_broker_uri =
            get(ENV_TASK_BROKER_URI).unwrap_or_else(|| DEFAULT_TASK_BROKER_URI.to_string());
        if let Err(e) = validate_url(&task_broker_uri, ENV_TASK_BROKER_URI) {
            errors.push(e);
        }

        let runner_uri = get(ENV_RUNNER_URI).unwrap_or_else(|| DEFAULT_RUNNER_URI.to_string());
        if let Err(e) = validate_url(&runner_uri, ENV_RUNNER_URI) {
            errors.push(e);
        }

        let idle_timeout = get(ENV_IDLE_TIMEOUT).unwrap_or_else(|| DEFAULT_IDLE_TIMEOUT.to_string());
        if idle_timeout.parse::<u64>().is_err() {
            errors.push(format!("{ENV_IDLE_TIMEOUT} must be a non-negative integer"));
        }

        let log_level = get(ENV_LOG_LEVEL)
            .map_or_else(|| DEFAULT_LOG_LEVEL.to_string(), |l| l.to_lowercase());
        if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
            errors.push(format!("{ENV_LOG_LEVEL} must be one of debug, info, warn, error"));
        }

        if !errors.is_empty() {
            return Err(ConfigError::InvalidEnv(errors));
        }

        Ok(Self {
            auth_token,
            task_broker_uri: task_broker_uri.trim_end_matches('/').to_string(),
            runner_uri: runner_uri.trim_end_matches('/').to_string(),
            idle_timeout,
            log_level,
        })
    }
}

fn validate_url(value: &str, name: &str) -> Result<(), String> {
    let uri: Uri = value
        .parse()
        .map_err(|e| format!("{name} must be a valid URL: {e}"))?;
    match uri.scheme_str() {
        Some("http" | "https") => {}
        _ => return Err(format!("{name} must use http:// or https:// scheme")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(format!("{name} must include a host"));
    }
    Ok(())
}

/// One runner the launcher knows how to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// Task type the runner serves, e.g. "javascript".
    pub runner_type: String,
    /// Working directory for the runner process.
    pub workdir: PathBuf,
    /// Executable to start.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables passed through to the runner in addition to the defaults.
    #[serde(default)]
    pub allowed_env: Vec<String>,
}

/// Launcher config file: every runner type this host can launch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct LauncherConfig {
    pub task_runners: Vec<RunnerConfig>,
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.task_runners.is_empty() {
            return Err(ConfigError::NoRunners {
                path: path.to_path_buf(),
            });
        }
        Ok(config)
    }

    /// JSON Schema for the config file. Fields with defaults are optional.
    pub fn schema() -> RootSchema {
        schema_for!(Self)
    }

    pub fn runner(&self, runner_type: &str) -> Result<&RunnerConfig, ConfigError> {
        let runner = self
            .task_runners
            .iter()
            .find(|r| r.runner_type == runner_type)
            .ok_or_else(|| ConfigError::UnknownRunnerType(runner_type.to_string()))?;
        if runner.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand(runner_type.to_string()));
        }
        Ok(runner)
    }
}

/// Resolve the config file path: explicit flag > env var > default.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the file and pick out `runner_type`.
pub fn load_runner_config(path: &Path, runner_type: &str) -> Result<RunnerConfig, ConfigError> {
    let config = LauncherConfig::load(path)?;
    match config.task_runners.len() {
        1 => tracing::debug!(path = %path.display(), "loaded config file with a single runner config"),
        n => tracing::debug!(path = %path.display(), runners = n, "loaded config file"),
    }
    config.runner(runner_type).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_defaults_apply() {
        let cfg = EnvConfig::from_lookup(lookup(&[(ENV_AUTH_TOKEN, "secret")])).unwrap();
        assert_eq!(cfg.auth_token, "secret");
        assert_eq!(cfg.task_broker_uri, DEFAULT_TASK_BROKER_URI);
        assert_eq!(cfg.runner_uri, DEFAULT_RUNNER_URI);
        assert_eq!(cfg.idle_timeout, "15");
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn env_errors_are_collected() {
        let err = EnvConfig::from_lookup(lookup(&[
            (ENV_TASK_BROKER_URI, "localhost:5679"),
            (ENV_RUNNER_URI, "ftp://runner"),
            (ENV_IDLE_TIMEOUT, "-3"),
            (ENV_LOG_LEVEL, "verbose"),
        ]))
        .unwrap_err();

        let ConfigError::InvalidEnv(errors) = err else {
            panic!("expected InvalidEnv, got {err:?}");
        };
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors[0].contains(ENV_AUTH_TOKEN));
        assert!(errors.iter().any(|e| e.contains(ENV_TASK_BROKER_URI)));
        assert!(errors.iter().any(|e| e.contains("http:// or https://")));
        assert!(errors.iter().any(|e| e.contains("non-negative integer")));
    }

    #[test]
    fn env_uris_lose_trailing_slash() {
        let cfg = EnvConfig::from_lookup(lookup(&[
            (ENV_AUTH_TOKEN, "secret"),
            (ENV_TASK_BROKER_URI, "https://broker.internal:8443/"),
            (ENV_LOG_LEVEL, "DEBUG"),
        ]))
        .unwrap();
        assert_eq!(cfg.task_broker_uri, "https://broker.internal:8443");
        assert_eq!(cfg.log_level, "debug");
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn picks_requested_runner() {
        let file = write_config(
            r#"{
                "task-runners": [
                    {
                        "runner-type": "javascript",
                        "workdir": "/usr/local/bin",
                        "command": "/usr/local/bin/node",
                        "args": ["/opt/runner/start.js"],
                        "allowed-env": ["PATH", "NODE_OPTIONS"]
                    },
                    {
                        "runner-type": "python",
                        "workdir": "/srv",
                        "command": "/usr/bin/python3",
                        "args": ["-m", "runner"]
                    }
                ]
            }"#,
        );

        let runner = load_runner_config(file.path(), "python").unwrap();
        assert_eq!(runner.command, "/usr/bin/python3");
        assert_eq!(runner.args, vec!["-m", "runner"]);
        assert!(runner.allowed_env.is_empty());
        assert_eq!(runner.workdir, PathBuf::from("/srv"));
    }

    #[test]
    fn unknown_runner_type() {
        let file = write_config(
            r#"{"task-runners": [{"runner-type": "javascript", "workdir": "/", "command": "node"}]}"#,
        );
        let err = load_runner_config(file.path(), "python").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRunnerType(t) if t == "python"));
    }

    #[test]
    fn empty_runner_list() {
        let file = write_config(r#"{"task-runners": []}"#);
        let err = LauncherConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NoRunners { .. }));
    }

    #[test]
    fn invalid_json() {
        let file = write_config(r#"{"task-runners": [{"runner-type": "javascript""#);
        let err = LauncherConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = LauncherConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("nope.json"));
    }

    #[test]
    fn schema_requires_runner_essentials_only() {
        let schema = serde_json::to_value(LauncherConfig::schema()).unwrap();
        let names = |v: &serde_json::Value| -> Vec<String> {
            v.as_array()
                .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                .unwrap_or_default()
        };

        assert_eq!(names(&schema["required"]), ["task-runners"]);
        let runner = &schema["definitions"]["RunnerConfig"];
        let mut required = names(&runner["required"]);
        required.sort();
        assert_eq!(required, ["command", "runner-type", "workdir"]);
        assert!(runner["properties"]["allowed-env"].is_object());
    }

    #[test]
    fn empty_command_is_rejected() {
        let file = write_config(
            r#"{"task-runners": [{"runner-type": "javascript", "workdir": "/", "command": " "}]}"#,
        );
        let err = load_runner_config(file.path(), "javascript").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand(_)));
    }
}
