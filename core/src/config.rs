//! Session configuration.
//!
//! Layers, later wins:
//! 1. Built-in defaults
//! 2. TOML file (`fstar-interactive.toml` next to the checked file, or an
//!    explicit path)
//! 3. `FSTAR_INTERACTIVE_*` environment variables

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::supervisor::PreprocessCommand;
use crate::supervisor::ProcessCommand;

pub const CONFIG_FILE_NAME: &str = "fstar-interactive.toml";
pub const ENV_PREFIX: &str = "FSTAR_INTERACTIVE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Verifier binary, resolved through `PATH`.
    #[serde(default = "default_executable")]
    pub executable: String,

    #[serde(default = "default_arguments")]
    pub arguments: Vec<String>,

    /// Directory the verifier runs in. Front-ends default it to the
    /// directory of the checked file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Run to completion before every verifier start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocess: Option<PreprocessConfig>,

    /// Delay between a rejection and the `#pop` that discards it.
    #[serde(default = "default_rollback_delay_ms")]
    pub rollback_delay_ms: u64,

    /// Line text that `verify_to_marker` stops at.
    #[serde(default = "default_check_marker")]
    pub check_marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreprocessConfig {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

fn default_executable() -> String {
    "fstar.exe".to_string()
}
fn default_arguments() -> Vec<String> {
    vec!["--in".to_string()]
}
fn default_rollback_delay_ms() -> u64 {
    500
}
fn default_check_marker() -> String {
    "(* check_marker *)".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            arguments: default_arguments(),
            working_directory: None,
            preprocess: None,
            rollback_delay_ms: default_rollback_delay_ms(),
            check_marker: default_check_marker(),
        }
    }
}

impl SessionConfig {
    pub fn rollback_delay(&self) -> Duration {
        Duration::from_millis(self.rollback_delay_ms)
    }

    pub fn process_command(&self) -> ProcessCommand {
        ProcessCommand {
            executable: self.executable.clone(),
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            preprocess: self.preprocess.as_ref().map(|p| PreprocessCommand {
                program: p.program.clone(),
                arguments: p.arguments.clone(),
            }),
        }
    }

    /// Applies `FSTAR_INTERACTIVE_*` pairs. Unknown keys are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "EXECUTABLE" => self.executable = value.to_string(),
                "ARGS" => self.arguments = split_words(key.as_ref(), value)?,
                "CWD" => self.working_directory = Some(PathBuf::from(value)),
                "PREPROCESS" => {
                    let mut words = split_words(key.as_ref(), value)?;
                    self.preprocess = if words.is_empty() {
                        None
                    } else {
                        let program = words.remove(0);
                        Some(PreprocessConfig {
                            program,
                            arguments: words,
                        })
                    };
                }
                "ROLLBACK_DELAY_MS" => {
                    self.rollback_delay_ms =
                        value
                            .trim()
                            .parse()
                            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                                key: key.as_ref().to_string(),
                                value: value.to_string(),
                                reason: e.to_string(),
                            })?;
                }
                other => tracing::debug!("ignoring unknown setting {ENV_PREFIX}{other}"),
            }
        }
        Ok(())
    }
}

fn split_words(key: &str, value: &str) -> Result<Vec<String>> {
    shlex::split(value).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "unbalanced quotes".to_string(),
    })
}

/// Layered loader for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env: Option<Vec<(String, String)>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit configuration file. It must exist.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Replaces the process environment as the source of overrides.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn load(&self) -> Result<SessionConfig> {
        let mut config = match &self.config_path {
            Some(path) => Self::read_file(path)?,
            None => SessionConfig::default(),
        };
        match &self.env {
            Some(vars) => config.apply_env(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))?,
            None => config.apply_env(std::env::vars())?,
        }
        Ok(config)
    }

    /// `fstar-interactive.toml` in `dir`, if present.
    pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
        let candidate = dir.join(CONFIG_FILE_NAME);
        candidate.is_file().then_some(candidate)
    }

    fn read_file(path: &Path) -> Result<SessionConfig> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
