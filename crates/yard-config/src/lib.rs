use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_YARD_CONFIG: &str = "YARD_CONFIG";

const DEFAULT_SESSION_NAME: &str = "yard";
const DEFAULT_ASSISTANT_COMMAND: &str = "claude";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// On-disk configuration, read from `~/.config/yard/config.toml` unless
/// `YARD_CONFIG` points elsewhere. A missing file is materialized with
/// defaults on first load; `repo` must then be filled in by hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct YardConfig {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default = "default_worktree_base")]
    pub worktree_base: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_session_name")]
    pub session: String,
    #[serde(default = "default_assistant_command")]
    pub assistant_command: String,
}

/// The source repository a yard instance manages. `remote` is the
/// `owner/name` slug used with the code-review host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub remote: String,
}

impl Default for YardConfig {
    fn default() -> Self {
        Self {
            repo: RepoConfig::default(),
            worktree_base: default_worktree_base(),
            database_path: default_database_path(),
            session: default_session_name(),
            assistant_command: default_assistant_command(),
        }
    }
}

impl YardConfig {
    /// Fails when the fields with no sensible default are still blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo.path.trim().is_empty() {
            return Err(ConfigError::configuration(
                "repo.path is not set. Edit the config file and point it at your main checkout.",
            ));
        }
        if self.repo.remote.trim().is_empty() {
            return Err(ConfigError::configuration(
                "repo.remote is not set. Edit the config file and set it to the owner/name slug.",
            ));
        }
        Ok(())
    }
}

pub fn load_from_env() -> Result<YardConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<YardConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("yard").join("config.toml"))
}

pub fn save(path: &Path, config: &YardConfig) -> Result<(), ConfigError> {
    persist_config(path, config)
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_YARD_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "YARD_CONFIG contained invalid UTF-8",
        )),
    }
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn default_yard_dir() -> PathBuf {
    resolve_home_dir()
        .map(|home| home.join(".config").join("yard"))
        .unwrap_or_else(|| PathBuf::from(".config/yard"))
}

fn default_worktree_base() -> String {
    resolve_home_dir()
        .map(|home| home.join("worktrees"))
        .unwrap_or_else(|| PathBuf::from("worktrees"))
        .to_string_lossy()
        .to_string()
}

fn default_database_path() -> String {
    default_yard_dir().join("yard.db").to_string_lossy().to_string()
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_owned()
}

fn default_assistant_command() -> String {
    DEFAULT_ASSISTANT_COMMAND.to_owned()
}

fn persist_config(path: &Path, config: &YardConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize config for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write config to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<YardConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for the config file: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = YardConfig::default();
            persist_config(path, &default_config)?;

            toml::to_string_pretty(&default_config).map_err(|err| {
                ConfigError::configuration(format!("Failed to serialize default config: {err}"))
            })?
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read config from {}: {err}",
                path.display()
            )));
        }
    };

    toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse config from {}: {err}",
            path.display()
        ))
    })
}
