//! Proxy configuration
//!
//! Loads settings from `agent-stream-proxy.toml`. Every field has a default,
//! so a missing file or a partial one is fine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent::AgentCommand;

/// Configuration file looked up in the current directory
pub const DEFAULT_CONFIG_FILE: &str = "agent-stream-proxy.toml";

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_EXECUTABLE: &str = "claude";
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `[server]` section
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// `[agent]` section
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    /// Executable name or path
    pub executable: String,
    /// Working directory for the agent; the current directory if unset
    pub working_dir: Option<PathBuf>,
    /// Arguments added after the stream flags
    pub extra_args: Vec<String>,
    /// Seconds between SIGTERM and SIGKILL when stopping a job
    pub grace_period_secs: u64,
    /// Extra environment variables for the agent
    pub env: HashMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            working_dir: None,
            extra_args: Vec::new(),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            env: HashMap::new(),
        }
    }
}

/// Values given on the command line; `Some` wins over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub executable: Option<String>,
    pub working_dir: Option<PathBuf>,
}

/// Complete proxy configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub server: ServerSettings,
    pub agent: AgentSettings,
}

impl ProxyConfig {
    /// Load configuration from a file that must exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else the default file if present, else defaults
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.executable.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agent.executable cannot be empty".to_string(),
            ));
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Apply command line overrides
    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(executable) = overrides.executable {
            self.agent.executable = executable;
        }
        if let Some(dir) = overrides.working_dir {
            self.agent.working_dir = Some(dir);
        }
        self.validate()
    }

    /// Agent working directory, defaulting to the current directory
    pub fn working_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.agent.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().map_err(|source| ConfigError::Read {
                path: PathBuf::from("."),
                source,
            }),
        }
    }

    /// Build the agent command these settings describe
    pub fn agent_command(&self) -> Result<AgentCommand, ConfigError> {
        let working_dir = self.working_dir()?;
        if !working_dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "agent working directory {} does not exist",
                working_dir.display()
            )));
        }

        Ok(AgentCommand::new(&self.agent.executable, working_dir)
            .with_extra_args(self.agent.extra_args.clone())
            .with_env(self.agent.env.clone())
            .with_grace_period(Duration::from_secs(self.agent.grace_period_secs)))
    }
}
