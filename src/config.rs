//! Runtime configuration for Berth

use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default Docker Engine socket path
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Docker Engine API version used for every request
pub const DEFAULT_API_VERSION: &str = "v1.41";

/// Number of finished pull tasks kept in the history ring
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Berth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    /// Unix socket of the Docker Engine
    pub socket_path: PathBuf,
    /// TCP endpoint of the Docker Engine (`tcp://host:port`), preferred over the socket
    pub docker_host: Option<String>,
    /// Engine API version prefix
    pub api_version: String,
    /// Data directory; project files live under `projects/`
    pub data_path: PathBuf,
    /// Private registries that need a token before pulling
    pub registries: Vec<RegistryConfig>,
    /// Capacity of the pull history ring
    pub history_limit: usize,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            docker_host: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            data_path: PathBuf::from("/var/lib/berth"),
            registries: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Private registry configuration (ECR shaped)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host, e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com`
    pub host: String,
    /// Other names images may use for this registry
    pub alias: Vec<String>,
    /// Cloud region
    pub region: Option<String>,
    /// Access key id
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    /// Plain username, used by the static token provider
    pub username: Option<String>,
    /// Plain password, used by the static token provider
    pub password: Option<String>,
    /// Lifetime of a generated token in seconds
    pub token_ttl_secs: Option<u64>,
}

impl BerthConfig {
    /// Load configuration from an explicit path, the user config dir, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BerthError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Parse YAML config content
    pub fn from_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// `~/.config/berth/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("berth").join("config.yaml"))
    }

    /// Directory holding `*.project.yml` files
    pub fn projects_dir(&self) -> PathBuf {
        self.data_path.join("projects")
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("DOCKER_HOST").filter(|h| !h.is_empty()) {
            if let Some(socket) = host.strip_prefix("unix://") {
                self.socket_path = PathBuf::from(socket);
                self.docker_host = None;
            } else {
                self.docker_host = Some(host);
            }
        }
        if let Some(socket) = lookup("BERTH_SOCKET").filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(data) = lookup("BERTH_DATA_PATH").filter(|s| !s.is_empty()) {
            self.data_path = PathBuf::from(data);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(BerthError::InvalidConfig(
                "history_limit must be at least 1".to_string(),
            ));
        }
        for registry in &self.registries {
            if registry.host.is_empty() {
                return Err(BerthError::InvalidConfig(
                    "registry entry without host".to_string(),
                ));
            }
        }
        Ok(())
    }
}
