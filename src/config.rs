//! Configuration module for Runway
//!
//! Configuration comes from a single TOML file (the first one found) with
//! `RUNWAY_*` environment variables applied on top:
//! - Explicit `--config` path
//! - `$RUNWAY_CONFIG`
//! - Project configuration (./runway.toml)
//! - User configuration (~/.config/runway/config.toml)
//! - Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server and data directory settings
    pub server: ServerConfig,

    /// Execution defaults passed to the engines
    pub execution: ExecutionConfig,

    /// Directory service and inventory cache settings
    pub directory: DirectoryConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Audit sink for background jobs
    pub audit: AuditConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to
    pub bind: String,

    /// Root for key files, staged uploads and transient inventories
    pub data_path: PathBuf,

    /// Number of background jobs that may run at once
    pub worker_pool_size: usize,

    /// Enable permissive CORS headers
    pub enable_cors: bool,

    /// Maximum accepted request body in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            data_path: PathBuf::from("./data"),
            worker_pool_size: 4,
            enable_cors: true,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Directory holding materialized private keys.
    pub fn keyfile_dir(&self) -> PathBuf {
        self.data_path.join("keyfile")
    }

    /// Directory holding staged upload blobs.
    pub fn upload_dir(&self) -> PathBuf {
        self.data_path.join("config")
    }

    /// Directory holding transient inventory files.
    pub fn inventory_dir(&self) -> PathBuf {
        self.data_path.join("tmp_inventory")
    }
}

/// Execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Default number of forks (parallel host connections per job)
    pub forks: usize,

    /// Default SSH port
    pub remote_port: u16,

    /// Connection timeout in seconds, handed to the transport
    pub timeout: u64,

    /// Verify server keys against known_hosts
    pub host_key_checking: bool,

    /// Write retry files for failed hosts
    pub retry_files_enabled: bool,

    /// Run playbook tasks with privilege escalation
    pub r#become: bool,

    /// User to become
    pub become_user: String,

    /// Prefix prepended to `shell` module arguments
    pub shell_profile_prefix: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            forks: 10,
            remote_port: 22,
            timeout: 10,
            host_key_checking: false,
            retry_files_enabled: false,
            r#become: true,
            become_user: "root".to_string(),
            shell_profile_prefix: "source ~/.bash_profile;".to_string(),
        }
    }
}

/// Directory service and inventory cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Endpoint returning the hosts of one group
    pub host_list_url: String,

    /// Endpoint returning tag strings for a batch of hosts
    pub host_tags_url: String,

    /// Access token sent with every request
    pub token: String,

    /// Source groups to pull
    pub groups: Vec<String>,

    /// Directory holding the two cache documents
    pub cache_path: PathBuf,

    /// Freshness window in seconds
    pub cache_max_age: u64,

    /// Users that may not query the inventory
    pub deny_users: Vec<String>,

    /// Hosts per tag request
    pub page_size: usize,

    /// HTTP timeout in seconds
    pub request_timeout: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host_list_url: String::new(),
            host_tags_url: String::new(),
            token: String::new(),
            groups: Vec::new(),
            cache_path: PathBuf::from("~/.runway/cache"),
            cache_max_age: 3600,
            deny_users: Vec::new(),
            page_size: 200,
            request_timeout: 30,
        }
    }
}

/// Logging output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// Single-line human readable output
    Compact,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level filter
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Append log output to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Audit sink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines file receiving background job outcomes
    pub file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the first file found, then apply environment overrides
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
        }

        let mut config = match Self::get_config_paths(config_path)
            .into_iter()
            .find(|p| p.exists())
        {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.expand_paths();
        Ok(config)
    }

    /// Get the list of configuration file paths to check
    fn get_config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.to_path_buf()];
        }

        let mut paths = Vec::new();
        if let Ok(path) = std::env::var("RUNWAY_CONFIG") {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from("runway.toml"));
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("runway").join("config.toml"));
        }
        paths
    }

    /// Parse a single TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("RUNWAY_BIND") {
            self.server.bind = bind;
        }

        if let Ok(path) = std::env::var("RUNWAY_DATA_PATH") {
            self.server.data_path = PathBuf::from(path);
        }

        if let Ok(forks) = std::env::var("RUNWAY_FORKS") {
            if let Ok(n) = forks.parse() {
                self.execution.forks = n;
            }
        }

        if let Ok(value) = std::env::var("RUNWAY_HOST_KEY_CHECKING") {
            self.execution.host_key_checking = matches!(
                value.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        if let Ok(level) = std::env::var("RUNWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("RUNWAY_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }

        if let Ok(token) = std::env::var("RUNWAY_DIRECTORY_TOKEN") {
            self.directory.token = token;
        }
    }

    fn expand_paths(&mut self) {
        self.server.data_path = expand_home(&self.server.data_path);
        self.directory.cache_path = expand_home(&self.directory.cache_path);
        self.logging.file = self.logging.file.as_deref().map(expand_home);
        self.audit.file = self.audit.file.as_deref().map(expand_home);
    }
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
