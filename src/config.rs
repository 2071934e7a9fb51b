// src/config.rs
use anyhow::{anyhow, Context, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "rabbitmq-fallback.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential")]
    pub username: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub confirm_publishes: bool,
}

/// Where undeliverable messages go while the broker is unreachable.
/// Leave `file` unset to make broker failures hard errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackupConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
pub(crate) fn default_host() -> String { "localhost".to_string() }
pub(crate) fn default_port() -> u16 { 5672 }
pub(crate) fn default_credential() -> String { "guest".to_string() }
pub(crate) fn default_vhost() -> String { "/".to_string() }
pub(crate) fn default_timeout() -> u64 { 5000 }
pub(crate) fn default_heartbeat() -> u16 { 30 }
pub(crate) fn default_connect_attempts() -> u32 { 1 }
pub(crate) fn default_reconnect_delay() -> u64 { 1000 }
pub(crate) fn default_prefetch() -> u16 { 1 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_credential(),
            password: default_credential(),
            vhost: default_vhost(),
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
            connect_attempts: default_connect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl QueueConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prefetch_count: default_prefetch(),
            confirm_publishes: false,
        }
    }
}

impl Settings {
    /// Settings with every default and the given queue name.
    pub fn for_queue(queue: &str) -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: QueueConfig::named(queue),
            backup: BackupConfig::default(),
        }
    }

    pub fn with_backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup.file = Some(path.into());
        self
    }

    /// AMQP URI for lapin, credentials and vhost percent-encoded.
    pub fn amqp_uri(&self) -> String {
        let c = &self.connection;
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            utf8_percent_encode(&c.username, NON_ALPHANUMERIC),
            utf8_percent_encode(&c.password, NON_ALPHANUMERIC),
            uri_host(&c.host),
            c.port,
            utf8_percent_encode(&c.vhost, NON_ALPHANUMERIC),
            c.heartbeat_seconds,
            c.connection_timeout_ms,
        )
    }

    /// Same as `amqp_uri` with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        let c = &self.connection;
        format!(
            "amqp://{}:***@{}:{}/{}",
            utf8_percent_encode(&c.username, NON_ALPHANUMERIC),
            uri_host(&c.host),
            c.port,
            utf8_percent_encode(&c.vhost, NON_ALPHANUMERIC),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(anyhow!("Configuration error: connection.host cannot be empty"));
        }
        if self.connection.port == 0 {
            return Err(anyhow!("Configuration error: connection.port cannot be 0"));
        }
        if self.connection.connect_attempts == 0 {
            return Err(anyhow!("Configuration error: connection.connect_attempts must be at least 1"));
        }
        if self.queue.name.is_empty() {
            return Err(anyhow!("Configuration error: queue.name cannot be empty"));
        }
        Ok(())
    }
}

// IPv6 literals need brackets in the authority part
fn uri_host(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let alternative = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", alternative.as_path()),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<Settings> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<Settings> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    let settings: Settings = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    settings.validate()?;
    Ok(settings)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let default_config = Settings::for_queue("messages")
        .with_backup_file("rabbitmq-fallback.backup");

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
