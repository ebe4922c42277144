//! Deploy-time configuration.
//!
//! Everything the device needs to know about its surroundings lives in one TOML
//! file: identity, link expectations, broker, update channel, output hardware and
//! the location of the persisted setpoint. Every field has a default so that a
//! partially written file still loads.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/lightnode";
const CONFIG_FILE: &str = "config.toml";
const STATE_DIR: &str = ".local/state/lightnode";
const SETPOINT_FILE: &str = "lightLevel";

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "LIGHTNODE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub link: LinkConfig,
    pub broker: BrokerConfig,
    pub update: UpdateConfig,
    pub output: OutputConfig,
    pub store: StoreConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Used as MQTT client id and in diagnostics.
    pub identity: String,
    /// Depth of the notification queue feeding the control loop.
    pub queue_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            identity: "entrance-wardrobe".to_string(),
            queue_capacity: 64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Network interface whose association the device depends on.
    pub interface: String,
    /// Network the interface is expected to join. Diagnostic only, association
    /// itself is done by the platform.
    pub ssid: Option<String>,
    pub attempts: u32,
    pub attempt_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            ssid: None,
            attempts: 3,
            attempt_timeout_ms: 10_000,
            retry_delay_ms: 5_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl LinkConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 15,
            topic_prefix: "home/entrance-wardrobe".to_string(),
            reconnect_delay_ms: 500,
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Updates are refused entirely while this is empty.
    pub password: String,
    /// Firmware images replace this file and are booted on restart. Unset means the
    /// running executable.
    pub firmware_path: Option<PathBuf>,
    pub filesystem_path: PathBuf,
    pub max_image_bytes: u64,
    pub restart_grace_ms: u64,
    pub header_timeout_ms: u64,
    /// Longest pause allowed between two reads of the image body.
    pub receive_timeout_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let state_dir = home_dir().join(STATE_DIR);
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8266,
            password: String::new(),
            firmware_path: None,
            filesystem_path: state_dir.join("filesystem.image"),
            max_image_bytes: 64 * 1024 * 1024,
            restart_grace_ms: 1_000,
            header_timeout_ms: 5_000,
            receive_timeout_ms: 10_000,
        }
    }
}

impl UpdateConfig {
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// The image the device boots: the configured firmware path, else the running
    /// executable.
    pub fn firmware_image(&self) -> Option<PathBuf> {
        self.firmware_path
            .clone()
            .or_else(|| std::env::current_exe().ok())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Pwm,
    Log,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub kind: OutputKind,
    /// Hardware PWM channel, 0 or 1.
    pub channel: u8,
    pub frequency_hz: f64,
    /// Native drive range the logical 0..=100 maps onto.
    pub range: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::Pwm,
            channel: 0,
            frequency_hz: 1_000.0,
            range: 1023,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: home_dir().join(STATE_DIR).join(SETPOINT_FILE),
        }
    }
}

impl Config {
    /// Location of the config file: `$LIGHTNODE_CONFIG` or `~/.config/lightnode/config.toml`.
    pub fn default_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => home_dir().join(CONFIG_DIR).join(CONFIG_FILE),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads the config at `path`, writing the defaults there first if no file exists.
    pub async fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("Creating default configuration at {}", path.display());
            let config = Config::default();
            config.save(path).await?;
            return Ok(config);
        }

        Self::load(path).await
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("device.identity is empty".into()));
        }
        if self.device.queue_capacity == 0 {
            return Err(ConfigError::Invalid("device.queue_capacity must be > 0".into()));
        }
        if self.link.attempts == 0 {
            return Err(ConfigError::Invalid("link.attempts must be > 0".into()));
        }
        if self.broker.topic_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("broker.topic_prefix is empty".into()));
        }
        if self.output.channel > 1 {
            return Err(ConfigError::Invalid(format!(
                "output.channel {} does not exist, expected 0 or 1",
                self.output.channel
            )));
        }
        if self.output.range == 0 {
            return Err(ConfigError::Invalid("output.range must be > 0".into()));
        }
        if self.update.max_image_bytes == 0 {
            return Err(ConfigError::Invalid("update.max_image_bytes must be > 0".into()));
        }
        if self.update.enabled && self.update.password.is_empty() {
            warn!("update.password is empty, remote updates will be refused");
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
[broker]
host = "10.0.0.2"
topic_prefix = "home/hall"

[link]
attempts = 5
"#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "10.0.0.2");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.topic_prefix, "home/hall");
        assert_eq!(config.link.attempts, 5);
        assert_eq!(config.link.interface, "wlan0");
        assert_eq!(config.output.kind, OutputKind::Pwm);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_link_attempts() {
        let mut config = Config::default();
        config.link.attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_slash_only_prefix() {
        let mut config = Config::default();
        config.broker.topic_prefix = "//".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn firmware_boots_from_running_executable_unless_configured() {
        let mut update = UpdateConfig::default();
        assert_eq!(update.firmware_image(), std::env::current_exe().ok());

        update.firmware_path = Some(PathBuf::from("/opt/lightnode/lightnode"));
        assert_eq!(
            update.firmware_image(),
            Some(PathBuf::from("/opt/lightnode/lightnode"))
        );
    }

    #[test]
    fn rejects_zero_image_limit() {
        let mut config = Config::default();
        config.update.max_image_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn output_kind_reads_lowercase() {
        let config: Config = toml::from_str("[output]\nkind = \"log\"\n").unwrap();
        assert_eq!(config.output.kind, OutputKind::Log);
    }

    #[tokio::test]
    async fn load_or_init_writes_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let first = Config::load_or_init(&path).await.unwrap();
        assert!(path.exists());

        let second = Config::load_or_init(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[broker\nport = ").await.unwrap();

        let err = Config::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }
}
