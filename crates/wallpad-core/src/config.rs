/*!
 * Configuration management for the wallpad gateway.
 *
 * This module loads, validates, and exposes the settings consumed by the
 * packet engine, the MQTT bridge and the diagnostics log.
 */
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{ChecksumKind, ConfirmSource};
use crate::utils::millis_to_duration;

/// Allowed range for `queue.max_send_count`
pub const MAX_SEND_COUNT_RANGE: std::ops::RangeInclusive<u8> = 1..=99;

/// Allowed range for `queue.min_receive_count`
pub const MIN_RECEIVE_COUNT_RANGE: std::ops::RangeInclusive<u8> = 1..=9;

/// Gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// MQTT broker and topic configuration
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Command queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Thermostat limits
    #[serde(default)]
    pub climate: ClimateConfig,

    /// Bus silence watchdog
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Diagnostics log
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Vendor packet table to load (`commax`, or `custom` for the override table alone)
    #[serde(default = "default_vendor")]
    pub vendor: String,

    /// Directory holding the override table and the scan results
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Path of a vendor table replacing the built-in one
    #[serde(default)]
    pub vendor_table: Option<String>,

    /// Path of the user-edited override table
    #[serde(default)]
    pub override_table: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log every raw bus frame under the `wallpad::bus` target
    #[serde(default)]
    pub bus_log: bool,

    /// Log every MQTT publish under the `wallpad::mqtt` target
    #[serde(default)]
    pub mqtt_log: bool,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// MQTT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Username
    #[serde(default)]
    pub username: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<String>,

    /// Client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic prefix on the Home Assistant side
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Topic prefix of the serial-to-network adapter (`<bridge_topic>/recv`, `<bridge_topic>/send`)
    #[serde(default = "default_bridge_topic")]
    pub bridge_topic: String,

    /// Home Assistant discovery prefix
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

/// Command queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Minimum bus idle time before the gateway may transmit
    #[serde(default = "default_quiet_interval_ms")]
    pub quiet_interval_ms: u64,

    /// How often the scheduler evaluates the queue
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Minimum spacing between two transmissions of the same command
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Transmissions allowed per command before it is given up
    #[serde(default = "default_max_send_count")]
    pub max_send_count: u8,

    /// Matching receipts required to confirm a command
    #[serde(default = "default_min_receive_count")]
    pub min_receive_count: u8,

    /// Checksum arithmetic used by the bus
    #[serde(default)]
    pub checksum: ChecksumKind,

    /// Per-device confirmation source (defaults to `either`)
    #[serde(default)]
    pub confirm_with: HashMap<String, ConfirmSource>,
}

/// Climate device limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClimateConfig {
    /// Lowest settable temperature
    #[serde(default = "default_min_temp")]
    pub min_temp: u8,

    /// Highest settable temperature
    #[serde(default = "default_max_temp")]
    pub max_temp: u8,
}

/// Bus silence watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds without any received frame before the bus is reported silent (0 disables)
    #[serde(default = "default_silence_secs")]
    pub silence_secs: u64,
}

/// Diagnostics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Number of recent send/receive events kept for display and export
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            vendor: default_vendor(),
            data_dir: default_data_dir(),
            vendor_table: None,
            override_table: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            bus_log: false,
            mqtt_log: false,
            json_format: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
            bridge_topic: default_bridge_topic(),
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            quiet_interval_ms: default_quiet_interval_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            max_send_count: default_max_send_count(),
            min_receive_count: default_min_receive_count(),
            checksum: ChecksumKind::default(),
            confirm_with: HashMap::new(),
        }
    }
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            min_temp: default_min_temp(),
            max_temp: default_max_temp(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            silence_secs: default_silence_secs(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
        }
    }
}

fn default_vendor() -> String {
    "commax".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "wallpad".to_string()
}

fn default_topic_prefix() -> String {
    "commax".to_string()
}

fn default_bridge_topic() -> String {
    "ew11".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_quiet_interval_ms() -> u64 {
    130
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    130
}

fn default_max_send_count() -> u8 {
    20
}

fn default_min_receive_count() -> u8 {
    3
}

fn default_min_temp() -> u8 {
    5
}

fn default_max_temp() -> u8 {
    40
}

fn default_silence_secs() -> u64 {
    10
}

fn default_recent_capacity() -> usize {
    100
}

impl GatewayConfig {
    /// Check the knobs that have a bounded range
    pub fn validate(&self) -> Result<()> {
        let queue = &self.queue;
        if !MAX_SEND_COUNT_RANGE.contains(&queue.max_send_count) {
            return Err(Error::config(format!(
                "queue.max_send_count must be within {:?}, got {}",
                MAX_SEND_COUNT_RANGE, queue.max_send_count
            )));
        }
        if !MIN_RECEIVE_COUNT_RANGE.contains(&queue.min_receive_count) {
            return Err(Error::config(format!(
                "queue.min_receive_count must be within {:?}, got {}",
                MIN_RECEIVE_COUNT_RANGE, queue.min_receive_count
            )));
        }
        if queue.tick_interval_ms == 0 {
            return Err(Error::config("queue.tick_interval_ms must be positive"));
        }
        if self.climate.min_temp > self.climate.max_temp {
            return Err(Error::config(format!(
                "climate.min_temp ({}) is above climate.max_temp ({})",
                self.climate.min_temp, self.climate.max_temp
            )));
        }
        if self.diagnostics.recent_capacity == 0 {
            return Err(Error::config("diagnostics.recent_capacity must be positive"));
        }
        Ok(())
    }

    /// Confirmation source configured for a device
    pub fn confirm_source(&self, device: &str) -> ConfirmSource {
        self.queue
            .confirm_with
            .get(device)
            .copied()
            .unwrap_or_default()
    }

    /// Path of the override table
    pub fn override_table_path(&self) -> PathBuf {
        match &self.general.override_table {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.general.data_dir).join("packet_structures_custom.yaml"),
        }
    }

    /// Path where device scan results are kept
    pub fn found_devices_path(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join("found_devices.json")
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl QueueConfig {
    /// Bus idle time required before transmitting
    pub fn quiet_interval(&self) -> Duration {
        millis_to_duration(self.quiet_interval_ms)
    }

    /// Scheduler tick period
    pub fn tick_interval(&self) -> Duration {
        millis_to_duration(self.tick_interval_ms)
    }

    /// Spacing between retransmissions
    pub fn retry_interval(&self) -> Duration {
        millis_to_duration(self.retry_interval_ms)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<GatewayConfig>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: GatewayConfig) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<GatewayConfig> {
        let mut config_builder = ConfigLib::builder();

        let default_config = GatewayConfig::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let mut config: GatewayConfig = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<GatewayConfig>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: GatewayConfig) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &GatewayConfig {
        &self.0
    }
}

impl From<GatewayConfig> for SharedConfig {
    fn from(config: GatewayConfig) -> Self {
        Self::new(config)
    }
}

impl AsRef<GatewayConfig> for SharedConfig {
    fn as_ref(&self) -> &GatewayConfig {
        self.get()
    }
}
