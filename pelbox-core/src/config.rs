//! Configuration management for pelbox
//!
//! The config file lives in the platform config directory:
//! - Linux: ~/.config/pelbox/config.toml
//! - macOS: ~/Library/Application Support/pelbox/config.toml
//!
//! `PELBOX_CONFIG` points at an explicit file instead. Secrets may come from
//! the environment so they stay out of the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Config directory not found")]
    NoDirFound,

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub hardware: HardwareConfig,

    #[serde(default)]
    pub calibration: Calibration,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Identity provider (Keycloak) connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base URL including the context path, e.g. `http://keycloak:8080/auth`
    #[serde(default = "default_identity_url")]
    pub base_url: String,

    /// Realm holding pelbox members
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Realm the service client logs in to
    #[serde(default = "default_admin_realm")]
    pub admin_realm: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Service client secret. Overridden by `PELBOX_CLIENT_SECRET`.
    #[serde(default)]
    pub client_secret: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Settings of the box this process drives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Secret the mobile app writes into the device row when pairing.
    /// Overridden by `PELBOX_APP_SECRET`.
    #[serde(default)]
    pub app_secret: String,
}

/// Persistence backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Overridden by `DATABASE_URL`
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// TOML file of members and device rows loaded into the `memory` backend
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

/// Hardware backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareBackend {
    Gpio,
    #[default]
    Simulated,
}

/// Two direction lines of one H-bridge channel (BCM numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorPins {
    pub forward: u8,
    pub backward: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub backend: HardwareBackend,

    /// Software PWM frequency in Hz
    #[serde(default = "default_pwm_frequency")]
    pub pwm_frequency: f64,

    #[serde(default = "default_lock_pin")]
    pub lock_pin: u8,

    #[serde(default = "default_dismantle_pin")]
    pub dismantle_pin: u8,

    /// Primary expansion ram
    #[serde(default = "default_expansion_pins")]
    pub expansion: MotorPins,

    /// Secondary latch that confirms an endpoint
    #[serde(default = "default_latch_pins")]
    pub latch: MotorPins,

    #[serde(default = "default_door_pins")]
    pub door: MotorPins,

    /// Sleep for the real pulse duration in the simulated backend
    #[serde(default = "default_true")]
    pub simulate_realtime: bool,
}

/// Open-loop timing constants. These are measured on the real box, not
/// derived; change them only after re-calibrating the mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    /// Duty cycle in percent for every motored pulse
    #[serde(default = "default_power")]
    pub power: u8,

    /// Fully extended level
    #[serde(default = "default_max_level")]
    pub max_level: u8,

    /// Time to travel from fully retracted to fully extended
    #[serde(default = "default_endpoint_time")]
    pub endpoint_time_ms: u64,

    /// One intermediate level step
    #[serde(default = "default_increment")]
    pub increment_ms: u64,

    /// Extra drive at an endpoint before stopping the ram
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    #[serde(default = "default_latch_extend")]
    pub latch_extend_ms: u64,

    #[serde(default = "default_latch_retract")]
    pub latch_retract_ms: u64,

    #[serde(default = "default_latch_settle")]
    pub latch_settle_ms: u64,

    #[serde(default = "default_door_travel")]
    pub door_travel_ms: u64,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_HTTP_PORT
}
fn default_identity_url() -> String {
    "http://127.0.0.1:8080/auth".to_string()
}
fn default_realm() -> String {
    "pelbox".to_string()
}
fn default_admin_realm() -> String {
    "master".to_string()
}
fn default_client_id() -> String {
    "admin-cli".to_string()
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_database_url() -> String {
    "postgres://pelbox@127.0.0.1:5432/pelbox".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_pwm_frequency() -> f64 {
    100.0
}
fn default_lock_pin() -> u8 {
    18
}
fn default_dismantle_pin() -> u8 {
    21
}
fn default_expansion_pins() -> MotorPins {
    MotorPins { forward: 6, backward: 13 }
}
fn default_latch_pins() -> MotorPins {
    MotorPins { forward: 27, backward: 17 }
}
fn default_door_pins() -> MotorPins {
    MotorPins { forward: 24, backward: 23 }
}
fn default_true() -> bool {
    true
}
fn default_power() -> u8 {
    100
}
fn default_max_level() -> u8 {
    5
}
fn default_endpoint_time() -> u64 {
    5_000
}
fn default_increment() -> u64 {
    1_000
}
fn default_settle() -> u64 {
    2_000
}
fn default_latch_extend() -> u64 {
    3_000
}
fn default_latch_retract() -> u64 {
    8_000
}
fn default_latch_settle() -> u64 {
    1_000
}
fn default_door_travel() -> u64 {
    4_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: default_identity_url(),
            realm: default_realm(),
            admin_realm: default_admin_realm(),
            client_id: default_client_id(),
            client_secret: String::new(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            seed_file: None,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: HardwareBackend::default(),
            pwm_frequency: default_pwm_frequency(),
            lock_pin: default_lock_pin(),
            dismantle_pin: default_dismantle_pin(),
            expansion: default_expansion_pins(),
            latch: default_latch_pins(),
            door: default_door_pins(),
            simulate_realtime: true,
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            power: default_power(),
            max_level: default_max_level(),
            endpoint_time_ms: default_endpoint_time(),
            increment_ms: default_increment(),
            settle_ms: default_settle(),
            latch_extend_ms: default_latch_extend(),
            latch_retract_ms: default_latch_retract(),
            latch_settle_ms: default_latch_settle(),
            door_travel_ms: default_door_travel(),
        }
    }
}

impl IdentityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Calibration {
    pub fn endpoint_time(&self) -> Duration {
        Duration::from_millis(self.endpoint_time_ms)
    }

    pub fn increment(&self) -> Duration {
        Duration::from_millis(self.increment_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn latch_extend(&self) -> Duration {
        Duration::from_millis(self.latch_extend_ms)
    }

    pub fn latch_retract(&self) -> Duration {
        Duration::from_millis(self.latch_retract_ms)
    }

    pub fn latch_settle(&self) -> Duration {
        Duration::from_millis(self.latch_settle_ms)
    }

    pub fn door_travel(&self) -> Duration {
        Duration::from_millis(self.door_travel_ms)
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("pelbox"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path, honouring `PELBOX_CONFIG`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var("PELBOX_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_or_default(&Self::config_path()?)
    }

    /// Defaults when `path` does not exist. A file that exists but cannot be
    /// read or parsed is an error, never a silent fallback.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(path)
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay secrets from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup("PELBOX_CLIENT_SECRET") {
            self.identity.client_secret = secret;
        }
        if let Some(secret) = lookup("PELBOX_APP_SECRET") {
            self.device.app_secret = secret;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.store.database_url = url;
        }
    }

    /// Reject values the sequencing math cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cal = &self.calibration;
        if cal.max_level == 0 {
            return Err(ConfigError::Invalid("calibration.max_level must be at least 1".into()));
        }
        if cal.power > 100 {
            return Err(ConfigError::Invalid(format!(
                "calibration.power must be a percentage, got {}",
                cal.power
            )));
        }
        if cal.endpoint_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "calibration.endpoint_time_ms must be non-zero".into(),
            ));
        }
        if self.store.backend == StoreBackend::Memory && self.store.seed_file.is_none() {
            return Err(ConfigError::Invalid(
                "store.seed_file is required with the memory backend".into(),
            ));
        }
        if self.hardware.pwm_frequency <= 0.0 {
            return Err(ConfigError::Invalid("hardware.pwm_frequency must be positive".into()));
        }
        Ok(())
    }
}
