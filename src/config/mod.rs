//! Configuration module
//!
//! Handles loading and saving bridge configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    EconetAddr, FrameContext, DEFAULT_AUN_PORT, DEFAULT_PICONET_BAUD, DEFAULT_VERSION_MAJOR,
    DEFAULT_VERSION_MINOR, DEFAULT_WS_PORT,
};
use crate::security::{DEFAULT_LIBRARY_PATH, DEFAULT_MAX_IDLE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// The bridge's own Econet identity
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// AUN (UDP) transport
    #[serde(default)]
    pub aun: AunConfig,

    /// WebSocket transport
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Piconet serial transport
    #[serde(default)]
    pub piconet: PiconetConfig,

    /// Session settings
    #[serde(default)]
    pub security: SecurityConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Unique instance identifier (auto-generated if not set)
    pub instance_id: Option<String>,
    /// Human-readable name for this bridge
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    "econet-bridge".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            name: default_name(),
            verbose: false,
        }
    }
}

/// Bridge identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Local Econet network number
    #[serde(default = "default_network")]
    pub network: u8,
    /// The bridge's station number
    #[serde(default = "default_station")]
    pub station: u8,
    /// Firmware version reported to machine peeks
    #[serde(default = "default_version_major")]
    pub version_major: u8,
    #[serde(default = "default_version_minor")]
    pub version_minor: u8,
}

fn default_network() -> u8 {
    1
}

fn default_station() -> u8 {
    254
}

fn default_version_major() -> u8 {
    DEFAULT_VERSION_MAJOR
}

fn default_version_minor() -> u8 {
    DEFAULT_VERSION_MINOR
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            station: default_station(),
            version_major: default_version_major(),
            version_minor: default_version_minor(),
        }
    }
}

/// AUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AunConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UDP port to listen on and send to
    #[serde(default = "default_aun_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// AUN map file, one `ip[:port][/cidr] network[.station]` rule per line
    pub map_file: Option<PathBuf>,
    /// Extra rules in the map file syntax
    #[serde(default)]
    pub rules: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_aun_port() -> u16 {
    DEFAULT_AUN_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for AunConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_aun_port(),
            bind_address: default_bind_address(),
            map_file: None,
            rules: Vec::new(),
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// File listing networks handed out to clients
    pub dynamic_networks_file: Option<PathBuf>,
    /// Networks handed out to clients, tried before those in the file
    #[serde(default)]
    pub dynamic_networks: Vec<u8>,
}

fn default_ws_port() -> u16 {
    DEFAULT_WS_PORT
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_ws_port(),
            bind_address: default_bind_address(),
            dynamic_networks_file: None,
            dynamic_networks: Vec::new(),
        }
    }
}

/// Piconet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiconetConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Serial device of the Piconet
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// File listing networks reached through the Piconet
    pub networks_file: Option<PathBuf>,
    #[serde(default)]
    pub networks: Vec<u8>,
}

fn default_device() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_PICONET_BAUD
}

impl Default for PiconetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: default_device(),
            baud_rate: default_baud_rate(),
            networks_file: None,
            networks: Vec::new(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Idle seconds before a session is logged out
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
    /// Seconds between housekeeping runs
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    /// TOML user file (in-memory users if not set)
    pub users_file: Option<PathBuf>,
    /// Parent of new users' home directories
    #[serde(default = "default_home_root")]
    pub home_root: String,
    /// Library directory given to new sessions
    #[serde(default = "default_library_path")]
    pub library_path: String,
}

fn default_max_idle() -> u64 {
    DEFAULT_MAX_IDLE.as_secs()
}

fn default_housekeeping_interval() -> u64 {
    60
}

fn default_home_root() -> String {
    "/home".to_string()
}

fn default_library_path() -> String {
    DEFAULT_LIBRARY_PATH.to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: default_max_idle(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            users_file: None,
            home_root: default_home_root(),
            library_path: default_library_path(),
        }
    }
}

impl SecurityConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("econet-bridge/config.toml")),
            Some(PathBuf::from("./econet-bridge.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings that cannot name a real station
    pub fn validate(&self) -> ConfigResult<()> {
        let station = self.bridge.station;
        if station == 0 || station == crate::protocol::BROADCAST_STATION {
            return Err(ConfigError::Invalid(format!(
                "bridge station {} is reserved",
                station
            )));
        }
        Ok(())
    }

    /// Get the instance ID, generating one if not set
    pub fn instance_id(&self) -> String {
        self.general
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn bridge_address(&self) -> EconetAddr {
        EconetAddr::new(self.bridge.network, self.bridge.station)
    }

    pub fn frame_context(&self) -> FrameContext {
        FrameContext::new(
            self.bridge_address(),
            self.bridge.version_major,
            self.bridge.version_minor,
        )
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            instance_id: Some("beeb-bridge".to_string()),
            name: "Econet Bridge".to_string(),
            verbose: false,
        },
        bridge: BridgeConfig {
            network: 127,
            ..Default::default()
        },
        aun: AunConfig {
            rules: vec![
                "192.168.0.0/24 127".to_string(),
                "192.168.0.40 127.254".to_string(),
            ],
            ..Default::default()
        },
        websocket: WebSocketConfig {
            dynamic_networks: vec![200],
            ..Default::default()
        },
        piconet: PiconetConfig {
            networks: vec![1],
            ..Default::default()
        },
        security: SecurityConfig {
            users_file: Some(PathBuf::from("users.toml")),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
