use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::utils::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Gateway identification
    pub gateway_uuid: String,
    pub gateway_name: String,
    pub version: String,

    // Gateway mode switch; nothing is opened while false
    pub gateway_active: bool,

    // RTU side
    pub serial_port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub direction_control: DirectionControl,
    pub direction_pin: Option<u8>,
    pub rtu_timeout_ms: u64,
    pub frame_delay_ms: u64,

    // TCP side
    pub tcp_listen: String,
    pub max_connections: usize,
    pub release_on_disconnect: bool,

    // Periodic statistics logging, 0 disables it
    pub stats_interval_secs: u64,

    // Keep-alive
    pub keep_alive: KeepAliveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Units that arm the poller. Empty means every addressed unit does.
    pub units: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    #[serde(rename = "8N1")]
    None,
    #[serde(rename = "8E1")]
    Even,
    #[serde(rename = "8O1")]
    Odd,
}

impl ParityConfig {
    pub fn parse(value: &str) -> Result<Self, GatewayError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "8N1" | "N" | "NONE" => Ok(ParityConfig::None),
            "8E1" | "E" | "EVEN" => Ok(ParityConfig::Even),
            "8O1" | "O" | "ODD" => Ok(ParityConfig::Odd),
            other => Err(GatewayError::ConfigError(format!(
                "Unsupported parity '{}', expected 8N1 or 8E1",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParityConfig::None => "8N1",
            ParityConfig::Even => "8E1",
            ParityConfig::Odd => "8O1",
        }
    }
}

/// How the RS-485 driver enable line is switched around a transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionControl {
    /// Transceiver switches by itself (auto-direction adapters).
    None,
    /// RTS high while transmitting.
    Rts,
    /// RTS low while transmitting.
    RtsInverted,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            units: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_uuid: Uuid::new_v4().to_string(),
            gateway_name: "EVSE Modbus Gateway".to_string(),
            version: crate::VERSION.to_string(),

            gateway_active: true,

            serial_port: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
            parity: ParityConfig::None,
            direction_control: DirectionControl::Rts,
            direction_pin: Some(2),
            rtu_timeout_ms: 1000,
            frame_delay_ms: 20,

            tcp_listen: "0.0.0.0:502".to_string(),
            max_connections: 8,
            release_on_disconnect: false,

            stats_interval_secs: 300,

            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl Config {
    /// Apply command line overrides on top of whatever was loaded from file.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), GatewayError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial_port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.baud_rate = baud
                .parse()
                .map_err(|_| GatewayError::ConfigError(format!("Invalid baud rate: {}", baud)))?;
        }
        if let Some(parity) = matches.get_one::<String>("parity") {
            self.parity = ParityConfig::parse(parity)?;
        }
        if let Some(listen) = matches.get_one::<String>("listen") {
            self.tcp_listen = listen.clone();
        }
        if let Some(timeout) = matches.get_one::<String>("timeout-ms") {
            self.rtu_timeout_ms = timeout
                .parse()
                .map_err(|_| GatewayError::ConfigError(format!("Invalid timeout: {}", timeout)))?;
        }
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::ConfigError(format!(
                "Cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, GatewayError> {
        let mut config: Config = toml::from_str(content)?;

        // Generate gateway UUID if not present
        if config.gateway_uuid.is_empty() {
            config.gateway_uuid = Uuid::new_v4().to_string();
        }

        if config.version.is_empty() {
            config.version = crate::VERSION.to_string();
        }

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        if path.as_ref().exists() {
            info!("📄 Loading configuration from {}", path.as_ref().display());
            Self::from_file(path)
        } else {
            warn!(
                "⚠️  Configuration file {} not found, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), GatewayError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.serial_port.trim().is_empty() {
            return Err(GatewayError::ConfigError("serial_port must not be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(GatewayError::ConfigError("baud_rate must be positive".to_string()));
        }
        if self.rtu_timeout_ms == 0 {
            return Err(GatewayError::ConfigError("rtu_timeout_ms must be positive".to_string()));
        }
        if self.max_connections == 0 {
            return Err(GatewayError::ConfigError("max_connections must be positive".to_string()));
        }
        self.listen_addr()?;
        if let Some(unit) = self.keep_alive.units.iter().find(|u| **u == 0 || **u > 247) {
            return Err(GatewayError::ConfigError(format!(
                "keep_alive.units contains invalid slave address {}",
                unit
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.tcp_listen.parse().map_err(|_| {
            GatewayError::ConfigError(format!("Invalid tcp_listen address: {}", self.tcp_listen))
        })
    }

    pub fn rtu_timeout(&self) -> Duration {
        Duration::from_millis(self.rtu_timeout_ms)
    }

    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms)
    }

}

impl KeepAliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
