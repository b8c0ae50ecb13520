use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("CRC checksum mismatch")]
    CrcError,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("RTU bus is busy with another transaction")]
    BusBusy,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Peer {0} is no longer connected")]
    PeerGone(SocketAddr),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for GatewayError {
    fn from(err: toml::ser::Error) -> Self {
        GatewayError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<serialport::Error> for GatewayError {
    fn from(err: serialport::Error) -> Self {
        GatewayError::ConnectionError(format!("Serial port error: {}", err))
    }
}
