//! Modbus RTU <-> TCP Gateway
//!
//! Lets a Modbus/TCP master (home automation, energy manager) reach Modbus RTU
//! slaves on the charger's RS-485 bus. Requests are forwarded one at a time
//! over the half-duplex line; collisions are answered with Slave Device Busy
//! and broadcasts are acknowledged immediately.

pub mod cli;
pub mod config;
pub mod gateway;
pub mod modbus;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use gateway::{Correlator, CorrelatorState, GatewayDisposition, KeepAlivePoller};
pub use modbus::{RtuMaster, TcpFrame, TcpRequest};
pub use services::{GatewayService, ModbusTcpServer};
pub use utils::error::GatewayError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
