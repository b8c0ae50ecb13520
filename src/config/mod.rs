pub mod settings;

pub use settings::{Config, DirectionControl, KeepAliveConfig, ParityConfig};
