pub mod gateway_service;
pub mod tcp_server;

pub use gateway_service::GatewayService;
pub use tcp_server::{ClientInfo, ModbusTcpServer, ServerEvent};
