pub mod crc;
pub mod protocol;
pub mod rtu;
pub mod serial;

pub use crc::crc16_modbus;
pub use protocol::{ExceptionCode, MbapHeader, TcpFrame, TcpRequest};
pub use rtu::{RtuEvent, RtuMaster, RtuOutcome};
pub use serial::{SerialLink, SerialPortLink};
