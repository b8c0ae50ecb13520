use log::{debug, error, info};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

use crate::config::settings::{Config, DirectionControl, ParityConfig};
use crate::utils::error::GatewayError;

/// Half-duplex byte pipe underneath the RTU master.
///
/// Implementations must never block on `receive`: the whole gateway runs on
/// one execution context.
pub trait SerialLink {
    /// Put a complete frame on the wire, owning the bus for its duration.
    ///
    /// Returns once the frame has left the UART, so the caller is held for
    /// the frame's transmission time: about 1 ms per byte at 9600 baud, or
    /// 9 ms for a typical 8 byte request. An RTU frame is at most 256 bytes,
    /// which caps the stall near 270 ms at 9600 baud.
    fn transmit(&mut self, frame: &[u8]) -> Result<(), GatewayError>;

    /// Copy already buffered input into `buf`, returning 0 when nothing is pending.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, GatewayError>;

    /// Drop any input that is still buffered.
    fn clear_input(&mut self) -> Result<(), GatewayError>;
}

pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    direction: DirectionControl,
}

impl SerialPortLink {
    pub fn open(config: &Config) -> Result<Self, GatewayError> {
        info!("🔌 Connecting to Modbus RTU port: {}", config.serial_port);
        info!(
            "⚙️  Configuration: {} baud, {}",
            config.baud_rate,
            config.parity.as_str()
        );

        let serial_parity = match config.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(&config.serial_port, config.baud_rate)
            .timeout(Duration::from_millis(10))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serial_parity)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", config.serial_port, e);
                GatewayError::ConnectionError(format!("Failed to open port: {}", e))
            })?;

        let mut link = Self {
            port,
            direction: config.direction_control,
        };
        link.set_transmit(false)?;

        match (config.direction_control, config.direction_pin) {
            (DirectionControl::None, _) => info!("↔️  Direction control: automatic"),
            (mode, Some(pin)) => info!("↔️  Direction control: {:?} (DE/RE pin {})", mode, pin),
            (mode, None) => info!("↔️  Direction control: {:?}", mode),
        }
        info!(" Modbus RTU connection established successfully");
        Ok(link)
    }

    fn set_transmit(&mut self, transmit: bool) -> Result<(), GatewayError> {
        let level = match self.direction {
            DirectionControl::None => return Ok(()),
            DirectionControl::Rts => transmit,
            DirectionControl::RtsInverted => !transmit,
        };
        self.port.write_request_to_send(level)?;
        Ok(())
    }
}

impl SerialLink for SerialPortLink {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), GatewayError> {
        self.set_transmit(true)?;

        let written = self
            .port
            .write_all(frame)
            .and_then(|_| self.port.flush())
            .map_err(|e| GatewayError::CommunicationError(format!("Write failed: {}", e)));

        // Back to receive even if the write failed, or the bus stays jammed
        self.set_transmit(false)?;
        written?;

        debug!("📤 RTU tx: {}", hex::encode(frame));
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(0);
        }

        let len = available.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(GatewayError::CommunicationError(format!("Read failed: {}", e))),
        }
    }

    fn clear_input(&mut self) -> Result<(), GatewayError> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Enumerate serial ports for the `list-ports` command.
pub fn list_ports() -> Result<Vec<String>, GatewayError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "{} (USB {:04x}:{:04x}{})",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.manufacturer
                    .map(|m| format!(", {}", m))
                    .unwrap_or_default()
            ),
            _ => port.port_name,
        })
        .collect())
}
