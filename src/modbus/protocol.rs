use bytes::{Buf, BytesMut};
use std::fmt;
use std::net::SocketAddr;

use super::crc::{append_crc, crc_matches};
use crate::utils::error::GatewayError;

pub const MBAP_HEADER_LEN: usize = 7;
pub const MAX_PDU_LEN: usize = 253;
pub const MIN_RTU_FRAME_LEN: usize = 4;
pub const BROADCAST_UNIT_ID: u8 = 0;
pub const MAX_UNIT_ID: u8 = 247;

/// Read Coils, address 0, quantity 1.
pub const KEEP_ALIVE_PROBE: [u8; 5] = [0x01, 0x00, 0x00, 0x00, 0x01];

const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::Acknowledge => write!(f, "Acknowledge"),
            ExceptionCode::SlaveDeviceBusy => write!(f, "Slave Device Busy"),
        }
    }
}

/// `[function | 0x80, code]`
pub fn exception_pdu(function_code: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function_code | EXCEPTION_FLAG, code as u8]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, GatewayError> {
        if buf.len() < MBAP_HEADER_LEN {
            return Err(GatewayError::InvalidFrame(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                buf.len()
            )));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };

        if header.protocol_id != 0 {
            return Err(GatewayError::InvalidFrame(format!(
                "Unsupported protocol id {}",
                header.protocol_id
            )));
        }
        // length covers unit id + PDU, and a PDU has at least a function code
        if header.length < 2 || header.pdu_len() > MAX_PDU_LEN {
            return Err(GatewayError::InvalidFrame(format!(
                "MBAP length {} out of range",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

/// A Modbus/TCP ADU with the PDU kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

impl TcpFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MBAP_HEADER_LEN + self.pdu.len());
        out.extend_from_slice(&self.transaction_id.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&((self.pdu.len() + 1) as u16).to_be_bytes());
        out.push(self.unit_id);
        out.extend_from_slice(&self.pdu);
        out
    }

    /// Pull one complete frame off the front of a stream buffer.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived. A malformed header is
    /// an error; the stream cannot be resynchronised after that.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, GatewayError> {
        if buf.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }
        let header = MbapHeader::decode(&buf[..MBAP_HEADER_LEN])?;
        let total = MBAP_HEADER_LEN + header.pdu_len();
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(MBAP_HEADER_LEN);
        let pdu = buf.split_to(header.pdu_len()).to_vec();
        Ok(Some(Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu,
        }))
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or_default()
    }
}

/// A decoded client request as handed from the TCP side to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub source: SocketAddr,
    pub pdu: Vec<u8>,
}

impl TcpRequest {
    pub fn from_frame(frame: TcpFrame, source: SocketAddr) -> Self {
        Self {
            transaction_id: frame.transaction_id,
            unit_id: frame.unit_id,
            source,
            pdu: frame.pdu,
        }
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or_default()
    }

    pub fn is_broadcast(&self) -> bool {
        self.unit_id == BROADCAST_UNIT_ID
    }
}

/// Build an RTU ADU: address, PDU, CRC.
pub fn encode_rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    append_crc(&mut frame);
    frame
}

/// Split a received RTU ADU into unit id and PDU after checking the CRC.
pub fn decode_rtu_frame(frame: &[u8]) -> Result<(u8, Vec<u8>), GatewayError> {
    if frame.len() < MIN_RTU_FRAME_LEN {
        return Err(GatewayError::InvalidFrame(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    if !crc_matches(frame) {
        return Err(GatewayError::CrcError);
    }
    Ok((frame[0], frame[1..frame.len() - 2].to_vec()))
}
