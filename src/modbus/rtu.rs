//! Modbus RTU master driving the half-duplex serial bus.
//!
//! The master never blocks: `raw_request` hands over a PDU and `poll` is called
//! from the scheduler tick to move bytes and detect frame ends and timeouts.
//! Only one unicast exchange can be outstanding; the correlator guarantees that,
//! and a second request is refused with `GatewayError::BusBusy`.

use log::{debug, trace, warn};
use std::time::{Duration, Instant};

use super::protocol::{decode_rtu_frame, encode_rtu_frame, BROADCAST_UNIT_ID, MAX_PDU_LEN};
use super::serial::SerialLink;
use crate::utils::error::GatewayError;

/// Longest RTU ADU: address + 253 byte PDU + CRC.
const MAX_ADU_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtuOutcome {
    Success(Vec<u8>),
    Timeout,
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtuEvent {
    Completed { unit_id: u8, outcome: RtuOutcome },
    /// A frame arrived while nothing was in flight.
    Unsolicited(Vec<u8>),
}

#[derive(Debug)]
enum BusState {
    Idle,
    /// Bus held quiet after a broadcast or a finished exchange.
    Turnaround { until: Instant },
    AwaitingResponse { unit_id: u8, sent_at: Instant },
}

/// 3.5 character times at 11 bits per character, fixed at 1.75 ms above 19200 baud.
pub fn inter_frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    let micros = (38_500_000 + baud_rate as u64 - 1) / baud_rate as u64;
    Duration::from_micros(micros)
}

pub struct RtuMaster {
    link: Box<dyn SerialLink>,
    timeout: Duration,
    frame_gap: Duration,
    frame_delay: Duration,
    state: BusState,
    queued: Option<(u8, Vec<u8>)>,
    queued_broadcast: Option<Vec<u8>>,
    failed: Option<(u8, String)>,
    rx_buf: Vec<u8>,
    last_rx_at: Option<Instant>,
}

impl RtuMaster {
    pub fn new(
        link: Box<dyn SerialLink>,
        baud_rate: u32,
        timeout: Duration,
        frame_delay: Duration,
    ) -> Self {
        Self {
            link,
            timeout,
            frame_gap: inter_frame_gap(baud_rate),
            frame_delay,
            state: BusState::Idle,
            queued: None,
            queued_broadcast: None,
            failed: None,
            rx_buf: Vec::with_capacity(MAX_ADU_LEN),
            last_rx_at: None,
        }
    }

    /// True while a unicast exchange is queued, on the wire or awaiting its reply.
    pub fn is_busy(&self) -> bool {
        self.queued.is_some()
            || self.failed.is_some()
            || matches!(self.state, BusState::AwaitingResponse { .. })
    }

    /// Start an exchange with `unit_id`. Unit 0 is sent as a broadcast and
    /// produces no completion event.
    pub fn raw_request(&mut self, unit_id: u8, pdu: &[u8], now: Instant) -> Result<(), GatewayError> {
        if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
            return Err(GatewayError::InvalidFrame(format!(
                "PDU length {} out of range",
                pdu.len()
            )));
        }

        let frame = encode_rtu_frame(unit_id, pdu);
        if unit_id == BROADCAST_UNIT_ID {
            if self.queued_broadcast.is_some() {
                return Err(GatewayError::BusBusy);
            }
            self.queued_broadcast = Some(frame);
        } else {
            if self.is_busy() {
                return Err(GatewayError::BusBusy);
            }
            self.queued = Some((unit_id, frame));
        }

        self.start_transmit(now);
        Ok(())
    }

    /// Advance the bus. Call repeatedly until it returns `None`.
    pub fn poll(&mut self, now: Instant) -> Option<RtuEvent> {
        if let Some((unit_id, reason)) = self.failed.take() {
            return Some(RtuEvent::Completed {
                unit_id,
                outcome: RtuOutcome::TransportError(reason),
            });
        }

        if let Err(e) = self.fill_rx(now) {
            warn!("⚠️  Serial read failed: {}", e);
        }

        if let Some(event) = self.check_receive(now) {
            return Some(event);
        }

        self.start_transmit(now);
        self.failed.take().map(|(unit_id, reason)| RtuEvent::Completed {
            unit_id,
            outcome: RtuOutcome::TransportError(reason),
        })
    }

    fn fill_rx(&mut self, now: Instant) -> Result<(), GatewayError> {
        let mut chunk = [0u8; MAX_ADU_LEN];
        loop {
            let n = self.link.receive(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            trace!("📥 RTU rx chunk: {}", hex::encode(&chunk[..n]));
            self.rx_buf.extend_from_slice(&chunk[..n]);
            self.last_rx_at = Some(now);
        }
    }

    fn frame_ended(&self, now: Instant) -> bool {
        match self.last_rx_at {
            Some(at) => !self.rx_buf.is_empty() && now.duration_since(at) >= self.frame_gap,
            None => false,
        }
    }

    fn check_receive(&mut self, now: Instant) -> Option<RtuEvent> {
        match self.state {
            BusState::AwaitingResponse { unit_id, sent_at } => {
                let outcome = if self.rx_buf.len() > MAX_ADU_LEN {
                    RtuOutcome::TransportError(format!(
                        "Response overran {} bytes",
                        MAX_ADU_LEN
                    ))
                } else if self.frame_ended(now) {
                    match decode_rtu_frame(&self.rx_buf) {
                        Ok((address, pdu)) if address == unit_id => RtuOutcome::Success(pdu),
                        Ok((address, _)) => RtuOutcome::TransportError(format!(
                            "Response from unit {}, expected {}",
                            address, unit_id
                        )),
                        Err(e) => RtuOutcome::TransportError(e.to_string()),
                    }
                } else if self.rx_buf.is_empty() && now.duration_since(sent_at) >= self.timeout {
                    RtuOutcome::Timeout
                } else {
                    return None;
                };

                debug!("📨 RTU unit {} exchange finished: {:?}", unit_id, outcome);
                self.rx_buf.clear();
                self.last_rx_at = None;
                self.state = BusState::Turnaround {
                    until: now + self.frame_delay,
                };
                Some(RtuEvent::Completed { unit_id, outcome })
            }
            _ if self.frame_ended(now) || self.rx_buf.len() > MAX_ADU_LEN => {
                let stray = std::mem::take(&mut self.rx_buf);
                self.last_rx_at = None;
                Some(RtuEvent::Unsolicited(stray))
            }
            _ => None,
        }
    }

    fn bus_free(&self, now: Instant) -> bool {
        match self.state {
            BusState::Idle => true,
            BusState::Turnaround { until } => now >= until,
            BusState::AwaitingResponse { .. } => false,
        }
    }

    fn start_transmit(&mut self, now: Instant) {
        // A frame still trickling in owns the line
        if !self.bus_free(now) || !self.rx_buf.is_empty() {
            return;
        }

        if let Some(frame) = self.queued_broadcast.take() {
            if let Err(e) = self.link.transmit(&frame) {
                warn!("⚠️  Broadcast transmit failed: {}", e);
            }
            self.state = BusState::Turnaround {
                until: now + self.frame_delay,
            };
            return;
        }

        if let Some((unit_id, frame)) = self.queued.take() {
            if let Err(e) = self.link.clear_input() {
                warn!("⚠️  Could not flush serial input: {}", e);
            }
            match self.link.transmit(&frame) {
                Ok(()) => {
                    self.state = BusState::AwaitingResponse {
                        unit_id,
                        sent_at: now,
                    };
                }
                Err(e) => {
                    self.state = BusState::Idle;
                    self.failed = Some((unit_id, e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::serial::memory::MemoryLink;

    const TIMEOUT: Duration = Duration::from_millis(500);
    const DELAY: Duration = Duration::from_millis(20);

    fn master(link: &MemoryLink) -> RtuMaster {
        RtuMaster::new(Box::new(link.clone()), 9600, TIMEOUT, DELAY)
    }

    fn ms(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    #[test]
    fn test_inter_frame_gap() {
        assert_eq!(inter_frame_gap(9600), Duration::from_micros(4011));
        assert_eq!(inter_frame_gap(19200), Duration::from_micros(2006));
        assert_eq!(inter_frame_gap(115200), Duration::from_micros(1750));
    }

    #[test]
    fn test_response_after_silence_gap() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(17, &[0x03, 0x00, 0x00, 0x00, 0x01], t0).unwrap();
        assert_eq!(link.sent_frames(), vec![encode_rtu_frame(17, &[0x03, 0x00, 0x00, 0x00, 0x01])]);
        assert!(rtu.is_busy());

        let reply = encode_rtu_frame(17, &[0x03, 0x02, 0x11, 0x22]);
        link.inject(&reply[..3]);
        assert_eq!(rtu.poll(ms(t0, 10)), None);
        link.inject(&reply[3..]);
        assert_eq!(rtu.poll(ms(t0, 11)), None);

        let event = rtu.poll(ms(t0, 20));
        assert_eq!(
            event,
            Some(RtuEvent::Completed {
                unit_id: 17,
                outcome: RtuOutcome::Success(vec![0x03, 0x02, 0x11, 0x22]),
            })
        );
        assert!(!rtu.is_busy());
    }

    #[test]
    fn test_timeout_without_bytes() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(5, &[0x01, 0x00, 0x00, 0x00, 0x01], t0).unwrap();
        assert_eq!(rtu.poll(ms(t0, 499)), None);
        assert_eq!(
            rtu.poll(ms(t0, 500)),
            Some(RtuEvent::Completed {
                unit_id: 5,
                outcome: RtuOutcome::Timeout,
            })
        );
        assert!(!rtu.is_busy());
    }

    #[test]
    fn test_corrupt_or_foreign_reply_is_transport_error() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(5, &[0x03, 0x00, 0x00, 0x00, 0x01], t0).unwrap();
        let mut reply = encode_rtu_frame(5, &[0x03, 0x02, 0x00, 0x01]);
        reply[4] ^= 0x40;
        link.inject(&reply);
        assert_eq!(rtu.poll(ms(t0, 5)), None);
        assert!(matches!(
            rtu.poll(ms(t0, 10)),
            Some(RtuEvent::Completed { unit_id: 5, outcome: RtuOutcome::TransportError(_) })
        ));

        rtu.raw_request(5, &[0x03, 0x00, 0x00, 0x00, 0x01], ms(t0, 40)).unwrap();
        link.inject(&encode_rtu_frame(6, &[0x03, 0x02, 0x00, 0x01]));
        assert_eq!(rtu.poll(ms(t0, 41)), None);
        assert!(matches!(
            rtu.poll(ms(t0, 50)),
            Some(RtuEvent::Completed { unit_id: 5, outcome: RtuOutcome::TransportError(_) })
        ));
    }

    #[test]
    fn test_second_unicast_is_refused() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(1, &[0x03, 0x00, 0x00, 0x00, 0x01], t0).unwrap();
        assert!(matches!(
            rtu.raw_request(2, &[0x03, 0x00, 0x00, 0x00, 0x01], t0),
            Err(GatewayError::BusBusy)
        ));
        assert_eq!(link.sent_frames().len(), 1);
    }

    #[test]
    fn test_broadcast_is_fire_and_forget_with_turnaround() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(0, &[0x06, 0x00, 0x01, 0x00, 0x03], t0).unwrap();
        assert_eq!(link.sent_frames().len(), 1);
        assert!(!rtu.is_busy());
        assert_eq!(rtu.poll(ms(t0, 1)), None);

        // Unicast right behind the broadcast waits out the turnaround delay
        rtu.raw_request(3, &[0x03, 0x00, 0x00, 0x00, 0x01], ms(t0, 2)).unwrap();
        assert_eq!(link.sent_frames().len(), 1);
        assert_eq!(rtu.poll(ms(t0, 10)), None);
        assert_eq!(rtu.poll(ms(t0, 20)), None);
        assert_eq!(link.sent_frames().len(), 2);

        // Timeout counts from the real transmit, not from the request
        assert_eq!(rtu.poll(ms(t0, 515)), None);
        assert!(matches!(
            rtu.poll(ms(t0, 520)),
            Some(RtuEvent::Completed { unit_id: 3, outcome: RtuOutcome::Timeout })
        ));
    }

    #[test]
    fn test_broadcast_while_exchange_in_flight_goes_out_afterwards() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(9, &[0x03, 0x00, 0x00, 0x00, 0x01], t0).unwrap();
        rtu.raw_request(0, &[0x05, 0x00, 0x01, 0xFF, 0x00], ms(t0, 1)).unwrap();
        assert_eq!(link.sent_frames().len(), 1);
        assert!(matches!(
            rtu.raw_request(0, &[0x05, 0x00, 0x02, 0xFF, 0x00], ms(t0, 2)),
            Err(GatewayError::BusBusy)
        ));

        link.inject(&encode_rtu_frame(9, &[0x03, 0x02, 0x00, 0x07]));
        assert_eq!(rtu.poll(ms(t0, 3)), None);
        assert!(matches!(rtu.poll(ms(t0, 10)), Some(RtuEvent::Completed { unit_id: 9, .. })));

        assert_eq!(rtu.poll(ms(t0, 30)), None);
        let sent = link.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1][0], 0);
    }

    #[test]
    fn test_unsolicited_bytes_while_idle() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        let t0 = Instant::now();

        link.inject(&[0x11, 0x03, 0x00]);
        assert_eq!(rtu.poll(t0), None);
        assert_eq!(
            rtu.poll(ms(t0, 10)),
            Some(RtuEvent::Unsolicited(vec![0x11, 0x03, 0x00]))
        );
        assert_eq!(rtu.poll(ms(t0, 20)), None);
    }

    #[test]
    fn test_transmit_failure_is_reported_once() {
        let link = MemoryLink::default();
        *link.fail_transmit.borrow_mut() = true;
        let mut rtu = master(&link);
        let t0 = Instant::now();

        rtu.raw_request(4, &[0x03, 0x00, 0x00, 0x00, 0x01], t0).unwrap();
        assert!(rtu.is_busy());
        assert!(matches!(
            rtu.poll(t0),
            Some(RtuEvent::Completed { unit_id: 4, outcome: RtuOutcome::TransportError(_) })
        ));
        assert_eq!(rtu.poll(ms(t0, 1)), None);
        assert!(!rtu.is_busy());
    }

    #[test]
    fn test_rejects_oversized_pdu() {
        let link = MemoryLink::default();
        let mut rtu = master(&link);
        assert!(rtu.raw_request(1, &[], Instant::now()).is_err());
        assert!(rtu.raw_request(1, &[0u8; 254], Instant::now()).is_err());
    }
}
