//! Transaction correlator tying one Modbus/TCP request to the RTU exchange it caused.
//!
//! The serial bus is half-duplex, so at most one unicast transaction is ever in
//! flight. The first request wins; everything that arrives until it completes is
//! answered with Slave Device Busy. Broadcasts are acknowledged immediately and
//! never occupy the correlator.

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Instant;

use super::keep_alive::KeepAlivePoller;
use super::stats::GatewayStats;
use crate::modbus::protocol::{ExceptionCode, TcpRequest, KEEP_ALIVE_PROBE};
use crate::modbus::rtu::{RtuEvent, RtuMaster, RtuOutcome};
use crate::utils::error::GatewayError;

/// Outbound side of the serial bus as seen by the correlator.
pub trait RtuBus {
    fn raw_request(&mut self, unit_id: u8, pdu: &[u8], now: Instant) -> Result<(), GatewayError>;
}

impl RtuBus for RtuMaster {
    fn raw_request(&mut self, unit_id: u8, pdu: &[u8], now: Instant) -> Result<(), GatewayError> {
        RtuMaster::raw_request(self, unit_id, pdu, now)
    }
}

/// Outbound side of the TCP server as seen by the correlator.
pub trait TcpResponder {
    /// Send `pdu` to `dest` in a frame tagged with `transaction_id` and `unit_id`.
    fn send_response(
        &mut self,
        dest: SocketAddr,
        transaction_id: u16,
        unit_id: u8,
        pdu: &[u8],
    ) -> Result<(), GatewayError>;

    /// Close the connection to `dest`.
    fn disconnect(&mut self, dest: SocketAddr);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayDisposition {
    Forward,
    RespondBusy,
    RespondAcknowledge,
}

impl GatewayDisposition {
    /// Exception the TCP side has to synthesize, if any.
    pub fn exception(&self) -> Option<ExceptionCode> {
        match self {
            GatewayDisposition::Forward => None,
            GatewayDisposition::RespondBusy => Some(ExceptionCode::SlaveDeviceBusy),
            GatewayDisposition::RespondAcknowledge => Some(ExceptionCode::Acknowledge),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client(SocketAddr),
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransaction {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelatorState {
    #[default]
    Idle,
    Pending(PendingTransaction),
}

pub struct Correlator {
    state: CorrelatorState,
    keep_alive: KeepAlivePoller,
    release_on_disconnect: bool,
    stats: GatewayStats,
}

impl Correlator {
    pub fn new(keep_alive: KeepAlivePoller, release_on_disconnect: bool) -> Self {
        Self {
            state: CorrelatorState::Idle,
            keep_alive,
            release_on_disconnect,
            stats: GatewayStats::default(),
        }
    }

    pub fn state(&self) -> CorrelatorState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingTransaction> {
        match &self.state {
            CorrelatorState::Pending(pending) => Some(pending),
            CorrelatorState::Idle => None,
        }
    }

    pub fn keep_alive(&self) -> &KeepAlivePoller {
        &self.keep_alive
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Decide what happens to a decoded client request.
    pub fn on_request(
        &mut self,
        request: &TcpRequest,
        bus: &mut dyn RtuBus,
        now: Instant,
    ) -> GatewayDisposition {
        if request.is_broadcast() {
            debug!(
                "📢 Broadcast fn 0x{:02x} from {} (tid {})",
                request.function_code(),
                request.source,
                request.transaction_id
            );
            if let Err(e) = bus.raw_request(request.unit_id, &request.pdu, now) {
                warn!("⚠️  Broadcast from {} not sent: {}", request.source, e);
                self.stats.transport_errors += 1;
            }
            self.stats.broadcasts_acknowledged += 1;
            return GatewayDisposition::RespondAcknowledge;
        }

        if let CorrelatorState::Pending(pending) = self.state {
            debug!(
                "⏳ Transaction {} to unit {} still running, {} (tid {}) gets busy",
                pending.transaction_id, pending.unit_id, request.source, request.transaction_id
            );
            self.stats.busy_rejections += 1;
            return GatewayDisposition::RespondBusy;
        }

        match bus.raw_request(request.unit_id, &request.pdu, now) {
            Ok(()) => {
                debug!(
                    "➡️  {} tid {} -> unit {} fn 0x{:02x}",
                    request.source,
                    request.transaction_id,
                    request.unit_id,
                    request.function_code()
                );
                self.state = CorrelatorState::Pending(PendingTransaction {
                    transaction_id: request.transaction_id,
                    unit_id: request.unit_id,
                    origin: Origin::Client(request.source),
                });
                self.keep_alive.record_activity(request.unit_id, now);
                self.stats.requests_forwarded += 1;
                GatewayDisposition::Forward
            }
            Err(e) => {
                // Bus still settling a released exchange, or the PDU was unusable
                debug!("⏳ RTU master refused unit {}: {}", request.unit_id, e);
                self.stats.busy_rejections += 1;
                GatewayDisposition::RespondBusy
            }
        }
    }

    /// Feed one RTU master event through the state machine.
    pub fn on_rtu_event(&mut self, event: RtuEvent, tcp: &mut dyn TcpResponder, now: Instant) {
        let (unit_id, outcome) = match event {
            RtuEvent::Completed { unit_id, outcome } => (unit_id, outcome),
            RtuEvent::Unsolicited(bytes) => {
                debug!("🗑️  Dropping unexpected RTU data: {}", hex::encode(&bytes));
                self.stats.stray_frames += 1;
                return;
            }
        };

        let pending = match self.state {
            CorrelatorState::Pending(pending) if pending.unit_id == unit_id => pending,
            _ => {
                debug!("🗑️  Dropping RTU result from unit {} with nothing pending", unit_id);
                self.stats.stray_frames += 1;
                return;
            }
        };
        self.state = CorrelatorState::Idle;

        match pending.origin {
            Origin::Client(source) => self.complete_client(pending, source, outcome, tcp),
            Origin::KeepAlive => self.complete_probe(pending.unit_id, outcome, now),
        }
    }

    fn complete_client(
        &mut self,
        pending: PendingTransaction,
        source: SocketAddr,
        outcome: RtuOutcome,
        tcp: &mut dyn TcpResponder,
    ) {
        match outcome {
            RtuOutcome::Success(pdu) => {
                match tcp.send_response(source, pending.transaction_id, pending.unit_id, &pdu) {
                    Ok(()) => {
                        debug!(
                            "⬅️  unit {} -> {} tid {} ({} bytes)",
                            pending.unit_id,
                            source,
                            pending.transaction_id,
                            pdu.len()
                        );
                        self.stats.responses_delivered += 1;
                    }
                    Err(e) => {
                        warn!(
                            "📵 Response from unit {} for {} (tid {}) not delivered: {}",
                            pending.unit_id, source, pending.transaction_id, e
                        );
                        self.stats.delivery_failures += 1;
                    }
                }
            }
            RtuOutcome::Timeout => {
                warn!(
                    "⏰ Unit {} did not answer tid {}, closing {}",
                    pending.unit_id, pending.transaction_id, source
                );
                self.stats.timeouts += 1;
                tcp.disconnect(source);
            }
            RtuOutcome::TransportError(reason) => {
                warn!(
                    "💥 RTU exchange with unit {} for {} failed: {}",
                    pending.unit_id, source, reason
                );
                self.stats.transport_errors += 1;
            }
        }
    }

    fn complete_probe(&mut self, unit_id: u8, outcome: RtuOutcome, now: Instant) {
        match outcome {
            RtuOutcome::Success(_) => debug!("💓 Unit {} answered keep-alive probe", unit_id),
            RtuOutcome::Timeout => {
                warn!("⏰ Unit {} did not answer keep-alive probe", unit_id);
                self.stats.timeouts += 1;
            }
            RtuOutcome::TransportError(reason) => {
                warn!("💥 Keep-alive probe to unit {} failed: {}", unit_id, reason);
                self.stats.transport_errors += 1;
            }
        }
        self.keep_alive.touch(now);
    }

    /// Issue the idle-bus probe if one is due. Returns true when it went out.
    pub fn poll_keep_alive(&mut self, bus: &mut dyn RtuBus, now: Instant) -> bool {
        if self.state != CorrelatorState::Idle {
            return false;
        }
        let unit_id = match self.keep_alive.due(now) {
            Some(unit_id) => unit_id,
            None => return false,
        };

        match bus.raw_request(unit_id, &KEEP_ALIVE_PROBE, now) {
            Ok(()) => {
                self.state = CorrelatorState::Pending(PendingTransaction {
                    transaction_id: 0,
                    unit_id,
                    origin: Origin::KeepAlive,
                });
                self.stats.keep_alive_probes += 1;
                true
            }
            Err(e) => {
                debug!("💓 Keep-alive probe to unit {} deferred: {}", unit_id, e);
                false
            }
        }
    }

    /// A TCP connection went away. Only releases the bus when configured to.
    pub fn on_client_disconnect(&mut self, source: SocketAddr) -> bool {
        match self.state {
            CorrelatorState::Pending(PendingTransaction {
                origin: Origin::Client(owner),
                transaction_id,
                unit_id,
            }) if owner == source => {
                if !self.release_on_disconnect {
                    debug!(
                        "🔌 {} left with tid {} to unit {} pending, waiting for RTU",
                        source, transaction_id, unit_id
                    );
                    return false;
                }
                info!(
                    "🔌 {} left, releasing tid {} to unit {}",
                    source, transaction_id, unit_id
                );
                self.state = CorrelatorState::Idle;
                self.stats.released_on_disconnect += 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingBus {
        requests: Vec<(u8, Vec<u8>)>,
        refuse: bool,
    }

    impl RtuBus for RecordingBus {
        fn raw_request(&mut self, unit_id: u8, pdu: &[u8], _now: Instant) -> Result<(), GatewayError> {
            if self.refuse {
                return Err(GatewayError::BusBusy);
            }
            self.requests.push((unit_id, pdu.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingResponder {
        responses: Vec<(SocketAddr, u16, u8, Vec<u8>)>,
        disconnected: Vec<SocketAddr>,
        gone: Vec<SocketAddr>,
    }

    impl TcpResponder for RecordingResponder {
        fn send_response(
            &mut self,
            dest: SocketAddr,
            transaction_id: u16,
            unit_id: u8,
            pdu: &[u8],
        ) -> Result<(), GatewayError> {
            if self.gone.contains(&dest) {
                return Err(GatewayError::PeerGone(dest));
            }
            self.responses.push((dest, transaction_id, unit_id, pdu.to_vec()));
            Ok(())
        }

        fn disconnect(&mut self, dest: SocketAddr) {
            self.disconnected.push(dest);
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn request(tid: u16, unit: u8, src: &str) -> TcpRequest {
        TcpRequest {
            transaction_id: tid,
            unit_id: unit,
            source: addr(src),
            pdu: vec![0x03, 0x00, 0x64, 0x00, 0x01],
        }
    }

    fn correlator() -> Correlator {
        Correlator::new(KeepAlivePoller::new(true, Duration::from_secs(60), vec![]), false)
    }

    fn success(unit_id: u8, pdu: &[u8]) -> RtuEvent {
        RtuEvent::Completed {
            unit_id,
            outcome: RtuOutcome::Success(pdu.to_vec()),
        }
    }

    #[test]
    fn test_collision_gets_busy_and_response_goes_to_first_client() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        let now = Instant::now();

        let a = request(5, 17, "10.0.0.2:50001");
        let b = request(6, 17, "10.0.0.3:50002");

        assert_eq!(gw.on_request(&a, &mut bus, now), GatewayDisposition::Forward);
        assert_eq!(gw.on_request(&b, &mut bus, now), GatewayDisposition::RespondBusy);
        assert_eq!(bus.requests.len(), 1);

        gw.on_rtu_event(success(17, &[0x11, 0x22]), &mut tcp, now);
        assert_eq!(
            tcp.responses,
            vec![(addr("10.0.0.2:50001"), 5, 17, vec![0x11, 0x22])]
        );
        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert_eq!(gw.stats().busy_rejections, 1);
        assert_eq!(gw.stats().responses_delivered, 1);
    }

    #[test]
    fn test_single_flight_under_many_contenders() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let now = Instant::now();

        let first = gw.on_request(&request(1, 3, "10.0.0.9:1000"), &mut bus, now);
        assert_eq!(first, GatewayDisposition::Forward);
        for tid in 2..50u16 {
            let unit = (tid % 5) as u8 + 1;
            let src = format!("10.0.0.{}:{}", tid, 2000 + tid);
            assert_eq!(
                gw.on_request(&request(tid, unit, &src), &mut bus, now),
                GatewayDisposition::RespondBusy
            );
        }
        assert_eq!(bus.requests.len(), 1);
        assert_eq!(gw.pending().map(|p| p.transaction_id), Some(1));
    }

    #[test]
    fn test_broadcast_acknowledged_and_never_pending() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let now = Instant::now();

        let mut broadcast = request(9, 0, "10.0.0.4:40000");
        broadcast.pdu = vec![0x06, 0x00, 0x01, 0x00, 0x02];
        assert_eq!(
            gw.on_request(&broadcast, &mut bus, now),
            GatewayDisposition::RespondAcknowledge
        );
        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert_eq!(bus.requests, vec![(0, vec![0x06, 0x00, 0x01, 0x00, 0x02])]);

        // The next unicast goes through normally
        assert_eq!(
            gw.on_request(&request(10, 2, "10.0.0.4:40000"), &mut bus, now),
            GatewayDisposition::Forward
        );

        // Broadcasts while pending are still acknowledged and leave the pending one alone
        assert_eq!(
            gw.on_request(&broadcast, &mut bus, now),
            GatewayDisposition::RespondAcknowledge
        );
        assert_eq!(gw.pending().map(|p| p.transaction_id), Some(10));
        assert_eq!(gw.keep_alive().state().last_active_unit_id, Some(2));
    }

    #[test]
    fn test_timeout_closes_client_and_frees_bus() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        let now = Instant::now();

        gw.on_request(&request(7, 4, "10.0.0.5:1234"), &mut bus, now);
        gw.on_rtu_event(
            RtuEvent::Completed {
                unit_id: 4,
                outcome: RtuOutcome::Timeout,
            },
            &mut tcp,
            now,
        );

        assert_eq!(tcp.disconnected, vec![addr("10.0.0.5:1234")]);
        assert!(tcp.responses.is_empty());
        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert_eq!(
            gw.on_request(&request(8, 4, "10.0.0.6:1234"), &mut bus, now),
            GatewayDisposition::Forward
        );
    }

    #[test]
    fn test_undeliverable_response_still_clears_state() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        tcp.gone.push(addr("10.0.0.7:999"));
        let now = Instant::now();

        gw.on_request(&request(3, 8, "10.0.0.7:999"), &mut bus, now);
        gw.on_rtu_event(success(8, &[0x03, 0x02, 0x00, 0x01]), &mut tcp, now);

        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert_eq!(gw.stats().delivery_failures, 1);
    }

    #[test]
    fn test_transport_error_ends_attempt_without_disconnect() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        let now = Instant::now();

        gw.on_request(&request(3, 8, "10.0.0.7:999"), &mut bus, now);
        gw.on_rtu_event(
            RtuEvent::Completed {
                unit_id: 8,
                outcome: RtuOutcome::TransportError("CRC checksum mismatch".into()),
            },
            &mut tcp,
            now,
        );
        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert!(tcp.disconnected.is_empty());
        assert!(tcp.responses.is_empty());
    }

    #[test]
    fn test_stray_rtu_data_is_ignored() {
        let mut gw = correlator();
        let mut tcp = RecordingResponder::default();
        let now = Instant::now();

        gw.on_rtu_event(success(3, &[0x01]), &mut tcp, now);
        gw.on_rtu_event(RtuEvent::Unsolicited(vec![0xAA, 0xBB]), &mut tcp, now);

        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert!(tcp.responses.is_empty());
        assert_eq!(gw.stats().stray_frames, 2);
    }

    #[test]
    fn test_refusing_bus_answers_busy_and_stays_idle() {
        let mut gw = correlator();
        let mut bus = RecordingBus {
            refuse: true,
            ..Default::default()
        };
        let now = Instant::now();

        assert_eq!(
            gw.on_request(&request(1, 1, "10.0.0.1:1"), &mut bus, now),
            GatewayDisposition::RespondBusy
        );
        assert_eq!(gw.state(), CorrelatorState::Idle);
    }

    #[test]
    fn test_keep_alive_probe_cycle() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        let t0 = Instant::now();

        gw.on_request(&request(1, 33, "10.0.0.8:5000"), &mut bus, t0);
        gw.on_rtu_event(success(33, &[0x03, 0x02, 0x00, 0x00]), &mut tcp, t0);

        // Idle bus but interval not elapsed
        assert!(!gw.poll_keep_alive(&mut bus, t0 + Duration::from_secs(30)));
        assert_eq!(bus.requests.len(), 1);

        let t1 = t0 + Duration::from_secs(60);
        assert!(gw.poll_keep_alive(&mut bus, t1));
        assert_eq!(bus.requests.last(), Some(&(33, KEEP_ALIVE_PROBE.to_vec())));
        assert!(matches!(
            gw.pending(),
            Some(PendingTransaction { origin: Origin::KeepAlive, unit_id: 33, .. })
        ));

        // Client traffic during the probe is serialized against it
        assert_eq!(
            gw.on_request(&request(2, 33, "10.0.0.8:5000"), &mut bus, t1),
            GatewayDisposition::RespondBusy
        );

        gw.on_rtu_event(success(33, &[0x01, 0x01, 0x00]), &mut tcp, t1);
        assert_eq!(tcp.responses.len(), 1);
        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert!(!gw.poll_keep_alive(&mut bus, t1 + Duration::from_secs(59)));
        assert!(gw.poll_keep_alive(&mut bus, t1 + Duration::from_secs(60)));
    }

    /// Arm the poller with a finished client exchange on unit 33 and send the
    /// probe one interval later. Returns the time the probe went out.
    fn start_probe(
        gw: &mut Correlator,
        bus: &mut RecordingBus,
        tcp: &mut RecordingResponder,
        t0: Instant,
    ) -> Instant {
        gw.on_request(&request(1, 33, "10.0.0.8:5000"), bus, t0);
        gw.on_rtu_event(success(33, &[0x03, 0x02, 0x00, 0x00]), tcp, t0);
        tcp.responses.clear();

        let t1 = t0 + Duration::from_secs(60);
        assert!(gw.poll_keep_alive(bus, t1));
        t1
    }

    #[test]
    fn test_unanswered_keep_alive_clears_quietly_and_restarts_timer() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        let t1 = start_probe(&mut gw, &mut bus, &mut tcp, Instant::now());

        let t2 = t1 + Duration::from_secs(1);
        gw.on_rtu_event(
            RtuEvent::Completed {
                unit_id: 33,
                outcome: RtuOutcome::Timeout,
            },
            &mut tcp,
            t2,
        );

        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert!(tcp.disconnected.is_empty());
        assert!(tcp.responses.is_empty());
        assert_eq!(gw.stats().timeouts, 1);
        assert!(!gw.poll_keep_alive(&mut bus, t2 + Duration::from_secs(59)));
        assert!(gw.poll_keep_alive(&mut bus, t2 + Duration::from_secs(60)));
    }

    #[test]
    fn test_failed_keep_alive_exchange_clears_quietly_and_restarts_timer() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let mut tcp = RecordingResponder::default();
        let t1 = start_probe(&mut gw, &mut bus, &mut tcp, Instant::now());

        let t2 = t1 + Duration::from_millis(200);
        gw.on_rtu_event(
            RtuEvent::Completed {
                unit_id: 33,
                outcome: RtuOutcome::TransportError("CRC mismatch".to_string()),
            },
            &mut tcp,
            t2,
        );

        assert_eq!(gw.state(), CorrelatorState::Idle);
        assert!(tcp.disconnected.is_empty());
        assert!(tcp.responses.is_empty());
        assert_eq!(gw.stats().transport_errors, 1);
        assert_eq!(gw.stats().timeouts, 0);
        assert!(!gw.poll_keep_alive(&mut bus, t2 + Duration::from_secs(59)));
        assert!(gw.poll_keep_alive(&mut bus, t2 + Duration::from_secs(60)));
    }

    #[test]
    fn test_keep_alive_not_issued_while_pending() {
        let mut gw = correlator();
        let mut bus = RecordingBus::default();
        let t0 = Instant::now();

        gw.on_request(&request(1, 33, "10.0.0.8:5000"), &mut bus, t0);
        assert!(!gw.poll_keep_alive(&mut bus, t0 + Duration::from_secs(600)));
        assert_eq!(bus.requests.len(), 1);
    }

    #[test]
    fn test_disconnect_release_is_opt_in() {
        let now = Instant::now();
        let mut bus = RecordingBus::default();
        let src = addr("10.0.0.2:50001");

        let mut gw = correlator();
        gw.on_request(&request(5, 17, "10.0.0.2:50001"), &mut bus, now);
        assert!(!gw.on_client_disconnect(src));
        assert!(gw.pending().is_some());

        let mut gw = Correlator::new(
            KeepAlivePoller::new(true, Duration::from_secs(60), vec![]),
            true,
        );
        gw.on_request(&request(5, 17, "10.0.0.2:50001"), &mut bus, now);
        assert!(!gw.on_client_disconnect(addr("10.0.0.3:50001")));
        assert!(gw.on_client_disconnect(src));
        assert_eq!(gw.state(), CorrelatorState::Idle);

        // The late RTU answer is now stray
        let mut tcp = RecordingResponder::default();
        gw.on_rtu_event(success(17, &[0x03, 0x00]), &mut tcp, now);
        assert!(tcp.responses.is_empty());
    }

    #[test]
    fn test_disposition_exceptions() {
        assert_eq!(GatewayDisposition::Forward.exception(), None);
        assert_eq!(
            GatewayDisposition::RespondBusy.exception(),
            Some(ExceptionCode::SlaveDeviceBusy)
        );
        assert_eq!(
            GatewayDisposition::RespondAcknowledge.exception(),
            Some(ExceptionCode::Acknowledge)
        );
    }
}
