use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

use super::tcp_server::{ModbusTcpServer, ServerEvent};
use crate::config::Config;
use crate::gateway::{Correlator, KeepAlivePoller};
use crate::modbus::rtu::RtuMaster;
use crate::modbus::serial::{SerialLink, SerialPortLink};
use crate::utils::error::GatewayError;

/// Scheduler tick for the serial side. Must stay well below the RTU
/// inter-frame gap so frame ends are noticed in time.
const BUS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The gateway's single execution context: TCP events, the RTU master and the
/// keep-alive timer are all serviced from one loop, so every correlator
/// transition runs to completion before the next event is looked at.
pub struct GatewayService {
    config: Config,
    correlator: Correlator,
    rtu: RtuMaster,
    server: ModbusTcpServer,
}

impl GatewayService {
    pub async fn new(config: Config) -> Result<Self, GatewayError> {
        let link = SerialPortLink::open(&config)?;
        Self::with_link(config, Box::new(link)).await
    }

    pub async fn with_link(config: Config, link: Box<dyn SerialLink>) -> Result<Self, GatewayError> {
        info!("🚀 Initializing gateway service");
        info!("🏭 Gateway: {} [{}]", config.gateway_name, config.gateway_uuid);
        info!("📦 Version: {}", config.version);

        let server = ModbusTcpServer::bind(config.listen_addr()?, config.max_connections).await?;
        let rtu = RtuMaster::new(
            link,
            config.baud_rate,
            config.rtu_timeout(),
            config.frame_delay(),
        );
        let correlator = Correlator::new(
            KeepAlivePoller::from_config(&config.keep_alive),
            config.release_on_disconnect,
        );

        info!(
            "⏱️  RTU timeout {} ms, keep-alive {}",
            config.rtu_timeout_ms,
            if config.keep_alive.enabled {
                format!("every {} s", config.keep_alive.interval_secs)
            } else {
                "disabled".to_string()
            }
        );
        info!("✅ Gateway service initialized for '{}'", config.gateway_name);

        Ok(Self {
            config,
            correlator,
            rtu,
            server,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.server.local_addr()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub async fn next_server_event(&mut self) -> ServerEvent {
        self.server.next_event().await
    }

    /// Run until Ctrl-C.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        info!(
            "🔁 Running in Modbus RTU<->TCP gateway mode: tcp {} <-> rtu {}",
            self.config.tcp_listen, self.config.serial_port
        );

        let mut bus_tick = interval(BUS_POLL_INTERVAL);
        bus_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stats_enabled = self.config.stats_interval_secs > 0;
        let mut stats_tick = interval(Duration::from_secs(self.config.stats_interval_secs.max(1)));
        stats_tick.reset();

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = &mut shutdown => {
                    if let Err(e) = result {
                        warn!("⚠️  Signal handler failed: {}", e);
                    }
                    info!("🛑 Stopping gateway...");
                    break;
                }
                event = self.server.next_event() => {
                    self.handle_server_event(event, Instant::now());
                }
                _ = bus_tick.tick() => {
                    self.service_bus(Instant::now());
                }
                _ = stats_tick.tick(), if stats_enabled => {
                    self.log_stats();
                }
            }
        }

        self.server.close_all();
        self.log_stats();
        Ok(())
    }

    pub fn handle_server_event(&mut self, event: ServerEvent, now: Instant) {
        match event {
            ServerEvent::Connected(_) => {}
            ServerEvent::Request(request) => {
                let disposition = self.correlator.on_request(&request, &mut self.rtu, now);
                if let Some(code) = disposition.exception() {
                    if let Err(e) = self.server.respond_exception(&request, code) {
                        warn!("📵 Could not send {} to {}: {}", code, request.source, e);
                    }
                }
                self.service_bus(now);
            }
            ServerEvent::Closed(peer) => {
                self.correlator.on_client_disconnect(peer);
            }
        }
    }

    /// Drain RTU master events into the correlator, then give the keep-alive
    /// poller a chance at the bus.
    pub fn service_bus(&mut self, now: Instant) {
        while let Some(event) = self.rtu.poll(now) {
            self.correlator.on_rtu_event(event, &mut self.server, now);
        }
        if self.correlator.poll_keep_alive(&mut self.rtu, now) {
            info!(
                "💓 Keep-alive probe sent to unit {}",
                self.correlator.pending().map(|p| p.unit_id).unwrap_or_default()
            );
        }
    }

    fn log_stats(&self) {
        info!(
            "📊 Gateway stats ({} clients): {}",
            self.server.client_count(),
            self.correlator.stats().to_json()
        );
        for client in self.server.clients() {
            debug!(
                "👤 {} connected since {}, {} requests, {} frames sent",
                client.address,
                client.connected_at.format("%Y-%m-%d %H:%M:%S"),
                client.requests_received,
                client.frames_sent
            );
        }
    }
}
