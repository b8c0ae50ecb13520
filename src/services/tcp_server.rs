use bytes::BytesMut;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::gateway::TcpResponder;
use crate::modbus::protocol::{exception_pdu, ExceptionCode, TcpFrame, TcpRequest};
use crate::utils::error::GatewayError;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub address: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub requests_received: u64,
    pub frames_sent: u64,
}

/// What the gateway loop gets out of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(SocketAddr),
    Request(TcpRequest),
    Closed(SocketAddr),
}

#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    Close,
}

#[derive(Debug)]
enum ConnectionEvent {
    Frame { conn_id: u64, peer: SocketAddr, frame: TcpFrame },
    Closed { conn_id: u64, peer: SocketAddr },
}

struct ClientHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    info: ClientInfo,
}

/// Modbus/TCP front end. Connection tasks only move bytes; all decisions
/// happen in whoever drives `next_event`.
pub struct ModbusTcpServer {
    listener: TcpListener,
    max_connections: usize,
    next_conn_id: u64,
    clients: HashMap<SocketAddr, ClientHandle>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ModbusTcpServer {
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::ConnectionError(format!("Failed to bind Modbus/TCP server on {}: {}", addr, e))
        })?;
        info!("🔌 Modbus/TCP server listening on {}", listener.local_addr()?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            max_connections,
            next_conn_id: 0,
            clients: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients.values().map(|c| c.info.clone()).collect()
    }

    /// Wait for the next connection change or decoded request. Cancel safe.
    pub async fn next_event(&mut self) -> ServerEvent {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.admit(stream, peer) {
                            return ServerEvent::Connected(peer);
                        }
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(event) = self.events_rx.recv() => match event {
                    ConnectionEvent::Frame { conn_id, peer, frame } => {
                        // Frames still queued from a connection we already dropped are discarded
                        if let Some(client) = self.live_client(peer, conn_id) {
                            client.info.requests_received += 1;
                            return ServerEvent::Request(TcpRequest::from_frame(frame, peer));
                        }
                    }
                    ConnectionEvent::Closed { conn_id, peer } => {
                        if self.live_client(peer, conn_id).is_some() {
                            if let Some(client) = self.clients.remove(&peer) {
                                info!(
                                    "👋 {} disconnected after {} requests (connected since {})",
                                    peer,
                                    client.info.requests_received,
                                    client.info.connected_at.format("%Y-%m-%d %H:%M:%S")
                                );
                            }
                            return ServerEvent::Closed(peer);
                        }
                    }
                },
            }
        }
    }

    fn live_client(&mut self, peer: SocketAddr, conn_id: u64) -> Option<&mut ClientHandle> {
        self.clients
            .get_mut(&peer)
            .filter(|client| client.conn_id == conn_id)
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> bool {
        if self.clients.len() >= self.max_connections {
            warn!(
                "🚫 Refusing {}: {} connections already open",
                peer,
                self.clients.len()
            );
            return false;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_connection(stream, peer, conn_id, rx, self.events_tx.clone()));

        self.clients.insert(
            peer,
            ClientHandle {
                conn_id,
                tx,
                info: ClientInfo {
                    address: peer,
                    connected_at: Utc::now(),
                    requests_received: 0,
                    frames_sent: 0,
                },
            },
        );
        info!("🔗 Modbus/TCP client connected: {}", peer);
        true
    }

    fn send_frame(&mut self, dest: SocketAddr, frame: &TcpFrame) -> Result<(), GatewayError> {
        let client = self.clients.get_mut(&dest).ok_or(GatewayError::PeerGone(dest))?;
        client
            .tx
            .send(Outbound::Frame(frame.encode()))
            .map_err(|_| GatewayError::PeerGone(dest))?;
        client.info.frames_sent += 1;
        Ok(())
    }

    /// Answer `request` with a synthesized exception carrying its own
    /// transaction and unit id.
    pub fn respond_exception(
        &mut self,
        request: &TcpRequest,
        code: ExceptionCode,
    ) -> Result<(), GatewayError> {
        let frame = TcpFrame::new(
            request.transaction_id,
            request.unit_id,
            exception_pdu(request.function_code(), code),
        );
        debug!(
            "↩️  {} to {} (tid {}, unit {})",
            code, request.source, request.transaction_id, request.unit_id
        );
        self.send_frame(request.source, &frame)
    }

    /// Close every connection, used on shutdown.
    pub fn close_all(&mut self) {
        for (_, client) in self.clients.drain() {
            let _ = client.tx.send(Outbound::Close);
        }
    }
}

impl TcpResponder for ModbusTcpServer {
    fn send_response(
        &mut self,
        dest: SocketAddr,
        transaction_id: u16,
        unit_id: u8,
        pdu: &[u8],
    ) -> Result<(), GatewayError> {
        self.send_frame(dest, &TcpFrame::new(transaction_id, unit_id, pdu.to_vec()))
    }

    fn disconnect(&mut self, dest: SocketAddr) {
        if let Some(client) = self.clients.remove(&dest) {
            info!("✂️  Closing connection to {}", dest);
            let _ = client.tx.send(Outbound::Close);
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (mut reader, mut writer) = stream.split();
    let mut buf = BytesMut::with_capacity(512);
    let mut open = true;

    while open {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                open = match read {
                    Ok(0) => false,
                    Ok(_) => drain_frames(&mut buf, peer, conn_id, &events),
                    Err(e) => {
                        debug!("Read from {} failed: {}", peer, e);
                        false
                    }
                };
            }
            out = outbound.recv() => {
                open = match out {
                    Some(Outbound::Frame(bytes)) => {
                        debug!("📤 TCP tx {}: {}", peer, hex::encode(&bytes));
                        match writer.write_all(&bytes).await {
                            Ok(()) => true,
                            Err(e) => {
                                warn!("⚠️  Write to {} failed: {}", peer, e);
                                false
                            }
                        }
                    }
                    Some(Outbound::Close) | None => false,
                };
            }
        }
    }

    let _ = events.send(ConnectionEvent::Closed { conn_id, peer });
}

/// Hand every complete frame in `buf` to the gateway loop. False on a frame
/// that cannot be decoded; the stream is unusable after that.
fn drain_frames(
    buf: &mut BytesMut,
    peer: SocketAddr,
    conn_id: u64,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> bool {
    loop {
        match TcpFrame::decode(buf) {
            Ok(Some(frame)) => {
                debug!(
                    "📥 TCP rx {}: tid {} unit {} fn 0x{:02x}",
                    peer,
                    frame.transaction_id,
                    frame.unit_id,
                    frame.function_code()
                );
                if events
                    .send(ConnectionEvent::Frame { conn_id, peer, frame })
                    .is_err()
                {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!("🚫 Dropping {}: {}", peer, e);
                return false;
            }
        }
    }
}
