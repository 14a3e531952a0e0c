//! The bridge loop
//!
//! One task owns the address maps, the session table, the services and the
//! dispatcher. Connection tasks report through [`BridgeEvent`]s and the AUN
//! socket is read in the same `select!`, so no state is shared between tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionHandle, ConnectionId};
use super::dispatcher::Dispatcher;
use super::serial::PiconetLine;
use super::BridgeEvent;
use crate::addressing::ipv4_of;
use crate::protocol::{
    AunFrame, EconetPacket, Encapsulation, EncapsulationKind, Envelope, FrameContext, PacketType,
    WsMessage, ALLOCATE_REQUEST, IMMEDIATE_MACHINE_PEEK,
};
use crate::security::SecurityManager;
use crate::service::ServiceRegistry;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65_536;

pub struct Bridge {
    ctx: FrameContext,
    dispatcher: Dispatcher,
    security: SecurityManager,
    services: ServiceRegistry,
}

impl Bridge {
    pub fn new(
        ctx: FrameContext,
        dispatcher: Dispatcher,
        security: SecurityManager,
        services: ServiceRegistry,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            security,
            services,
        }
    }

    pub fn context(&self) -> &FrameContext {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    pub fn security_mut(&mut self) -> &mut SecurityManager {
        &mut self.security
    }

    /// Run until Ctrl+C or until every event sender is gone
    pub async fn run(
        mut self,
        udp: Option<Arc<UdpSocket>>,
        mut events: mpsc::Receiver<BridgeEvent>,
        housekeeping_interval: Duration,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut housekeeping = tokio::time::interval(housekeeping_interval);

        info!("Bridge running as {}", self.ctx.bridge);

        loop {
            tokio::select! {
                result = recv_datagram(udp.as_deref(), &mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_aun_datagram(from, &buf[..len]),
                        Err(e) => warn!("AUN receive failed: {}", e),
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("All event sources closed");
                            break;
                        }
                    }
                }

                _ = housekeeping.tick() => {
                    self.house_keeping();
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
            }
        }

        if let Some(serial) = self.dispatcher.serial() {
            if let Err(e) = serial.stop() {
                debug!("Could not stop Piconet: {}", e);
            }
        }
        let stats = self.dispatcher.stats();
        info!(
            aun = stats.aun_sent,
            websocket = stats.websocket_sent,
            piconet = stats.piconet_sent,
            dropped = stats.dropped,
            "Bridge stopped"
        );
    }

    pub fn handle_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::WsConnected { conn, peer, handle } => {
                self.handle_ws_connected(conn, peer, handle);
            }
            BridgeEvent::WsFrame { conn, text } => self.handle_ws_frame(conn, &text),
            BridgeEvent::WsDisconnected { conn, reason } => {
                // Sessions outlive the connection and expire through housekeeping
                match self.dispatcher.unregister_client(conn) {
                    Some(addr) => info!(%conn, %addr, "WebSocket client left: {}", reason),
                    None => info!(%conn, "WebSocket client left: {}", reason),
                }
            }
            BridgeEvent::SerialLine(line) => self.handle_serial_line(&line),
            BridgeEvent::SerialClosed { reason } => {
                warn!("Piconet closed: {}", reason);
                self.dispatcher.set_serial(None);
            }
        }
    }

    fn handle_ws_connected(&mut self, conn: ConnectionId, peer: SocketAddr, handle: ConnectionHandle) {
        info!(%conn, %peer, "WebSocket client connected");
        self.dispatcher.register_client(conn, handle);
    }

    /// Acknowledge, decode and deliver one AUN datagram
    pub fn handle_aun_datagram(&mut self, from: SocketAddr, raw: &[u8]) {
        let frame = match AunFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%from, "Dropping AUN datagram: {}", e);
                return;
            }
        };

        let Some(ip) = ipv4_of(&from) else {
            warn!(%from, "Dropping AUN datagram from non-IPv4 sender");
            return;
        };
        let maps = &mut self.dispatcher.maps_mut().aun;
        let Some(sender) = maps.resolve_socket(&from) else {
            warn!(%from, "Dropping AUN datagram from unmapped host");
            return;
        };
        let key = maps.source_key(ip, from.port());
        maps.set_counter(&key, frame.sequence());

        debug!(%from, %sender, "AUN in: {}", frame);

        let ctx = self.ctx.with_sender(sender);
        if let Some(ack) = frame.build_ack(&ctx) {
            self.dispatcher.send_datagram(&ack, from);
        }

        if skip_delivery(&frame) {
            return;
        }
        match frame.build_econet_packet(&ctx) {
            Ok(packet) => self.deliver(packet, EncapsulationKind::Aun),
            Err(e) => warn!(%from, "Dropping AUN datagram: {}", e),
        }
    }

    /// Handle a text frame from a WebSocket client
    pub fn handle_ws_frame(&mut self, conn: ConnectionId, text: &str) {
        let message = match WsMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(%conn, "Dropping WebSocket frame: {}", e);
                return;
            }
        };

        match message {
            WsMessage::Control(request) => {
                let reply = if request.request == ALLOCATE_REQUEST {
                    match self.dispatcher.maps_mut().websocket.allocate(conn) {
                        Ok(addr) => {
                            info!(%conn, %addr, "Allocated Econet address");
                            Envelope::ctrl_response(addr.to_string())
                        }
                        Err(e) => {
                            warn!(%conn, "Allocation failed: {}", e);
                            Envelope::ctrl_error(e.to_string())
                        }
                    }
                } else {
                    warn!(%conn, request = %request.request, "Unknown control request");
                    Envelope::ctrl_error(format!("unknown request {}", request.request))
                };

                match reply.to_json() {
                    Ok(text) => {
                        self.dispatcher.send_to_client(conn, text);
                    }
                    Err(e) => error!(%conn, "Failed to encode control reply: {}", e),
                }
            }
            WsMessage::Packet(pkt) => {
                debug!(%conn, src = %pkt.src(), dst = %pkt.dst(), "WebSocket in: {}", pkt);

                // Clients may only send as the address they were allocated
                let allocated = self.dispatcher.maps().websocket.resolve_connection(conn);
                if allocated != Some(pkt.src()) {
                    match allocated {
                        Some(addr) => warn!(%conn, %addr, src = %pkt.src(), "Dropping packet with foreign source"),
                        None => warn!(%conn, src = %pkt.src(), "Dropping packet from unallocated client"),
                    }
                    return;
                }

                match pkt.build_ack_envelope(&self.ctx) {
                    Ok(Some(ack)) => {
                        self.dispatcher.send_to_client(conn, ack);
                    }
                    Ok(None) => {}
                    Err(e) => error!(%conn, "Failed to encode ack: {}", e),
                }

                if skip_delivery(&pkt) {
                    return;
                }
                match pkt.build_econet_packet(&self.ctx) {
                    Ok(packet) => self.deliver(packet, EncapsulationKind::WebSocket),
                    Err(e) => warn!(%conn, "Dropping WebSocket packet: {}", e),
                }
            }
        }
    }

    /// Handle one line from the Piconet
    pub fn handle_serial_line(&mut self, line: &str) {
        let parsed = match PiconetLine::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping Piconet line {:?}: {}", line, e);
                return;
            }
        };

        match parsed {
            PiconetLine::Status(status) => info!("Piconet status: {}", status),
            PiconetLine::Error(reason) => warn!("Piconet error: {}", reason),
            PiconetLine::Monitor(frame) => debug!("Piconet monitor: {}", frame),
            PiconetLine::TxResult(result) if result.is_ok() => debug!("Piconet TX_RESULT {}", result),
            PiconetLine::TxResult(result) => warn!("Piconet transmit failed: {}", result),
            PiconetLine::Unknown(line) => debug!("Unrecognised Piconet line: {}", line),
            PiconetLine::Packet(frame) => {
                debug!("Piconet in: {}", frame);
                if skip_delivery(&frame) {
                    return;
                }
                match frame.build_econet_packet(&self.ctx) {
                    Ok(packet) => self.deliver(packet, EncapsulationKind::Piconet),
                    Err(e) => warn!("Dropping Piconet packet: {}", e),
                }
            }
        }
    }

    /// Hand an inbound packet to the services, or bridge it onwards
    fn deliver(&mut self, packet: EconetPacket, origin: EncapsulationKind) {
        self.security.touch(packet.source());

        let destination = packet.destination();
        if destination == self.ctx.bridge || destination.is_broadcast() {
            for reply in self.services.dispatch(&packet) {
                self.dispatcher.send(reply);
            }
            return;
        }

        // Only WebSocket clients share a transport with each other
        if origin != EncapsulationKind::WebSocket && self.dispatcher.route(destination) == Some(origin) {
            debug!(%destination, "Not bridging {} packet back onto {}", origin, origin);
            return;
        }

        debug!(source = %packet.source(), %destination, "Bridging packet");
        self.dispatcher.send(packet);
    }

    pub fn house_keeping(&mut self) {
        let expired = self.security.house_keeping();
        if !expired.is_empty() {
            info!("Logged out {} idle sessions", expired.len());
        }
        debug!(
            sessions = self.security.session_count(),
            clients = self.dispatcher.client_count(),
            "Housekeeping done"
        );
    }
}

/// Responses and machine peeks are consumed by the transport layer
fn skip_delivery(frame: &impl Encapsulation) -> bool {
    let packet_type = frame.packet_type();
    if packet_type.is_response() {
        debug!("Not dispatching {:?} frame", packet_type);
        return true;
    }
    packet_type == PacketType::Immediate && frame.control() == IMMEDIATE_MACHINE_PEEK
}

async fn recv_datagram(udp: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match udp {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
