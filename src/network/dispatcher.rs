//! Packet dispatcher
//!
//! The one place outbound packets leave the bridge. The destination address
//! picks the transport: a dynamic WebSocket allocation first, then the
//! Piconet network set, then the AUN map. A destination nobody can reach is
//! logged and dropped so a batch of replies keeps flowing.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::connection::{ConnectionHandle, ConnectionId};
use super::serial::SerialHandle;
use crate::addressing::{AunMap, PiconetMap, WsMap};
use crate::protocol::{AunFrame, EconetAddr, EconetPacket, EncapsulationKind, WsPacket};

/// Something that can put an AUN datagram on the wire without blocking
pub trait DatagramSink {
    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(buf, target)
    }
}

/// The three address maps, owned together
#[derive(Debug, Default)]
pub struct AddressMaps {
    pub aun: AunMap,
    pub piconet: PiconetMap,
    pub websocket: WsMap,
}

/// Counters for packets leaving the bridge
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub aun_sent: u64,
    pub websocket_sent: u64,
    pub piconet_sent: u64,
    pub dropped: u64,
}

pub struct Dispatcher {
    maps: AddressMaps,
    aun_port: u16,
    udp: Option<Arc<dyn DatagramSink>>,
    clients: HashMap<ConnectionId, ConnectionHandle>,
    serial: Option<SerialHandle>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(maps: AddressMaps, aun_port: u16) -> Self {
        Self {
            maps,
            aun_port,
            udp: None,
            clients: HashMap::new(),
            serial: None,
            stats: DispatchStats::default(),
        }
    }

    pub fn set_udp(&mut self, udp: Arc<dyn DatagramSink>) {
        self.udp = Some(udp);
    }

    pub fn set_serial(&mut self, serial: Option<SerialHandle>) {
        self.serial = serial;
    }

    pub fn serial(&self) -> Option<&SerialHandle> {
        self.serial.as_ref()
    }

    pub fn maps(&self) -> &AddressMaps {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut AddressMaps {
        &mut self.maps
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Track a freshly connected WebSocket client
    pub fn register_client(&mut self, conn: ConnectionId, handle: ConnectionHandle) {
        self.clients.insert(conn, handle);
    }

    /// Forget a closed WebSocket client and release its dynamic address
    pub fn unregister_client(&mut self, conn: ConnectionId) -> Option<EconetAddr> {
        let addr = self.maps.websocket.resolve_connection(conn);
        self.maps.websocket.free(conn);
        if let Some(handle) = self.clients.remove(&conn) {
            handle.mark_disconnected();
        }
        addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Which transport reaches `addr`
    pub fn route(&self, addr: EconetAddr) -> Option<EncapsulationKind> {
        if self.maps.websocket.resolve_addr(addr).is_some() {
            Some(EncapsulationKind::WebSocket)
        } else if self.maps.piconet.network_known(addr.network) {
            Some(EncapsulationKind::Piconet)
        } else if self.maps.aun.resolve_addr(addr).is_some() {
            Some(EncapsulationKind::Aun)
        } else {
            None
        }
    }

    /// Send a packet to its destination; returns whether any transport took it
    pub fn send(&mut self, packet: EconetPacket) -> bool {
        let destination = packet.destination();
        let sent = if destination.is_broadcast() {
            self.send_broadcast(&packet)
        } else {
            match self.route(destination) {
                Some(EncapsulationKind::WebSocket) => self.send_websocket(&packet),
                Some(EncapsulationKind::Piconet) => self.send_piconet(&packet),
                Some(EncapsulationKind::Aun) => self.send_aun(&packet),
                None => {
                    warn!(%destination, "No route to destination, dropping packet");
                    false
                }
            }
        };

        if !sent {
            self.stats.dropped += 1;
        }
        sent
    }

    /// Queue raw text (acks, control replies) to one WebSocket client
    pub fn send_to_client(&mut self, conn: ConnectionId, text: String) -> bool {
        let Some(handle) = self.clients.get(&conn) else {
            warn!(%conn, "Unknown WebSocket connection");
            return false;
        };
        match handle.send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(%conn, "WebSocket send failed: {}", e);
                false
            }
        }
    }

    /// Send a raw AUN datagram (acks) straight back to a socket address
    pub fn send_datagram(&mut self, bytes: &[u8], target: SocketAddr) -> bool {
        let Some(udp) = &self.udp else {
            warn!(%target, "AUN transport not running");
            return false;
        };
        match udp.send_datagram(bytes, target) {
            Ok(_) => true,
            Err(e) => {
                warn!(%target, "AUN send failed: {}", e);
                false
            }
        }
    }

    fn send_broadcast(&mut self, packet: &EconetPacket) -> bool {
        let network = packet.destination_network();
        let mut sent = false;

        let targets: Vec<ConnectionId> = self
            .clients
            .keys()
            .copied()
            .filter(|conn| {
                self.maps
                    .websocket
                    .resolve_connection(*conn)
                    .is_some_and(|addr| addr.network == network)
            })
            .collect();
        for conn in targets {
            sent |= self.send_websocket_to(conn, packet);
        }

        if self.maps.piconet.network_known(network) {
            sent |= self.send_piconet(packet);
        }

        if self.maps.aun.resolve_addr(packet.destination()).is_some() {
            sent |= self.send_aun(packet);
        }

        if !sent {
            debug!(network, "Broadcast reached no stations");
        }
        sent
    }

    fn send_websocket(&mut self, packet: &EconetPacket) -> bool {
        match self.maps.websocket.resolve_addr(packet.destination()) {
            Some(conn) => self.send_websocket_to(conn, packet),
            None => false,
        }
    }

    fn send_websocket_to(&mut self, conn: ConnectionId, packet: &EconetPacket) -> bool {
        let sequence = self.maps.websocket.next_sequence(conn);
        let text = match WsPacket::from_packet(packet, sequence).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(%conn, "Failed to encode WebSocket packet: {}", e);
                return false;
            }
        };
        let sent = self.send_to_client(conn, text);
        if sent {
            self.stats.websocket_sent += 1;
        }
        sent
    }

    fn send_piconet(&mut self, packet: &EconetPacket) -> bool {
        let Some(serial) = &self.serial else {
            warn!(destination = %packet.destination(), "Piconet not connected, dropping packet");
            return false;
        };
        match serial.transmit(packet) {
            Ok(()) => {
                self.stats.piconet_sent += 1;
                true
            }
            Err(e) => {
                warn!("Piconet send failed: {}", e);
                false
            }
        }
    }

    fn send_aun(&mut self, packet: &EconetPacket) -> bool {
        let destination = packet.destination();
        let Some(endpoint) = self.maps.aun.resolve_addr(destination) else {
            warn!(%destination, "No AUN endpoint, dropping packet");
            return false;
        };

        let key = self.maps.aun.endpoint_key(&endpoint);
        let sequence = self.maps.aun.increment_counter(&key);
        let bytes = AunFrame::from_packet(packet, sequence).encode();
        let target = endpoint.socket_addr(self.aun_port);

        let sent = self.send_datagram(&bytes, target);
        if sent {
            debug!(%destination, %target, sequence, "AUN packet sent");
            self.stats.aun_sent += 1;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Encapsulation, PacketType, WsMessage};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl DatagramSink for RecordingSink {
        fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((buf.to_vec(), target));
            Ok(buf.len())
        }
    }

    fn packet_to(dst: EconetAddr) -> EconetPacket {
        EconetPacket::new(EconetAddr::new(1, 254), dst, 0x99, 0x80, vec![0x11, 0x22])
    }

    fn dispatcher() -> (Dispatcher, Arc<RecordingSink>) {
        let maps = AddressMaps {
            aun: AunMap::parse("192.168.0.0/24 127\n192.168.0.40 127.254\n").unwrap(),
            piconet: PiconetMap::new([5]),
            websocket: WsMap::new([200]),
        };
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = Dispatcher::new(maps, 32768);
        dispatcher.set_udp(sink.clone());
        (dispatcher, sink)
    }

    #[test]
    fn test_aun_send_uses_counter() {
        let (mut dispatcher, sink) = dispatcher();
        dispatcher.maps_mut().aun.set_counter("192.168.0.40", 100);

        assert!(dispatcher.send(packet_to(EconetAddr::new(127, 254))));
        assert!(dispatcher.send(packet_to(EconetAddr::new(127, 254))));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, "192.168.0.40:32768".parse::<SocketAddr>().unwrap());

        let first = AunFrame::decode(&sent[0].0).unwrap();
        let second = AunFrame::decode(&sent[1].0).unwrap();
        assert_eq!(first.packet_type(), PacketType::Unicast);
        assert_eq!(first.sequence(), 104);
        assert_eq!(second.sequence(), 108);
        assert_eq!(first.data(), &[0x11, 0x22]);
    }

    #[test]
    fn test_unroutable_is_dropped_quietly() {
        let (mut dispatcher, sink) = dispatcher();
        assert!(!dispatcher.send(packet_to(EconetAddr::new(99, 1))));
        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(dispatcher.stats().dropped, 1);
    }

    #[test]
    fn test_websocket_route_wins() {
        let (mut dispatcher, sink) = dispatcher();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = ConnectionId::new();
        dispatcher.register_client(conn, ConnectionHandle::new(tx));
        let addr = dispatcher.maps_mut().websocket.allocate(conn).unwrap();

        assert_eq!(dispatcher.route(addr), Some(EncapsulationKind::WebSocket));
        assert!(dispatcher.send(packet_to(addr)));
        assert!(sink.sent.lock().unwrap().is_empty());

        let text = rx.try_recv().unwrap();
        match WsMessage::decode(&text).unwrap() {
            WsMessage::Packet(pkt) => {
                assert_eq!(pkt.dst(), addr);
                assert_eq!(pkt.src(), EconetAddr::new(1, 254));
                assert_eq!(pkt.data(), &[0x11, 0x22]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_piconet_route() {
        let (mut dispatcher, _sink) = dispatcher();
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher.set_serial(Some(SerialHandle::new(ConnectionHandle::new(tx), 1)));

        assert_eq!(
            dispatcher.route(EconetAddr::new(5, 3)),
            Some(EncapsulationKind::Piconet)
        );
        assert!(dispatcher.send(packet_to(EconetAddr::new(5, 3))));
        assert!(rx.try_recv().unwrap().starts_with("TX 3 5 128 153 "));
    }

    #[test]
    fn test_piconet_route_without_device_drops() {
        let (mut dispatcher, _sink) = dispatcher();
        assert!(!dispatcher.send(packet_to(EconetAddr::new(5, 3))));
    }

    #[test]
    fn test_unregister_frees_address() {
        let (mut dispatcher, _sink) = dispatcher();
        let (tx, _rx) = mpsc::channel(8);
        let conn = ConnectionId::new();
        let handle = ConnectionHandle::new(tx);
        dispatcher.register_client(conn, handle.clone());
        let addr = dispatcher.maps_mut().websocket.allocate(conn).unwrap();

        assert_eq!(dispatcher.unregister_client(conn), Some(addr));
        assert_eq!(dispatcher.client_count(), 0);
        assert!(!handle.is_connected());
        assert_eq!(dispatcher.route(addr), None);
        assert!(!dispatcher.send(packet_to(addr)));
    }

    #[test]
    fn test_broadcast_reaches_subnet_and_clients() {
        let (mut dispatcher, sink) = dispatcher();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = ConnectionId::new();
        dispatcher.register_client(conn, ConnectionHandle::new(tx));
        dispatcher.maps_mut().websocket.allocate(conn).unwrap();

        assert!(dispatcher.send(packet_to(EconetAddr::new(127, 255))));
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].1, "192.168.0.255:32768".parse::<SocketAddr>().unwrap());
        assert_eq!(
            AunFrame::decode(&sent[0].0).unwrap().packet_type(),
            PacketType::Broadcast
        );
        assert!(rx.try_recv().is_err());

        drop(sent);
        assert!(dispatcher.send(packet_to(EconetAddr::new(200, 255))));
        assert!(rx.try_recv().is_ok());
    }
}
