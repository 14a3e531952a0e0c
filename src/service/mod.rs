//! Service dispatch
//!
//! File and print services live outside the bridge. They see decoded packets
//! through [`Service`] and hand back replies, which the bridge sends on in
//! the order they were returned.

use tracing::debug;

use crate::protocol::EconetPacket;

/// A consumer of inbound packets, such as a file server
pub trait Service {
    fn name(&self) -> &str;

    /// Whether this service listens on `port`
    fn accepts(&self, port: u8) -> bool;

    fn inbound_packet(&mut self, packet: &EconetPacket);

    /// Drain replies produced since the last call
    fn take_replies(&mut self) -> Vec<EconetPacket>;
}

/// Registered services, offered packets in registration order
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Box<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        debug!("Registered service {}", service.name());
        self.services.push(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Offer `packet` to every service on its port and collect their replies
    pub fn dispatch(&mut self, packet: &EconetPacket) -> Vec<EconetPacket> {
        let mut replies = Vec::new();
        let mut handled = false;

        for service in self.services.iter_mut().filter(|s| s.accepts(packet.port())) {
            handled = true;
            service.inbound_packet(packet);
            replies.extend(service.take_replies());
        }

        if !handled {
            debug!(
                port = packet.port(),
                source = %packet.source(),
                "No service listening on port"
            );
        }
        replies
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::EconetAddr;

    /// Replies to every packet on its port with `tag` followed by the payload
    pub(crate) struct EchoService {
        pub port: u8,
        pub tag: u8,
        pub replies: Vec<EconetPacket>,
        pub seen: usize,
    }

    impl EchoService {
        pub fn new(port: u8, tag: u8) -> Self {
            Self {
                port,
                tag,
                replies: Vec::new(),
                seen: 0,
            }
        }
    }

    impl Service for EchoService {
        fn name(&self) -> &str {
            "echo"
        }

        fn accepts(&self, port: u8) -> bool {
            port == self.port
        }

        fn inbound_packet(&mut self, packet: &EconetPacket) {
            self.seen += 1;
            let mut payload = vec![self.tag];
            payload.extend_from_slice(packet.payload());
            self.replies.push(EconetPacket::new(
                packet.destination(),
                packet.source(),
                packet.port(),
                packet.control(),
                payload,
            ));
        }

        fn take_replies(&mut self) -> Vec<EconetPacket> {
            std::mem::take(&mut self.replies)
        }
    }

    fn packet(port: u8) -> EconetPacket {
        EconetPacket::new(
            EconetAddr::new(1, 5),
            EconetAddr::new(1, 254),
            port,
            0x80,
            vec![0x42],
        )
    }

    #[test]
    fn test_replies_in_registration_order() {
        let mut registry = ServiceRegistry::new();
        registry.register(Box::new(EchoService::new(0x99, 1)));
        registry.register(Box::new(EchoService::new(0x99, 2)));
        registry.register(Box::new(EchoService::new(0xD1, 3)));

        let replies = registry.dispatch(&packet(0x99));
        let tags: Vec<u8> = replies.iter().map(|r| r.payload()[0]).collect();
        assert_eq!(tags, vec![1, 2]);
        assert_eq!(replies[0].destination(), EconetAddr::new(1, 5));
    }

    #[test]
    fn test_unhandled_port() {
        let mut registry = ServiceRegistry::new();
        registry.register(Box::new(EchoService::new(0x99, 1)));
        assert!(registry.dispatch(&packet(0x10)).is_empty());
        assert_eq!(registry.len(), 1);
    }
}
