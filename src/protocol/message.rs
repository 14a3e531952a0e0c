//! Canonical Econet packet definitions
//!
//! Every transport decodes into these types and every reply is built from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Station number addressing every station on a network
pub const BROADCAST_STATION: u8 = 255;

/// Error parsing a textual `network.station` address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid Econet address: {0:?}")]
pub struct AddrParseError(pub String);

/// An Econet address: a (network, station) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EconetAddr {
    pub network: u8,
    pub station: u8,
}

impl EconetAddr {
    pub const fn new(network: u8, station: u8) -> Self {
        Self { network, station }
    }

    pub fn is_broadcast(&self) -> bool {
        self.station == BROADCAST_STATION
    }
}

impl fmt::Display for EconetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.network, self.station)
    }
}

impl FromStr for EconetAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddrParseError(s.to_string());
        let (network, station) = s.trim().split_once('.').ok_or_else(err)?;
        Ok(Self {
            network: network.parse().map_err(|_| err())?,
            station: station.parse().map_err(|_| err())?,
        })
    }
}

/// Econet packet types as carried in the AUN header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Broadcast = 1,
    Unicast = 2,
    Ack = 3,
    Reject = 4,
    Immediate = 5,
    ImmediateReply = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Broadcast),
            2 => Some(PacketType::Unicast),
            3 => Some(PacketType::Ack),
            4 => Some(PacketType::Reject),
            5 => Some(PacketType::Immediate),
            6 => Some(PacketType::ImmediateReply),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Acknowledgement traffic answers something we sent; it never reaches a service
    pub fn is_response(self) -> bool {
        matches!(
            self,
            PacketType::Ack | PacketType::Reject | PacketType::ImmediateReply
        )
    }
}

/// Transport-agnostic Econet packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EconetPacket {
    source: EconetAddr,
    destination: EconetAddr,
    port: u8,
    control: u8,
    payload: Vec<u8>,
}

impl EconetPacket {
    pub fn new(
        source: EconetAddr,
        destination: EconetAddr,
        port: u8,
        control: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            source,
            destination,
            port,
            control,
            payload,
        }
    }

    pub fn source(&self) -> EconetAddr {
        self.source
    }

    pub fn source_network(&self) -> u8 {
        self.source.network
    }

    pub fn source_station(&self) -> u8 {
        self.source.station
    }

    pub fn destination(&self) -> EconetAddr {
        self.destination
    }

    pub fn destination_network(&self) -> u8 {
        self.destination.network
    }

    pub fn destination_station(&self) -> u8 {
        self.destination.station
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn control(&self) -> u8 {
        self.control
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the packet, returning its payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_parse_and_display() {
        let addr: EconetAddr = "127.254".parse().unwrap();
        assert_eq!(addr, EconetAddr::new(127, 254));
        assert_eq!(addr.to_string(), "127.254");
    }

    #[test]
    fn test_addr_parse_rejects_garbage() {
        assert!("127".parse::<EconetAddr>().is_err());
        assert!("256.1".parse::<EconetAddr>().is_err());
        assert!("a.b".parse::<EconetAddr>().is_err());
    }

    #[test]
    fn test_packet_type_codes() {
        for code in 1..=6u8 {
            assert_eq!(PacketType::from_u8(code).unwrap().as_u8(), code);
        }
        assert!(PacketType::from_u8(0).is_none());
        assert!(PacketType::from_u8(7).is_none());
        assert!(PacketType::Ack.is_response());
        assert!(!PacketType::Unicast.is_response());
    }
}
