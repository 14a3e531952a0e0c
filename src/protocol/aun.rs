//! AUN encapsulation (Econet over UDP)
//!
//! One datagram carries one packet: the 8-byte header followed by the data.
//! The header has no addressing; the sender's IP identifies the source and
//! the receiving host is the destination.

use std::fmt;

use super::codec::{
    fmt_frame, AunHeader, CodecError, CodecResult, Encapsulation, EncapsulationKind, FrameContext,
};
use super::{EconetPacket, PacketType};

/// A decoded AUN datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AunFrame {
    header: AunHeader,
    data: Vec<u8>,
}

impl AunFrame {
    pub fn new(header: AunHeader, data: Vec<u8>) -> Self {
        Self { header, data }
    }

    pub fn decode(raw: &[u8]) -> CodecResult<Self> {
        let (header, payload) = AunHeader::parse(raw)?;
        Ok(Self::new(header, payload.to_vec()))
    }

    /// Build the outbound datagram for `packet` using `sequence`
    pub fn from_packet(packet: &EconetPacket, sequence: u32) -> Self {
        let packet_type = if packet.destination().is_broadcast() {
            PacketType::Broadcast
        } else {
            PacketType::Unicast
        };
        let header = AunHeader::new(packet_type, packet.port(), packet.control(), sequence);
        Self::new(header, packet.payload().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        self.header.encode(&self.data)
    }

    pub fn header(&self) -> &AunHeader {
        &self.header
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }
}

impl Encapsulation for AunFrame {
    fn kind(&self) -> EncapsulationKind {
        EncapsulationKind::Aun
    }

    fn port(&self) -> u8 {
        self.header.port
    }

    fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    fn control(&self) -> u8 {
        self.header.control
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn build_econet_packet(&self, ctx: &FrameContext) -> CodecResult<EconetPacket> {
        let source = ctx.sender.ok_or(CodecError::UnresolvedSource)?;
        Ok(EconetPacket::new(
            source,
            ctx.bridge,
            self.header.port,
            self.header.control,
            self.data.clone(),
        ))
    }

    fn build_ack(&self, ctx: &FrameContext) -> Option<Vec<u8>> {
        self.header.ack(ctx)
    }
}

impl fmt::Display for AunFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_frame(f, &self.header, &self.data)
    }
}
