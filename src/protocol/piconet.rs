//! Piconet encapsulation (serial bridge text protocol)
//!
//! Received packets arrive as `RX_*` lines carrying base64 blobs. The first
//! blob is the scout: destination station, destination network, source
//! station, source network, control, port. On the serial wire network 0
//! means "the network the bridge hardware is attached to".

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::fmt;

use super::codec::{
    fmt_frame, AunHeader, CodecError, CodecResult, Encapsulation, EncapsulationKind, FrameContext,
};
use super::{EconetAddr, EconetPacket, PacketType};

/// Scout size: dst stn, dst net, src stn, src net, control, port
pub const SCOUT_SIZE: usize = 6;

/// Broadcast data packed into the scout blob after the addressing bytes
const BROADCAST_DATA_SIZE: usize = 8;

/// Immediate data packed into the scout blob after the addressing bytes
const IMMEDIATE_DATA_SIZE: usize = 4;

/// Bytes in front of the data in a received transmit frame (the repeated scout addressing)
const TRANSMIT_HEADER_SIZE: usize = 4;

/// CRC trailer after the data in a received transmit frame
const TRANSMIT_TRAILER_SIZE: usize = 2;

/// Network number meaning "the locally attached network" on the serial wire
pub const LOCAL_WIRE_NETWORK: u8 = 0;

/// A decoded `RX_*` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiconetFrame {
    packet_type: PacketType,
    destination: EconetAddr,
    source: EconetAddr,
    control: u8,
    port: u8,
    data: Vec<u8>,
}

impl PiconetFrame {
    /// Decode a received line such as `RX_TRANSMIT <scout> <data>`
    pub fn decode(line: &str) -> CodecResult<Self> {
        let mut parts = line.split_whitespace();
        let kind = parts
            .next()
            .ok_or_else(|| CodecError::Malformed("empty line".into()))?;

        let packet_type = match kind {
            "RX_BROADCAST" => PacketType::Broadcast,
            "RX_IMMEDIATE" => PacketType::Immediate,
            "RX_TRANSMIT" => PacketType::Unicast,
            other => return Err(CodecError::Malformed(format!("not a packet line: {other}"))),
        };

        let scout_b64 = parts
            .next()
            .ok_or_else(|| CodecError::Malformed(format!("{kind} without scout")))?;
        let scout = BASE64.decode(scout_b64)?;
        if scout.len() < SCOUT_SIZE {
            return Err(CodecError::TooShort(scout.len(), SCOUT_SIZE));
        }

        let data = match packet_type {
            PacketType::Broadcast => tail(&scout, BROADCAST_DATA_SIZE),
            PacketType::Immediate => tail(&scout, IMMEDIATE_DATA_SIZE),
            _ => {
                let data_b64 = parts
                    .next()
                    .ok_or_else(|| CodecError::Malformed(format!("{kind} without data")))?;
                let frame = BASE64.decode(data_b64)?;
                let framing = TRANSMIT_HEADER_SIZE + TRANSMIT_TRAILER_SIZE;
                if frame.len() < framing {
                    return Err(CodecError::TooShort(frame.len(), framing));
                }
                frame[TRANSMIT_HEADER_SIZE..frame.len() - TRANSMIT_TRAILER_SIZE].to_vec()
            }
        };

        Ok(Self {
            packet_type,
            destination: EconetAddr::new(scout[1], scout[0]),
            source: EconetAddr::new(scout[3], scout[2]),
            control: scout[4],
            port: scout[5],
            data,
        })
    }

    /// Encode `packet` as the command line that transmits it
    pub fn encode_command(packet: &EconetPacket, local_network: u8) -> String {
        let mut command = if packet.destination().is_broadcast() {
            "BCAST".to_string()
        } else {
            format!(
                "TX {} {} {} {}",
                packet.destination_station(),
                to_wire_network(packet.destination_network(), local_network),
                packet.control(),
                packet.port()
            )
        };
        // No data field at all for an empty payload
        if !packet.payload().is_empty() {
            command.push(' ');
            command.push_str(&BASE64.encode(packet.payload()));
        }
        command
    }

    pub fn source(&self) -> EconetAddr {
        self.source
    }

    pub fn destination(&self) -> EconetAddr {
        self.destination
    }

    fn header(&self) -> AunHeader {
        AunHeader::new(self.packet_type, self.port, self.control, 0)
    }
}

/// Data that follows the scout addressing bytes, truncated to what is present
fn tail(scout: &[u8], len: usize) -> Vec<u8> {
    let end = scout.len().min(SCOUT_SIZE + len);
    scout[SCOUT_SIZE..end].to_vec()
}

fn from_wire_network(network: u8, local_network: u8) -> u8 {
    if network == LOCAL_WIRE_NETWORK {
        local_network
    } else {
        network
    }
}

fn to_wire_network(network: u8, local_network: u8) -> u8 {
    if network == local_network {
        LOCAL_WIRE_NETWORK
    } else {
        network
    }
}

impl Encapsulation for PiconetFrame {
    fn kind(&self) -> EncapsulationKind {
        EncapsulationKind::Piconet
    }

    fn port(&self) -> u8 {
        self.port
    }

    fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    fn control(&self) -> u8 {
        self.control
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn build_econet_packet(&self, ctx: &FrameContext) -> CodecResult<EconetPacket> {
        let local = ctx.local_network();
        let source = EconetAddr::new(
            from_wire_network(self.source.network, local),
            self.source.station,
        );
        let destination = EconetAddr::new(
            from_wire_network(self.destination.network, local),
            self.destination.station,
        );
        Ok(EconetPacket::new(
            source,
            destination,
            self.port,
            self.control,
            self.data.clone(),
        ))
    }

    /// The bridge hardware acknowledges on the wire
    fn build_ack(&self, _ctx: &FrameContext) -> Option<Vec<u8>> {
        None
    }
}

impl fmt::Display for PiconetFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_frame(f, &self.header(), &self.data)
    }
}
