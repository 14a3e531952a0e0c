//! Shared codec machinery
//!
//! Every encapsulation carries the same 8-byte AUN header somewhere inside
//! its transport framing, so the header, the acknowledgement rule and the
//! diagnostic formatting live here.

use bytes::{BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

use super::{EconetAddr, EconetPacket, PacketType};

/// Header size: type(1) + port(1) + control(1) + pad(1) + sequence(4) = 8 bytes
pub const AUN_HEADER_SIZE: usize = 8;

/// Control byte of an immediate operation asking for the machine type
pub const IMMEDIATE_MACHINE_PEEK: u8 = 8;

/// Machine type bytes sent in reply to a machine peek
const MACHINE_TYPE: [u8; 2] = [0x40, 0x66];

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too short: {0} bytes (need {1})")]
    TooShort(usize, usize),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Sender has no Econet address")]
    UnresolvedSource,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// The transports a packet can travel over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncapsulationKind {
    Aun,
    WebSocket,
    Piconet,
}

impl fmt::Display for EncapsulationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncapsulationKind::Aun => "AUN",
            EncapsulationKind::WebSocket => "WebSocket",
            EncapsulationKind::Piconet => "Piconet",
        };
        f.write_str(name)
    }
}

/// Bridge-side facts a codec needs to build packets and acknowledgements
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// The bridge's own Econet address
    pub bridge: EconetAddr,
    /// Econet address of the sender, when the transport resolved one
    pub sender: Option<EconetAddr>,
    /// Firmware version reported in machine peek replies
    pub version_major: u8,
    pub version_minor: u8,
}

impl FrameContext {
    pub fn new(bridge: EconetAddr, version_major: u8, version_minor: u8) -> Self {
        Self {
            bridge,
            sender: None,
            version_major,
            version_minor,
        }
    }

    pub fn with_sender(mut self, sender: EconetAddr) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Network number substituted for network 0 on the serial wire
    pub fn local_network(&self) -> u8 {
        self.bridge.network
    }
}

/// Operations every encapsulation provides
pub trait Encapsulation: fmt::Display {
    fn kind(&self) -> EncapsulationKind;

    fn port(&self) -> u8;

    fn packet_type(&self) -> PacketType;

    fn control(&self) -> u8;

    fn data(&self) -> &[u8];

    /// Map the transport's addressing onto a canonical packet
    fn build_econet_packet(&self, ctx: &FrameContext) -> CodecResult<EconetPacket>;

    /// Acknowledgement bytes to send back, if the packet type needs one
    fn build_ack(&self, ctx: &FrameContext) -> Option<Vec<u8>>;
}

/// The fixed AUN header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AunHeader {
    pub packet_type: PacketType,
    pub port: u8,
    pub control: u8,
    pub pad: u8,
    pub sequence: u32,
}

impl AunHeader {
    pub fn new(packet_type: PacketType, port: u8, control: u8, sequence: u32) -> Self {
        Self {
            packet_type,
            port,
            control,
            pad: 0,
            sequence,
        }
    }

    /// Split a raw frame into its header and payload
    pub fn parse(raw: &[u8]) -> CodecResult<(Self, &[u8])> {
        if raw.len() < AUN_HEADER_SIZE {
            return Err(CodecError::TooShort(raw.len(), AUN_HEADER_SIZE));
        }

        let packet_type =
            PacketType::from_u8(raw[0]).ok_or(CodecError::UnknownPacketType(raw[0]))?;
        let sequence = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);

        let header = Self {
            packet_type,
            port: raw[1],
            control: raw[2],
            pad: raw[3],
            sequence,
        };
        Ok((header, &raw[AUN_HEADER_SIZE..]))
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type.as_u8());
        buf.put_u8(self.port);
        buf.put_u8(self.control);
        buf.put_u8(self.pad);
        buf.put_u32_le(self.sequence);
    }

    /// Encode the header followed by `payload`
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(AUN_HEADER_SIZE + payload.len());
        self.write(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    /// Apply the acknowledgement rule shared by AUN and WebSocket
    ///
    /// Unicast frames are acked with their own sequence number. A machine
    /// peek immediate gets the machine type and firmware version back.
    pub fn ack(&self, ctx: &FrameContext) -> Option<Vec<u8>> {
        match self.packet_type {
            PacketType::Unicast => {
                Some(AunHeader::new(PacketType::Ack, 0, 0, self.sequence).encode(&[]))
            }
            PacketType::Immediate if self.control == IMMEDIATE_MACHINE_PEEK => {
                let body = [
                    MACHINE_TYPE[0],
                    MACHINE_TYPE[1],
                    ctx.version_minor,
                    ctx.version_major,
                ];
                Some(AunHeader::new(PacketType::ImmediateReply, 0, 0, 0).encode(&body))
            }
            _ => None,
        }
    }
}

/// Write the diagnostic form shared by all encapsulations
pub fn fmt_frame(f: &mut fmt::Formatter<'_>, header: &AunHeader, data: &[u8]) -> fmt::Result {
    write!(
        f,
        "Header | Type : {} Port : {} Control : {} Pad : {} Seq : {} | Body |",
        header.packet_type.as_u8(),
        header.port,
        header.control,
        header.pad,
        header.sequence
    )?;
    let body: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
    write!(f, "{}|", body.join(":"))
}
