//! WebSocket-JSON encapsulation
//!
//! Browser clients exchange JSON text frames. A `pkt` envelope carries
//! explicit source and destination addresses plus a base64 payload that
//! holds a complete AUN frame. A `ctrl` envelope carries bridge requests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::{
    fmt_frame, AunHeader, CodecError, CodecResult, Encapsulation, EncapsulationKind, FrameContext,
};
use super::{EconetAddr, EconetPacket, PacketType};

/// Control request asking the bridge for a dynamic Econet address
pub const ALLOCATE_REQUEST: &str = "allocate";

/// Outer JSON envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Pkt {
        src: String,
        dst: String,
        payload: String,
    },
    Ctrl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Envelope {
    pub fn ctrl_response(response: impl Into<String>) -> Self {
        Envelope::Ctrl {
            request: None,
            args: None,
            response: Some(response.into()),
            error: None,
        }
    }

    pub fn ctrl_error(error: impl Into<String>) -> Self {
        Envelope::Ctrl {
            request: None,
            args: None,
            response: None,
            error: Some(error.into()),
        }
    }

    pub fn to_json(&self) -> CodecResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A control-channel request from a client
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub request: String,
    pub args: serde_json::Value,
}

/// A decoded WebSocket text frame
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Packet(WsPacket),
    Control(ControlRequest),
}

impl WsMessage {
    pub fn decode(text: &str) -> CodecResult<Self> {
        match serde_json::from_str::<Envelope>(text)? {
            Envelope::Pkt { src, dst, payload } => {
                let src = parse_addr(&src)?;
                let dst = parse_addr(&dst)?;
                let raw = BASE64.decode(payload.trim())?;
                let (header, data) = AunHeader::parse(&raw)?;
                Ok(WsMessage::Packet(WsPacket {
                    src,
                    dst,
                    header,
                    data: data.to_vec(),
                }))
            }
            Envelope::Ctrl { request, args, .. } => {
                let request = request
                    .ok_or_else(|| CodecError::Malformed("ctrl envelope without request".into()))?;
                Ok(WsMessage::Control(ControlRequest {
                    request,
                    args: args.unwrap_or(serde_json::Value::Null),
                }))
            }
        }
    }
}

fn parse_addr(text: &str) -> CodecResult<EconetAddr> {
    text.parse()
        .map_err(|e: super::AddrParseError| CodecError::Malformed(e.to_string()))
}

/// A `pkt` envelope with its AUN frame unpacked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsPacket {
    src: EconetAddr,
    dst: EconetAddr,
    header: AunHeader,
    data: Vec<u8>,
}

impl WsPacket {
    /// Build the outbound envelope for `packet` using `sequence`
    pub fn from_packet(packet: &EconetPacket, sequence: u32) -> Self {
        let packet_type = if packet.destination().is_broadcast() {
            PacketType::Broadcast
        } else {
            PacketType::Unicast
        };
        Self {
            src: packet.source(),
            dst: packet.destination(),
            header: AunHeader::new(packet_type, packet.port(), packet.control(), sequence),
            data: packet.payload().to_vec(),
        }
    }

    pub fn src(&self) -> EconetAddr {
        self.src
    }

    pub fn dst(&self) -> EconetAddr {
        self.dst
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::Pkt {
            src: self.src.to_string(),
            dst: self.dst.to_string(),
            payload: BASE64.encode(self.header.encode(&self.data)),
        }
    }

    pub fn encode(&self) -> CodecResult<String> {
        self.to_envelope().to_json()
    }

    /// Wrap the acknowledgement into a `pkt` envelope addressed back to the sender
    pub fn build_ack_envelope(&self, ctx: &FrameContext) -> CodecResult<Option<String>> {
        let Some(ack) = self.build_ack(ctx) else {
            return Ok(None);
        };
        let envelope = Envelope::Pkt {
            src: ctx.bridge.to_string(),
            dst: self.src.to_string(),
            payload: BASE64.encode(ack),
        };
        envelope.to_json().map(Some)
    }
}

impl Encapsulation for WsPacket {
    fn kind(&self) -> EncapsulationKind {
        EncapsulationKind::WebSocket
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

    fn build_econet_packet(&self, _ctx: &FrameContext) -> CodecResult<EconetPacket> {
        Ok(EconetPacket::new(
            self.src,
            self.dst,
            self.header.port,
            self.header.control,
            self.data.clone(),
        ))
    }

    fn build_ack(&self, ctx: &FrameContext) -> Option<Vec<u8>> {
        self.header.ack(ctx)
    }
}

impl fmt::Display for WsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_frame(f, &self.header, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FrameContext {
        FrameContext::new(EconetAddr::new(1, 254), 2, 0)
    }

    fn pkt_json(payload: &[u8]) -> String {
        format!(
            r#"{{"type":"pkt","src":"10.3","dst":"1.254","payload":"{}"}}"#,
            BASE64.encode(payload)
        )
    }

    #[test]
    fn test_decode_packet() {
        let text = pkt_json(&[0x02, 0x99, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x41]);
        let WsMessage::Packet(pkt) = WsMessage::decode(&text).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(pkt.src(), EconetAddr::new(10, 3));
        assert_eq!(pkt.dst(), EconetAddr::new(1, 254));
        assert_eq!(pkt.packet_type(), PacketType::Unicast);
        assert_eq!(pkt.sequence(), 8);
        assert_eq!(pkt.data(), &[0x41]);

        let packet = pkt.build_econet_packet(&ctx()).unwrap();
        assert_eq!(packet.source(), EconetAddr::new(10, 3));
        assert_eq!(packet.port(), 0x99);
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let text = pkt_json(&[0x02, 0x99]);
        assert!(matches!(
            WsMessage::decode(&text),
            Err(CodecError::TooShort(2, 8))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        assert!(matches!(
            WsMessage::decode("{not json"),
            Err(CodecError::Json(_))
        ));
        assert!(WsMessage::decode(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_decode_control() {
        let msg = WsMessage::decode(r#"{"type":"ctrl","request":"allocate","args":{}}"#).unwrap();
        match msg {
            WsMessage::Control(req) => assert_eq!(req.request, ALLOCATE_REQUEST),
            _ => panic!("expected control"),
        }
    }

    #[test]
    fn test_ack_envelope_swaps_addresses() {
        let text = pkt_json(&[0x02, 0x99, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00]);
        let WsMessage::Packet(pkt) = WsMessage::decode(&text).unwrap() else {
            panic!("expected packet");
        };
        let ack = pkt.build_ack_envelope(&ctx()).unwrap().unwrap();

        let envelope: Envelope = serde_json::from_str(&ack).unwrap();
        let Envelope::Pkt { src, dst, payload } = envelope else {
            panic!("expected pkt envelope");
        };
        assert_eq!(src, "1.254");
        assert_eq!(dst, "10.3");
        let raw = BASE64.decode(payload).unwrap();
        assert_eq!(raw, vec![3, 0, 0, 0, 0x0C, 0, 0, 0]);
    }

    #[test]
    fn test_ctrl_response_shape() {
        let json = Envelope::ctrl_response("200.1").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ctrl");
        assert_eq!(value["response"], "200.1");
        assert!(value.get("error").is_none());
    }
}
