//! Piconet serial bridge handler
//!
//! The Piconet speaks newline-delimited ASCII. Commands go out through a
//! writer task fed by a channel; every line read comes back to the bridge
//! loop as an event and is parsed there.

use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, ConnectionResult};
use super::BridgeEvent;
use crate::protocol::{CodecError, CodecResult, EconetPacket, PiconetFrame};

/// Commands queued for the serial port before sends are refused
const COMMAND_QUEUE: usize = 64;

/// Outcome codes reported by `TX_RESULT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    Ok,
    Uninitialised,
    Overflow,
    Underrun,
    LineJammed,
    NoScoutAck,
    NoDataAck,
    Timeout,
    Misc,
    Unexpected,
}

impl TxResult {
    pub fn is_ok(self) -> bool {
        self == TxResult::Ok
    }
}

impl FromStr for TxResult {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "OK" => TxResult::Ok,
            "UNINITIALISED" => TxResult::Uninitialised,
            "OVERFLOW" => TxResult::Overflow,
            "UNDERRUN" => TxResult::Underrun,
            "LINE_JAMMED" => TxResult::LineJammed,
            "NO_SCOUT_ACK" => TxResult::NoScoutAck,
            "NO_DATA_ACK" => TxResult::NoDataAck,
            "TIMEOUT" => TxResult::Timeout,
            "MISC" => TxResult::Misc,
            "UNEXPECTED" => TxResult::Unexpected,
            other => return Err(CodecError::Malformed(format!("unknown TX_RESULT {other:?}"))),
        })
    }
}

impl fmt::Display for TxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            TxResult::Ok => "OK",
            TxResult::Uninitialised => "UNINITIALISED",
            TxResult::Overflow => "OVERFLOW",
            TxResult::Underrun => "UNDERRUN",
            TxResult::LineJammed => "LINE_JAMMED",
            TxResult::NoScoutAck => "NO_SCOUT_ACK",
            TxResult::NoDataAck => "NO_DATA_ACK",
            TxResult::Timeout => "TIMEOUT",
            TxResult::Misc => "MISC",
            TxResult::Unexpected => "UNEXPECTED",
        };
        f.write_str(code)
    }
}

/// A line received from the Piconet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PiconetLine {
    Status(String),
    Error(String),
    Monitor(String),
    TxResult(TxResult),
    Packet(PiconetFrame),
    Unknown(String),
}

impl PiconetLine {
    pub fn parse(line: &str) -> CodecResult<Self> {
        let line = line.trim();
        let (kind, rest) = match line.split_once(char::is_whitespace) {
            Some((kind, rest)) => (kind, rest.trim()),
            None => (line, ""),
        };

        Ok(match kind {
            "STATUS" => PiconetLine::Status(rest.to_string()),
            "ERROR" => PiconetLine::Error(rest.to_string()),
            "MONITOR" => PiconetLine::Monitor(rest.to_string()),
            "TX_RESULT" => PiconetLine::TxResult(rest.parse()?),
            "RX_BROADCAST" | "RX_IMMEDIATE" | "RX_TRANSMIT" => {
                PiconetLine::Packet(PiconetFrame::decode(line)?)
            }
            _ => PiconetLine::Unknown(line.to_string()),
        })
    }
}

/// Command lines understood by the Piconet
pub mod commands {
    pub const STATUS: &str = "STATUS";
    pub const SET_MODE_LISTEN: &str = "SET_MODE LISTEN";
    pub const STOP: &str = "STOP";

    pub fn set_station(station: u8) -> String {
        format!("SET_STATION {}", station)
    }
}

/// Handle for writing to the Piconet
#[derive(Clone, Debug)]
pub struct SerialHandle {
    handle: ConnectionHandle,
    local_network: u8,
}

impl SerialHandle {
    pub fn new(handle: ConnectionHandle, local_network: u8) -> Self {
        Self {
            handle,
            local_network,
        }
    }

    pub fn send_line(&self, line: impl Into<String>) -> ConnectionResult<()> {
        self.handle.send(line.into())
    }

    /// Queue the `TX`/`BCAST` command carrying `packet`
    pub fn transmit(&self, packet: &EconetPacket) -> ConnectionResult<()> {
        self.send_line(PiconetFrame::encode_command(packet, self.local_network))
    }

    /// Query status, claim our station and start listening
    pub fn initialise(&self, station: u8) -> ConnectionResult<()> {
        self.send_line(commands::STATUS)?;
        self.send_line(commands::set_station(station))?;
        self.send_line(commands::SET_MODE_LISTEN)
    }

    pub fn stop(&self) -> ConnectionResult<()> {
        self.send_line(commands::STOP)
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}

/// Open the serial device and start its reader and writer tasks
pub fn open_piconet(
    device: &str,
    baud_rate: u32,
    local_network: u8,
    event_tx: mpsc::Sender<BridgeEvent>,
) -> ConnectionResult<SerialHandle> {
    let port = tokio_serial::new(device, baud_rate).open_native_async()?;
    info!("Opened Piconet on {} at {} baud", device, baud_rate);

    let (reader, mut writer) = tokio::io::split(port);
    let (line_tx, mut line_rx) = mpsc::channel::<String>(COMMAND_QUEUE);
    let handle = ConnectionHandle::new(line_tx);

    let writer_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            debug!("Piconet <- {}", line);
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if let Err(e) = writer.write_all(&bytes).await {
                warn!("Piconet write failed: {}", e);
                break;
            }
        }
        writer_handle.mark_disconnected();
    });

    let reader_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if event_tx.send(BridgeEvent::SerialLine(line)).await.is_err() {
                        break "Bridge stopped".to_string();
                    }
                }
                Ok(None) => break "Device closed".to_string(),
                Err(e) => break format!("Read error: {}", e),
            }
        };
        reader_handle.mark_disconnected();
        let _ = event_tx.send(BridgeEvent::SerialClosed { reason }).await;
    });

    Ok(SerialHandle::new(handle, local_network))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EconetAddr, Encapsulation, PacketType};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(
            PiconetLine::parse("STATUS 1 2 3 0").unwrap(),
            PiconetLine::Status("1 2 3 0".to_string())
        );
        assert_eq!(
            PiconetLine::parse("ERROR bad command\r").unwrap(),
            PiconetLine::Error("bad command".to_string())
        );
        assert_eq!(
            PiconetLine::parse("MONITOR").unwrap(),
            PiconetLine::Monitor(String::new())
        );
        assert_eq!(
            PiconetLine::parse("HELLO").unwrap(),
            PiconetLine::Unknown("HELLO".to_string())
        );
    }

    #[test]
    fn test_parse_tx_results() {
        assert_eq!(
            PiconetLine::parse("TX_RESULT OK").unwrap(),
            PiconetLine::TxResult(TxResult::Ok)
        );
        assert_eq!(
            PiconetLine::parse("TX_RESULT NO_SCOUT_ACK").unwrap(),
            PiconetLine::TxResult(TxResult::NoScoutAck)
        );
        assert!(PiconetLine::parse("TX_RESULT MAYBE").is_err());
        assert_eq!(TxResult::LineJammed.to_string(), "LINE_JAMMED");
        assert!(!TxResult::Timeout.is_ok());
    }

    #[test]
    fn test_parse_packet_line() {
        let scout = BASE64.encode([254u8, 0, 9, 0, 0x80, 0x99]);
        let data = BASE64.encode([254u8, 0, 9, 0, 0x41, 0, 0]);
        let line = format!("RX_TRANSMIT {scout} {data}");

        match PiconetLine::parse(&line).unwrap() {
            PiconetLine::Packet(frame) => {
                assert_eq!(frame.packet_type(), PacketType::Unicast);
                assert_eq!(frame.data(), &[0x41]);
            }
            other => panic!("unexpected line: {:?}", other),
        }
    }

    #[test]
    fn test_handle_commands() {
        let (tx, mut rx) = mpsc::channel(8);
        let serial = SerialHandle::new(ConnectionHandle::new(tx), 5);

        serial.initialise(254).unwrap();
        serial
            .transmit(&EconetPacket::new(
                EconetAddr::new(5, 254),
                EconetAddr::new(5, 3),
                0x99,
                0x80,
                vec![0xFF],
            ))
            .unwrap();
        serial.stop().unwrap();

        let lines: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            lines,
            vec![
                "STATUS".to_string(),
                "SET_STATION 254".to_string(),
                "SET_MODE LISTEN".to_string(),
                format!("TX 3 0 128 153 {}", BASE64.encode([0xFFu8])),
                "STOP".to_string(),
            ]
        );
    }
}
