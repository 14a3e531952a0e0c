//! Econet Bridge - carries Acorn Econet traffic between transports
//!
//! Stations reach the bridge over AUN (Econet over UDP), over WebSocket JSON
//! from browser emulators, or through a Piconet serial interface on a real
//! Econet wire. Every packet is decoded into one [`protocol::EconetPacket`],
//! handed to in-process services, and replies are routed back out by
//! destination address.

pub mod addressing;
pub mod config;
pub mod network;
pub mod protocol;
pub mod security;
pub mod service;
