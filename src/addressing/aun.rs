//! AUN address map
//!
//! Rules come from a text file, one per line: `ip[:port][/cidr] network[.station]`.
//! Lookups prefer `host:port` rules, then `host` rules, then the longest
//! matching subnet, where the last octet of the IP becomes the station.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use tracing::warn;

use super::{config_lines, read_map_file, AddressError, AddressResult};
use crate::protocol::EconetAddr;

/// Stride between issued sequence numbers, one retransmission slot apart
pub const SEQUENCE_STRIDE: u32 = 4;

/// A single line of the AUN map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AunRule {
    HostPort {
        ip: Ipv4Addr,
        port: u16,
        addr: EconetAddr,
    },
    Host {
        ip: Ipv4Addr,
        addr: EconetAddr,
    },
    Subnet {
        base: Ipv4Addr,
        prefix: u8,
        network: u8,
    },
}

impl AunRule {
    /// Parse `ip[:port][/cidr] network[.station]`
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let (target, econet) = match (parts.next(), parts.next(), parts.next()) {
            (Some(target), Some(econet), None) => (target, econet),
            _ => return Err(format!("expected `ip[:port][/cidr] network[.station]`, got {line:?}")),
        };

        let (network, station) = match econet.split_once('.') {
            Some((n, s)) => (parse_u8(n)?, Some(parse_u8(s)?)),
            None => (parse_u8(econet)?, None),
        };

        if let Some((ip, prefix)) = target.split_once('/') {
            if station.is_some() {
                return Err(format!("subnet rule {target} takes a network number only"));
            }
            let ip = parse_ip(ip)?;
            let prefix: u8 = prefix
                .parse()
                .ok()
                .filter(|p| *p <= 32)
                .ok_or_else(|| format!("invalid prefix length {prefix:?}"))?;
            let base = Ipv4Addr::from(u32::from(ip) & mask(prefix));
            return Ok(AunRule::Subnet {
                base,
                prefix,
                network,
            });
        }

        let (ip, port) = match target.split_once(':') {
            Some((ip, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("invalid UDP port {port:?}"))?;
                (parse_ip(ip)?, Some(port))
            }
            None => (parse_ip(target)?, None),
        };

        let station = station.unwrap_or(ip.octets()[3]);
        let addr = EconetAddr::new(network, station);
        Ok(match port {
            Some(port) => AunRule::HostPort { ip, port, addr },
            None => AunRule::Host { ip, addr },
        })
    }
}

fn parse_u8(text: &str) -> Result<u8, String> {
    text.parse()
        .map_err(|_| format!("{text:?} is not a number between 0 and 255"))
}

fn parse_ip(text: &str) -> Result<Ipv4Addr, String> {
    text.parse()
        .map_err(|_| format!("{text:?} is not an IPv4 address"))
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Where an Econet address lives on the IP network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AunEndpoint {
    pub ip: Ipv4Addr,
    /// Set when the rule pins a UDP port
    pub port: Option<u16>,
}

impl AunEndpoint {
    pub fn socket_addr(&self, default_port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port.unwrap_or(default_port))
    }
}

impl fmt::Display for AunEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ip, port),
            None => write!(f, "{}", self.ip),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Subnet {
    base: u32,
    prefix: u8,
    network: u8,
}

impl Subnet {
    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == self.base
    }

    /// IP of `station` on this subnet; station 255 is the subnet broadcast
    ///
    /// Other stations keep only the last octet, so on prefixes wider than /24
    /// they land in the lowest /24 of the subnet.
    fn host_ip(&self, station: u8) -> Ipv4Addr {
        if station == crate::protocol::BROADCAST_STATION {
            Ipv4Addr::from(self.base | !mask(self.prefix))
        } else {
            Ipv4Addr::from((self.base & !0xFF) | u32::from(station))
        }
    }
}

/// AUN address map plus the per-source sequence counters
#[derive(Debug, Default)]
pub struct AunMap {
    host_ports: HashMap<(Ipv4Addr, u16), EconetAddr>,
    hosts: HashMap<Ipv4Addr, EconetAddr>,
    /// Reverse bindings; the first rule naming an Econet address keeps it
    addr_host_ports: HashMap<EconetAddr, (Ipv4Addr, u16)>,
    addr_hosts: HashMap<EconetAddr, Ipv4Addr>,
    subnets: Vec<Subnet>,
    counters: HashMap<String, u32>,
}

impl AunMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from the text of a map file
    pub fn parse(text: &str) -> AddressResult<Self> {
        let mut map = Self::new();
        for (line, rule) in config_lines(text) {
            let rule = AunRule::parse(rule)
                .map_err(|message| AddressError::Parse { line, message })?;
            map.add_rule(rule);
        }
        Ok(map)
    }

    pub fn load(path: &Path) -> AddressResult<Self> {
        Self::parse(&read_map_file(path)?)
    }

    pub fn add_rule(&mut self, rule: AunRule) {
        match rule {
            AunRule::HostPort { ip, port, addr } => {
                if let Some(previous) = self.host_ports.insert((ip, port), addr) {
                    if self.addr_host_ports.get(&previous) == Some(&(ip, port)) {
                        self.addr_host_ports.remove(&previous);
                    }
                }
                if let Some((kept_ip, kept_port)) = self.addr_host_ports.get(&addr) {
                    if (*kept_ip, *kept_port) != (ip, port) {
                        warn!(
                            "{}:{} also maps to {}, replies go to {}:{}",
                            ip, port, addr, kept_ip, kept_port
                        );
                    }
                } else {
                    self.addr_host_ports.insert(addr, (ip, port));
                }
            }
            AunRule::Host { ip, addr } => {
                if let Some(previous) = self.hosts.insert(ip, addr) {
                    if self.addr_hosts.get(&previous) == Some(&ip) {
                        self.addr_hosts.remove(&previous);
                    }
                }
                if let Some(kept) = self.addr_hosts.get(&addr) {
                    if *kept != ip {
                        warn!("{} also maps to {}, replies go to {}", ip, addr, kept);
                    }
                } else {
                    self.addr_hosts.insert(addr, ip);
                }
            }
            AunRule::Subnet {
                base,
                prefix,
                network,
            } => self.subnets.push(Subnet {
                base: u32::from(base),
                prefix,
                network,
            }),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.host_ports.len() + self.hosts.len() + self.subnets.len()
    }

    /// Econet address of an IP host, optionally sending from a specific port
    pub fn resolve_host(&self, ip: Ipv4Addr, port: Option<u16>) -> Option<EconetAddr> {
        if let Some(port) = port {
            if let Some(addr) = self.host_ports.get(&(ip, port)) {
                return Some(*addr);
            }
        }

        if let Some(addr) = self.hosts.get(&ip) {
            return Some(*addr);
        }

        self.subnet_for(ip)
            .map(|subnet| EconetAddr::new(subnet.network, ip.octets()[3]))
    }

    /// Longest subnet rule containing `ip`
    fn subnet_for(&self, ip: Ipv4Addr) -> Option<&Subnet> {
        self.subnets
            .iter()
            .filter(|subnet| subnet.contains(ip))
            .max_by_key(|subnet| subnet.prefix)
    }

    /// Econet address of a datagram's sender
    pub fn resolve_socket(&self, from: &SocketAddr) -> Option<EconetAddr> {
        let ip = ipv4_of(from)?;
        self.resolve_host(ip, Some(from.port()))
    }

    /// IP endpoint serving an Econet address
    pub fn resolve_addr(&self, addr: EconetAddr) -> Option<AunEndpoint> {
        if let Some((ip, port)) = self.addr_host_ports.get(&addr) {
            return Some(AunEndpoint {
                ip: *ip,
                port: Some(*port),
            });
        }

        if let Some(ip) = self.addr_hosts.get(&addr) {
            return Some(AunEndpoint { ip: *ip, port: None });
        }

        // Longest prefix first, matching the forward lookup
        let mut subnets: Vec<&Subnet> = self
            .subnets
            .iter()
            .filter(|subnet| subnet.network == addr.network)
            .collect();
        subnets.sort_by_key(|subnet| std::cmp::Reverse(subnet.prefix));

        subnets
            .into_iter()
            .map(|subnet| subnet.host_ip(addr.station))
            .find(|ip| {
                !self.host_claimed(*ip)
                    && self.subnet_for(*ip).map(|s| s.network) == Some(addr.network)
            })
            .map(|ip| AunEndpoint { ip, port: None })
    }

    /// Whether a host or host:port rule already binds `ip`
    fn host_claimed(&self, ip: Ipv4Addr) -> bool {
        self.hosts.contains_key(&ip) || self.host_ports.keys().any(|(host, _)| *host == ip)
    }

    /// Counter key for a source: `ip:port` when a port-specific rule exists, else `ip`
    pub fn source_key(&self, ip: Ipv4Addr, port: u16) -> String {
        if self.host_ports.contains_key(&(ip, port)) {
            format!("{ip}:{port}")
        } else {
            ip.to_string()
        }
    }

    /// Counter key for an endpoint we are about to send to
    pub fn endpoint_key(&self, endpoint: &AunEndpoint) -> String {
        endpoint.to_string()
    }

    /// Advance a source's counter by one stride and return the new value
    pub fn increment_counter(&mut self, key: &str) -> u32 {
        let counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter = counter.wrapping_add(SEQUENCE_STRIDE);
        *counter
    }

    /// Prime a source's counter from an observed sequence number
    pub fn set_counter(&mut self, key: &str, value: u32) {
        self.counters.insert(key.to_string(), value);
    }

    pub fn counter(&self, key: &str) -> Option<u32> {
        self.counters.get(key).copied()
    }
}

/// IPv4 address of a socket, unwrapping IPv4-mapped IPv6
pub fn ipv4_of(addr: &SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}
