//! WebSocket dynamic address pool
//!
//! Browser clients have no fixed address. On request each connection is
//! given the first free station on the first configured dynamic network with
//! room, and the station is released when the connection closes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::{parse_network_list, read_map_file, AddressError, AddressResult, SEQUENCE_STRIDE};
use crate::network::ConnectionId;
use crate::protocol::EconetAddr;

/// Lowest station handed out dynamically
pub const FIRST_DYNAMIC_STATION: u8 = 1;

/// Highest station handed out dynamically (254 is conventionally the file server)
pub const LAST_DYNAMIC_STATION: u8 = 253;

const STATIONS_PER_NETWORK: usize = (LAST_DYNAMIC_STATION - FIRST_DYNAMIC_STATION + 1) as usize;

#[derive(Debug, Clone)]
struct DynamicNetwork {
    network: u8,
    stations: BTreeMap<u8, ConnectionId>,
}

impl DynamicNetwork {
    fn has_capacity(&self) -> bool {
        self.stations.len() < STATIONS_PER_NETWORK
    }

    fn first_free_station(&self) -> Option<u8> {
        (FIRST_DYNAMIC_STATION..=LAST_DYNAMIC_STATION).find(|s| !self.stations.contains_key(s))
    }
}

#[derive(Debug, Clone, Default)]
pub struct WsMap {
    networks: Vec<DynamicNetwork>,
    reverse: HashMap<ConnectionId, EconetAddr>,
    sequences: HashMap<ConnectionId, u32>,
}

impl WsMap {
    /// Pool over `networks`, searched in the given order
    pub fn new(networks: impl IntoIterator<Item = u8>) -> Self {
        let mut map = Self::default();
        for network in networks {
            if !map.networks.iter().any(|n| n.network == network) {
                map.networks.push(DynamicNetwork {
                    network,
                    stations: BTreeMap::new(),
                });
            }
        }
        map
    }

    pub fn parse(text: &str) -> AddressResult<Self> {
        Ok(Self::new(parse_network_list(text)?))
    }

    pub fn load(path: &Path) -> AddressResult<Self> {
        Self::parse(&read_map_file(path)?)
    }

    pub fn networks(&self) -> impl Iterator<Item = u8> + '_ {
        self.networks.iter().map(|n| n.network)
    }

    /// Give `conn` an address; a connection that already holds one keeps it
    pub fn allocate(&mut self, conn: ConnectionId) -> AddressResult<EconetAddr> {
        if let Some(addr) = self.reverse.get(&conn) {
            return Ok(*addr);
        }

        for pool in self.networks.iter_mut().filter(|n| n.has_capacity()) {
            if let Some(station) = pool.first_free_station() {
                pool.stations.insert(station, conn);
                let addr = EconetAddr::new(pool.network, station);
                self.reverse.insert(conn, addr);
                return Ok(addr);
            }
        }

        Err(AddressError::NoCapacity)
    }

    /// Release whatever `conn` holds; false if it held nothing
    pub fn free(&mut self, conn: ConnectionId) -> bool {
        self.sequences.remove(&conn);
        let Some(addr) = self.reverse.remove(&conn) else {
            return false;
        };
        if let Some(pool) = self.networks.iter_mut().find(|n| n.network == addr.network) {
            pool.stations.remove(&addr.station);
        }
        true
    }

    pub fn resolve_addr(&self, addr: EconetAddr) -> Option<ConnectionId> {
        self.networks
            .iter()
            .find(|n| n.network == addr.network)
            .and_then(|n| n.stations.get(&addr.station))
            .copied()
    }

    pub fn resolve_connection(&self, conn: ConnectionId) -> Option<EconetAddr> {
        self.reverse.get(&conn).copied()
    }

    /// Sequence number for the next packet sent to `conn`
    pub fn next_sequence(&mut self, conn: ConnectionId) -> u32 {
        let seq = self.sequences.entry(conn).or_insert(0);
        *seq = seq.wrapping_add(SEQUENCE_STRIDE);
        *seq
    }

    pub fn allocated(&self) -> usize {
        self.reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_allocation() {
        let mut map = WsMap::parse("200\n201\n").unwrap();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert_eq!(map.allocate(a).unwrap(), EconetAddr::new(200, 1));
        assert_eq!(map.allocate(b).unwrap(), EconetAddr::new(200, 2));
        assert_eq!(map.resolve_addr(EconetAddr::new(200, 2)), Some(b));
        assert_eq!(map.resolve_connection(a), Some(EconetAddr::new(200, 1)));
    }

    #[test]
    fn test_reallocation_is_idempotent() {
        let mut map = WsMap::new([200]);
        let a = ConnectionId::new();
        let first = map.allocate(a).unwrap();
        assert_eq!(map.allocate(a).unwrap(), first);
        assert_eq!(map.allocated(), 1);
    }

    #[test]
    fn test_free_then_reuse() {
        let mut map = WsMap::new([200]);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let c = ConnectionId::new();

        map.allocate(a).unwrap();
        map.allocate(b).unwrap();
        assert!(map.free(a));
        assert!(!map.free(a));
        assert_eq!(map.resolve_addr(EconetAddr::new(200, 1)), None);

        assert_eq!(map.allocate(c).unwrap(), EconetAddr::new(200, 1));
    }

    #[test]
    fn test_spills_to_next_network_then_exhausts() {
        let mut map = WsMap::new([200, 201]);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..(2 * STATIONS_PER_NETWORK) {
            let addr = map.allocate(ConnectionId::new()).unwrap();
            assert!(seen.insert(addr), "station {addr} handed out twice");
            assert!((FIRST_DYNAMIC_STATION..=LAST_DYNAMIC_STATION).contains(&addr.station));
        }
        assert!(seen.contains(&EconetAddr::new(201, 253)));

        assert!(matches!(
            map.allocate(ConnectionId::new()),
            Err(AddressError::NoCapacity)
        ));
    }

    #[test]
    fn test_no_networks_configured() {
        let mut map = WsMap::new(Vec::<u8>::new());
        assert!(matches!(
            map.allocate(ConnectionId::new()),
            Err(AddressError::NoCapacity)
        ));
    }

    #[test]
    fn test_sequence_per_connection() {
        let mut map = WsMap::new([200]);
        let a = ConnectionId::new();
        assert_eq!(map.next_sequence(a), 4);
        assert_eq!(map.next_sequence(a), 8);
        map.free(a);
        assert_eq!(map.next_sequence(a), 4);
    }
}
