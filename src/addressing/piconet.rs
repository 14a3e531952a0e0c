//! Piconet network map
//!
//! The set of Econet networks reached through the local serial bridge.

use std::collections::BTreeSet;
use std::path::Path;

use super::{parse_network_list, read_map_file, AddressResult};

#[derive(Debug, Clone, Default)]
pub struct PiconetMap {
    networks: BTreeSet<u8>,
}

impl PiconetMap {
    pub fn new(networks: impl IntoIterator<Item = u8>) -> Self {
        Self {
            networks: networks.into_iter().collect(),
        }
    }

    pub fn parse(text: &str) -> AddressResult<Self> {
        Ok(Self::new(parse_network_list(text)?))
    }

    pub fn load(path: &Path) -> AddressResult<Self> {
        Self::parse(&read_map_file(path)?)
    }

    pub fn add_network(&mut self, network: u8) {
        self.networks.insert(network);
    }

    pub fn network_known(&self, network: u8) -> bool {
        self.networks.contains(&network)
    }

    pub fn networks(&self) -> impl Iterator<Item = u8> + '_ {
        self.networks.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_network_known() {
        let map = PiconetMap::parse("# serial side\n5\n6\n").unwrap();
        assert!(map.network_known(5));
        assert!(map.network_known(6));
        assert!(!map.network_known(7));
        assert_eq!(map.networks().collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "12").unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "13").unwrap();

        let map = PiconetMap::load(file.path()).unwrap();
        assert!(map.network_known(12));
        assert!(map.network_known(13));
    }

    #[test]
    fn test_missing_file() {
        assert!(PiconetMap::load(Path::new("/nonexistent/piconet.map")).is_err());
    }
}
