//! Address resolution - maps transport addresses onto Econet addresses
//!
//! Provides:
//! - AUN map: IP host/port/subnet rules to network.station
//! - Piconet map: networks reachable through the serial bridge
//! - WebSocket map: dynamic addresses for browser connections

mod aun;
mod piconet;
mod websocket;

pub use aun::*;
pub use piconet::*;
pub use websocket::*;

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::EconetAddr;

/// Address resolution errors
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("No route to {0}")]
    Unresolved(EconetAddr),

    #[error("No dynamic addresses available")]
    NoCapacity,
}

pub type AddressResult<T> = Result<T, AddressError>;

/// Significant lines of a map file, numbered from 1, with comments stripped
pub(crate) fn config_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines().enumerate().filter_map(|(idx, line)| {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let line = line.trim();
        (!line.is_empty()).then_some((idx + 1, line))
    })
}

/// Read a map file
pub(crate) fn read_map_file(path: &Path) -> AddressResult<String> {
    std::fs::read_to_string(path).map_err(|source| AddressError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a list of network numbers, one per line
pub fn parse_network_list(text: &str) -> AddressResult<Vec<u8>> {
    config_lines(text)
        .map(|(line, value)| {
            value.parse::<u8>().map_err(|_| AddressError::Parse {
                line,
                message: format!("invalid network number {value:?}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_list() {
        let text = "# reachable networks\n\n1\n  7  # lab\n200\n";
        assert_eq!(parse_network_list(text).unwrap(), vec![1, 7, 200]);
    }

    #[test]
    fn test_network_list_error_line() {
        let err = parse_network_list("1\n\n300\n").unwrap_err();
        match err {
            AddressError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }
}
