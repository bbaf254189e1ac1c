//! Ring positions.
//!
//! Every key and every node lives at a 128-bit position on the ring: the
//! MD5 digest of its name read as a big-endian integer. Node names are
//! `"ip:client_port"`.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::ClusterError;

/// A point on the 128-bit hash ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position(pub u128);

impl Position {
    /// Returns the position of a key or node name.
    pub fn of(key: &str) -> Self {
        hash_key(key)
    }
}

/// Hashes `key` onto the ring.
pub fn hash_key(key: &str) -> Position {
    let digest = Md5::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    Position(u128::from_be_bytes(bytes))
}

/// Returns the ring name of a node: `"ip:client_port"`.
pub fn node_key(ip: &str, client_port: u16) -> String {
    format!("{ip}:{client_port}")
}

/// Half-open circular interval test for `[start, end)`.
///
/// `start == end` covers the whole ring (single-node case). When
/// `start > end` the interval wraps past zero.
pub fn in_range(pos: Position, start: Position, end: Position) -> bool {
    if start == end {
        true
    } else if start < end {
        start <= pos && pos < end
    } else {
        pos >= start || pos < end
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for Position {
    type Err = ClusterError;

    /// Accepts 1 to 32 hex digits, so peers that drop leading zeros
    /// still parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 32 {
            return Err(ClusterError::protocol(format!("invalid ring position '{s}'")));
        }
        u128::from_str_radix(s, 16)
            .map(Position)
            .map_err(|_| ClusterError::protocol(format!("invalid ring position '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_empty_string() {
        assert_eq!(
            hash_key("").to_string(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn display_is_fixed_width() {
        assert_eq!(Position(0x05).to_string().len(), 32);
        assert_eq!(
            Position(0x05).to_string(),
            "00000000000000000000000000000005"
        );
    }

    #[test]
    fn parse_accepts_short_and_full_forms() {
        assert_eq!("5".parse::<Position>().unwrap(), Position(5));
        let full = hash_key("127.0.0.1:5000");
        assert_eq!(full.to_string().parse::<Position>().unwrap(), full);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Position>().is_err());
        assert!("xyz".parse::<Position>().is_err());
        assert!("1".repeat(33).parse::<Position>().is_err());
    }

    #[test]
    fn range_normal() {
        let (s, e) = (Position(2), Position(8));
        assert!(in_range(Position(2), s, e));
        assert!(in_range(Position(7), s, e));
        assert!(!in_range(Position(8), s, e));
        assert!(!in_range(Position(1), s, e));
    }

    #[test]
    fn range_wraps() {
        let (s, e) = (Position(8), Position(2));
        assert!(in_range(Position(9), s, e));
        assert!(in_range(Position(u128::MAX), s, e));
        assert!(in_range(Position(0), s, e));
        assert!(!in_range(Position(2), s, e));
        assert!(!in_range(Position(5), s, e));
    }

    #[test]
    fn equal_bounds_cover_everything() {
        let p = Position(42);
        assert!(in_range(Position(0), p, p));
        assert!(in_range(Position(u128::MAX), p, p));
    }
}
