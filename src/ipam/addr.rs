//! Overlay address arithmetic

use crate::error::{Error, Result};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Address at `offset` from the network base of `cidr`.
///
/// The network and broadcast addresses are never handed out.
pub fn offset_address(cidr: &Ipv4Network, offset: u32) -> Result<Ipv4Addr> {
    let usable = match cidr.prefix() {
        32 => 1,
        31 => 2,
        _ => cidr.size().saturating_sub(1),
    };

    if offset == 0 && cidr.prefix() < 31 || offset >= usable {
        return Err(Error::PoolExhausted {
            pool: cidr.to_string(),
        });
    }

    let base = u32::from(cidr.network());
    Ok(Ipv4Addr::from(base + offset))
}

/// Offset of `addr` inside `cidr`, if it belongs there
pub fn address_offset(cidr: &Ipv4Network, addr: Ipv4Addr) -> Option<u32> {
    cidr.contains(addr)
        .then(|| u32::from(addr) - u32::from(cidr.network()))
}

/// Parse a CIDR given on the command line or in a record
pub fn parse_cidr(value: &str) -> Result<Ipv4Network> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid CIDR {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_offset_address() {
        let cidr = parse_cidr("10.80.0.0/16").unwrap();
        assert_eq!(offset_address(&cidr, 7).unwrap(), Ipv4Addr::new(10, 80, 0, 7));
        assert_eq!(offset_address(&cidr, 256).unwrap(), Ipv4Addr::new(10, 80, 1, 0));
        assert_eq!(
            offset_address(&cidr, 65534).unwrap(),
            Ipv4Addr::new(10, 80, 255, 254)
        );
    }

    #[test]
    fn test_offset_address_rejects_reserved_slots() {
        let cidr = parse_cidr("10.80.0.0/24").unwrap();
        assert_matches!(offset_address(&cidr, 0), Err(Error::PoolExhausted { .. }));
        assert_matches!(offset_address(&cidr, 255), Err(Error::PoolExhausted { .. }));
        assert_matches!(offset_address(&cidr, 4000), Err(Error::PoolExhausted { .. }));
    }

    #[test]
    fn test_address_offset_roundtrip() {
        let cidr = parse_cidr("10.90.0.0/16").unwrap();
        assert_eq!(address_offset(&cidr, Ipv4Addr::new(10, 90, 1, 2)), Some(258));
        assert_eq!(address_offset(&cidr, Ipv4Addr::new(10, 91, 0, 1)), None);
    }

    #[test]
    fn test_parse_cidr_error() {
        assert_matches!(parse_cidr("10.80.0.0/40"), Err(Error::Configuration(_)));
    }
}
