//! Subnet arithmetic for network blocks

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::config::BOTTOM_RESERVED;
use crate::error::{PoolError, Result};

/// Addresses derived from a network block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddresses {
    pub netmask: Ipv4Addr,
    /// Second address of the block
    pub gateway: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    /// Third address of the block
    pub vpn_private_ip: Ipv4Addr,
}

/// Block `index` of `network_size` addresses carved out of `range`
pub fn network_block(range: Ipv4Net, index: u32, network_size: u32) -> Result<Ipv4Net> {
    if !network_size.is_power_of_two() {
        return Err(PoolError::InvalidConfig(format!(
            "network_size {} is not a power of two",
            network_size
        )));
    }
    let start = u64::from(index) * u64::from(network_size);
    let range_size = 1u64 << (32 - u32::from(range.prefix_len()));
    if start + u64::from(network_size) > range_size {
        return Err(PoolError::InvalidConfig(format!(
            "network index {} falls outside {}",
            index, range
        )));
    }

    let base = u64::from(u32::from(range.network())) + start;
    let base = u32::try_from(base)
        .map_err(|_| PoolError::InvalidConfig(format!("network index {} overflows", index)))?;
    let prefix = u8::try_from(32 - network_size.trailing_zeros())
        .map_err(|_| PoolError::InvalidConfig(format!("network_size {} has no prefix", network_size)))?;
    Ipv4Net::new(Ipv4Addr::from(base), prefix)
        .map_err(|e| PoolError::InvalidConfig(format!("network index {}: {}", index, e)))
}

/// Netmask, gateway, broadcast and VPN private address of `block`
pub fn block_addresses(block: Ipv4Net) -> BlockAddresses {
    let network = u32::from(block.network());
    BlockAddresses {
        netmask: block.netmask(),
        gateway: Ipv4Addr::from(network.saturating_add(1)),
        broadcast: block.broadcast(),
        vpn_private_ip: Ipv4Addr::from(network.saturating_add(2)),
    }
}

/// Every address of `block`, network and broadcast included
pub fn addresses(block: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    (u32::from(block.network())..=u32::from(block.broadcast())).map(Ipv4Addr::from)
}

/// Whether position `i` of a block of `total` addresses is never allocable.
///
/// The bottom three (network, gateway, VPN) and the top `1 + vpn_clients`
/// (broadcast plus the VPN client range) are reserved.
pub fn is_reserved(i: u64, total: u64, vpn_clients: u32) -> bool {
    i < u64::from(BOTTOM_RESERVED) || i >= total.saturating_sub(1 + u64::from(vpn_clients))
}

/// Parse an IPv4 address, mapping failures to [`PoolError::InvalidAddress`]
pub fn parse_address(value: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| PoolError::InvalidAddress(value.to_string()))
}

/// Parse an IPv4 CIDR, mapping failures to [`PoolError::InvalidAddress`]
pub fn parse_cidr(value: &str) -> Result<Ipv4Net> {
    value
        .trim()
        .parse()
        .map_err(|_| PoolError::InvalidAddress(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> Ipv4Net {
        "10.0.0.0/8".parse().unwrap()
    }

    #[test]
    fn test_blocks_are_contiguous() {
        assert_eq!(
            network_block(range(), 0, 256).unwrap().to_string(),
            "10.0.0.0/24"
        );
        assert_eq!(
            network_block(range(), 1, 256).unwrap().to_string(),
            "10.0.1.0/24"
        );
        assert_eq!(
            network_block(range(), 3, 64).unwrap().to_string(),
            "10.0.0.192/26"
        );
    }

    #[test]
    fn test_block_outside_range_is_rejected() {
        let small: Ipv4Net = "192.168.0.0/24".parse().unwrap();
        assert!(network_block(small, 0, 128).is_ok());
        assert!(network_block(small, 1, 128).is_ok());
        assert!(matches!(
            network_block(small, 2, 128),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_block_prefix_extremes() {
        assert_eq!(
            network_block(range(), 5, 1).unwrap().to_string(),
            "10.0.0.5/32"
        );
        let everything: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        assert_eq!(
            network_block(everything, 1, 1 << 31).unwrap().to_string(),
            "128.0.0.0/1"
        );
    }

    #[test]
    fn test_block_addresses() {
        let block: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let derived = block_addresses(block);
        assert_eq!(derived.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(derived.gateway, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(derived.broadcast, Ipv4Addr::new(10, 0, 1, 255));
        assert_eq!(derived.vpn_private_ip, Ipv4Addr::new(10, 0, 1, 2));
    }

    #[test]
    fn test_addresses_cover_whole_block() {
        let block: Ipv4Net = "10.0.0.0/29".parse().unwrap();
        let all: Vec<_> = addresses(block).collect();
        assert_eq!(all.len(), 8);
        assert_eq!(all[0], Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(all[7], Ipv4Addr::new(10, 0, 0, 7));
    }

    #[test]
    fn test_reservation_rule() {
        // 16 addresses, 2 VPN clients: 0..3 and 13..16 are reserved
        let reserved: Vec<u64> = (0..16).filter(|&i| is_reserved(i, 16, 2)).collect();
        assert_eq!(reserved, vec![0, 1, 2, 13, 14, 15]);
    }

    #[test]
    fn test_parse_errors_are_invalid_address() {
        assert!(matches!(
            parse_address("10.0.0.256"),
            Err(PoolError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_cidr("10.0.0.0/33"),
            Err(PoolError::InvalidAddress(_))
        ));
        assert_eq!(parse_address(" 10.0.0.1 ").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }
}
