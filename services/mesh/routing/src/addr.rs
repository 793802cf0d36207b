//! Hardware addresses and subnet ids

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Number of distinct subnet ids (0..240)
pub const SUBNET_COUNT: u8 = 240;

/// Third octet of the subnet with id 0
pub const SUBNET_OCTET_BASE: u8 = 10;

/// 6-byte hardware (MAC) address of a mesh node
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HwAddr(pub [u8; 6]);

/// Error parsing a hardware address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hardware address: {0}")]
pub struct AddrParseError(pub String);

impl HwAddr {
    /// The all-zero address
    pub const ZERO: HwAddr = HwAddr([0; 6]);

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the all-zero address
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl From<[u8; 6]> for HwAddr {
    fn from(octets: [u8; 6]) -> Self {
        HwAddr(octets)
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for HwAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| AddrParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(AddrParseError(s.to_string()));
        }

        Ok(HwAddr(octets))
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Subnet id (0..240) owned by a mesh node
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetId(u8);

impl SubnetId {
    /// Create a subnet id, rejecting values outside 0..240
    pub fn new(id: u8) -> Option<Self> {
        (id < SUBNET_COUNT).then_some(SubnetId(id))
    }

    /// Derive the subnet id of a node from its hardware address.
    ///
    /// Uncoordinated: two nodes whose last octets agree modulo 240 collide.
    pub fn from_hw_addr(addr: &HwAddr) -> Self {
        SubnetId(addr.0[5] % SUBNET_COUNT)
    }

    /// Subnet id of an address following the 192.168.(10+id).x convention.
    ///
    /// Only the third octet is inspected; it must lie in [10, 250).
    pub fn from_ipv4(ip: Ipv4Addr) -> Option<Self> {
        let third = ip.octets()[2];
        if (SUBNET_OCTET_BASE..SUBNET_OCTET_BASE + SUBNET_COUNT).contains(&third) {
            Some(SubnetId(third - SUBNET_OCTET_BASE))
        } else {
            None
        }
    }

    /// Raw id
    pub fn get(self) -> u8 {
        self.0
    }

    /// Third octet of this subnet's addresses
    pub fn octet(self) -> u8 {
        SUBNET_OCTET_BASE + self.0
    }

    /// Network address, 192.168.(10+id).0
    pub fn network(self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.octet(), 0)
    }

    /// Gateway address served by the owning node, 192.168.(10+id).1
    pub fn gateway(self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.octet(), 1)
    }

    /// Netmask of every node subnet
    pub fn netmask(self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    /// Whether `ip` falls inside this subnet
    pub fn contains(self, ip: Ipv4Addr) -> bool {
        let [a, b, c, _] = ip.octets();
        a == 192 && b == 168 && c == self.octet()
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/24", self.network())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_addr_display_parse() {
        let addr = HwAddr([0x24, 0x6f, 0x28, 0xAB, 0xCD, 0x25]);
        assert_eq!(addr.to_string(), "24:6f:28:ab:cd:25");
        assert_eq!("24:6F:28:AB:CD:25".parse::<HwAddr>().unwrap(), addr);
        assert_eq!("24-6f-28-ab-cd-25".parse::<HwAddr>().unwrap(), addr);

        assert!("24:6f:28:ab:cd".parse::<HwAddr>().is_err());
        assert!("24:6f:28:ab:cd:25:00".parse::<HwAddr>().is_err());
        assert!("zz:6f:28:ab:cd:25".parse::<HwAddr>().is_err());
    }

    #[test]
    fn test_hw_addr_serde() {
        let addr = HwAddr([1, 2, 3, 4, 5, 6]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: HwAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_subnet_from_hw_addr() {
        let addr = HwAddr([0, 0, 0, 0, 0, 37]);
        assert_eq!(SubnetId::from_hw_addr(&addr).get(), 37);

        let addr = HwAddr([0, 0, 0, 0, 0, 245]);
        assert_eq!(SubnetId::from_hw_addr(&addr).get(), 5);

        let addr = HwAddr([0, 0, 0, 0, 0, 239]);
        assert_eq!(SubnetId::from_hw_addr(&addr).get(), 239);
    }

    #[test]
    fn test_subnet_from_ipv4() {
        assert_eq!(
            SubnetId::from_ipv4(Ipv4Addr::new(192, 168, 47, 9)),
            SubnetId::new(37)
        );
        assert_eq!(
            SubnetId::from_ipv4(Ipv4Addr::new(192, 168, 10, 1)),
            SubnetId::new(0)
        );
        assert_eq!(
            SubnetId::from_ipv4(Ipv4Addr::new(192, 168, 249, 1)),
            SubnetId::new(239)
        );
        assert_eq!(SubnetId::from_ipv4(Ipv4Addr::new(192, 168, 9, 1)), None);
        assert_eq!(SubnetId::from_ipv4(Ipv4Addr::new(192, 168, 250, 1)), None);
    }

    #[test]
    fn test_subnet_addresses() {
        let subnet = SubnetId::new(37).unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 47, 0));
        assert_eq!(subnet.gateway(), Ipv4Addr::new(192, 168, 47, 1));
        assert_eq!(subnet.to_string(), "192.168.47.0/24");
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 47, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 48, 200)));
        assert!(SubnetId::new(240).is_none());
    }
}
