//! # Address
//!
//! IPv4 endpoint identity used throughout the transport.
//!
//! An [`Address`] is a 32-bit IPv4 address plus a 16-bit port. It is an immutable
//! `Copy` value, compared by raw bits and totally ordered so it can key a
//! `BTreeMap`. The all-zero address means "unset".

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::NetError;

/// IPv4 address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address {
    ip: u32,
    port: u16,
}

impl Address {
    /// Loopback IP in host order (127.0.0.1)
    pub const LOOPBACK_IP: u32 = 0x7F00_0001;

    /// Build an address from four octets and a port
    pub const fn new(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    /// Build an address from a raw host-order IPv4 value and a port
    pub const fn from_raw(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    /// Loopback address on the given port
    pub const fn loopback(port: u16) -> Self {
        Self::from_raw(Self::LOOPBACK_IP, port)
    }

    /// Broadcast address (255.255.255.255) on the given port
    pub const fn broadcast(port: u16) -> Self {
        Self::from_raw(u32::MAX, port)
    }

    /// Raw host-order IPv4 value
    pub const fn ip(&self) -> u32 {
        self.ip
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The four octets of the IP, most significant first
    pub const fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    /// True when the IP part is zero (an unset slot)
    pub const fn is_unset(&self) -> bool {
        self.ip == 0
    }

    pub const fn is_loopback(&self) -> bool {
        self.ip == Self::LOOPBACK_IP
    }

    /// Same IP, different port
    pub const fn with_port(&self, port: u16) -> Self {
        Self { ip: self.ip, port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{a}.{b}.{c}.{d}:{}", self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::from_raw(u32::from(*addr.ip()), addr.port())
    }
}

impl From<Address> for SocketAddrV4 {
    fn from(addr: Address) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(addr.ip), addr.port)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::V4(addr.into())
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = NetError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Ok(Self::from_raw(u32::from(ip), v6.port())),
                None => Err(NetError::AddressParse(v6.to_string())),
            },
        }
    }
}

impl FromStr for Address {
    type Err = NetError;

    /// Parse `"a.b.c.d:port"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddrV4>()
            .map(Address::from)
            .map_err(|_| NetError::AddressParse(s.to_string()))
    }
}
