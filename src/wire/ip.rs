//! The address model shared by both internet protocol versions.
//!
//! A scanned connection is identified by a four-tuple of two addresses and
//! two ports. Both sides of a connection are always the same version, but a
//! connection table holds v4 and v6 entries side by side, so addresses are
//! carried as a tagged union rather than a generic parameter.
use core::fmt;

/// An IPv4 address.
#[derive(Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Ipv4Address(pub [u8; 4]);

/// An IPv6 address.
#[derive(Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Ipv6Address(pub [u8; 16]);

/// An internetworking address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Address {
    /// An unspecified address.
    ///
    /// May be used as a placeholder for storage where the address is not
    /// assigned yet, and doubles as the sentinel written into released
    /// connection records.
    Unspecified,

    /// An IPv4 address.
    Ipv4(Ipv4Address),

    /// An IPv6 address.
    Ipv6(Ipv6Address),
}

/// Protocol number of TCP inside an IP datagram.
pub const PROTOCOL_TCP: u8 = 0x06;

impl Ipv4Address {
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Ipv4Address {
        Ipv4Address([a0, a1, a2, a3])
    }

    pub fn from_bytes(data: &[u8]) -> Ipv4Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Ipv4Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The address as a host-order integer, for hashing and range stepping.
    pub fn to_network_integer(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_network_integer(value: u32) -> Ipv4Address {
        Ipv4Address(value.to_be_bytes())
    }
}

impl Ipv6Address {
    pub const fn new(bytes: [u8; 16]) -> Ipv6Address {
        Ipv6Address(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Ipv6Address {
        let mut bytes = [0; 16];
        bytes.copy_from_slice(data);
        Ipv6Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The address as a 128-bit integer, for range stepping and comparison.
    pub fn to_u128(self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    pub fn from_u128(value: u128) -> Ipv6Address {
        Ipv6Address(value.to_be_bytes())
    }
}

impl Address {
    /// Create an address wrapping an IPv4 address with the given octets.
    pub const fn v4(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address::Ipv4(Ipv4Address::new(a0, a1, a2, a3))
    }

    /// Query whether this is an IPv6 address.
    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    /// Query whether the address is assigned at all.
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Address::Unspecified)
    }

    /// Return an address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Address::Unspecified => &[],
            Address::Ipv4(addr) => addr.as_bytes(),
            Address::Ipv6(addr) => addr.as_bytes(),
        }
    }
}

impl Default for Address {
    fn default() -> Address {
        Address::Unspecified
    }
}

impl From<Ipv4Address> for Address {
    fn from(addr: Ipv4Address) -> Address {
        Address::Ipv4(addr)
    }
}

impl From<Ipv6Address> for Address {
    fn from(addr: Ipv6Address) -> Address {
        Address::Ipv6(addr)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ipv4Address([a, b, c, d]) = self;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", u16::from_be_bytes([chunk[0], chunk[1]]))?;
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Unspecified => write!(f, "*"),
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
        }
    }
}

pub mod checksum {
    //! The internet checksum, in the accumulate-then-combine form that lets a
    //! packet formatter sum the pseudo header and payload independently.
    use super::{Address, PROTOCOL_TCP};

    /// Sum a byte slice as a sequence of big-endian 16-bit words.
    pub fn data(data: &[u8]) -> u32 {
        let mut accum = 0u32;
        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            accum = accum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
        }
        if let [last] = chunks.remainder() {
            accum = accum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
        }
        accum
    }

    /// Sum the TCP pseudo header for the given address pair.
    pub fn pseudo_header(src_addr: &Address, dst_addr: &Address, length: u32) -> u32 {
        data(src_addr.as_bytes())
            .wrapping_add(data(dst_addr.as_bytes()))
            .wrapping_add(u32::from(PROTOCOL_TCP))
            .wrapping_add(length)
    }

    /// Fold partial sums into the ones-complement checksum field value.
    pub fn combine(sums: &[u32]) -> u16 {
        let mut accum: u64 = sums.iter().map(|&s| u64::from(s)).sum();
        while accum > 0xffff {
            accum = (accum & 0xffff) + (accum >> 16);
        }
        !(accum as u16)
    }
}
