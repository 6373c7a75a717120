//! Wire representations of the protocol data the engine emits and inspects.
//!
//! Only the pieces the connection engine actually touches live here: the
//! address model shared by IPv4 and IPv6 connections, the internet checksum,
//! and the TCP header. Full packet formatting on top of these is the job of
//! [`crate::stack::template`].
use core::fmt;

pub mod ip;
pub mod tcp;

pub use self::ip::{Address, Ipv4Address, Ipv6Address};
pub use self::tcp::{Flags, Packet as TcpPacket, SeqNumber};

/// The error type for parsing and formatting of packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A buffer was shorter than the structure written into or read from it.
    Truncated,

    /// A header contained a self-contradictory or unrepresentable value.
    Malformed,

    /// A value depends on a feature this stack does not implement.
    Unsupported,
}

/// The result type for the wire layer.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated"),
            Error::Malformed => write!(f, "malformed"),
            Error::Unsupported => write!(f, "unsupported"),
        }
    }
}
