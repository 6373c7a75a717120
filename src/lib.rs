//! A userspace TCP connection engine for banner scanning.
//!
//! This crate contains the connection-oriented half of a stateless port
//! scanner: the part that turns raw, pre-validated TCP segment arrivals into
//! short-lived sessions, sends a protocol hello, collects whatever banner the
//! remote service volunteers, and tears the session down again. It sits
//! beside, and deliberately bypasses, the host operating system's TCP stack.
//!
//! The design is intentionally asymmetric. Connections are always actively
//! opened by the scanner, carry at most one request and one response, and are
//! strictly half-duplex within each phase. This permits a compressed state
//! machine (`ESTABLISHED` is split into a send-only and a receive-only half)
//! and a trivially small per-connection footprint.
//!
//! Packet capture, checksum validation of incoming segments, and the actual
//! transmit loop are *not* part of this crate. The ingress is expected to
//! deliver classified events ([`layer::tcp::TcpEvent`]) for packets whose
//! four-tuple and SYN cookie already checked out, and a transmit thread is
//! expected to drain the queue handed out by [`stack::Stack::new`].
#[macro_use]
mod macros;

pub mod banner;
pub mod layer;
pub mod managed;
pub mod stack;
pub mod time;
pub mod wire;
