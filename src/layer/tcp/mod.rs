//! The TCP connection engine.
//!
//! This is a compressed rendition of the RFC 793 state diagram, tailored to
//! connections that this side always opens, that carry at most one request
//! and one response, and that live for seconds. Deviations worth knowing
//! about:
//!
//! * There is no LISTEN or SYN-RECEIVED; SYNs go out through the stateless
//!   transmit path and state is only instantiated once a cookie-validated
//!   SYN-ACK arrives.
//! * ESTABLISHED is split into a send-only and a receive-only half. The
//!   probe dialogue is strictly half-duplex: wait for a server banner, send
//!   a hello, collect the response.
//! * Out-of-order data beyond the expected sequence number is dropped, not
//!   reassembled. The peer retransmits; a scanner optimizes for the common
//!   case and bounded memory, not throughput.
//! * Validity of acknowledgements is judged against a fixed 100,000-byte
//!   reordering window instead of the advertised-window bookkeeping a full
//!   stack would carry.
//!
//! The [`ConnectionTable`] owns every per-connection resource: the state
//! records themselves (in a slab, addressed by stable keys), the bucket
//! chains that find them by four-tuple from either packet direction, and
//! the timer wheel that guarantees every live connection has exactly one
//! pending timeout at all times.
mod app;
mod machine;
mod segment;
mod siphash;
mod table;
mod tcb;
mod timer;

#[cfg(test)]
mod tests;

pub use self::machine::TcpEvent;
pub use self::segment::{Segment, SendBuf, REORDER_WINDOW};
pub use self::siphash::SynCookie;
pub use self::table::ConnectionTable;
pub use self::tcb::{AppState, DestroyReason, Tcb, TcpState};
pub use self::timer::{TimerToken, TimerWheel};
pub use crate::managed::Key;
