//! Protocol layer implementations.
//!
//! Only TCP lives here; the scanner's lower layers (link framing, IP
//! classification, checksum validation) run inside the capture and transmit
//! machinery outside this crate.
pub mod tcp;
