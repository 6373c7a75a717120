//! Formatting of complete outgoing TCP/IP packets.
//!
//! The engine emits exactly four packet shapes: a SYN, a bare ACK, a RST,
//! and a PSH+ACK carrying payload, each optionally with FIN. A template
//! carries the per-scan constants (TTL, advertised MSS) and stamps the
//! per-packet variables into a borrowed buffer. Link-layer framing is left
//! to the transmit side, which knows the interface.
use byteorder::{ByteOrder, NetworkEndian};

use crate::wire::ip::{checksum, PROTOCOL_TCP};
use crate::wire::{self, Address, Flags, SeqNumber, TcpPacket};

/// The default advertised receive window.
pub const WINDOW_DEFAULT: u16 = 65535;

/// The reduced window advertised when a probe wants the peer to dribble its
/// response in small segments.
pub const WINDOW_SMALL: u16 = 600;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Per-scan constants for outgoing packet formatting.
#[derive(Debug, Clone, Copy)]
pub struct TemplatePacket {
    /// Time-to-live (hop limit) of outgoing datagrams.
    pub ttl: u8,

    /// The maximum segment size advertised in outgoing SYNs.
    pub mss: u16,
}

impl Default for TemplatePacket {
    fn default() -> TemplatePacket {
        TemplatePacket { ttl: 255, mss: 1460 }
    }
}

impl TemplatePacket {
    pub fn new() -> TemplatePacket {
        TemplatePacket::default()
    }

    /// Format a TCP packet towards `(ip_them, port_them)`, sourced from
    /// `(ip_me, port_me)`, into `buf`. Returns the formatted length.
    ///
    /// SYN packets automatically carry the advertised MSS option. All other
    /// packets have a bare 20-octet TCP header.
    #[allow(clippy::too_many_arguments)]
    pub fn format_tcp(
        &self,
        buf: &mut [u8],
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        seqno: SeqNumber,
        ackno: SeqNumber,
        flags: Flags,
        window: u16,
        payload: &[u8],
    ) -> wire::Result<usize> {
        let is_syn = flags.contains(Flags::SYN);
        let tcp_len = if is_syn {
            wire::tcp::HEADER_LEN_WITH_MSS
        } else {
            wire::tcp::HEADER_LEN
        } + payload.len();

        let ip_len = match (&ip_me, &ip_them) {
            (Address::Ipv4(_), Address::Ipv4(_)) => IPV4_HEADER_LEN,
            (Address::Ipv6(_), Address::Ipv6(_)) => IPV6_HEADER_LEN,
            _ => return Err(wire::Error::Malformed),
        };
        let total = ip_len + tcp_len;
        if buf.len() < total {
            return Err(wire::Error::Truncated);
        }

        match (ip_me, ip_them) {
            (Address::Ipv4(src), Address::Ipv4(dst)) => {
                self.emit_ipv4(&mut buf[..IPV4_HEADER_LEN], src.as_bytes(), dst.as_bytes(), total)
            }
            (Address::Ipv6(src), Address::Ipv6(dst)) => {
                self.emit_ipv6(&mut buf[..IPV6_HEADER_LEN], src.as_bytes(), dst.as_bytes(), tcp_len)
            }
            _ => unreachable!(),
        }

        let tcp_buf = &mut buf[ip_len..total];
        tcp_buf.fill(0);
        let mut packet = TcpPacket::new_unchecked(tcp_buf);
        packet.set_src_port(port_me);
        packet.set_dst_port(port_them);
        packet.set_seq_number(seqno);
        packet.set_ack_number(ackno);
        packet.set_flags(flags);
        packet.set_window_len(window);
        packet.set_urgent_at(0);
        if is_syn {
            packet.set_header_len(wire::tcp::HEADER_LEN_WITH_MSS as u8);
            packet.set_mss_option(self.mss);
        } else {
            packet.set_header_len(wire::tcp::HEADER_LEN as u8);
        }
        let payload_at = packet.header_len() as usize;
        packet.into_inner()[payload_at..].copy_from_slice(payload);

        let mut packet = TcpPacket::new_unchecked(&mut buf[ip_len..total]);
        packet.fill_checksum(&ip_me, &ip_them);

        Ok(total)
    }

    fn emit_ipv4(&self, buf: &mut [u8], src: &[u8], dst: &[u8], total_len: usize) {
        buf.fill(0);
        buf[0] = 0x45;
        NetworkEndian::write_u16(&mut buf[2..4], total_len as u16);
        // Don't-fragment, no offset.
        NetworkEndian::write_u16(&mut buf[6..8], 0x4000);
        buf[8] = self.ttl;
        buf[9] = PROTOCOL_TCP;
        buf[12..16].copy_from_slice(src);
        buf[16..20].copy_from_slice(dst);
        let sum = checksum::combine(&[checksum::data(buf)]);
        NetworkEndian::write_u16(&mut buf[10..12], sum);
    }

    fn emit_ipv6(&self, buf: &mut [u8], src: &[u8], dst: &[u8], payload_len: usize) {
        buf.fill(0);
        buf[0] = 0x60;
        NetworkEndian::write_u16(&mut buf[4..6], payload_len as u16);
        buf[6] = PROTOCOL_TCP;
        buf[7] = self.ttl;
        buf[8..24].copy_from_slice(src);
        buf[24..40].copy_from_slice(dst);
    }
}

/// Split a formatted packet into its IP header and TCP segment.
///
/// Meant for diagnostics and tests on the formatting side; incoming packets
/// are classified by the capture layer, not here.
pub fn split_ip(packet: &[u8]) -> wire::Result<(&[u8], &[u8])> {
    match packet.first().map(|byte| byte >> 4) {
        Some(4) if packet.len() >= IPV4_HEADER_LEN => Ok(packet.split_at(IPV4_HEADER_LEN)),
        Some(6) if packet.len() >= IPV6_HEADER_LEN => Ok(packet.split_at(IPV6_HEADER_LEN)),
        Some(_) | None => Err(wire::Error::Truncated),
    }
}
