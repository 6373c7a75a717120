//! SYN cookies and the symmetric connection hash.
//!
//! Both derive from the same keyed primitive, SipHash-2-4:
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and
//! > Daniel J. Bernstein
//!
//! The cookie keys the initial sequence number of outgoing SYNs to the
//! four-tuple, so a SYN-ACK can be validated without any state for the SYN
//! that provoked it. The connection hash folds the two endpoints together
//! with XOR *before* hashing, which makes the bucket index identical for
//! both packet directions of one connection.
use crate::wire::{Address, Ipv6Address};

/// The keyed hash primitive behind cookie generation and table placement.
pub struct SynCookie {
    keys: (u64, u64),
}

// Yes, that's the initial values.
const IV: [&[u8; 8]; 4] = [b"somepseu", b"dorandom", b"lygenera", b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl SynCookie {
    /// Derive the hash keys from the per-scan entropy.
    pub fn new(entropy: u64) -> SynCookie {
        SynCookie {
            keys: (entropy, entropy.rotate_left(32) ^ 0x5bf0_3635_3273_3df3),
        }
    }

    /// The cookie for a connection, used as its initial sequence number.
    pub fn cookie(
        &self,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
    ) -> u32 {
        self.hash_tuple(ip_them, port_them, ip_me, port_me)
    }

    /// The direction-invariant hash placing a connection in the table.
    pub fn symmetric_hash(
        &self,
        ip_me: Address,
        port_me: u16,
        ip_them: Address,
        port_them: u16,
    ) -> u32 {
        let folded_port = port_me ^ port_them;
        let folded_ip = match (ip_me, ip_them) {
            (Address::Ipv4(me), Address::Ipv4(them)) => Address::Ipv4(
                crate::wire::Ipv4Address::from_network_integer(
                    me.to_network_integer() ^ them.to_network_integer(),
                ),
            ),
            (Address::Ipv6(me), Address::Ipv6(them)) => {
                Address::Ipv6(Ipv6Address::from_u128(me.to_u128() ^ them.to_u128()))
            }
            // Mixed or unassigned tuples cannot correspond to a live
            // connection; hash them stably anyway.
            _ => Address::Unspecified,
        };
        self.hash_tuple(folded_ip, folded_port, folded_ip, folded_port)
    }

    fn hash_tuple(&self, a: Address, port_a: u16, b: Address, port_b: u16) -> u32 {
        let mut state = State::init(self.keys.0, self.keys.1);

        match (a, b) {
            (Address::Ipv4(here), Address::Ipv4(there)) => {
                let m = u64::from(here.to_network_integer())
                    | u64::from(there.to_network_integer()) << 32;
                let p = u64::from(port_a) | u64::from(port_b) << 16
                    // Message length = 12
                    | 12_u64 << 56;
                state.absorb(m);
                state.absorb(p);
            }
            (Address::Ipv6(here), Address::Ipv6(there)) => {
                let (m0, m1) = Self::ipv6_to_messages(here);
                let (m2, m3) = Self::ipv6_to_messages(there);
                let p = u64::from(port_a) | u64::from(port_b) << 16
                    // Message length = 36
                    | 36_u64 << 56;
                state.absorb(m0);
                state.absorb(m1);
                state.absorb(m2);
                state.absorb(m3);
                state.absorb(p);
            }
            _ => {
                let p = u64::from(port_a) | u64::from(port_b) << 16 | 4_u64 << 56;
                state.absorb(p);
            }
        }
        state.finalize() as u32
    }

    fn ipv6_to_messages(addr: Ipv6Address) -> (u64, u64) {
        let bytes = addr.0;
        let mut m0 = [0u8; 8];
        let mut m1 = [0u8; 8];
        m0.copy_from_slice(&bytes[..8]);
        m1.copy_from_slice(&bytes[8..]);
        (u64::from_be_bytes(m0), u64::from_be_bytes(m1))
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Address;

    /// See the paper, Appendix A.
    #[test]
    fn manual_test_vectors() {
        let k0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        let k1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());

        let mut state = State::init(k0, k1);
        let m0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        state.absorb(m0);
        let m1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());
        state.absorb(m1);

        assert_eq!(state.finalize(), 0xa129ca6149be45e5);
    }

    #[test]
    fn hash_is_symmetric() {
        let cookie = SynCookie::new(0x1122_3344_5566_7788);
        let a = Address::v4(10, 0, 0, 1);
        let b = Address::v4(1, 2, 3, 4);
        assert_eq!(
            cookie.symmetric_hash(a, 12345, b, 80),
            cookie.symmetric_hash(b, 80, a, 12345),
        );

        let a6 = Address::Ipv6(Ipv6Address::from_u128(0x2001_0db8 << 96 | 1));
        let b6 = Address::Ipv6(Ipv6Address::from_u128(0x2001_0db8 << 96 | 2));
        assert_eq!(
            cookie.symmetric_hash(a6, 40000, b6, 443),
            cookie.symmetric_hash(b6, 443, a6, 40000),
        );
    }

    #[test]
    fn cookie_depends_on_every_tuple_member() {
        let cookie = SynCookie::new(42);
        let base = cookie.cookie(Address::v4(1, 2, 3, 4), 80, Address::v4(10, 0, 0, 1), 4000);
        assert_ne!(
            base,
            cookie.cookie(Address::v4(1, 2, 3, 5), 80, Address::v4(10, 0, 0, 1), 4000)
        );
        assert_ne!(
            base,
            cookie.cookie(Address::v4(1, 2, 3, 4), 81, Address::v4(10, 0, 0, 1), 4000)
        );
        assert_ne!(
            base,
            cookie.cookie(Address::v4(1, 2, 3, 4), 80, Address::v4(10, 0, 0, 1), 4001)
        );
        assert_ne!(base, SynCookie::new(43).cookie(
            Address::v4(1, 2, 3, 4), 80, Address::v4(10, 0, 0, 1), 4000));
    }
}
