//! The timer wheel.
//!
//! An ordered set of `(deadline, connection)` entries. Every live connection
//! owns exactly one entry at all times; arming a connection that already has
//! one replaces it, and destroying a connection unlinks its entry
//! synchronously. The wheel stores connection keys rather than callbacks,
//! so a dangling timer can at worst produce a failed slab lookup, never a
//! call into freed state.
use std::collections::BTreeMap;

use crate::managed::Key;
use crate::time::{Expiration, Instant};

/// The handle a connection keeps to its single wheel entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerToken {
    when: Instant,
    seq: u64,
}

impl TimerToken {
    /// The deadline this token is queued for.
    pub fn when(&self) -> Instant {
        self.when
    }
}

/// Ordered set of pending connection timeouts.
pub struct TimerWheel {
    entries: BTreeMap<TimerToken, Key>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// The number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `key` for `when`, replacing the slot's previous entry.
    ///
    /// The token lives in the connection itself (`slot`), which is what
    /// makes the one-entry-per-connection rule enforceable here rather than
    /// by caller discipline.
    pub fn arm(&mut self, slot: &mut Option<TimerToken>, key: Key, when: Instant) {
        self.unlink(slot);
        let token = TimerToken {
            when,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(token, key);
        *slot = Some(token);
    }

    /// Drop the slot's entry from the wheel, if any.
    pub fn unlink(&mut self, slot: &mut Option<TimerToken>) {
        if let Some(token) = slot.take() {
            self.entries.remove(&token);
        }
    }

    /// Pop the next entry due at or before `now`.
    ///
    /// The popped connection's token slot must be cleared by the caller
    /// before re-arming; the wheel's side is already gone.
    pub fn remove_expired(&mut self, now: Instant) -> Option<(TimerToken, Key)> {
        let (&token, _) = self.entries.first_key_value()?;
        if token.when > now {
            return None;
        }
        let key = self.entries.remove(&token)?;
        Some((token, key))
    }

    /// When the next entry is due.
    pub fn next_expiry(&self) -> Expiration {
        self.entries
            .keys()
            .next()
            .map(|token| token.when)
            .into()
    }
}

impl Default for TimerWheel {
    fn default() -> TimerWheel {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::Slab;

    fn key() -> Key {
        Slab::new().insert(())
    }

    fn two_keys() -> (Key, Key) {
        let mut slab = Slab::new();
        (slab.insert(()), slab.insert(()))
    }

    #[test]
    fn arm_replaces_previous_entry() {
        let mut wheel = TimerWheel::new();
        let mut slot = None;
        let key = key();

        wheel.arm(&mut slot, key, Instant::from_secs(5));
        wheel.arm(&mut slot, key, Instant::from_secs(9));
        assert_eq!(wheel.len(), 1);

        assert_eq!(wheel.remove_expired(Instant::from_secs(5)), None);
        let (token, popped) = wheel.remove_expired(Instant::from_secs(9)).unwrap();
        assert_eq!(popped, key);
        assert_eq!(token.when(), Instant::from_secs(9));
        assert!(wheel.is_empty());
    }

    #[test]
    fn expiry_order_is_by_deadline() {
        let mut wheel = TimerWheel::new();
        let (mut a_slot, mut b_slot) = (None, None);
        let (a, b) = two_keys();

        wheel.arm(&mut a_slot, a, Instant::from_secs(7));
        wheel.arm(&mut b_slot, b, Instant::from_secs(3));
        assert_eq!(wheel.next_expiry(), crate::time::Expiration::When(Instant::from_secs(3)));

        let now = Instant::from_secs(10);
        assert_eq!(wheel.remove_expired(now).unwrap().1, b);
        assert_eq!(wheel.remove_expired(now).unwrap().1, a);
        assert_eq!(wheel.remove_expired(now), None);
    }

    #[test]
    fn unlink_cancels() {
        let mut wheel = TimerWheel::new();
        let mut slot = None;
        wheel.arm(&mut slot, key(), Instant::from_secs(1));
        wheel.unlink(&mut slot);
        assert_eq!(slot, None);
        assert_eq!(wheel.remove_expired(Instant::from_secs(60)), None);
    }

    #[test]
    fn identical_deadlines_coexist() {
        let mut wheel = TimerWheel::new();
        let (mut a_slot, mut b_slot) = (None, None);
        wheel.arm(&mut a_slot, key(), Instant::from_secs(2));
        wheel.arm(&mut b_slot, key(), Instant::from_secs(2));
        assert_eq!(wheel.len(), 2);
    }
}
