//! The per-connection state record.
use core::fmt;
use std::collections::VecDeque;

use crate::banner::{BannerOutput, StreamId, StreamState};
use crate::managed::Key;
use crate::time::Instant;
use crate::wire::{Address, SeqNumber};

use super::segment::Segment;
use super::timer::TimerToken;

/// State tag of the compressed state machine.
///
/// ESTABLISHED is split in two: the probe dialogue is half-duplex, so a
/// connection is at any moment either draining its transmit queue or
/// listening for the peer, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    /// Transmit queue non-empty, waiting for acknowledgements.
    EstablishedSend,
    /// Nothing queued, waiting for peer data or a timeout.
    EstablishedRecv,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::EstablishedSend => "ESTABLISHED_SEND",
            TcpState::EstablishedRecv => "ESTABLISHED_RECV",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::LastAck => "LAST-ACK",
            TcpState::FinWait1 => "FIN-WAIT-1",
            TcpState::FinWait2 => "FIN-WAIT-2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME-WAIT",
        };
        write!(f, "{}", name)
    }
}

/// The application-side sub-state driving the probe dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Waiting for the three-way handshake to finish.
    Connect,
    /// Connected; waiting to see whether the server speaks first.
    ReceiveHello,
    /// Past the hello phase; collecting whatever else arrives.
    ReceiveNext,
    /// Application data queued; waiting for it to be acknowledged.
    SendNext,
}

/// Why a connection was torn down, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Timeout,
    Rst,
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DestroyReason::Timeout => "timeout",
            DestroyReason::Rst => "rst",
            DestroyReason::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

/// A Transmission Control Block: everything one connection owns.
pub struct Tcb {
    pub ip_me: Address,
    pub ip_them: Address,
    pub port_me: u16,
    pub port_them: u16,

    /// Next sequence number we will transmit.
    pub seqno_me: SeqNumber,
    /// Next sequence number we expect to receive.
    pub seqno_them: SeqNumber,
    /// Highest received byte we have acknowledged.
    pub ackno_me: SeqNumber,
    /// Highest of our bytes the peer has acknowledged.
    pub ackno_them: SeqNumber,

    /// Baselines for the relative offsets in log output.
    pub seqno_me_first: SeqNumber,
    pub seqno_them_first: SeqNumber,

    pub state: TcpState,
    pub app: AppState,

    /// Outgoing segments not yet fully acknowledged, oldest first.
    pub segments: VecDeque<Segment>,

    /// Handle of this connection's single timer wheel entry.
    pub timer: Option<TimerToken>,

    /// Chain link of the connection table bucket this record hangs in.
    pub(crate) next_in_bucket: Option<Key>,

    /// TTL observed on the validated SYN-ACK, recorded for reporting.
    pub ttl: u8,
    /// SYN (re)transmissions so far.
    pub syns_sent: u8,
    /// Payload bytes per outgoing segment.
    pub mss: u16,

    pub is_active: bool,
    /// Advertise a tiny receive window so the peer answers in driblets.
    pub is_small_window: bool,

    pub when_created: Instant,

    /// The protocol probe this connection runs.
    pub stream: Option<StreamId>,
    /// Banner evidence accumulated so far.
    pub banout: BannerOutput,
    /// Per-protocol parser scratch.
    pub banner_state: StreamState,
}

impl Tcb {
    pub fn new(ip_me: Address, ip_them: Address, port_me: u16, port_them: u16) -> Tcb {
        Tcb {
            ip_me,
            ip_them,
            port_me,
            port_them,
            seqno_me: SeqNumber::default(),
            seqno_them: SeqNumber::default(),
            ackno_me: SeqNumber::default(),
            ackno_them: SeqNumber::default(),
            seqno_me_first: SeqNumber::default(),
            seqno_them_first: SeqNumber::default(),
            state: TcpState::SynSent,
            app: AppState::Connect,
            segments: VecDeque::new(),
            timer: None,
            next_in_bucket: None,
            ttl: 0,
            syns_sent: 0,
            mss: 1400,
            is_active: false,
            is_small_window: false,
            when_created: Instant::default(),
            stream: None,
            banout: BannerOutput::new(),
            banner_state: StreamState::default(),
        }
    }

    /// Whether this record belongs to the given four-tuple.
    pub fn tuple_equals(
        &self,
        ip_me: Address,
        ip_them: Address,
        port_me: u16,
        port_them: u16,
    ) -> bool {
        self.port_me == port_me
            && self.port_them == port_them
            && self.ip_me == ip_me
            && self.ip_them == ip_them
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip_me.is_ipv6()
    }

    pub(crate) fn change_state(&mut self, new: TcpState) {
        net_debug!("{}                  to {{{}}}", self.trace(), new);
        self.state = new;
    }

    /// A compact log prefix: remote endpoint, relative receive and send
    /// offsets, and the state tag.
    pub fn trace(&self) -> TcbTrace<'_> {
        TcbTrace { tcb: self }
    }
}

pub struct TcbTrace<'a> {
    tcb: &'a Tcb,
}

impl fmt::Display for TcbTrace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tcb = self.tcb;
        write!(
            f,
            "[{}:{} {:4},{:4}] [{:4},{:4}] {{{}}}",
            tcb.ip_them,
            tcb.port_them,
            tcb.seqno_them - tcb.seqno_them_first,
            tcb.ackno_me - tcb.seqno_them_first,
            tcb.seqno_me - tcb.seqno_me_first,
            tcb.ackno_them - tcb.seqno_me_first,
            tcb.state,
        )
    }
}
