//! The per-connection queue of unacknowledged outgoing segments.
//!
//! Segments enter through [`Tcb::seg_send`], leave through cumulative
//! acknowledgement in [`Tcb::seg_acknowledge`], and are replayed by
//! [`Tcb::seg_resend`] when the retransmit timer fires. The queue is
//! strictly FIFO and at most one FIN ever sits in it, always at the tail;
//! nothing can be queued behind a FIN.
use core::fmt;

use crate::time::Duration;
use crate::wire::{Flags, SeqNumber};

use super::machine::{self, Ctx};
use super::tcb::{Tcb, TcpState};

/// How far apart two sequence numbers may be and still describe the same
/// conversation. Acknowledgements outside this span in either direction are
/// stale duplicates or forgeries and get dropped. A full stack would reason
/// with the advertised window here; a single-request probe can use a fixed
/// span comfortably above anything it will ever have in flight.
pub const REORDER_WINDOW: u32 = 100_000;

/// An outgoing buffer handed to the engine, tagged with its ownership rule.
pub enum SendBuf<'a> {
    /// Borrowed from configuration storage; lives as long as the process
    /// and is never copied or freed.
    Static(&'static [u8]),
    /// Handed over; the queue owns the allocation from here on.
    Adopt(Vec<u8>),
    /// Borrowed transiently; the queue copies what it needs.
    Copy(&'a [u8]),
}

impl SendBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            SendBuf::Static(bytes) => bytes.len(),
            SendBuf::Adopt(bytes) => bytes.len(),
            SendBuf::Copy(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backing storage of a queued segment. The variant decides what happens on
/// drop: borrowed bytes are left alone, owned and copied ones are freed.
enum SegmentBuf {
    Static(&'static [u8]),
    Adopt(Vec<u8>),
    Copy(Box<[u8]>),
}

/// One queued outgoing segment.
pub struct Segment {
    /// Sequence number of the first payload byte.
    pub seqno: SeqNumber,
    buf: SegmentBuf,
    /// Payload length; may be shorter than the backing buffer after an
    /// MSS split kept the whole allocation on the head chunk.
    len: usize,
    pub is_fin: bool,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &[u8] {
        match &self.buf {
            SegmentBuf::Static(bytes) => &bytes[..self.len],
            SegmentBuf::Adopt(bytes) => &bytes[..self.len],
            SegmentBuf::Copy(bytes) => &bytes[..self.len],
        }
    }

    /// Sequence span this segment occupies, including a FIN's virtual byte.
    fn sequence_len(&self) -> usize {
        self.len + usize::from(self.is_fin)
    }

    /// Drop `count` acknowledged bytes off the front.
    ///
    /// Borrowed storage just re-slices. Owned storage is reallocated to a
    /// copy of the remainder, because ownership of a partial allocation
    /// cannot be expressed.
    fn trim_front(&mut self, count: usize) {
        debug_assert!(count < self.len);
        match core::mem::replace(&mut self.buf, SegmentBuf::Static(&[])) {
            SegmentBuf::Static(bytes) => {
                self.buf = SegmentBuf::Static(&bytes[count..]);
            }
            SegmentBuf::Adopt(bytes) => {
                self.buf = SegmentBuf::Copy(bytes[count..self.len].into());
            }
            SegmentBuf::Copy(bytes) => {
                self.buf = SegmentBuf::Copy(bytes[count..self.len].into());
            }
        }
        self.len -= count;
        self.seqno = self.seqno + count;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Segment")
            .field("seqno", &self.seqno)
            .field("len", &self.len)
            .field("is_fin", &self.is_fin)
            .finish()
    }
}

impl Tcb {
    /// Queue application bytes (and/or a FIN) for transmission.
    ///
    /// Buffers longer than the connection MSS are split into MSS-sized
    /// segments; an adopted allocation stays whole on the first chunk and
    /// the tail chunks become copies, since ownership cannot be divided.
    /// If the queue was empty the first chunk is transmitted immediately
    /// and the connection moves to the sending half of ESTABLISHED.
    pub(crate) fn seg_send(&mut self, ctx: &mut Ctx<'_>, buf: SendBuf<'_>, is_fin: bool) {
        if buf.is_empty() && !is_fin {
            return;
        }

        if let Some(last) = self.segments.back() {
            if last.is_fin {
                net_debug!("{} can't send past a FIN", self.trace());
                // An adopted buffer dies here with nothing sent.
                machine::arm(ctx, self, Duration::from_secs(1));
                return;
            }
        }

        let mut seqno = match self.segments.back() {
            Some(last) => last.seqno + last.len(),
            None => self.seqno_me,
        };
        let was_empty = self.segments.is_empty();
        let mss = usize::from(self.mss);

        match buf {
            SendBuf::Static(mut bytes) => loop {
                let take = bytes.len().min(mss);
                let (chunk, rest) = bytes.split_at(take);
                let last = rest.is_empty();
                self.push_segment(&mut seqno, SegmentBuf::Static(chunk), take, is_fin && last);
                if last {
                    break;
                }
                bytes = rest;
            },
            SendBuf::Adopt(bytes) => {
                if bytes.len() <= mss {
                    let len = bytes.len();
                    self.push_segment(&mut seqno, SegmentBuf::Adopt(bytes), len, is_fin);
                } else {
                    let tail = bytes[mss..].to_vec();
                    self.push_segment(&mut seqno, SegmentBuf::Adopt(bytes), mss, false);
                    self.push_copies(&mut seqno, &tail, mss, is_fin);
                }
            }
            SendBuf::Copy(bytes) => self.push_copies(&mut seqno, bytes, mss, is_fin),
        }

        if was_empty {
            let head = self.segments.front().expect("just queued a segment");
            let mut flags = Flags::PSH | Flags::ACK;
            if head.is_fin {
                flags |= Flags::FIN;
            }
            net_debug!(
                "{} xmit = {}-bytes{} @ {}",
                self.trace(),
                head.len(),
                if head.is_fin { " FIN" } else { "" },
                head.seqno - self.seqno_me_first
            );
            machine::send_packet(ctx.template, ctx.stack, self, flags, head.payload());
            self.change_state(TcpState::EstablishedSend);
        }

        machine::arm(ctx, self, Duration::from_secs(1));
    }

    fn push_copies(&mut self, seqno: &mut SeqNumber, mut bytes: &[u8], mss: usize, is_fin: bool) {
        loop {
            let take = bytes.len().min(mss);
            let (chunk, rest) = bytes.split_at(take);
            let last = rest.is_empty();
            self.push_segment(seqno, SegmentBuf::Copy(chunk.into()), take, is_fin && last);
            if last {
                break;
            }
            bytes = rest;
        }
    }

    fn push_segment(&mut self, seqno: &mut SeqNumber, buf: SegmentBuf, len: usize, is_fin: bool) {
        net_debug!(
            "{} send = {}-bytes{} @ {}",
            self.trace(),
            len,
            if is_fin { " FIN" } else { "" },
            *seqno - self.seqno_me_first
        );
        self.segments.push_back(Segment {
            seqno: *seqno,
            buf,
            len,
            is_fin,
        });
        *seqno = *seqno + len;
    }

    /// Retire queued segments covered by a cumulative acknowledgement.
    ///
    /// Returns whether the acknowledgement moved anything. Repeats of the
    /// current position are ignored, and anything farther than the
    /// reordering window away in either direction is dropped as stale.
    pub(crate) fn seg_acknowledge(&mut self, ackno: SeqNumber) -> bool {
        if ackno == self.seqno_me {
            return false;
        }

        if ackno - self.seqno_me > REORDER_WINDOW {
            net_debug!(
                "{} - ackno from past: old ackno = {:#010x}, this ackno = {:#010x}",
                self.ip_them,
                self.ackno_me.0,
                ackno.0
            );
            return false;
        }

        if self.seqno_me - ackno < REORDER_WINDOW {
            net_debug!(
                "{} - ackno from future: my seqno = {:#010x}, their ackno = {:#010x}",
                self.ip_them,
                self.seqno_me.0,
                ackno.0
            );
            return false;
        }

        let mut acked = ackno - self.seqno_me;
        while let Some(head) = self.segments.front() {
            let span = head.sequence_len() as u32;
            if acked < span {
                break;
            }
            net_debug!(
                "{} ACKed {}-bytes{}",
                self.trace(),
                head.len(),
                if head.is_fin { " FIN" } else { "" }
            );
            acked -= span;
            self.seqno_me += span as usize;
            self.ackno_them += span as usize;
            self.segments.pop_front();
        }

        if acked > 0 {
            if let Some(head) = self.segments.front_mut() {
                if (acked as usize) < head.len() {
                    head.trim_front(acked as usize);
                    self.seqno_me += acked as usize;
                    self.ackno_them += acked as usize;
                    net_debug!("{} ACKed {}-bytes (partial)", self.trace(), acked);
                }
            }
        }

        self.ackno_them = ackno;
        true
    }

    /// Retransmit the queue head, byte-identical to its first transmission.
    pub(crate) fn seg_resend(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(head) = self.segments.front() {
            if self.seqno_me != head.seqno {
                panic!(
                    "segment queue corrupt: next seqno {} but head starts at {}",
                    self.seqno_me, head.seqno
                );
            }

            if head.is_fin && head.is_empty() {
                machine::send_packet(ctx.template, ctx.stack, self, Flags::FIN | Flags::ACK, &[]);
            } else {
                let mut flags = Flags::PSH | Flags::ACK;
                if head.is_fin {
                    flags |= Flags::FIN;
                }
                machine::send_packet(ctx.template, ctx.stack, self, flags, head.payload());
            }
        }

        machine::arm(ctx, self, Duration::from_secs(2));
    }
}
