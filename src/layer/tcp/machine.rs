//! The event-driven transition logic.
//!
//! One entry point, [`process`], receives every classified packet event and
//! every timer expiry for a connection and returns whether the connection
//! survives. Packet emission goes through [`send_packet`], which only ever
//! produces the four shapes the engine needs: SYN, bare ACK, RST, and
//! PSH+ACK with payload (each possibly carrying FIN).
use core::fmt;

use crate::banner::BannerRegistry;
use crate::managed::Key;
use crate::stack::template::{TemplatePacket, WINDOW_DEFAULT, WINDOW_SMALL};
use crate::stack::Stack;
use crate::time::{Duration, Instant};
use crate::wire::{Flags, SeqNumber};

use super::app::{self, AppEvent};
use super::tcb::{DestroyReason, Tcb, TcpState};
use super::timer::TimerWheel;

/// A classified arrival on a connection.
///
/// The packet ingress validates checksums, matches the four-tuple, and
/// boils the packet down to one of these before handing it over. `Timeout`
/// is generated internally by the timer wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    Timeout,
    SynAck,
    Ack,
    Fin,
    Rst,
    Data,
}

impl fmt::Display for TcpEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TcpEvent::Timeout => "TIMEOUT",
            TcpEvent::SynAck => "SYNACK",
            TcpEvent::Ack => "ACK",
            TcpEvent::Fin => "FIN",
            TcpEvent::Rst => "RST",
            TcpEvent::Data => "DATA",
        };
        write!(f, "{}", name)
    }
}

/// What the table should do with the connection after an event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Keep,
    Destroy(DestroyReason),
}

/// A follow-up connection requested during dispatch, carried out by the
/// table once the current event finishes.
pub(crate) struct Reconnect {
    pub stream: crate::banner::StreamId,
    pub ip_me: crate::wire::Address,
    pub ip_them: crate::wire::Address,
    pub port_me: u16,
    pub port_them: u16,
}

/// The slice of table state an event handler may touch.
///
/// Handlers get the connection record and this context as two separate
/// borrows, which keeps sends, timer updates, and app dispatch from ever
/// aliasing the table's ownership structures.
pub(crate) struct Ctx<'a> {
    pub template: &'a TemplatePacket,
    pub stack: &'a Stack,
    pub timers: &'a mut TimerWheel,
    pub banners: &'a BannerRegistry,
    pub timeout_connection: u32,
    pub timeout_hello: u32,
    pub now: Instant,
    pub key: Key,
    pub reconnect: Option<Reconnect>,
}

/// Re-arm the connection's single timer for `delay` from now.
pub(crate) fn arm(ctx: &mut Ctx<'_>, tcb: &mut Tcb, delay: Duration) {
    let when = ctx.now + delay;
    ctx.timers.arm(&mut tcb.timer, ctx.key, when);
}

/// Format and queue one packet for this connection.
pub(crate) fn send_packet(
    template: &TemplatePacket,
    stack: &Stack,
    tcb: &Tcb,
    flags: Flags,
    payload: &[u8],
) {
    let is_syn = flags == Flags::SYN;

    if flags.contains(Flags::ACK) {
        net_trace!(
            "{} xmit ACK ackingthem={}",
            tcb.trace(),
            tcb.seqno_them - tcb.seqno_them_first
        );
    }

    let mut buffer = match stack.packet_buffer() {
        Some(buffer) => buffer,
        None => return,
    };

    let window = if tcb.is_small_window {
        WINDOW_SMALL
    } else {
        WINDOW_DEFAULT
    };
    let seqno = if is_syn { tcb.seqno_me - 1 } else { tcb.seqno_me };
    match template.format_tcp(
        buffer.storage_mut(),
        tcb.ip_them,
        tcb.port_them,
        tcb.ip_me,
        tcb.port_me,
        seqno,
        tcb.seqno_them,
        flags,
        window,
        payload,
    ) {
        Ok(length) => buffer.set_len(length),
        Err(err) => {
            net_debug!("{} cannot format packet: {}", tcb.trace(), err);
            stack.recycle(buffer);
            return;
        }
    }
    stack.transmit(buffer);

    if flags.contains(Flags::FIN) {
        net_trace!(
            "{} xmit FIN myseqno={}",
            tcb.trace(),
            (tcb.seqno_me - tcb.seqno_me_first) as usize + payload.len()
        );
    }
}

/// Handle one event against one connection.
pub(crate) fn process(
    tcb: &mut Tcb,
    ctx: &mut Ctx<'_>,
    event: TcpEvent,
    payload: &[u8],
    seqno_them: SeqNumber,
    ackno_them: SeqNumber,
) -> Disposition {
    if event != TcpEvent::SynAck {
        net_debug!("{} ##{}##", tcb.trace(), event);
    }

    // No connection outlives the table-wide deadline, whatever state it is
    // stuck in.
    if event == TcpEvent::Timeout {
        let deadline = tcb.when_created + Duration::from_secs(u64::from(ctx.timeout_connection));
        if deadline < ctx.now {
            net_debug!("{} CONNECTION TIMEOUT", tcb.trace());
            send_packet(ctx.template, ctx.stack, tcb, Flags::RST, &[]);
            return Disposition::Destroy(DestroyReason::Timeout);
        }
    }

    if event == TcpEvent::Rst {
        return Disposition::Destroy(DestroyReason::Rst);
    }

    match tcb.state {
        TcpState::SynSent => match event {
            TcpEvent::Timeout => {
                // The SYN-ACK never came; try again, backing off linearly.
                tcb.syns_sent += 1;
                send_packet(ctx.template, ctx.stack, tcb, Flags::SYN, &[]);
                let delay = Duration::from_secs(u64::from(tcb.syns_sent));
                arm(ctx, tcb, delay);
            }
            TcpEvent::SynAck => {
                tcb.seqno_them = seqno_them;
                tcb.seqno_them_first = seqno_them - 1;
                tcb.seqno_me = ackno_them;
                tcb.seqno_me_first = ackno_them - 1;

                net_debug!("{} {} connection established", tcb.trace(), event);

                send_packet(ctx.template, ctx.stack, tcb, Flags::ACK, &[]);
                app::notify(tcb, ctx, AppEvent::Connected, &[]);
            }
            _ => {}
        },

        TcpState::EstablishedSend | TcpState::EstablishedRecv | TcpState::FinWait1 => {
            match event {
                TcpEvent::SynAck => {
                    // Their SYN-ACK retransmitted: our ACK got lost.
                    send_packet(ctx.template, ctx.stack, tcb, Flags::ACK, &[]);
                }
                TcpEvent::Fin => {
                    if tcb.state == TcpState::EstablishedRecv {
                        tcb.change_state(TcpState::CloseWait);
                    }
                    // In the send half, ignore: the peer repeats its FIN
                    // once it has acknowledged our outstanding data.
                }
                TcpEvent::Ack => {
                    tcb.seg_acknowledge(ackno_them);

                    match tcb.state {
                        TcpState::EstablishedSend => {
                            if tcb.segments.front().map_or(true, |seg| seg.is_empty()) {
                                tcb.change_state(TcpState::EstablishedRecv);
                                // Everything queued is on the wire and
                                // acknowledged; let the application decide
                                // whether to send more or turn to listening.
                                app::notify(tcb, ctx, AppEvent::SendSent, &[]);
                                arm(ctx, tcb, Duration::from_secs(10));
                            }
                        }
                        TcpState::EstablishedRecv => {
                            arm(ctx, tcb, Duration::from_secs(1));
                        }
                        TcpState::FinWait1 => {
                            if tcb.segments.front().map_or(true, |seg| seg.is_empty()) {
                                tcb.change_state(TcpState::FinWait2);
                                arm(ctx, tcb, Duration::from_secs(5));
                            } else {
                                arm(ctx, tcb, Duration::from_secs(1));
                            }
                        }
                        _ => {}
                    }

                    if tcb.segments.front().map_or(false, |seg| seg.is_fin) {
                        tcb.change_state(TcpState::FinWait1);
                    }
                }
                TcpEvent::Timeout => match tcb.state {
                    TcpState::EstablishedRecv => {
                        // Nothing heard within the window. Usually just a
                        // quiet server waiting for the client to go first.
                        app::notify(tcb, ctx, AppEvent::RecvTimeout, &[]);
                    }
                    TcpState::EstablishedSend | TcpState::FinWait1 => {
                        tcb.seg_resend(ctx);
                        arm(ctx, tcb, Duration::from_secs(1));
                    }
                    _ => {}
                },
                TcpEvent::Data => {
                    segment_recv(tcb, ctx, payload, seqno_them, false);
                }
                TcpEvent::Rst => {}
            }
        }

        TcpState::FinWait2 | TcpState::TimeWait => match event {
            TcpEvent::Timeout => {
                if tcb.state == TcpState::TimeWait {
                    return Disposition::Destroy(DestroyReason::Timeout);
                }
            }
            TcpEvent::Fin => {
                // Their FIN consumes one step of sequence space, like a
                // zero-length payload with a virtual byte.
                segment_recv(tcb, ctx, &[], seqno_them, true);
                tcb.change_state(TcpState::TimeWait);
                arm(ctx, tcb, Duration::from_secs(5));
            }
            _ => {}
        },

        TcpState::LastAck => {
            net_debug!("{} ={} : {}", tcb.trace(), tcb.state, event);
        }

        TcpState::CloseWait | TcpState::Closing => {
            net_debug!("{} unhandled state {} on {}", tcb.trace(), tcb.state, event);
        }
    }

    Disposition::Keep
}

/// Accept (or reject) arriving payload bytes for the receive stream.
///
/// Stale retransmits are acknowledged away, an already-seen prefix is
/// trimmed, and anything starting beyond the expected sequence number is
/// dropped wholesale; there is no reassembly buffer.
fn segment_recv(
    tcb: &mut Tcb,
    ctx: &mut Ctx<'_>,
    payload: &[u8],
    seqno_them: SeqNumber,
    is_fin: bool,
) {
    let mut payload = payload;
    let mut seqno_them = seqno_them;

    if tcb.seqno_them - seqno_them > payload.len() as u32 {
        // Entirely old bytes; our ACK must have gone missing.
        send_packet(ctx.template, ctx.stack, tcb, Flags::ACK, &[]);
        return;
    }

    while seqno_them != tcb.seqno_them && !payload.is_empty() {
        seqno_them = seqno_them + 1;
        payload = &payload[1..];
    }

    if payload.is_empty() && !is_fin {
        send_packet(ctx.template, ctx.stack, tcb, Flags::ACK, &[]);
        return;
    }

    if !payload.is_empty() {
        app::notify(tcb, ctx, AppEvent::RecvPayload, payload);
    }

    let advance = payload.len() + usize::from(is_fin);
    tcb.seqno_them += advance;
    tcb.ackno_me += advance;
    net_debug!("{} received {}-bytes", tcb.trace(), payload.len());

    send_packet(ctx.template, ctx.stack, tcb, Flags::ACK, &[]);
}
