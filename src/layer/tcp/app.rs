//! The application dispatch layer.
//!
//! Above the TCP transitions sits a four-state probe dialogue:
//!
//! * `Connect`: handshake still in flight.
//! * `ReceiveHello`: connected, giving the server a short window to speak
//!   first (SSH-style). If it stays silent, our hello goes out instead.
//! * `ReceiveNext`: hello phase over, everything arriving goes to the
//!   banner parser.
//! * `SendNext`: a parser queued more application data, now waiting for it
//!   to be acknowledged before listening again.
//!
//! Dispatch also launches follow-up connections: a stream may name a
//! successor variant to probe the same target with, which gets a fresh
//! connection from a rotated local four-tuple as soon as this one
//! establishes.
use core::mem;

use crate::banner::{AppProto, NetSend};
use crate::stack::StackSource;
use crate::time::Duration;
use crate::wire::{Address, Ipv4Address, Ipv6Address};

use super::machine::{self, Ctx, Reconnect};
use super::segment::SendBuf;
use super::tcb::{AppState, Tcb, TcpState};

/// What the transport layer tells the dialogue about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppEvent {
    Connected,
    RecvTimeout,
    RecvPayload,
    SendSent,
}

/// Advance the probe dialogue for one transport-layer event.
pub(crate) fn notify(tcb: &mut Tcb, ctx: &mut Ctx<'_>, event: AppEvent, payload: &[u8]) {
    match tcb.app {
        AppState::Connect => {
            if event == AppEvent::Connected {
                // Give the server its chance to talk before we do.
                net_debug!("{} +timeout", tcb.trace());
                let hello_wait = Duration::from_secs(u64::from(ctx.timeout_hello));
                machine::arm(ctx, tcb, hello_wait);
                tcb.change_state(TcpState::EstablishedRecv);
                tcb.app = AppState::ReceiveHello;

                // A stream with a successor variant probes the target again
                // over a second connection, e.g. an alternate TLS hello.
                if let Some(id) = tcb.stream {
                    if let Some(next) = ctx.banners.stream(id).next() {
                        ctx.reconnect = Some(Reconnect {
                            stream: next,
                            ip_me: tcb.ip_me,
                            ip_them: tcb.ip_them,
                            port_me: tcb.port_me,
                            port_them: tcb.port_them,
                        });
                    }
                }
            }
        }

        AppState::ReceiveHello => match event {
            AppEvent::RecvTimeout => transmit_hello(tcb, ctx),
            AppEvent::RecvPayload => {
                tcb.app = AppState::ReceiveNext;
                deliver(tcb, ctx, payload);
            }
            _ => {}
        },

        AppState::ReceiveNext => {
            if event == AppEvent::RecvPayload {
                deliver(tcb, ctx, payload);
            }
        }

        AppState::SendNext => {
            if event == AppEvent::SendSent {
                tcb.change_state(TcpState::EstablishedRecv);
                tcb.app = AppState::ReceiveNext;
            }
        }
    }
}

/// The server said nothing; probe it with the stream's hello.
fn transmit_hello(tcb: &mut Tcb, ctx: &mut Ctx<'_>) {
    let id = match tcb.stream {
        Some(id) => id,
        None => return,
    };
    let banners = ctx.banners;
    let stream = banners.stream(id);

    if stream.is_tls() {
        tcb.banner_state.is_sent_tls_hello = true;
    }
    if banners.is_heartbleed {
        // Keep the leaked heartbeat reply coming in small segments.
        tcb.is_small_window = true;
    }

    let crafted = {
        let mut net = NetHandle {
            tcb: &mut *tcb,
            ctx: &mut *ctx,
            is_closing: false,
        };
        stream.transmit_hello(&mut net)
    };

    if !crafted {
        let hello = stream.hello();
        if !hello.is_empty() {
            tcb.seg_send(ctx, SendBuf::Static(hello), true);
        }
    }
}

/// Feed arrived payload to the connection's banner parser.
fn deliver(tcb: &mut Tcb, ctx: &mut Ctx<'_>, payload: &[u8]) {
    let id = match tcb.stream {
        Some(id) => id,
        None => {
            // No probe attached to this port; keep the bytes as unclassified
            // evidence (which is never reported on its own).
            tcb.banout.append(AppProto::Unknown, payload);
            return;
        }
    };
    let banners = ctx.banners;
    let stream = banners.stream(id);

    // The parser needs the accumulator and scratch mutably while it may
    // also queue sends on the connection; lift them out for the call.
    let mut banout = mem::take(&mut tcb.banout);
    let mut state = mem::take(&mut tcb.banner_state);
    {
        let mut net = NetHandle {
            tcb: &mut *tcb,
            ctx: &mut *ctx,
            is_closing: false,
        };
        stream.parse(&mut state, payload, &mut banout, &mut net);
    }
    tcb.banout = banout;
    tcb.banner_state = state;
}

/// The handle through which parsers reach back into their connection.
pub(crate) struct NetHandle<'a, 'c> {
    tcb: &'a mut Tcb,
    ctx: &'a mut Ctx<'c>,
    is_closing: bool,
}

impl NetSend for NetHandle<'_, '_> {
    fn send(&mut self, buf: SendBuf<'_>, is_fin: bool) {
        self.tcb.seg_send(self.ctx, buf, is_fin);
        self.tcb.app = AppState::SendNext;
    }

    fn is_closing(&self) -> bool {
        self.is_closing
    }
}

/// Step to the next local four-tuple for a follow-up connection.
///
/// Ports advance through the configured source range; when they wrap, the
/// source address advances through its range too, wrapping likewise.
pub(crate) fn next_ip_port(src: &StackSource, ip_me: &mut Address, port_me: &mut u16) {
    let index = port_me.wrapping_sub(src.port.first).wrapping_add(1);
    *port_me = src.port.first.wrapping_add(index);
    if *port_me >= src.port.last {
        *port_me = src.port.first;

        match ip_me {
            Address::Ipv4(addr) => {
                let first = src.ipv4.first.to_network_integer();
                let index = addr
                    .to_network_integer()
                    .wrapping_sub(first)
                    .wrapping_add(1);
                let mut next = first.wrapping_add(index);
                if next >= src.ipv4.last.to_network_integer() {
                    next = first;
                }
                *addr = Ipv4Address::from_network_integer(next);
            }
            Address::Ipv6(addr) => {
                let first = src.ipv6.first.to_u128();
                let diff = addr.to_u128().wrapping_sub(first).wrapping_add(1);
                let next = first.wrapping_add(diff);
                *addr = if src.ipv6.last.to_u128() < next {
                    Ipv6Address::from_u128(first)
                } else {
                    Ipv6Address::from_u128(next)
                };
            }
            Address::Unspecified => {}
        }
    }
}
